//! Per-run memory cgroup (cgroup v2).
//!
//! `ru_maxrss` of a forked child starts from the high-water mark of the
//! address space it inherited from the caller, and `execve` carries that
//! mark over to the new image. A cgroup only charges pages faulted in after
//! the child has joined it, so `memory.peak` measures the target alone, and
//! `memory.max` turns an oversized allocation into an OOM kill that shows up
//! in `memory.events` instead of a failed `malloc`.
//!
//! The parent creates `<base>/run-<id>` and opens its `cgroup.procs`; the
//! child joins by writing `0` to that descriptor before exec.

use crate::config::types::{JudgeError, Result};
use nix::errno::Errno;
use once_cell::sync::Lazy;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the directory run cgroups are created under.
pub const CGROUP_BASE_ENV: &str = "JUDGEBOX_CGROUP_BASE";

const DEFAULT_BASE: &str = "/sys/fs/cgroup/judgebox";

const REMOVE_ATTEMPTS: u32 = 200;
const REMOVE_BACKOFF: Duration = Duration::from_millis(2);

/// Base directory with the memory controller enabled for its children,
/// or `None` when this host cannot give us one.
static BASE: Lazy<Option<PathBuf>> = Lazy::new(|| {
    let base = std::env::var_os(CGROUP_BASE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE));
    match prepare_base(&base) {
        Ok(()) => {
            log::debug!("Memory cgroups under {}", base.display());
            Some(base)
        }
        Err(e) => {
            log::info!(
                "Memory cgroup unavailable at {} ({}), measuring with rusage",
                base.display(),
                e
            );
            None
        }
    }
});

fn controllers_include_memory(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|list| list.split_whitespace().any(|c| c == "memory"))
        .unwrap_or(false)
}

/// Enable the memory controller for children of `dir`.
fn delegate_memory(dir: &Path) -> io::Result<()> {
    let control = dir.join("cgroup.subtree_control");
    if controllers_include_memory(&control) {
        return Ok(());
    }
    fs::write(&control, "+memory")
}

fn prepare_base(base: &Path) -> io::Result<()> {
    if !base.exists() {
        if let Some(parent) = base.parent() {
            if !controllers_include_memory(&parent.join("cgroup.controllers")) {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "memory controller not available",
                ));
            }
            delegate_memory(parent)?;
        }
        fs::create_dir_all(base)?;
    }
    delegate_memory(base)?;
    // memory.peak needs 5.19+; without it there is nothing exact to read
    if !base.join("memory.peak").exists() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "memory.peak not provided by this kernel",
        ));
    }
    Ok(())
}

/// True when runs get their own memory cgroup.
pub fn available() -> bool {
    BASE.is_some()
}

/// What the run cgroup recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupUsage {
    /// `memory.peak` in bytes
    pub peak_bytes: u64,
    /// `oom` + `oom_kill` from `memory.events`
    pub oom_events: u64,
}

/// One run's cgroup. Removed on drop, after killing anything left inside.
#[derive(Debug)]
pub struct RunCgroup {
    path: PathBuf,
    procs: File,
    capped: bool,
}

impl RunCgroup {
    /// Create a cgroup for one run, or `None` when memory cgroups are not
    /// usable on this host.
    ///
    /// `ceiling` goes to `memory.max`; swap is disabled so usage cannot hide
    /// below it.
    pub fn for_run(name: &str, ceiling: Option<u64>) -> Result<Option<Self>> {
        match BASE.as_deref() {
            Some(base) => Self::create(base, name, ceiling).map(Some),
            None => Ok(None),
        }
    }

    pub fn create(base: &Path, name: &str, ceiling: Option<u64>) -> Result<Self> {
        let path = base.join(format!("run-{}", name));
        fs::create_dir(&path).map_err(|e| {
            JudgeError::Cgroup(format!("Failed to create {}: {}", path.display(), e))
        })?;

        match configure(&path, ceiling) {
            Ok(procs) => Ok(Self {
                path,
                procs,
                capped: ceiling.is_some(),
            }),
            Err(e) => {
                let _ = fs::remove_dir(&path);
                Err(JudgeError::Cgroup(format!(
                    "Failed to configure {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `memory.max` is set, so the address-space rlimit is not needed.
    pub fn capped(&self) -> bool {
        self.capped
    }

    /// Write end of `cgroup.procs`, close-on-exec.
    pub fn procs_fd(&self) -> RawFd {
        self.procs.as_raw_fd()
    }

    pub fn usage(&self) -> Result<GroupUsage> {
        let peak = read_counter(&self.path.join("memory.peak"))?;
        let events = fs::read_to_string(self.path.join("memory.events")).map_err(|e| {
            JudgeError::Cgroup(format!("Failed to read memory.events: {}", e))
        })?;
        Ok(GroupUsage {
            peak_bytes: peak,
            oom_events: oom_events(&events),
        })
    }

    fn kill_members(&self) {
        let kill = self.path.join("cgroup.kill");
        if kill.exists() {
            if let Err(e) = fs::write(&kill, "1") {
                log::debug!("cgroup.kill on {} failed: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for RunCgroup {
    fn drop(&mut self) {
        self.kill_members();
        // killed members leave asynchronously; rmdir is EBUSY until they do
        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    std::thread::sleep(REMOVE_BACKOFF)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(e) => {
                    log::warn!("Failed to remove cgroup {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        log::warn!("Cgroup {} still populated, leaving it", self.path.display());
    }
}

fn configure(path: &Path, ceiling: Option<u64>) -> io::Result<File> {
    if let Some(bytes) = ceiling {
        fs::write(path.join("memory.max"), bytes.to_string())?;
        let swap = path.join("memory.swap.max");
        if swap.exists() {
            fs::write(&swap, "0")?;
        }
    }
    let oom_group = path.join("memory.oom.group");
    if oom_group.exists() {
        fs::write(&oom_group, "1")?;
    }
    OpenOptions::new().write(true).open(path.join("cgroup.procs"))
}

fn read_counter(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path)
        .map_err(|e| JudgeError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))?;
    content
        .trim()
        .parse::<u64>()
        .map_err(|e| JudgeError::Cgroup(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Sum of the `oom` and `oom_kill` lines of `memory.events`.
pub fn oom_events(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .filter(|(key, _)| *key == "oom" || *key == "oom_kill")
        .filter_map(|(_, value)| value.trim().parse::<u64>().ok())
        .sum()
}

/// Move the calling process into the cgroup whose `cgroup.procs` is `procs`.
///
/// Async-signal-safe; runs in the child before exec.
pub fn join(procs: RawFd) -> std::result::Result<(), Errno> {
    let pid = b"0";
    let rc = unsafe { libc::write(procs, pid.as_ptr().cast(), pid.len()) };
    if rc < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_counters_are_summed() {
        let events = "low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\noom_group_kill 1\n";
        assert_eq!(oom_events(events), 2);
        assert_eq!(oom_events("low 0\nhigh 0\nmax 0\noom 0\noom_kill 0\n"), 0);
        assert_eq!(oom_events(""), 0);
    }

    #[test]
    fn run_group_is_created_and_removed() {
        if !available() {
            println!("memory cgroup not available, skipping");
            return;
        }
        let group = RunCgroup::for_run("unit-create", Some(64 << 20))
            .unwrap()
            .unwrap();
        let path = group.path().to_path_buf();
        assert!(group.capped());
        assert_eq!(
            fs::read_to_string(path.join("memory.max")).unwrap().trim(),
            (64u64 << 20).to_string()
        );
        assert_eq!(group.usage().unwrap().oom_events, 0);
        drop(group);
        assert!(!path.exists());
    }

    #[test]
    fn missing_base_is_a_cgroup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunCgroup::create(&dir.path().join("absent"), "x", None).unwrap_err();
        assert!(matches!(err, JudgeError::Cgroup(_)), "{:?}", err);
    }
}
