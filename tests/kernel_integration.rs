//! Integration tests for kernel module
//!
//! These tests install limits and filters in a forked child and report back
//! through the exit status, so the test process itself stays unrestricted.

use judgebox::config::presets;
use judgebox::kernel::cgroup::{self, RunCgroup};
use judgebox::kernel::credentials::{validate_credentials, Credentials};
use judgebox::kernel::rlimit::RlimitPlan;
use judgebox::{JudgeError, Limit, ResourceLimits, SeccompAction, SyscallPolicy, SyscallRule};
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

/// Run `body` in a child and return how it ended.
fn in_child(body: impl FnOnce() -> i32) -> WaitStatus {
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let code = body();
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => waitpid(child, None).unwrap(),
    }
}

#[test]
fn test_blacklist_denies_sockets_with_eacces() {
    let filter = presets::general().compile(Some(c"/bin/true")).unwrap();

    let status = in_child(|| {
        if filter.install().is_err() {
            return 10;
        }
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd >= 0 {
            return 11;
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EACCES) {
            return 12;
        }
        0
    });

    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{:?}", status);
}

#[test]
fn test_kill_rule_raises_sigsys() {
    let policy = SyscallPolicy::new(SeccompAction::Allow).rule(SyscallRule::kill(libc::SYS_getppid));
    let filter = policy.compile(None).unwrap();

    let status = in_child(|| {
        if filter.install().is_err() {
            return 10;
        }
        unsafe { libc::syscall(libc::SYS_getppid) };
        1
    });

    match status {
        WaitStatus::Signaled(_, signal, _) => assert_eq!(signal as i32, libc::SIGSYS),
        other => panic!("expected SIGSYS, got {:?}", other),
    }
}

#[test]
fn test_rlimit_plan_is_visible_after_apply() {
    let limits = ResourceLimits {
        max_stack: Limit::of(8 << 20),
        max_output_size: Limit::of(1 << 20),
        ..ResourceLimits::default()
    };
    let plan = RlimitPlan::from_limits(&limits);

    let status = in_child(|| {
        if plan.apply().is_err() {
            return 10;
        }
        match getrlimit(Resource::RLIMIT_FSIZE) {
            Ok((soft, hard)) if soft == (1 << 20) + 1 && hard == (1 << 20) + 1 => {}
            _ => return 11,
        }
        match getrlimit(Resource::RLIMIT_CORE) {
            Ok((0, 0)) => {}
            _ => return 12,
        }
        0
    });

    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{:?}", status);
}

#[test]
fn test_output_ceiling_raises_sigxfsz() {
    let limits = ResourceLimits {
        max_output_size: Limit::of(16),
        ..ResourceLimits::default()
    };
    let plan = RlimitPlan::from_limits(&limits);
    let dir = tempfile::tempdir_in(env!("CARGO_TARGET_TMPDIR")).unwrap();
    let path = dir.path().join("sink");
    let file = std::fs::File::create(&path).unwrap();

    let status = in_child(|| {
        use std::os::fd::AsRawFd;
        if plan.apply().is_err() {
            return 10;
        }
        let chunk = [b'x'; 64];
        unsafe { libc::write(file.as_raw_fd(), chunk.as_ptr().cast(), chunk.len()) };
        unsafe { libc::write(file.as_raw_fd(), chunk.as_ptr().cast(), chunk.len()) };
        1
    });

    match status {
        WaitStatus::Signaled(_, signal, _) => assert_eq!(signal as i32, libc::SIGXFSZ),
        other => panic!("expected SIGXFSZ, got {:?}", other),
    }
    // the ceiling sits one byte above the limit
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 17);
}

#[test]
fn test_address_space_cap_refuses_oversized_mapping() {
    let limits = ResourceLimits {
        max_memory: Limit::of(64 << 20),
        ..ResourceLimits::default()
    };
    let plan = RlimitPlan::from_limits(&limits);

    let status = in_child(|| {
        if plan.apply().is_err() {
            return 10;
        }
        match getrlimit(Resource::RLIMIT_AS) {
            Ok((soft, _)) if soft == 128 << 20 => {}
            _ => return 11,
        }
        let map = |len: usize| unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        // 256MB alone is past the 128MB cap
        if map(256 << 20) != libc::MAP_FAILED {
            return 12;
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::ENOMEM) {
            return 13;
        }
        0
    });

    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{:?}", status);
}

#[test]
fn test_cgroup_peak_counts_only_pages_touched_after_joining() {
    if !cgroup::available() {
        println!("memory cgroup not available, skipping");
        return;
    }
    let group = RunCgroup::for_run("kernel-join", None).unwrap().unwrap();
    let procs = group.procs_fd();
    // resident in this process, and so in the child, before it joins
    let ballast = vec![1u8; 64 << 20];

    let status = in_child(|| {
        if cgroup::join(procs).is_err() {
            return 10;
        }
        let mut fresh = vec![0u8; 8 << 20];
        for page in fresh.chunks_mut(4096) {
            page[0] = 1;
        }
        std::hint::black_box(&fresh);
        0
    });
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{:?}", status);

    let usage = group.usage().unwrap();
    assert!(usage.peak_bytes >= 8 << 20, "{:?}", usage);
    assert!(usage.peak_bytes < 48 << 20, "{:?}", usage);
    assert_eq!(usage.oom_events, 0);
    assert_eq!(std::hint::black_box(&ballast)[0], 1);
}

#[test]
fn test_credential_switch_validates_before_fork() {
    if nix::unistd::geteuid().is_root() {
        let creds = Credentials::new(Some(65534), Some(65534)).unwrap();
        assert!(validate_credentials(&creds).is_ok());
        return;
    }
    let creds = Credentials::new(Some(65534), None).unwrap();
    assert!(matches!(
        validate_credentials(&creds),
        Err(JudgeError::RootRequired(_))
    ));
}
