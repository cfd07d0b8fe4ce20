//! Parent-side wait with a wall-clock deadline.
//!
//! The child is never reaped before the deadline logic is finished, so a
//! kill can only reach our own (possibly zombie) child and never a recycled
//! pid. Two strategies:
//!
//! - `Native`: `pidfd_open` + `poll`, one blocking call per wake-up.
//! - `Fallback`: a watchdog thread sleeping on a channel timeout while the
//!   parent blocks in `waitid(WNOWAIT)`. The watchdog is joined before
//!   `wait4` reaps the child.

use crate::config::types::{JudgeError, Result};
use crate::core::types::{ChildExit, ResourceUsage, WaitOutcome};
use crate::kernel::signal::kill_process_group;
use crossbeam_channel::{bounded, RecvTimeoutError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Slack added to the real-time limit before the child is killed.
pub const WALL_GRACE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidfdMode {
    Native,
    Fallback,
}

static PIDFD_MODE: Lazy<PidfdMode> = Lazy::new(detect_pidfd_mode);

/// Detected once per process.
pub fn pidfd_mode() -> PidfdMode {
    *PIDFD_MODE
}

fn detect_pidfd_mode() -> PidfdMode {
    match pidfd_open(Pid::this()) {
        Ok(_) => PidfdMode::Native,
        Err(e) => {
            log::info!("pidfd_open unavailable ({}), using watchdog thread", e);
            PidfdMode::Fallback
        }
    }
}

fn pidfd_open(pid: Pid) -> std::result::Result<OwnedFd, Errno> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return Err(Errno::last());
    }
    // SAFETY: the kernel just handed us this descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}

fn wait_error(pid: Pid, source: Errno) -> JudgeError {
    JudgeError::Wait {
        pid: pid.as_raw(),
        source,
    }
}

/// Wait for `pid` to exit, killing its process group once `real_limit`
/// plus [`WALL_GRACE`] has elapsed since `started`, then reap it.
pub fn supervise(pid: Pid, started: Instant, real_limit: Option<Duration>) -> Result<ChildExit> {
    supervise_with(pid, started, real_limit, pidfd_mode())
}

pub fn supervise_with(
    pid: Pid,
    started: Instant,
    real_limit: Option<Duration>,
    mode: PidfdMode,
) -> Result<ChildExit> {
    let deadline = real_limit.map(|limit| limit + WALL_GRACE);

    let wall_timer_fired = match (deadline, mode) {
        (None, _) => {
            wait_exited(pid)?;
            false
        }
        (Some(deadline), PidfdMode::Native) => match pidfd_open(pid) {
            Ok(pidfd) => wait_pidfd(pid, &pidfd, started, deadline)?,
            Err(e) => {
                log::debug!("pidfd_open({}) failed: {}, falling back to watchdog", pid, e);
                wait_watchdog(pid, started, deadline)?
            }
        },
        (Some(deadline), PidfdMode::Fallback) => wait_watchdog(pid, started, deadline)?,
    };

    // The leader is a zombie here, so the group id cannot be recycled yet.
    if kill_process_group(pid) {
        log::debug!("Swept leftover members of process group {}", pid);
    }

    let (wait_outcome, usage) = reap(pid)?;
    let real_time_ms = started.elapsed().as_millis() as u64;

    Ok(ChildExit {
        wait_outcome,
        usage,
        real_time_ms,
        wall_timer_fired,
    })
}

fn kill_child(pid: Pid) {
    kill_process_group(pid);
    // in case the child never became a group leader
    let _ = kill(pid, Signal::SIGKILL);
}

/// Block until `pid` has exited without reaping it.
fn wait_exited(pid: Pid) -> Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(wait_error(pid, e)),
        }
    }
}

fn wait_pidfd(pid: Pid, pidfd: &OwnedFd, started: Instant, deadline: Duration) -> Result<bool> {
    loop {
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            log::debug!("Wall deadline {:?} reached for pid {}", deadline, pid);
            kill_child(pid);
            wait_exited(pid)?;
            return Ok(true);
        }

        let remaining = deadline - elapsed;
        let timeout_ms = remaining.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd: pidfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc > 0 {
            return Ok(false);
        }
        if rc < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                e => {
                    kill_child(pid);
                    let _ = reap(pid);
                    return Err(wait_error(pid, e));
                }
            }
        }
    }
}

fn wait_watchdog(pid: Pid, started: Instant, deadline: Duration) -> Result<bool> {
    let (cancel_tx, cancel_rx) = bounded::<()>(1);
    let fired = Arc::new(AtomicBool::new(false));
    let remaining = deadline.saturating_sub(started.elapsed());

    let flag = Arc::clone(&fired);
    let spawned = thread::Builder::new()
        .name(format!("judgebox-watchdog-{}", pid))
        .spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(remaining) {
                flag.store(true, Ordering::SeqCst);
                kill_child(pid);
            }
        });

    let watchdog = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            kill_child(pid);
            let _ = reap(pid);
            return Err(JudgeError::Watchdog(e));
        }
    };

    let waited = wait_exited(pid);
    drop(cancel_tx);
    if watchdog.join().is_err() {
        log::error!("Watchdog thread for pid {} panicked", pid);
    }
    waited?;

    Ok(fired.load(Ordering::SeqCst))
}

fn reap(pid: Pid) -> Result<(WaitOutcome, ResourceUsage)> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if rc == pid.as_raw() {
            return Ok((
                WaitOutcome::from_raw_status(status),
                ResourceUsage::from_rusage(&usage),
            ));
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(wait_error(pid, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{fork, ForkResult};

    fn spawn_child(exit_immediately: bool) -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe {
                libc::setpgid(0, 0);
                if exit_immediately {
                    libc::_exit(7);
                }
                loop {
                    libc::pause();
                }
            },
            ForkResult::Parent { child } => child,
        }
    }

    #[test]
    fn detection_is_stable() {
        assert_eq!(pidfd_mode(), pidfd_mode());
    }

    #[test]
    fn quick_exit_is_not_a_timeout() {
        for mode in [PidfdMode::Native, PidfdMode::Fallback] {
            let started = Instant::now();
            let pid = spawn_child(true);
            let exit = supervise_with(pid, started, Some(Duration::from_secs(5)), mode).unwrap();
            assert_eq!(exit.wait_outcome, WaitOutcome::Exited(7));
            assert!(!exit.wall_timer_fired);
            assert!(exit.real_time_ms < 5000);
        }
    }

    #[test]
    fn deadline_kills_a_stuck_child() {
        for mode in [PidfdMode::Native, PidfdMode::Fallback] {
            let started = Instant::now();
            let pid = spawn_child(false);
            let exit =
                supervise_with(pid, started, Some(Duration::from_millis(100)), mode).unwrap();
            assert!(exit.wall_timer_fired);
            assert_eq!(exit.wait_outcome, WaitOutcome::Signaled(libc::SIGKILL));
            assert!(exit.real_time_ms >= 100);
        }
    }

    #[test]
    fn unlimited_wait_reaps() {
        let started = Instant::now();
        let pid = spawn_child(true);
        let exit = supervise(pid, started, None).unwrap();
        assert_eq!(exit.wait_outcome.exit_code(), 7);
    }
}
