/// File Descriptor Closure Hardening
///
/// Every descriptor above stderr is marked close-on-exec in the child so
/// the target starts with exactly stdin, stdout and stderr.
/// - Prefer close_range(CLOSE_RANGE_CLOEXEC)
/// - Fallback to fcntl over [3, ceiling), where the ceiling is read in the
///   parent because /proc cannot be walked without allocating
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, Resource};
use std::os::fd::RawFd;

const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Upper bound for the fallback loop.
const MAX_FALLBACK_FDS: u64 = 1 << 16;

/// Highest descriptor number worth scanning, computed before fork.
pub fn descriptor_ceiling() -> RawFd {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) => soft.min(MAX_FALLBACK_FDS) as RawFd,
        Err(e) => {
            log::warn!("getrlimit(RLIMIT_NOFILE) failed: {}, assuming 1024", e);
            1024
        }
    }
}

/// Mark every descriptor >= `first` close-on-exec.
///
/// Async-signal-safe.
pub fn mark_cloexec_from(first: RawFd, ceiling: RawFd) -> Result<(), Errno> {
    if try_close_range(first) {
        return Ok(());
    }
    mark_cloexec_via_fcntl(first, ceiling)
}

fn try_close_range(first: RawFd) -> bool {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    rc == 0
}

fn mark_cloexec_via_fcntl(first: RawFd, ceiling: RawFd) -> Result<(), Errno> {
    for fd in first..ceiling {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            // EBADF: not open
            continue;
        }
        if flags & libc::FD_CLOEXEC != 0 {
            continue;
        }
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        if rc < 0 {
            return Err(Errno::last());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags >= 0 && flags & libc::FD_CLOEXEC != 0
    }

    fn inheritable_dup() -> RawFd {
        let file = std::fs::File::open("/dev/null").unwrap();
        // dup() does not carry FD_CLOEXEC over
        let fd = unsafe { libc::dup(file.as_raw_fd()) };
        assert!(fd >= 0);
        assert!(!is_cloexec(fd));
        fd
    }

    #[test]
    fn ceiling_is_positive_and_bounded() {
        let ceiling = descriptor_ceiling();
        assert!(ceiling > 2);
        assert!(ceiling as u64 <= MAX_FALLBACK_FDS);
    }

    #[test]
    fn fcntl_fallback_marks_descriptors() {
        let fd = inheritable_dup();
        mark_cloexec_via_fcntl(fd, fd + 1).unwrap();
        assert!(is_cloexec(fd));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn mark_from_descriptor_marks_it() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};

        let fd = inheritable_dup();
        // the sweep covers every descriptor above `fd`; keep it out of the
        // test harness, whose other threads may be spawning children
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match mark_cloexec_from(fd, descriptor_ceiling()) {
                    Ok(()) if is_cloexec(fd) => 0,
                    Ok(()) => 1,
                    Err(_) => 2,
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert!(matches!(status, WaitStatus::Exited(_, 0)), "{:?}", status);
            }
        }
        assert!(!is_cloexec(fd));
        unsafe { libc::close(fd) };
    }
}
