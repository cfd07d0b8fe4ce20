//! Signal numbers the limiter and filter use, and group kills.

use nix::errno::Errno;
use nix::sys::signal::{killpg, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;

/// Signals whose default action ends the run in a way the classifier reads.
/// An ignored disposition survives `execve`, so each is reset explicitly.
pub const ENFORCEMENT_SIGNALS: [Signal; 6] = [
    Signal::SIGXFSZ,
    Signal::SIGXCPU,
    Signal::SIGPROF,
    Signal::SIGSYS,
    Signal::SIGPIPE,
    Signal::SIGSEGV,
];

/// SIGPROF comes from the CPU interval timer, SIGXCPU from `RLIMIT_CPU`.
pub fn is_cpu_limit_signal(signal: i32) -> bool {
    signal == libc::SIGPROF || signal == libc::SIGXCPU
}

/// Raised by `RLIMIT_FSIZE` on the first write past the ceiling.
pub fn is_output_limit_signal(signal: i32) -> bool {
    signal == libc::SIGXFSZ
}

/// A seccomp kill or trap surfaces as SIGSYS.
pub fn is_filter_signal(signal: i32) -> bool {
    signal == libc::SIGSYS
}

pub fn signal_name(signal: i32) -> &'static str {
    Signal::try_from(signal)
        .map(|s| s.as_str())
        .unwrap_or("UNKNOWN")
}

/// Unblock every signal and restore the default action of
/// [`ENFORCEMENT_SIGNALS`], whatever the caller's thread had set.
///
/// Async-signal-safe; runs in the child before exec.
pub fn reset_signal_state() -> Result<(), Errno> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
    for signal in ENFORCEMENT_SIGNALS {
        // SAFETY: SIG_DFL installs no handler code
        unsafe { nix::sys::signal::signal(signal, SigHandler::SigDfl) }?;
    }
    Ok(())
}

/// SIGKILL every member of the process group led by `leader`.
///
/// Returns false when the group is already empty.
pub fn kill_process_group(leader: Pid) -> bool {
    match killpg(leader, Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            log::warn!("killpg({}) failed: {}", leader, e);
            false
        }
    }
}
