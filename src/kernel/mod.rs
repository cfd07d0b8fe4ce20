//! Thin wrappers around the Linux primitives the child installs.
//!
//! Everything here that runs after fork is async-signal-safe: raw syscalls
//! over data prepared by the parent, errors as bare `Errno`.

pub mod cgroup;
pub mod credentials;
pub mod rlimit;
pub mod seccomp;
pub mod signal;
