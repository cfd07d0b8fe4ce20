//! judgebox: a process sandbox for running untrusted judge submissions
//! under kernel-enforced resource limits and a seccomp syscall filter.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::rlimit`]: Resource limiter (setrlimit plan, CPU profiling timer)
//! - [`kernel::seccomp`]: Syscall filter (policy model, BPF compiler, install)
//! - [`kernel::cgroup`]: Per-run memory cgroup (exact peak, OOM ceiling)
//! - [`kernel::credentials`]: Optional uid/gid switch
//! - [`kernel::signal`]: Signal semantics and process-group teardown
//!
//! ## Execution Control ([`exec`], [`core`])
//! - [`exec::preexec`]: Type-state enforced child setup chain
//! - [`exec::executor`]: The [`run`] entry point
//! - [`core::supervisor`]: Wall-clock watchdog and reaping
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::verdict`]: Evidence to outcome classification
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: Requests, results, limits, errors
//! - [`config::presets`]: Named syscall rule sets
//! - [`config::validator`]: Request validation
//!
//! # Example
//!
//! ```no_run
//! use judgebox::{ExecutionRequest, Limit, Outcome};
//!
//! let mut request = ExecutionRequest::new("/usr/bin/true");
//! request.limits.max_cpu_time = Limit::of(1000);
//! request.limits.max_real_time = Limit::of(2000);
//! request.limits.max_memory = Limit::of(256 << 20);
//!
//! let result = judgebox::run(request)?;
//! assert_eq!(result.outcome, Outcome::Success);
//! # Ok::<(), judgebox::JudgeError>(())
//! ```

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod core;
pub mod exec;

// Verdict
pub mod verdict;

// Configuration & Policy
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the judgebox binary
pub mod cli;

use std::fmt;

pub use config::types::*;
pub use exec::executor::run;
pub use kernel::seccomp::{ArgCmp, ArgValue, CmpOp, SeccompAction, SyscallPolicy, SyscallRule};

const VERSION_MAJOR: u32 = parse_component(env!("CARGO_PKG_VERSION_MAJOR"));
const VERSION_MINOR: u32 = parse_component(env!("CARGO_PKG_VERSION_MINOR"));
const VERSION_PATCH: u32 = parse_component(env!("CARGO_PKG_VERSION_PATCH"));

const fn parse_component(text: &str) -> u32 {
    let bytes = text.as_bytes();
    let mut value = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value & 0xff
}

/// Crate version packed as `(major << 16) | (minor << 8) | patch`.
pub const fn version() -> u32 {
    (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_PATCH
}

/// Unpacked form of [`version`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn current() -> Self {
        Self::from_packed(version())
    }

    pub const fn from_packed(packed: u32) -> Self {
        Self {
            major: (packed >> 16) as u8,
            minor: (packed >> 8) as u8,
            patch: packed as u8,
        }
    }

    pub const fn packed(self) -> u32 {
        ((self.major as u32) << 16) | ((self.minor as u32) << 8) | self.patch as u32
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
