//! Resource ceilings for the child.
//!
//! [`RlimitPlan::from_limits`] runs in the parent and turns
//! [`ResourceLimits`] into concrete `setrlimit` values. [`RlimitPlan::apply`]
//! runs in the forked child and only issues syscalls.
//!
//! CPU time is enforced twice: an `ITIMER_PROF` timer delivers SIGPROF at
//! the exact millisecond ceiling, and `RLIMIT_CPU` (`(ms + 1000) / 1000`
//! whole seconds, truncating) backs it up for programs that ignore SIGPROF.
//! Both survive `execve`.
//!
//! `RLIMIT_FSIZE` sits one byte above the output ceiling. A program that
//! ignores SIGXFSZ can then still leave a file one byte longer than allowed,
//! which the post-run size check catches.

use crate::config::types::ResourceLimits;
use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};

/// One `setrlimit` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitEntry {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

impl RlimitEntry {
    fn fixed(resource: Resource, value: u64) -> Self {
        Self {
            resource,
            soft: value,
            hard: value,
        }
    }
}

/// Every ceiling the child must install before exec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RlimitPlan {
    pub entries: Vec<RlimitEntry>,
    /// SIGPROF deadline in milliseconds of CPU time
    pub cpu_timer_ms: Option<u64>,
}

impl RlimitPlan {
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        let mut entries = Vec::with_capacity(6);

        if let Some(stack) = limits.max_stack.get() {
            entries.push(RlimitEntry::fixed(Resource::RLIMIT_STACK, stack));
        }

        if !limits.memory_limit_check_only {
            if let Some(memory) = limits.max_memory.get() {
                // headroom so that usage past the ceiling is measurable
                entries.push(RlimitEntry::fixed(
                    Resource::RLIMIT_AS,
                    memory.saturating_mul(2),
                ));
            }
        }

        if let Some(cpu_ms) = limits.max_cpu_time.get() {
            let seconds = cpu_ms.saturating_add(1000) / 1000;
            entries.push(RlimitEntry {
                resource: Resource::RLIMIT_CPU,
                soft: seconds,
                hard: seconds.saturating_add(1),
            });
        }

        if let Some(nproc) = limits.max_process_number.get() {
            entries.push(RlimitEntry::fixed(Resource::RLIMIT_NPROC, nproc));
        }

        if let Some(output) = limits.max_output_size.get() {
            entries.push(RlimitEntry::fixed(
                Resource::RLIMIT_FSIZE,
                output.saturating_add(1),
            ));
        }

        entries.push(RlimitEntry::fixed(Resource::RLIMIT_CORE, 0));

        Self {
            entries,
            cpu_timer_ms: limits.max_cpu_time.get(),
        }
    }

    /// Drop one resource from the plan.
    pub fn without(mut self, resource: Resource) -> Self {
        self.entries.retain(|entry| entry.resource != resource);
        self
    }

    pub fn get(&self, resource: Resource) -> Option<&RlimitEntry> {
        self.entries.iter().find(|entry| entry.resource == resource)
    }

    /// Install the plan on the calling process.
    ///
    /// Async-signal-safe: no allocation, no locks.
    pub fn apply(&self) -> Result<(), Errno> {
        for entry in &self.entries {
            setrlimit(
                entry.resource,
                entry.soft as libc::rlim_t,
                entry.hard as libc::rlim_t,
            )?;
        }

        if let Some(ms) = self.cpu_timer_ms {
            arm_cpu_timer(ms)?;
        }
        Ok(())
    }
}

fn arm_cpu_timer(ms: u64) -> Result<(), Errno> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        },
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Human-readable name for logs.
pub fn resource_name(resource: Resource) -> &'static str {
    match resource {
        Resource::RLIMIT_STACK => "RLIMIT_STACK",
        Resource::RLIMIT_AS => "RLIMIT_AS",
        Resource::RLIMIT_CPU => "RLIMIT_CPU",
        Resource::RLIMIT_NPROC => "RLIMIT_NPROC",
        Resource::RLIMIT_FSIZE => "RLIMIT_FSIZE",
        Resource::RLIMIT_CORE => "RLIMIT_CORE",
        _ => "RLIMIT_OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Limit;

    #[test]
    fn unlimited_request_only_disables_core_dumps() {
        let plan = RlimitPlan::from_limits(&ResourceLimits::default());
        assert_eq!(plan.entries, vec![RlimitEntry::fixed(Resource::RLIMIT_CORE, 0)]);
        assert_eq!(plan.cpu_timer_ms, None);
    }

    #[test]
    fn cpu_limit_adds_a_second_and_truncates() {
        let limits = ResourceLimits {
            max_cpu_time: Limit::of(1500),
            ..ResourceLimits::default()
        };
        let plan = RlimitPlan::from_limits(&limits);
        let cpu = plan.get(Resource::RLIMIT_CPU).unwrap();
        assert_eq!((cpu.soft, cpu.hard), (2, 3));
        assert_eq!(plan.cpu_timer_ms, Some(1500));

        let limits = ResourceLimits {
            max_cpu_time: Limit::of(500),
            ..ResourceLimits::default()
        };
        let cpu = *RlimitPlan::from_limits(&limits).get(Resource::RLIMIT_CPU).unwrap();
        assert_eq!((cpu.soft, cpu.hard), (1, 2));

        // (2000 + 1000) / 1000, not rounded up to 4
        let limits = ResourceLimits {
            max_cpu_time: Limit::of(2000),
            ..ResourceLimits::default()
        };
        let cpu = *RlimitPlan::from_limits(&limits).get(Resource::RLIMIT_CPU).unwrap();
        assert_eq!((cpu.soft, cpu.hard), (3, 4));

        let limits = ResourceLimits {
            max_cpu_time: Limit::of(2999),
            ..ResourceLimits::default()
        };
        let cpu = *RlimitPlan::from_limits(&limits).get(Resource::RLIMIT_CPU).unwrap();
        assert_eq!((cpu.soft, cpu.hard), (3, 4));
    }

    #[test]
    fn address_space_gets_double_headroom_unless_check_only() {
        let mut limits = ResourceLimits {
            max_memory: Limit::of(64 << 20),
            ..ResourceLimits::default()
        };
        let plan = RlimitPlan::from_limits(&limits);
        assert_eq!(plan.get(Resource::RLIMIT_AS).unwrap().soft, 128 << 20);

        limits.memory_limit_check_only = true;
        let plan = RlimitPlan::from_limits(&limits);
        assert!(plan.get(Resource::RLIMIT_AS).is_none());
    }

    #[test]
    fn address_space_can_be_left_to_a_cgroup() {
        let limits = ResourceLimits {
            max_memory: Limit::of(64 << 20),
            max_stack: Limit::of(8 << 20),
            ..ResourceLimits::default()
        };
        let plan = RlimitPlan::from_limits(&limits).without(Resource::RLIMIT_AS);
        assert!(plan.get(Resource::RLIMIT_AS).is_none());
        assert!(plan.get(Resource::RLIMIT_STACK).is_some());
        assert!(plan.get(Resource::RLIMIT_CORE).is_some());
    }

    #[test]
    fn output_ceiling_leaves_one_byte_of_evidence() {
        let limits = ResourceLimits {
            max_output_size: Limit::of(4096),
            ..ResourceLimits::default()
        };
        let fsize = *RlimitPlan::from_limits(&limits).get(Resource::RLIMIT_FSIZE).unwrap();
        assert_eq!((fsize.soft, fsize.hard), (4097, 4097));
    }

    #[test]
    fn stack_and_process_limits_are_exact() {
        let limits = ResourceLimits {
            max_stack: Limit::of(8 << 20),
            max_process_number: Limit::of(1),
            ..ResourceLimits::default()
        };
        let plan = RlimitPlan::from_limits(&limits);
        assert_eq!(plan.get(Resource::RLIMIT_STACK).unwrap().soft, 8 << 20);
        assert_eq!(plan.get(Resource::RLIMIT_NPROC).unwrap().soft, 1);
        assert_eq!(resource_name(Resource::RLIMIT_FSIZE), "RLIMIT_FSIZE");
    }
}
