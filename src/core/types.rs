use serde::{Deserialize, Serialize};

/// How `wait4` reported the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl WaitOutcome {
    pub fn from_raw_status(status: libc::c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            WaitOutcome::Signaled(libc::WTERMSIG(status))
        } else {
            WaitOutcome::Exited(libc::WEXITSTATUS(status))
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            WaitOutcome::Exited(code) => code,
            WaitOutcome::Signaled(_) => 0,
        }
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            WaitOutcome::Exited(_) => None,
            WaitOutcome::Signaled(sig) => Some(sig),
        }
    }
}

/// Kernel accounting collected at reap time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// user + system
    pub cpu_time_ms: u64,
    /// `ru_maxrss`, which never drops below the mark inherited at fork
    pub memory_kb: u64,
}

impl ResourceUsage {
    pub fn from_rusage(usage: &libc::rusage) -> Self {
        let ms = |tv: libc::timeval| tv.tv_sec.max(0) as u64 * 1000 + tv.tv_usec.max(0) as u64 / 1000;
        Self {
            cpu_time_ms: ms(usage.ru_utime) + ms(usage.ru_stime),
            memory_kb: usage.ru_maxrss.max(0) as u64,
        }
    }
}

/// What the supervisor observed about a reaped child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildExit {
    pub wait_outcome: WaitOutcome,
    pub usage: ResourceUsage,
    pub real_time_ms: u64,
    /// The wall-clock deadline expired and the group was killed
    pub wall_timer_fired: bool,
}

/// Where a peak memory figure came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// `memory.peak` of the run's own cgroup
    Cgroup,
    /// `ru_maxrss` that rose above the child's pre-exec mark
    Rusage,
    /// `ru_maxrss` never rose above the pre-exec mark, so it only bounds
    /// the program's peak from above
    Inherited,
}

/// Pre-exec growth tolerated above the child's measured RSS mark.
pub const INHERITED_SLACK_KB: u64 = 64;

/// Peak memory of the program and whether a memory ceiling was hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryEvidence {
    pub peak_kb: u64,
    pub source: MemorySource,
    /// The run cgroup recorded an OOM event
    pub limit_hit: bool,
}

impl MemoryEvidence {
    pub fn from_cgroup(peak_bytes: u64, oom_events: u64) -> Self {
        Self {
            peak_kb: peak_bytes.div_ceil(1024),
            source: MemorySource::Cgroup,
            limit_hit: oom_events > 0,
        }
    }

    /// `maxrss_kb` from `wait4`; `baseline_kb` is what the child measured for
    /// itself right before exec. The child may still fault in a few stack
    /// pages after measuring, so growth within [`INHERITED_SLACK_KB`] of
    /// the mark is not attributed to the program.
    pub fn from_rusage(maxrss_kb: u64, baseline_kb: Option<u64>) -> Self {
        let source = match baseline_kb {
            Some(baseline) if maxrss_kb <= baseline.saturating_add(INHERITED_SLACK_KB) => {
                MemorySource::Inherited
            }
            _ => MemorySource::Rusage,
        };
        Self {
            peak_kb: maxrss_kb,
            source,
            limit_hit: false,
        }
    }

    /// The program's own peak, when it is known.
    pub fn measured_kb(&self) -> Option<u64> {
        match self.source {
            MemorySource::Inherited => None,
            MemorySource::Cgroup | MemorySource::Rusage => Some(self.peak_kb),
        }
    }
}

/// Everything the classifier looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunEvidence {
    pub wait_outcome: WaitOutcome,
    pub usage: ResourceUsage,
    pub memory: MemoryEvidence,
    pub real_time_ms: u64,
    pub wall_timer_fired: bool,
    /// A redirected file grew past the output ceiling
    pub output_overflow: bool,
    /// A syscall filter was installed before exec
    pub filter_active: bool,
}

impl RunEvidence {
    pub fn new(
        exit: ChildExit,
        memory: MemoryEvidence,
        output_overflow: bool,
        filter_active: bool,
    ) -> Self {
        Self {
            wait_outcome: exit.wait_outcome,
            usage: exit.usage,
            memory,
            real_time_ms: exit.real_time_ms,
            wall_timer_fired: exit.wall_timer_fired,
            output_overflow,
            filter_active,
        }
    }
}
