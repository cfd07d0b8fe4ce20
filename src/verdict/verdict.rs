/// Outcome classification
///
/// A pure function over the evidence of one run. Usage is checked before
/// signals, so a process that crosses a ceiling at the same moment it
/// crashes or exits is still reported against the ceiling.
use crate::config::types::{LimitKind, Outcome, ResourceLimits, Termination};
use crate::core::types::RunEvidence;
use crate::kernel::signal::{is_cpu_limit_signal, is_filter_signal, is_output_limit_signal};

/// Verdict classifier - first matching rule wins
pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify one run. Deterministic for identical evidence.
    pub fn classify(evidence: &RunEvidence, limits: &ResourceLimits) -> (Outcome, Termination) {
        let signal = evidence.wait_outcome.signal();

        if Self::cpu_exceeded(evidence, limits) {
            return Self::limit(Outcome::CpuTimeLimitExceeded, LimitKind::CpuTime, signal);
        }

        if evidence.wall_timer_fired || limits.max_real_time.exceeded_by(evidence.real_time_ms) {
            return Self::limit(Outcome::RealTimeLimitExceeded, LimitKind::RealTime, signal);
        }

        if Self::memory_exceeded(evidence, limits) {
            return Self::limit(Outcome::MemoryLimitExceeded, LimitKind::Memory, signal);
        }

        if evidence.output_overflow || signal.is_some_and(is_output_limit_signal) {
            return Self::limit(Outcome::OutputLimitExceeded, LimitKind::Output, signal);
        }

        match signal {
            Some(sig) if evidence.filter_active && is_filter_signal(sig) => {
                (Outcome::SignalledByKernel, Termination::RaisedByFilter)
            }
            Some(_) => (Outcome::SignalledByKernel, Termination::RaisedExternally),
            None if evidence.wait_outcome.exit_code() != 0 => {
                (Outcome::RuntimeError, Termination::None)
            }
            None => (Outcome::Success, Termination::None),
        }
    }

    fn cpu_exceeded(evidence: &RunEvidence, limits: &ResourceLimits) -> bool {
        if limits.max_cpu_time.is_unlimited() {
            return false;
        }
        // the timer can fire a hair before rusage shows the overrun
        limits.max_cpu_time.exceeded_by(evidence.usage.cpu_time_ms)
            || evidence.wait_outcome.signal().is_some_and(is_cpu_limit_signal)
    }

    /// Only the program's own peak counts; a figure that may include the
    /// caller's inherited pages decides nothing.
    fn memory_exceeded(evidence: &RunEvidence, limits: &ResourceLimits) -> bool {
        if limits.max_memory.is_unlimited() {
            return false;
        }
        evidence.memory.limit_hit
            || evidence
                .memory
                .measured_kb()
                .is_some_and(|kb| limits.max_memory.exceeded_by(kb.saturating_mul(1024)))
    }

    /// A limit outcome; the termination is tagged only when a signal ended the run.
    fn limit(outcome: Outcome, kind: LimitKind, signal: Option<i32>) -> (Outcome, Termination) {
        let termination = match signal {
            Some(_) => Termination::RaisedByLimit(kind),
            None => Termination::None,
        };
        (outcome, termination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Limit;
    use crate::core::types::{MemoryEvidence, ResourceUsage, WaitOutcome};

    fn create_test_limits() -> ResourceLimits {
        ResourceLimits {
            max_cpu_time: Limit::of(1000),
            max_real_time: Limit::of(2000),
            max_memory: Limit::of(64 << 20),
            max_output_size: Limit::of(1 << 20),
            ..ResourceLimits::default()
        }
    }

    fn evidence(wait_outcome: WaitOutcome, cpu_ms: u64, real_ms: u64, mem_kb: u64) -> RunEvidence {
        RunEvidence {
            wait_outcome,
            usage: ResourceUsage {
                cpu_time_ms: cpu_ms,
                memory_kb: mem_kb,
            },
            memory: MemoryEvidence::from_rusage(mem_kb, None),
            real_time_ms: real_ms,
            wall_timer_fired: false,
            output_overflow: false,
            filter_active: true,
        }
    }

    #[test]
    fn test_classify_success() {
        let ev = evidence(WaitOutcome::Exited(0), 3, 5, 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (Outcome::Success, Termination::None)
        );
    }

    #[test]
    fn test_exactly_at_limit_is_success() {
        let ev = evidence(WaitOutcome::Exited(0), 1000, 2000, 64 * 1024);
        let (outcome, _) = VerdictClassifier::classify(&ev, &create_test_limits());
        assert_eq!(outcome, Outcome::Success);

        let ev = evidence(WaitOutcome::Exited(0), 1001, 1100, 1024);
        let (outcome, termination) = VerdictClassifier::classify(&ev, &create_test_limits());
        assert_eq!(outcome, Outcome::CpuTimeLimitExceeded);
        assert_eq!(termination, Termination::None);
    }

    #[test]
    fn test_cpu_timer_signal_wins_even_below_measured_limit() {
        let ev = evidence(WaitOutcome::Signaled(libc::SIGPROF), 998, 1010, 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (
                Outcome::CpuTimeLimitExceeded,
                Termination::RaisedByLimit(LimitKind::CpuTime)
            )
        );
    }

    #[test]
    fn test_sigprof_without_cpu_limit_is_external() {
        let limits = ResourceLimits::default();
        let ev = evidence(WaitOutcome::Signaled(libc::SIGPROF), 10, 10, 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &limits),
            (Outcome::SignalledByKernel, Termination::RaisedExternally)
        );
    }

    #[test]
    fn test_wall_timer() {
        let mut ev = evidence(WaitOutcome::Signaled(libc::SIGKILL), 40, 2051, 1024);
        ev.wall_timer_fired = true;
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (
                Outcome::RealTimeLimitExceeded,
                Termination::RaisedByLimit(LimitKind::RealTime)
            )
        );
    }

    #[test]
    fn test_cpu_checked_before_wall() {
        let mut ev = evidence(WaitOutcome::Signaled(libc::SIGKILL), 1500, 2100, 1024);
        ev.wall_timer_fired = true;
        let (outcome, _) = VerdictClassifier::classify(&ev, &create_test_limits());
        assert_eq!(outcome, Outcome::CpuTimeLimitExceeded);
    }

    #[test]
    fn test_memory_usage_beats_crash_signal() {
        let ev = evidence(WaitOutcome::Signaled(libc::SIGSEGV), 20, 30, 70 * 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (
                Outcome::MemoryLimitExceeded,
                Termination::RaisedByLimit(LimitKind::Memory)
            )
        );

        let ev = evidence(WaitOutcome::Exited(0), 20, 30, 70 * 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()).0,
            Outcome::MemoryLimitExceeded
        );
    }

    #[test]
    fn test_inherited_rusage_is_not_memory_exceeded() {
        let mut ev = evidence(WaitOutcome::Exited(0), 1, 2, 132_104);
        ev.memory = MemoryEvidence::from_rusage(132_104, Some(132_104));
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (Outcome::Success, Termination::None)
        );

        ev.memory = MemoryEvidence::from_rusage(140_000, Some(132_104));
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()).0,
            Outcome::MemoryLimitExceeded
        );
    }

    #[test]
    fn test_cgroup_oom_kill_is_memory_exceeded() {
        // killed at the cgroup ceiling before the peak was ever sampled high
        let mut ev = evidence(WaitOutcome::Signaled(libc::SIGKILL), 5, 9, 0);
        ev.memory = MemoryEvidence::from_cgroup(3 << 20, 1);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (
                Outcome::MemoryLimitExceeded,
                Termination::RaisedByLimit(LimitKind::Memory)
            )
        );

        // a failed allocation the program reported itself, no ceiling hit
        let mut ev = evidence(WaitOutcome::Exited(1), 5, 9, 0);
        ev.memory = MemoryEvidence::from_cgroup(3 << 20, 0);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()).0,
            Outcome::RuntimeError
        );

        let mut ev = evidence(WaitOutcome::Exited(0), 5, 9, 0);
        ev.memory = MemoryEvidence::from_cgroup(65 << 20, 0);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()).0,
            Outcome::MemoryLimitExceeded
        );
    }

    #[test]
    fn test_output_overflow() {
        let ev = evidence(WaitOutcome::Signaled(libc::SIGXFSZ), 20, 30, 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (
                Outcome::OutputLimitExceeded,
                Termination::RaisedByLimit(LimitKind::Output)
            )
        );

        // program ignored SIGXFSZ and exited cleanly
        let mut ev = evidence(WaitOutcome::Exited(0), 20, 30, 1024);
        ev.output_overflow = true;
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()).0,
            Outcome::OutputLimitExceeded
        );
    }

    #[test]
    fn test_filter_kill_vs_external_signal() {
        let ev = evidence(WaitOutcome::Signaled(libc::SIGSYS), 2, 3, 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (Outcome::SignalledByKernel, Termination::RaisedByFilter)
        );

        let mut ev = evidence(WaitOutcome::Signaled(libc::SIGSYS), 2, 3, 1024);
        ev.filter_active = false;
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()).1,
            Termination::RaisedExternally
        );

        let ev = evidence(WaitOutcome::Signaled(libc::SIGSEGV), 2, 3, 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (Outcome::SignalledByKernel, Termination::RaisedExternally)
        );
    }

    #[test]
    fn test_classify_runtime_error() {
        let ev = evidence(WaitOutcome::Exited(3), 2, 3, 1024);
        assert_eq!(
            VerdictClassifier::classify(&ev, &create_test_limits()),
            (Outcome::RuntimeError, Termination::None)
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let ev = evidence(WaitOutcome::Signaled(libc::SIGSYS), 2, 3, 1024);
        let limits = create_test_limits();
        let first = VerdictClassifier::classify(&ev, &limits);
        for _ in 0..10 {
            assert_eq!(VerdictClassifier::classify(&ev, &limits), first);
        }
    }
}
