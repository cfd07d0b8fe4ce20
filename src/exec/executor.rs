/// One sandboxed execution, start to finish
use crate::config::types::{ExecutionRequest, ExecutionResult, JudgeError, Result};
use crate::config::validator::validate_request;
use crate::core::supervisor::supervise;
use crate::core::types::{MemoryEvidence, RunEvidence};
use crate::exec::preexec::{ChildPlan, ChildReport, SETUP_FAILURE_EXIT};
use crate::kernel::cgroup::RunCgroup;
use crate::kernel::signal::signal_name;
use crate::verdict::verdict::VerdictClassifier;
use nix::unistd::{fork, ForkResult};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Run `request` to completion and classify how it ended.
///
/// Blocks the calling thread. Independent calls share no mutable state and
/// may run concurrently from different threads.
///
/// Configuration problems and sandbox failures are `Err`; anything the
/// target program does, including crashing or exceeding limits, is an
/// `Ok` result with the corresponding outcome.
pub fn run(request: ExecutionRequest) -> Result<ExecutionResult> {
    let run_id = Uuid::new_v4();
    log::info!(
        "[{}] run {} {:?} policy={}",
        run_id,
        request.exe_path.display(),
        request.args,
        policy_label(&request)
    );

    validate_request(&request)?;
    // dropped after the child is reaped, which removes the cgroup
    let memory_group = RunCgroup::for_run(&run_id.to_string(), memory_ceiling(&request))?;
    let plan = ChildPlan::build(&request, memory_group.as_ref())?;
    log::debug!(
        "[{}] plan ready: filter={} ({} instructions), cgroup={}, limits={:?}",
        run_id,
        plan.filter_active(),
        plan.filter_len(),
        memory_group
            .as_ref()
            .map_or("none".to_string(), |g| g.path().display().to_string()),
        request.limits
    );

    let (report_read, report_write) = report_pipe()?;
    let started = Instant::now();

    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => unsafe { plan.enter(report_write.as_raw_fd()) },
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            log::error!("[{}] fork failed: {}", run_id, e);
            return Err(JudgeError::Spawn(e));
        }
    };
    drop(report_write);

    // mirrors the child's own setpgid; whichever runs first wins
    unsafe { libc::setpgid(child.as_raw(), child.as_raw()) };

    let real_limit = request.limits.max_real_time.get().map(Duration::from_millis);
    let exit = supervise(child, started, real_limit)?;

    let report = read_child_report(report_read)?;
    if let Some(failure) = report.failure {
        log::error!(
            "[{}] child setup failed during {}: {} (exit {:?})",
            run_id,
            failure.stage,
            failure.errno,
            exit.wait_outcome
        );
        return Err(failure.into());
    }
    if exit.wait_outcome.exit_code() == SETUP_FAILURE_EXIT {
        log::debug!(
            "[{}] program exited with {} without a setup report",
            run_id,
            SETUP_FAILURE_EXIT
        );
    }

    let memory = match memory_group.as_ref().map(RunCgroup::usage) {
        Some(Ok(usage)) => MemoryEvidence::from_cgroup(usage.peak_bytes, usage.oom_events),
        Some(Err(e)) => {
            log::warn!("[{}] {}, falling back to rusage", run_id, e);
            MemoryEvidence::from_rusage(exit.usage.memory_kb, report.baseline_kb)
        }
        None => MemoryEvidence::from_rusage(exit.usage.memory_kb, report.baseline_kb),
    };
    log::debug!(
        "[{}] memory peak={}KB source={:?} limit_hit={} rusage={}KB baseline={:?}KB",
        run_id,
        memory.peak_kb,
        memory.source,
        memory.limit_hit,
        exit.usage.memory_kb,
        report.baseline_kb
    );

    let output_overflow = output_overflowed(&request);
    let evidence = RunEvidence::new(exit, memory, output_overflow, plan.filter_active());
    let (outcome, termination) = VerdictClassifier::classify(&evidence, &request.limits);

    let signal = exit.wait_outcome.signal().unwrap_or(0);
    let result = ExecutionResult {
        outcome,
        exit_code: exit.wait_outcome.exit_code(),
        signal,
        termination,
        cpu_time_ms: exit.usage.cpu_time_ms,
        real_time_ms: exit.real_time_ms,
        memory_kb: memory.peak_kb,
        error: None,
    };

    log::info!(
        "[{}] {} exit={} signal={} ({}) cpu={}ms real={}ms mem={}KB",
        run_id,
        result.outcome,
        result.exit_code,
        result.signal,
        if signal == 0 { "none" } else { signal_name(signal) },
        result.cpu_time_ms,
        result.real_time_ms,
        result.memory_kb
    );

    Ok(result)
}

fn policy_label(request: &ExecutionRequest) -> &'static str {
    use crate::config::types::PolicySelector;
    match request.policy {
        PolicySelector::Standard => "c_cpp",
        PolicySelector::StandardFileIo => "c_cpp_file_io",
        PolicySelector::NativeExtensionSafe => "general",
        PolicySelector::Golang => "golang",
        PolicySelector::Node => "node",
        PolicySelector::Explicit(_) => "explicit",
        PolicySelector::Unfiltered => "none",
    }
}

/// `memory.max` for the run cgroup: twice the limit, like the address-space
/// cap it replaces, so usage past the limit is still measurable.
fn memory_ceiling(request: &ExecutionRequest) -> Option<u64> {
    if request.limits.memory_limit_check_only {
        return None;
    }
    request.limits.max_memory.get().map(|bytes| bytes.saturating_mul(2))
}

/// Close-on-exec pipe: a successful exec closes the write end, so the
/// parent reads the baseline record and at most one failure record.
fn report_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(JudgeError::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: pipe2 returned two fresh descriptors
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn read_child_report(report: OwnedFd) -> Result<ChildReport> {
    let mut bytes = Vec::new();
    File::from(report).read_to_end(&mut bytes)?;
    Ok(ChildReport::decode(&bytes).unwrap_or_else(|| {
        log::warn!("Ignoring malformed child report of {} bytes", bytes.len());
        ChildReport::default()
    }))
}

/// True when a redirected file ended up longer than the output ceiling.
fn output_overflowed(request: &ExecutionRequest) -> bool {
    let Some(limit) = request.limits.max_output_size.get() else {
        return false;
    };
    [&request.output_path, &request.error_path]
        .into_iter()
        .flatten()
        .any(|path| file_len(path).is_some_and(|len| len > limit))
}

fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}
