/// Pre-Exec Ordering Enforcement
///
/// The child's setup sequence is fixed:
/// 1. own process group, parent-death signal, clean signal state, join the
///    run's memory cgroup
/// 2. redirect stdin/stdout/stderr, mark every other descriptor close-on-exec
/// 3. apply rlimits and the CPU interval timer
/// 4. setgroups, setresgid, setresuid
/// 5. report the pre-exec RSS mark, no_new_privs + seccomp filter
/// 6. execve
///
/// Everything the child touches is built in the parent as a [`ChildPlan`].
/// After fork the child only issues raw syscalls and writes 8-byte
/// `{tag, value}` records to a close-on-exec pipe: one baseline record with
/// its own `ru_maxrss` right before exec, and on failure a `{stage, errno}`
/// record, after which it exits with [`SETUP_FAILURE_EXIT`].
use crate::config::presets;
use crate::config::types::{ExecutionRequest, JudgeError, Result, SetupStage};
use crate::kernel::cgroup::{self, RunCgroup};
use crate::kernel::credentials::{switch_credentials, Credentials};
use crate::kernel::rlimit::{resource_name, RlimitPlan};
use crate::kernel::seccomp::CompiledFilter;
use crate::kernel::signal::reset_signal_state;
use crate::utils::fd_closure::{descriptor_ceiling, mark_cloexec_from};
use nix::errno::Errno;
use nix::sys::resource::{getrusage, Resource, UsageWho};
use nix::unistd::Pid;
use std::convert::Infallible;
use std::ffi::{CString, OsStr};
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Exit status of a child whose setup failed before exec.
pub const SETUP_FAILURE_EXIT: i32 = 253;

/// Size of one record on the report pipe.
pub const REPORT_LEN: usize = 8;

/// Record tag of the pre-exec `ru_maxrss` mark; stages start at 1.
const BASELINE_TAG: i32 = 0;

const OUTPUT_MODE: libc::c_uint = 0o644;

/// A failed pre-exec step, as seen from inside the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupFailure {
    pub stage: SetupStage,
    pub errno: Errno,
}

impl SetupFailure {
    fn at(stage: SetupStage) -> impl Fn(Errno) -> SetupFailure {
        move |errno| SetupFailure { stage, errno }
    }

    pub fn encode(self) -> [u8; REPORT_LEN] {
        let mut record = [0u8; REPORT_LEN];
        record[..4].copy_from_slice(&(self.stage as i32).to_le_bytes());
        record[4..].copy_from_slice(&(self.errno as i32).to_le_bytes());
        record
    }

    pub fn decode(record: &[u8]) -> Option<Self> {
        if record.len() != REPORT_LEN {
            return None;
        }
        let stage = i32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let errno = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        Some(Self {
            stage: SetupStage::from_raw(stage)?,
            errno: Errno::from_raw(errno),
        })
    }
}

/// Everything the child wrote to the report pipe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChildReport {
    /// The child's own `ru_maxrss` in KB just before exec
    pub baseline_kb: Option<u64>,
    pub failure: Option<SetupFailure>,
}

impl ChildReport {
    pub fn encode_baseline(kb: u64) -> [u8; REPORT_LEN] {
        let mut record = [0u8; REPORT_LEN];
        record[..4].copy_from_slice(&BASELINE_TAG.to_le_bytes());
        record[4..].copy_from_slice(&(kb.min(i32::MAX as u64) as i32).to_le_bytes());
        record
    }

    /// Decode every whole record; `None` if any of them is malformed.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % REPORT_LEN != 0 {
            return None;
        }
        let mut report = Self::default();
        for record in bytes.chunks_exact(REPORT_LEN) {
            let tag = i32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            if tag == BASELINE_TAG {
                let kb = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
                report.baseline_kb = Some(kb.max(0) as u64);
            } else {
                report.failure = Some(SetupFailure::decode(record)?);
            }
        }
        Some(report)
    }
}

impl From<SetupFailure> for JudgeError {
    fn from(failure: SetupFailure) -> Self {
        JudgeError::Setup {
            stage: failure.stage,
            errno: failure.errno,
        }
    }
}

type StepResult<T> = std::result::Result<T, SetupFailure>;

fn path_cstring(what: &str, path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| JudgeError::InvalidConfig(format!("{} contains a NUL byte", what)))
}

fn arg_cstring(what: &str, value: &OsStr) -> Result<CString> {
    CString::new(value.as_bytes())
        .map_err(|_| JudgeError::InvalidConfig(format!("{} contains a NUL byte", what)))
}

/// Where stderr goes.
#[derive(Debug)]
enum ErrorTarget {
    Null,
    SameAsOutput,
    File(CString),
}

/// Everything the child needs, prepared before fork.
///
/// Holds raw pointers into its own `CString`s, so it is neither `Send` nor
/// meant to outlive the run it was built for.
pub struct ChildPlan {
    exe: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    input: Option<CString>,
    output: Option<CString>,
    error: ErrorTarget,
    dev_null: CString,
    rlimits: RlimitPlan,
    credentials: Option<Credentials>,
    filter: Option<CompiledFilter>,
    /// `cgroup.procs` of the run's memory cgroup
    memory_group: Option<RawFd>,
    fd_ceiling: RawFd,
    parent: Pid,
}

impl ChildPlan {
    /// `memory_group` must stay alive until the child has been reaped.
    pub fn build(request: &ExecutionRequest, memory_group: Option<&RunCgroup>) -> Result<Self> {
        let exe = path_cstring("exe_path", &request.exe_path)?;

        let mut argv = Vec::with_capacity(request.args.len() + 1);
        argv.push(exe.clone());
        for arg in &request.args {
            argv.push(arg_cstring("argument", OsStr::new(arg))?);
        }

        let mut envp = Vec::with_capacity(request.env.len());
        for (key, value) in &request.env {
            envp.push(arg_cstring("environment entry", OsStr::new(&format!("{}={}", key, value)))?);
        }

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        let input = request
            .input_path
            .as_deref()
            .map(|p| path_cstring("input_path", p))
            .transpose()?;
        let output = request
            .output_path
            .as_deref()
            .map(|p| path_cstring("output_path", p))
            .transpose()?;
        let error = match (&request.error_path, &request.output_path) {
            (None, _) => ErrorTarget::Null,
            (Some(err), Some(out)) if err == out => ErrorTarget::SameAsOutput,
            (Some(err), _) => ErrorTarget::File(path_cstring("error_path", err)?),
        };

        // compiled against `exe`, whose heap buffer moves into the plan unchanged
        let filter = match presets::policy_for(&request.policy) {
            Some(policy) => Some(policy.compile(Some(exe.as_c_str()))?),
            None => None,
        };

        let mut rlimits = RlimitPlan::from_limits(&request.limits);
        if memory_group.is_some_and(RunCgroup::capped) {
            // memory.max enforces the ceiling; an address-space cap would
            // only turn oversized requests into failed allocations
            rlimits = rlimits.without(Resource::RLIMIT_AS);
        }
        for entry in &rlimits.entries {
            log::debug!(
                "{} soft={} hard={}",
                resource_name(entry.resource),
                entry.soft,
                entry.hard
            );
        }

        Ok(Self {
            exe,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            input,
            output,
            error,
            dev_null: CString::from(c"/dev/null"),
            rlimits,
            credentials: Credentials::new(request.uid, request.gid),
            filter,
            memory_group: memory_group.map(RunCgroup::procs_fd),
            fd_ceiling: descriptor_ceiling(),
            parent: Pid::this(),
        })
    }

    pub fn filter_active(&self) -> bool {
        self.filter.is_some()
    }

    pub fn filter_len(&self) -> usize {
        self.filter.as_ref().map_or(0, CompiledFilter::len)
    }

    /// Child entry point after fork. Never returns.
    ///
    /// # Safety
    /// Must only be called in a freshly forked child; `report_fd` is the
    /// write end of the close-on-exec report pipe.
    pub unsafe fn enter(&self, report_fd: RawFd) -> ! {
        let failure = match Self::chain(self, report_fd) {
            Ok(never) => match never {},
            Err(failure) => failure,
        };
        let record = failure.encode();
        libc::write(report_fd, record.as_ptr().cast(), record.len());
        libc::_exit(SETUP_FAILURE_EXIT)
    }

    fn chain(plan: &ChildPlan, report_fd: RawFd) -> StepResult<Infallible> {
        Sandbox::new(plan, report_fd)
            .claim_lifecycle()?
            .redirect_streams()?
            .apply_limits()?
            .drop_credentials()?
            .install_filter()?
            .exec()
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

// ============================================================================
// Type-State Pre-Exec Chain
// ============================================================================
//
// FreshChild -> LifecycleOwned -> StreamsReady -> LimitsApplied ->
// CredsDropped -> FilterInstalled
//
// Each step consumes the prior state and returns exactly one next state on
// success. Only Sandbox<FilterInstalled> exposes exec.

/// Type-state marker: fresh child, nothing set up yet
pub struct FreshChild;

/// Type-state marker: own process group, dies with the parent
pub struct LifecycleOwned;

/// Type-state marker: standard streams redirected, no stray descriptors
pub struct StreamsReady;

/// Type-state marker: rlimits and CPU timer installed
pub struct LimitsApplied;

/// Type-state marker: target identity in place
pub struct CredsDropped;

/// Type-state marker: seccomp filter loaded (or deliberately absent)
pub struct FilterInstalled;

/// Child process with type-state tracking of its pre-exec progress.
pub struct Sandbox<'p, S> {
    plan: &'p ChildPlan,
    report_fd: RawFd,
    _state: PhantomData<S>,
}

impl<'p, S> Sandbox<'p, S> {
    fn advance<T>(self) -> Sandbox<'p, T> {
        Sandbox {
            plan: self.plan,
            report_fd: self.report_fd,
            _state: PhantomData,
        }
    }
}

impl<'p> Sandbox<'p, FreshChild> {
    pub fn new(plan: &'p ChildPlan, report_fd: RawFd) -> Self {
        Self {
            plan,
            report_fd,
            _state: PhantomData,
        }
    }

    /// New process group so the parent can kill descendants as one unit,
    /// SIGKILL if the parent dies first, no blocked or ignored limit
    /// signals inherited from the calling thread, and membership of the
    /// run's memory cgroup before the program faults in a single page.
    pub fn claim_lifecycle(self) -> StepResult<Sandbox<'p, LifecycleOwned>> {
        let fail = SetupFailure::at(SetupStage::Lifecycle);
        if unsafe { libc::setpgid(0, 0) } != 0 {
            return Err(fail(Errno::last()));
        }
        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } != 0 {
            return Err(fail(Errno::last()));
        }
        // parent already gone before PDEATHSIG was armed
        if unsafe { libc::getppid() } != self.plan.parent.as_raw() {
            return Err(fail(Errno::ESRCH));
        }
        reset_signal_state().map_err(&fail)?;
        if let Some(procs) = self.plan.memory_group {
            cgroup::join(procs).map_err(SetupFailure::at(SetupStage::MemoryGroup))?;
        }
        Ok(self.advance())
    }
}

impl<'p> Sandbox<'p, LifecycleOwned> {
    pub fn redirect_streams(self) -> StepResult<Sandbox<'p, StreamsReady>> {
        let fail = SetupFailure::at(SetupStage::Redirect);
        let plan = self.plan;

        let stdin_src = plan.input.as_ref().unwrap_or(&plan.dev_null);
        open_onto(stdin_src, libc::O_RDONLY, libc::STDIN_FILENO).map_err(&fail)?;

        let stdout_opened = match &plan.output {
            Some(path) => open_onto(
                path,
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                libc::STDOUT_FILENO,
            ),
            None => open_onto(&plan.dev_null, libc::O_WRONLY, libc::STDOUT_FILENO),
        };
        stdout_opened.map_err(&fail)?;

        match &plan.error {
            ErrorTarget::SameAsOutput => {
                if unsafe { libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) } < 0 {
                    return Err(fail(Errno::last()));
                }
            }
            ErrorTarget::File(path) => open_onto(
                path,
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                libc::STDERR_FILENO,
            )
            .map_err(&fail)?,
            ErrorTarget::Null => {
                open_onto(&plan.dev_null, libc::O_WRONLY, libc::STDERR_FILENO).map_err(&fail)?
            }
        }

        mark_cloexec_from(3, plan.fd_ceiling).map_err(&fail)?;
        Ok(self.advance())
    }
}

/// Open `path` and install it as `target`.
fn open_onto(path: &CString, flags: libc::c_int, target: RawFd) -> std::result::Result<(), Errno> {
    let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, OUTPUT_MODE) };
    if fd < 0 {
        return Err(Errno::last());
    }
    if fd == target {
        // opened straight into place; clear the close-on-exec bit
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
        return if rc < 0 { Err(Errno::last()) } else { Ok(()) };
    }
    let rc = unsafe { libc::dup2(fd, target) };
    let dup_err = Errno::last();
    unsafe { libc::close(fd) };
    if rc < 0 {
        return Err(dup_err);
    }
    Ok(())
}

impl<'p> Sandbox<'p, StreamsReady> {
    pub fn apply_limits(self) -> StepResult<Sandbox<'p, LimitsApplied>> {
        self.plan
            .rlimits
            .apply()
            .map_err(SetupFailure::at(SetupStage::Rlimit))?;
        Ok(self.advance())
    }
}

impl<'p> Sandbox<'p, LimitsApplied> {
    pub fn drop_credentials(self) -> StepResult<Sandbox<'p, CredsDropped>> {
        if let Some(creds) = &self.plan.credentials {
            switch_credentials(creds).map_err(SetupFailure::at(SetupStage::Credentials))?;
        }
        Ok(self.advance())
    }
}

impl<'p> Sandbox<'p, CredsDropped> {
    /// Last step before exec; nothing but `execve` runs under the filter.
    ///
    /// The RSS mark is taken here, after the last step that could touch
    /// memory, so anything `wait4` reports above it belongs to the program.
    pub fn install_filter(self) -> StepResult<Sandbox<'p, FilterInstalled>> {
        if let Ok(usage) = getrusage(UsageWho::RUSAGE_SELF) {
            let record = ChildReport::encode_baseline(usage.max_rss().max(0) as u64);
            unsafe { libc::write(self.report_fd, record.as_ptr().cast(), record.len()) };
        }
        if let Some(filter) = &self.plan.filter {
            filter
                .install()
                .map_err(SetupFailure::at(SetupStage::Seccomp))?;
        }
        Ok(self.advance())
    }
}

impl<'p> Sandbox<'p, FilterInstalled> {
    /// Replace the process image. Only returns on failure.
    pub fn exec(self) -> StepResult<Infallible> {
        let plan = self.plan;
        unsafe {
            libc::execve(
                plan.exe.as_ptr(),
                plan.argv_ptrs.as_ptr(),
                plan.envp_ptrs.as_ptr(),
            );
        }
        Err(SetupFailure {
            stage: SetupStage::Exec,
            errno: Errno::last(),
        })
    }
}
