use crate::kernel::seccomp::SyscallPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single resource ceiling.
///
/// Stored as a signed integer so that request documents can use `-1` for
/// "unlimited", the same convention the CLI flags use. Zero and other
/// negative values are representable but rejected by the validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Limit(i64);

impl Limit {
    pub const UNLIMITED: Limit = Limit(-1);

    /// Finite ceiling. Values above `i64::MAX` saturate.
    pub const fn of(value: u64) -> Self {
        if value > i64::MAX as u64 {
            Limit(i64::MAX)
        } else {
            Limit(value as i64)
        }
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_unlimited(self) -> bool {
        self.0 == -1
    }

    /// Positive or the unlimited sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 == -1 || self.0 > 0
    }

    /// The ceiling, or `None` when unlimited (or invalid).
    pub const fn get(self) -> Option<u64> {
        if self.0 > 0 {
            Some(self.0 as u64)
        } else {
            None
        }
    }

    /// True when `used` is strictly above a finite ceiling.
    pub fn exceeded_by(self, used: u64) -> bool {
        self.get().is_some_and(|limit| used > limit)
    }
}

impl Default for Limit {
    fn default() -> Self {
        Limit::UNLIMITED
    }
}

impl From<i64> for Limit {
    fn from(value: i64) -> Self {
        Limit(value)
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Resource ceilings for one execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time in milliseconds
    #[serde(default)]
    pub max_cpu_time: Limit,
    /// Wall clock time in milliseconds
    #[serde(default)]
    pub max_real_time: Limit,
    /// Peak resident memory in bytes
    #[serde(default)]
    pub max_memory: Limit,
    /// Stack size in bytes
    #[serde(default)]
    pub max_stack: Limit,
    /// Processes and threads owned by the target uid
    #[serde(default)]
    pub max_process_number: Limit,
    /// Bytes written to any single file
    #[serde(default)]
    pub max_output_size: Limit,
    /// Only compare peak memory after the run; do not cap the address space.
    /// Needed for runtimes that reserve large virtual regions up front.
    #[serde(default)]
    pub memory_limit_check_only: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_time: Limit::UNLIMITED,
            max_real_time: Limit::UNLIMITED,
            max_memory: Limit::UNLIMITED,
            max_stack: Limit::UNLIMITED,
            max_process_number: Limit::UNLIMITED,
            max_output_size: Limit::UNLIMITED,
            memory_limit_check_only: false,
        }
    }
}

impl ResourceLimits {
    /// Named view used by validation and logging.
    pub fn entries(&self) -> [(&'static str, Limit); 6] {
        [
            ("max_cpu_time", self.max_cpu_time),
            ("max_real_time", self.max_real_time),
            ("max_memory", self.max_memory),
            ("max_stack", self.max_stack),
            ("max_process_number", self.max_process_number),
            ("max_output_size", self.max_output_size),
        ]
    }
}

/// Which syscall policy to install in the child.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySelector {
    /// Deny-by-default whitelist for compiled C/C++ programs, read-only opens
    #[default]
    Standard,
    /// Like `Standard` but the program may open files for writing
    StandardFileIo,
    /// Allow-by-default blacklist for interpreters and native extensions
    NativeExtensionSafe,
    /// Blacklist that keeps `clone` for the Go runtime's threads
    Golang,
    /// Blacklist that keeps `clone` for Node's worker threads
    Node,
    /// Caller-supplied rules
    Explicit(SyscallPolicy),
    /// No filter at all. Only for trusted helpers such as compilers.
    Unfiltered,
}

/// One sandboxed execution, consumed by [`crate::run`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Program to execute; also passed as argv[0]
    pub exe_path: PathBuf,
    /// Arguments after argv[0]
    #[serde(default)]
    pub args: Vec<String>,
    /// The complete environment of the target, nothing is inherited
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// stdin source, `/dev/null` when unset
    #[serde(default)]
    pub input_path: Option<PathBuf>,
    /// stdout destination (truncated), `/dev/null` when unset
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// stderr destination; may equal `output_path`
    #[serde(default)]
    pub error_path: Option<PathBuf>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub policy: PolicySelector,
    /// Switch to this uid before exec (root only)
    #[serde(default)]
    pub uid: Option<u32>,
    /// Switch to this gid before exec (root only)
    #[serde(default)]
    pub gid: Option<u32>,
}

impl ExecutionRequest {
    pub fn new(exe_path: impl Into<PathBuf>) -> Self {
        Self {
            exe_path: exe_path.into(),
            args: Vec::new(),
            env: Vec::new(),
            input_path: None,
            output_path: None,
            error_path: None,
            limits: ResourceLimits::default(),
            policy: PolicySelector::default(),
            uid: None,
            gid: None,
        }
    }

    pub fn wants_credential_switch(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }
}

/// How a run ended, from the judge's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    CpuTimeLimitExceeded,
    RealTimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    SystemError,
    OutputLimitExceeded,
    SignalledByKernel,
}

impl Outcome {
    /// Numeric result code understood by existing judge front-ends.
    pub fn code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::CpuTimeLimitExceeded => 1,
            Outcome::RealTimeLimitExceeded => 2,
            Outcome::MemoryLimitExceeded => 3,
            Outcome::RuntimeError => 4,
            Outcome::SystemError => 5,
            Outcome::OutputLimitExceeded => 6,
            Outcome::SignalledByKernel => 7,
        }
    }

    pub fn is_time_limit(self) -> bool {
        matches!(
            self,
            Outcome::CpuTimeLimitExceeded | Outcome::RealTimeLimitExceeded
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Success => "SUCCESS",
            Outcome::CpuTimeLimitExceeded => "CPU_TIME_LIMIT_EXCEEDED",
            Outcome::RealTimeLimitExceeded => "REAL_TIME_LIMIT_EXCEEDED",
            Outcome::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Outcome::RuntimeError => "RUNTIME_ERROR",
            Outcome::SystemError => "SYSTEM_ERROR",
            Outcome::OutputLimitExceeded => "OUTPUT_LIMIT_EXCEEDED",
            Outcome::SignalledByKernel => "SIGNALLED_BY_KERNEL",
        };
        f.write_str(name)
    }
}

/// Which ceiling a limit-driven termination came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    CpuTime,
    RealTime,
    Memory,
    Output,
}

/// Who ended the process, independent of raw signal numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause", content = "limit")]
pub enum Termination {
    /// The process exited on its own
    #[default]
    None,
    RaisedByLimit(LimitKind),
    RaisedByFilter,
    RaisedExternally,
}

/// Numeric infrastructure error codes, kept stable for front-ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidConfig,
    ForkFailed,
    PthreadFailed,
    WaitFailed,
    RootRequired,
    LoadSeccompFailed,
    SetrlimitFailed,
    Dup2Failed,
    SetuidFailed,
    ExecveFailed,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::InvalidConfig => -1,
            ErrorCode::ForkFailed => -2,
            ErrorCode::PthreadFailed => -3,
            ErrorCode::WaitFailed => -4,
            ErrorCode::RootRequired => -5,
            ErrorCode::LoadSeccompFailed => -6,
            ErrorCode::SetrlimitFailed => -7,
            ErrorCode::Dup2Failed => -8,
            ErrorCode::SetuidFailed => -9,
            ErrorCode::ExecveFailed => -10,
        }
    }
}

/// Result of one execution. Every field is populated for every outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Exit status when the process exited, 0 otherwise
    pub exit_code: i32,
    /// Terminating signal, 0 if none
    pub signal: i32,
    pub termination: Termination,
    pub cpu_time_ms: u64,
    pub real_time_ms: u64,
    /// Peak memory of the program: `memory.peak` of its cgroup when one was
    /// used, otherwise `ru_maxrss`
    pub memory_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl ExecutionResult {
    /// Render a failed call as a SystemError result document.
    pub fn from_error(err: &JudgeError) -> Self {
        Self {
            outcome: Outcome::SystemError,
            exit_code: 0,
            signal: 0,
            termination: Termination::None,
            cpu_time_ms: 0,
            real_time_ms: 0,
            memory_kb: 0,
            error: Some(err.code()),
        }
    }
}

/// Step of the child's pre-exec sequence, reported on setup failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SetupStage {
    Lifecycle = 1,
    Redirect = 2,
    Rlimit = 3,
    Credentials = 4,
    Seccomp = 5,
    Exec = 6,
    MemoryGroup = 7,
}

impl SetupStage {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(SetupStage::Lifecycle),
            2 => Some(SetupStage::Redirect),
            3 => Some(SetupStage::Rlimit),
            4 => Some(SetupStage::Credentials),
            5 => Some(SetupStage::Seccomp),
            6 => Some(SetupStage::Exec),
            7 => Some(SetupStage::MemoryGroup),
            _ => None,
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Lifecycle => "lifecycle",
            SetupStage::Redirect => "stream redirection",
            SetupStage::Rlimit => "resource limits",
            SetupStage::Credentials => "credential switch",
            SetupStage::Seccomp => "seccomp install",
            SetupStage::Exec => "execve",
            SetupStage::MemoryGroup => "memory cgroup join",
        };
        f.write_str(name)
    }
}

/// Failures of the sandbox call itself.
#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Root privileges required: {0}")]
    RootRequired(String),

    #[error("Syscall filter error: {0}")]
    Filter(String),

    #[error("fork failed: {0}")]
    Spawn(nix::errno::Errno),

    #[error("Watchdog thread failed: {0}")]
    Watchdog(std::io::Error),

    #[error("Waiting for pid {pid} failed: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Sandbox setup failed during {stage}: {errno}")]
    Setup {
        stage: SetupStage,
        errno: nix::errno::Errno,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JudgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JudgeError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            JudgeError::RootRequired(_) => ErrorCode::RootRequired,
            JudgeError::Filter(_) => ErrorCode::LoadSeccompFailed,
            JudgeError::Spawn(_) | JudgeError::Io(_) => ErrorCode::ForkFailed,
            JudgeError::Watchdog(_) => ErrorCode::PthreadFailed,
            JudgeError::Wait { .. } => ErrorCode::WaitFailed,
            JudgeError::Cgroup(_) => ErrorCode::SetrlimitFailed,
            JudgeError::Setup { stage, .. } => match stage {
                SetupStage::Lifecycle => ErrorCode::ForkFailed,
                SetupStage::Redirect => ErrorCode::Dup2Failed,
                SetupStage::Rlimit => ErrorCode::SetrlimitFailed,
                SetupStage::Credentials => ErrorCode::SetuidFailed,
                SetupStage::Seccomp => ErrorCode::LoadSeccompFailed,
                SetupStage::Exec => ErrorCode::ExecveFailed,
                SetupStage::MemoryGroup => ErrorCode::SetrlimitFailed,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_sentinel_and_validity() {
        assert!(Limit::UNLIMITED.is_valid());
        assert!(Limit::UNLIMITED.get().is_none());
        assert!(!Limit::from(0).is_valid());
        assert!(!Limit::from(-7).is_valid());
        assert_eq!(Limit::of(512).get(), Some(512));
        assert_eq!(Limit::of(u64::MAX).raw(), i64::MAX);
    }

    #[test]
    fn exceeded_is_strict() {
        let limit = Limit::of(1000);
        assert!(!limit.exceeded_by(1000));
        assert!(limit.exceeded_by(1001));
        assert!(!Limit::UNLIMITED.exceeded_by(u64::MAX));
    }

    #[test]
    fn request_document_uses_minus_one_for_unlimited() {
        let json = r#"{
            "exe_path": "/bin/true",
            "limits": { "max_cpu_time": 1000, "max_memory": -1 },
            "policy": "native_extension_safe"
        }"#;
        let request: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.limits.max_cpu_time, Limit::of(1000));
        assert!(request.limits.max_memory.is_unlimited());
        assert!(request.limits.max_real_time.is_unlimited());
        assert_eq!(request.policy, PolicySelector::NativeExtensionSafe);
        assert!(request.args.is_empty());
    }

    #[test]
    fn result_serializes_with_stable_names() {
        let result = ExecutionResult {
            outcome: Outcome::CpuTimeLimitExceeded,
            exit_code: 0,
            signal: 27,
            termination: Termination::RaisedByLimit(LimitKind::CpuTime),
            cpu_time_ms: 503,
            real_time_ms: 510,
            memory_kb: 1200,
            error: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["outcome"], "CPU_TIME_LIMIT_EXCEEDED");
        assert_eq!(value["termination"]["cause"], "raised_by_limit");
        assert_eq!(value["termination"]["limit"], "cpu_time");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn error_codes_follow_stage() {
        let err = JudgeError::Setup {
            stage: SetupStage::Rlimit,
            errno: nix::errno::Errno::EPERM,
        };
        assert_eq!(err.code(), ErrorCode::SetrlimitFailed);
        assert_eq!(err.code().as_i32(), -7);

        let doc = ExecutionResult::from_error(&JudgeError::InvalidConfig("x".into()));
        assert_eq!(doc.outcome, Outcome::SystemError);
        assert_eq!(doc.error, Some(ErrorCode::InvalidConfig));
        assert_eq!(Outcome::SystemError.code(), 5);
    }

    #[test]
    fn setup_stage_raw_round_trip() {
        for stage in [
            SetupStage::Lifecycle,
            SetupStage::Redirect,
            SetupStage::Rlimit,
            SetupStage::Credentials,
            SetupStage::Seccomp,
            SetupStage::Exec,
            SetupStage::MemoryGroup,
        ] {
            assert_eq!(SetupStage::from_raw(stage as i32), Some(stage));
        }
        assert_eq!(SetupStage::from_raw(0), None);
    }
}
