// Request validation
// Every request is checked before anything is forked; a malformed request
// never produces a child.

use crate::config::presets;
use crate::config::types::{ExecutionRequest, JudgeError, Result};
use crate::kernel::credentials::{validate_credentials, Credentials};
use nix::unistd::{access, AccessFlags};
use std::path::Path;

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a request and fail fast on the first class of problem found.
///
/// Warnings are logged, errors become [`JudgeError::InvalidConfig`].
/// A credential switch by a non-root caller is [`JudgeError::RootRequired`].
pub fn validate_request(request: &ExecutionRequest) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(request, &mut result);
    validate_paths(request, &mut result);
    validate_strings(request, &mut result);
    validate_policy(request, &mut result);

    for warning in &result.warnings {
        log::warn!("Request warning: {}", warning);
    }

    if !result.is_valid() {
        return Err(JudgeError::InvalidConfig(result.errors.join("; ")));
    }

    if let Some(creds) = Credentials::new(request.uid, request.gid) {
        validate_credentials(&creds)?;
    }

    Ok(result)
}

/// Validate resource limits
fn validate_limits(request: &ExecutionRequest, result: &mut ValidationResult) {
    let limits = &request.limits;
    for (name, limit) in limits.entries() {
        if !limit.is_valid() {
            result.add_error(format!(
                "{} must be positive or -1 (unlimited), got {}",
                name,
                limit.raw()
            ));
        }
    }

    match (limits.max_cpu_time.get(), limits.max_real_time.get()) {
        (Some(_), None) => result.add_warning(
            "max_cpu_time is set but max_real_time is unlimited; a blocked program is never killed"
                .to_string(),
        ),
        (Some(cpu), Some(real)) if real < cpu => result.add_warning(format!(
            "max_real_time ({}ms) is below max_cpu_time ({}ms); CPU limit can never trigger",
            real, cpu
        )),
        _ => {}
    }

    if let Some(memory) = limits.max_memory.get() {
        if memory < 1024 * 1024 {
            result.add_warning(format!(
                "max_memory {} is very low (< 1MB), the loader alone may exceed it",
                memory
            ));
        }
    }

    if limits.memory_limit_check_only && limits.max_memory.is_unlimited() {
        result.add_warning("memory_limit_check_only has no effect without max_memory".to_string());
    }
}

/// Validate executable and redirection paths
fn validate_paths(request: &ExecutionRequest, result: &mut ValidationResult) {
    let exe = &request.exe_path;
    if !exe.is_absolute() {
        result.add_error(format!(
            "exe_path must be absolute (no PATH lookup is done): {}",
            exe.display()
        ));
    } else if !exe.is_file() {
        result.add_error(format!("exe_path is not a regular file: {}", exe.display()));
    } else if let Err(e) = access(exe.as_path(), AccessFlags::X_OK) {
        result.add_error(format!("exe_path is not executable: {}: {}", exe.display(), e));
    }

    if let Some(input) = &request.input_path {
        if !input.exists() {
            result.add_error(format!("input_path does not exist: {}", input.display()));
        } else if input.is_dir() {
            result.add_error(format!("input_path is a directory: {}", input.display()));
        }
    }

    for (name, path) in [
        ("output_path", &request.output_path),
        ("error_path", &request.error_path),
    ] {
        if let Some(path) = path {
            check_writable_target(name, path, result);
        }
    }
}

fn check_writable_target(name: &str, path: &Path, result: &mut ValidationResult) {
    if path.is_dir() {
        result.add_error(format!("{} is a directory: {}", name, path.display()));
        return;
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !parent.is_dir() {
        result.add_error(format!(
            "{} parent directory does not exist: {}",
            name,
            parent.display()
        ));
    }
}

/// argv/envp must survive conversion to C strings
fn validate_strings(request: &ExecutionRequest, result: &mut ValidationResult) {
    for (i, arg) in request.args.iter().enumerate() {
        if arg.contains('\0') {
            result.add_error(format!("argument {} contains a NUL byte", i));
        }
    }

    for (key, value) in &request.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            result.add_error(format!("invalid environment variable name {:?}", key));
        }
        if value.contains('\0') {
            result.add_error(format!("environment variable {} contains a NUL byte", key));
        }
    }
}

fn validate_policy(request: &ExecutionRequest, result: &mut ValidationResult) {
    match presets::policy_for(&request.policy) {
        Some(policy) => {
            // the executable address is irrelevant here, only the shape is checked
            let placeholder = std::ffi::CString::from(c"/");
            if let Err(e) = policy.compile(Some(placeholder.as_c_str())) {
                result.add_error(e.to_string());
            }
        }
        None => result.add_warning(format!(
            "no syscall filter for {}; only use this for trusted programs",
            request.exe_path.display()
        )),
    }
}
