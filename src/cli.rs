use crate::config::types::{ExecutionRequest, ExecutionResult, Limit, PolicySelector};
use crate::kernel::seccomp::SyscallPolicy;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

/// Named syscall rule sets accepted by `--seccomp-rule-name`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
#[value(rename_all = "snake_case")]
enum RuleName {
    CCpp,
    CCppFileIo,
    General,
    Golang,
    Node,
    /// Run without a syscall filter
    None,
}

impl From<RuleName> for PolicySelector {
    fn from(name: RuleName) -> Self {
        match name {
            RuleName::CCpp => Self::Standard,
            RuleName::CCppFileIo => Self::StandardFileIo,
            RuleName::General => Self::NativeExtensionSafe,
            RuleName::Golang => Self::Golang,
            RuleName::Node => Self::Node,
            RuleName::None => Self::Unfiltered,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one program under resource limits and a syscall filter", long_about = None)]
struct Cli {
    /// Absolute path of the program to run
    #[arg(long)]
    exe_path: PathBuf,
    /// Argument passed to the program (repeatable, argv[0] is the exe path)
    #[arg(long = "args", value_name = "ARG", allow_hyphen_values = true)]
    args: Vec<String>,
    /// Environment entry KEY=VALUE (repeatable, the environment starts empty)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,
    /// File connected to stdin
    #[arg(long)]
    input_path: Option<PathBuf>,
    /// File connected to stdout
    #[arg(long)]
    output_path: Option<PathBuf>,
    /// File connected to stderr
    #[arg(long)]
    error_path: Option<PathBuf>,
    /// CPU time limit in milliseconds
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_cpu_time: i64,
    /// Wall clock limit in milliseconds
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_real_time: i64,
    /// Memory limit in bytes
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_memory: i64,
    /// Stack limit in bytes
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_stack: i64,
    /// Maximum number of processes for the run's user
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_process_number: i64,
    /// Maximum size of any written file in bytes
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_output_size: i64,
    /// Measure memory against the limit without capping the address space
    #[arg(long)]
    memory_limit_check_only: bool,
    /// Run the program as this uid (requires root)
    #[arg(long)]
    uid: Option<u32>,
    /// Run the program as this gid (requires root)
    #[arg(long)]
    gid: Option<u32>,
    /// Named syscall rule set
    #[arg(long, value_enum, default_value = "c_cpp", conflicts_with = "policy_file")]
    seccomp_rule_name: RuleName,
    /// JSON syscall policy, replacing the named rule set
    #[arg(long)]
    policy_file: Option<PathBuf>,
    /// Append log records to this file instead of stderr
    #[arg(long)]
    log_path: Option<PathBuf>,
}

fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("empty variable name in {:?}", raw)),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

impl Cli {
    fn into_request(self) -> Result<ExecutionRequest> {
        let policy = match &self.policy_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading policy file {}", path.display()))?;
                let policy = SyscallPolicy::from_json(&text)
                    .with_context(|| format!("parsing policy file {}", path.display()))?;
                PolicySelector::Explicit(policy)
            }
            None => self.seccomp_rule_name.into(),
        };

        let mut request = ExecutionRequest::new(self.exe_path);
        request.args = self.args;
        request.env = self.env;
        request.input_path = self.input_path;
        request.output_path = self.output_path;
        request.error_path = self.error_path;
        request.limits.max_cpu_time = Limit::from(self.max_cpu_time);
        request.limits.max_real_time = Limit::from(self.max_real_time);
        request.limits.max_memory = Limit::from(self.max_memory);
        request.limits.max_stack = Limit::from(self.max_stack);
        request.limits.max_process_number = Limit::from(self.max_process_number);
        request.limits.max_output_size = Limit::from(self.max_output_size);
        request.limits.memory_limit_check_only = self.memory_limit_check_only;
        request.policy = policy;
        request.uid = self.uid;
        request.gid = self.gid;
        Ok(request)
    }
}

fn init_logging(log_path: Option<&PathBuf>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(path) = log_path {
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn print_result(result: &ExecutionResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("serializing result")?;
    println!("{}", json);
    Ok(())
}

/// Parse arguments, run once, print the result as JSON on stdout.
///
/// A sandbox failure still prints a `SYSTEM_ERROR` result before returning
/// the error, so callers reading stdout always get a record.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_path.as_ref())?;

    let request = cli.into_request()?;
    match crate::run(request) {
        Ok(result) => print_result(&result),
        Err(e) => {
            log::error!("Sandbox failure: {}", e);
            print_result(&ExecutionResult::from_error(&e))?;
            Err(e.into())
        }
    }
}
