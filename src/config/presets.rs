//! Named syscall rule sets.
//!
//! `c_cpp` is a whitelist for compiled programs; `general`, `golang` and
//! `node` are blacklists for runtimes whose syscall surface is too wide to
//! enumerate. Every preset pins `execve` to the configured executable and
//! refuses write-mode opens unless the preset is meant for file IO.

use crate::config::types::PolicySelector;
use crate::kernel::seccomp::{ArgCmp, SeccompAction, SyscallPolicy, SyscallRule};

const WRITE_FLAGS: u64 = (libc::O_WRONLY | libc::O_RDWR) as u64;

#[cfg(target_arch = "x86_64")]
const C_CPP_ARCH_SPECIFIC: &[libc::c_long] = &[
    libc::SYS_access,
    libc::SYS_arch_prctl,
    libc::SYS_fstat,
    libc::SYS_readlink,
];
#[cfg(not(target_arch = "x86_64"))]
const C_CPP_ARCH_SPECIFIC: &[libc::c_long] = &[libc::SYS_fstat];

const C_CPP_WHITELIST: &[libc::c_long] = &[
    libc::SYS_brk,
    libc::SYS_clock_gettime,
    libc::SYS_close,
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_faccessat,
    libc::SYS_futex,
    libc::SYS_getrandom,
    libc::SYS_lseek,
    libc::SYS_mmap,
    libc::SYS_mprotect,
    libc::SYS_munmap,
    libc::SYS_newfstatat,
    libc::SYS_pread64,
    libc::SYS_prlimit64,
    libc::SYS_read,
    libc::SYS_readlinkat,
    libc::SYS_readv,
    libc::SYS_rseq,
    libc::SYS_rt_sigreturn,
    libc::SYS_set_robust_list,
    libc::SYS_set_tid_address,
    libc::SYS_write,
    libc::SYS_writev,
];

#[cfg(target_arch = "x86_64")]
const FORK_FAMILY: &[libc::c_long] = &[libc::SYS_fork, libc::SYS_vfork];
#[cfg(not(target_arch = "x86_64"))]
const FORK_FAMILY: &[libc::c_long] = &[];

/// Resolve a selector to the policy to install, `None` for no filter.
pub fn policy_for(selector: &PolicySelector) -> Option<SyscallPolicy> {
    match selector {
        PolicySelector::Standard => Some(c_cpp()),
        PolicySelector::StandardFileIo => Some(c_cpp_file_io()),
        PolicySelector::NativeExtensionSafe => Some(general()),
        PolicySelector::Golang => Some(golang()),
        PolicySelector::Node => Some(node()),
        PolicySelector::Explicit(policy) => Some(policy.clone()),
        PolicySelector::Unfiltered => None,
    }
}

/// Look up a preset by its rule-set name.
pub fn by_name(name: &str) -> Option<PolicySelector> {
    match name {
        "c_cpp" => Some(PolicySelector::Standard),
        "c_cpp_file_io" => Some(PolicySelector::StandardFileIo),
        "general" => Some(PolicySelector::NativeExtensionSafe),
        "golang" => Some(PolicySelector::Golang),
        "node" => Some(PolicySelector::Node),
        _ => None,
    }
}

fn exec_only_target(policy: SyscallPolicy) -> SyscallPolicy {
    policy.rule(SyscallRule::allow(libc::SYS_execve).when(ArgCmp::is_executable(0)))
}

#[cfg(target_arch = "x86_64")]
fn read_only_opens(policy: SyscallPolicy) -> SyscallPolicy {
    policy
        .rule(SyscallRule::allow(libc::SYS_open).when(ArgCmp::masked_eq(1, WRITE_FLAGS, 0)))
        .rule(SyscallRule::allow(libc::SYS_openat).when(ArgCmp::masked_eq(2, WRITE_FLAGS, 0)))
}

#[cfg(not(target_arch = "x86_64"))]
fn read_only_opens(policy: SyscallPolicy) -> SyscallPolicy {
    policy.rule(SyscallRule::allow(libc::SYS_openat).when(ArgCmp::masked_eq(2, WRITE_FLAGS, 0)))
}

/// Whitelist for C/C++ submissions: no new files for writing, no processes.
pub fn c_cpp() -> SyscallPolicy {
    let policy = SyscallPolicy::new(SeccompAction::Kill)
        .allow_all(C_CPP_WHITELIST)
        .allow_all(C_CPP_ARCH_SPECIFIC);
    read_only_opens(exec_only_target(policy))
}

/// `c_cpp` plus unrestricted opens and descriptor duplication.
pub fn c_cpp_file_io() -> SyscallPolicy {
    let policy = SyscallPolicy::new(SeccompAction::Kill)
        .allow_all(C_CPP_WHITELIST)
        .allow_all(C_CPP_ARCH_SPECIFIC)
        .allow_all(&[libc::SYS_openat, libc::SYS_dup, libc::SYS_dup3]);
    #[cfg(target_arch = "x86_64")]
    let policy = policy.allow_all(&[libc::SYS_open, libc::SYS_dup2]);
    exec_only_target(policy)
}

fn kill_writable(policy: SyscallPolicy, syscall: libc::c_long, flags_arg: u8) -> SyscallPolicy {
    let wronly = libc::O_WRONLY as u64;
    let rdwr = libc::O_RDWR as u64;
    policy
        .rule(SyscallRule::kill(syscall).when(ArgCmp::masked_eq(flags_arg, wronly, wronly)))
        .rule(SyscallRule::kill(syscall).when(ArgCmp::masked_eq(flags_arg, rdwr, rdwr)))
}

fn blacklist(allow_clone: bool) -> SyscallPolicy {
    let mut policy = SyscallPolicy::new(SeccompAction::Allow)
        .rule(SyscallRule::errno(libc::SYS_socket, libc::EACCES))
        .kill_all(&[libc::SYS_kill, libc::SYS_execveat])
        .kill_all(FORK_FAMILY);
    if !allow_clone {
        policy = policy.kill_all(&[libc::SYS_clone, libc::SYS_clone3]);
    }
    policy = policy.rule(SyscallRule::kill(libc::SYS_execve).when(ArgCmp::is_not_executable(0)));

    #[cfg(target_arch = "x86_64")]
    {
        policy = kill_writable(policy, libc::SYS_open, 1);
    }
    kill_writable(policy, libc::SYS_openat, 2)
}

/// Blacklist for interpreters and native extensions.
pub fn general() -> SyscallPolicy {
    blacklist(false)
}

/// Go spawns OS threads through `clone`.
pub fn golang() -> SyscallPolicy {
    blacklist(true)
}

/// Node's libuv pool also needs `clone`.
pub fn node() -> SyscallPolicy {
    blacklist(true)
}
