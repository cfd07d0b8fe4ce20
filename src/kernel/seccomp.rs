//! Seccomp-BPF syscall filtering.
//!
//! A [`SyscallPolicy`] is an ordered rule list plus an explicit default
//! action. [`SyscallPolicy::compile`] turns it into a classic BPF program
//! in the parent; the child only calls [`CompiledFilter::install`], which
//! issues two raw syscalls and allocates nothing.
//!
//! ## Program layout
//!
//! 1. Kill on a foreign audit architecture
//! 2. (x86_64) kill on x32 syscall numbers
//! 3. Load the syscall number
//! 4. One block per rule, in order: match number, compare arguments,
//!    return the rule's action. A failed argument compare reloads the
//!    syscall number and falls through to the next block.
//! 5. Return the default action
//!
//! First match wins. Once installed the filter cannot be removed, and
//! `PR_SET_NO_NEW_PRIVS` is set before it.

use crate::config::types::{JudgeError, Result};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::ffi::CStr;

const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// BPF instruction classes
const BPF_LD: u16 = 0x00;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// ld fields
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;

// alu/jmp fields
const BPF_AND: u16 = 0x50;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_00b7;

#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

// struct seccomp_data offsets
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS: u32 = 16;

/// Kernel limit on classic BPF program length.
pub const MAX_INSTRUCTIONS: usize = 4096;
/// Largest errno a filter may return.
pub const MAX_ERRNO: u16 = 4095;
/// Syscalls take at most six arguments.
pub const MAX_ARGS: u8 = 6;

/// What the kernel does when a rule (or the default) matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeccompAction {
    Allow,
    /// Kill the whole process with SIGSYS
    Kill,
    /// Deliver a catchable SIGSYS
    Trap,
    /// Fail the syscall with this errno
    Errno(u16),
}

impl SeccompAction {
    fn ret_value(self) -> u32 {
        match self {
            SeccompAction::Allow => SECCOMP_RET_ALLOW,
            SeccompAction::Kill => SECCOMP_RET_KILL_PROCESS,
            SeccompAction::Trap => SECCOMP_RET_TRAP,
            SeccompAction::Errno(errno) => SECCOMP_RET_ERRNO | u32::from(errno),
        }
    }
}

/// Comparison applied to one 64-bit syscall argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    /// `(arg & mask) == value`
    MaskedEq(u64),
}

/// Right-hand side of an argument comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Const(u64),
    /// Address of the executable path handed to `execve`, resolved at
    /// compile time. Lets a policy allow exactly one `execve`.
    ExecutablePath,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArgCmp {
    pub index: u8,
    pub op: CmpOp,
    pub value: ArgValue,
}

impl ArgCmp {
    pub fn eq(index: u8, value: u64) -> Self {
        Self {
            index,
            op: CmpOp::Eq,
            value: ArgValue::Const(value),
        }
    }

    pub fn ne(index: u8, value: u64) -> Self {
        Self {
            index,
            op: CmpOp::Ne,
            value: ArgValue::Const(value),
        }
    }

    pub fn masked_eq(index: u8, mask: u64, value: u64) -> Self {
        Self {
            index,
            op: CmpOp::MaskedEq(mask),
            value: ArgValue::Const(value),
        }
    }

    pub fn is_executable(index: u8) -> Self {
        Self {
            index,
            op: CmpOp::Eq,
            value: ArgValue::ExecutablePath,
        }
    }

    pub fn is_not_executable(index: u8) -> Self {
        Self {
            index,
            op: CmpOp::Ne,
            value: ArgValue::ExecutablePath,
        }
    }
}

/// One rule: a syscall number, an action and optional argument predicates.
/// All predicates must hold for the rule to match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyscallRule {
    pub syscall: i64,
    pub action: SeccompAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgCmp>,
}

impl SyscallRule {
    pub fn new(syscall: libc::c_long, action: SeccompAction) -> Self {
        Self {
            syscall: syscall as i64,
            action,
            args: Vec::new(),
        }
    }

    pub fn allow(syscall: libc::c_long) -> Self {
        Self::new(syscall, SeccompAction::Allow)
    }

    pub fn kill(syscall: libc::c_long) -> Self {
        Self::new(syscall, SeccompAction::Kill)
    }

    pub fn errno(syscall: libc::c_long, errno: i32) -> Self {
        Self::new(syscall, SeccompAction::Errno(errno as u16))
    }

    pub fn when(mut self, cmp: ArgCmp) -> Self {
        self.args.push(cmp);
        self
    }
}

/// Ordered syscall rules with an explicit fallback.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyscallPolicy {
    pub rules: Vec<SyscallRule>,
    pub default_action: SeccompAction,
}

impl SyscallPolicy {
    pub fn new(default_action: SeccompAction) -> Self {
        Self {
            rules: Vec::new(),
            default_action,
        }
    }

    pub fn rule(mut self, rule: SyscallRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn allow_all(mut self, syscalls: &[libc::c_long]) -> Self {
        self.rules
            .extend(syscalls.iter().map(|&nr| SyscallRule::allow(nr)));
        self
    }

    pub fn kill_all(mut self, syscalls: &[libc::c_long]) -> Self {
        self.rules
            .extend(syscalls.iter().map(|&nr| SyscallRule::kill(nr)));
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| JudgeError::Filter(format!("Invalid policy document: {}", e)))
    }

    pub fn references_executable(&self) -> bool {
        self.rules.iter().any(|rule| {
            rule.args
                .iter()
                .any(|cmp| cmp.value == ArgValue::ExecutablePath)
        })
    }

    /// Compile to a BPF program.
    ///
    /// `executable` resolves [`ArgValue::ExecutablePath`]; its buffer must
    /// stay alive and unmoved until the child calls `execve` with it.
    pub fn compile(&self, executable: Option<&CStr>) -> Result<CompiledFilter> {
        let exe_addr = executable.map(|path| path.as_ptr() as u64);

        let mut program = Vec::with_capacity(8 + self.rules.len() * 4);

        program.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
        program.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            AUDIT_ARCH_CURRENT,
            1,
            0,
        ));
        program.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        program.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR));

        #[cfg(target_arch = "x86_64")]
        {
            program.push(SockFilter::jump(
                BPF_JMP | BPF_JGE | BPF_K,
                X32_SYSCALL_BIT,
                0,
                1,
            ));
            program.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        }

        for (position, rule) in self.rules.iter().enumerate() {
            let block = compile_rule(rule, exe_addr)
                .map_err(|msg| JudgeError::Filter(format!("rule {}: {}", position, msg)))?;
            program.extend(block);
        }

        check_action(self.default_action)
            .map_err(|msg| JudgeError::Filter(format!("default action: {}", msg)))?;
        program.push(SockFilter::stmt(
            BPF_RET | BPF_K,
            self.default_action.ret_value(),
        ));

        if program.len() > MAX_INSTRUCTIONS {
            return Err(JudgeError::Filter(format!(
                "program has {} instructions, kernel limit is {}",
                program.len(),
                MAX_INSTRUCTIONS
            )));
        }

        Ok(CompiledFilter { program })
    }
}

fn check_action(action: SeccompAction) -> std::result::Result<(), String> {
    match action {
        SeccompAction::Errno(errno) if errno > MAX_ERRNO => {
            Err(format!("errno {} out of range (max {})", errno, MAX_ERRNO))
        }
        _ => Ok(()),
    }
}

/// Jump target inside a rule block before offsets are known.
#[derive(Clone, Copy)]
enum Target {
    Next,
    Skip(u8),
    Fail,
}

struct Pending {
    code: u16,
    k: u32,
    jt: Target,
    jf: Target,
}

impl Pending {
    fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            k,
            jt: Target::Next,
            jf: Target::Next,
        }
    }

    fn jeq(k: u32, jt: Target, jf: Target) -> Self {
        Self {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            k,
            jt,
            jf,
        }
    }
}

fn compile_rule(rule: &SyscallRule, exe_addr: Option<u64>) -> std::result::Result<Vec<SockFilter>, String> {
    let nr = u32::try_from(rule.syscall)
        .ok()
        .filter(|&nr| nr < 0x4000_0000)
        .ok_or_else(|| format!("syscall number {} out of range", rule.syscall))?;
    check_action(rule.action)?;

    if rule.args.is_empty() {
        return Ok(vec![
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 1),
            SockFilter::stmt(BPF_RET | BPF_K, rule.action.ret_value()),
        ]);
    }

    if rule.args.len() > usize::from(MAX_ARGS) {
        return Err(format!("{} argument comparisons (max {})", rule.args.len(), MAX_ARGS));
    }

    let mut body: Vec<Pending> = Vec::new();
    for cmp in &rule.args {
        if cmp.index >= MAX_ARGS {
            return Err(format!("argument index {} out of range", cmp.index));
        }
        let value = match cmp.value {
            ArgValue::Const(v) => v,
            ArgValue::ExecutablePath => exe_addr
                .ok_or_else(|| "executable path comparison without an executable".to_string())?,
        };
        emit_arg_cmp(&mut body, cmp.index, cmp.op, value);
    }
    body.push(Pending::stmt(BPF_RET | BPF_K, rule.action.ret_value()));

    // layout: [jeq nr] body... [ld nr]
    let fail_at = body.len() + 1;
    let block_len = fail_at + 1;

    let mut block = Vec::with_capacity(block_len);
    let skip_block = offset(block_len - 1)?;
    block.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, skip_block));

    for (i, ins) in body.iter().enumerate() {
        let at = i + 1;
        let resolve = |target: Target| -> std::result::Result<u8, String> {
            match target {
                Target::Next => Ok(0),
                Target::Skip(n) => Ok(n),
                Target::Fail => offset(fail_at - at - 1),
            }
        };
        block.push(SockFilter::jump(ins.code, ins.k, resolve(ins.jt)?, resolve(ins.jf)?));
    }
    block.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR));

    Ok(block)
}

fn offset(distance: usize) -> std::result::Result<u8, String> {
    u8::try_from(distance).map_err(|_| "rule too large for a BPF jump".to_string())
}

#[cfg(target_endian = "little")]
fn arg_word_offsets(index: u8) -> (u32, u32) {
    let base = OFFSET_ARGS + 8 * u32::from(index);
    (base, base + 4)
}

#[cfg(target_endian = "big")]
fn arg_word_offsets(index: u8) -> (u32, u32) {
    let base = OFFSET_ARGS + 8 * u32::from(index);
    (base + 4, base)
}

fn emit_arg_cmp(body: &mut Vec<Pending>, index: u8, op: CmpOp, value: u64) {
    let (lo_off, hi_off) = arg_word_offsets(index);
    let lo = value as u32;
    let hi = (value >> 32) as u32;

    match op {
        CmpOp::Eq => {
            body.push(Pending::stmt(BPF_LD | BPF_W | BPF_ABS, lo_off));
            body.push(Pending::jeq(lo, Target::Next, Target::Fail));
            body.push(Pending::stmt(BPF_LD | BPF_W | BPF_ABS, hi_off));
            body.push(Pending::jeq(hi, Target::Next, Target::Fail));
        }
        CmpOp::Ne => {
            // holds as soon as either word differs
            body.push(Pending::stmt(BPF_LD | BPF_W | BPF_ABS, lo_off));
            body.push(Pending::jeq(lo, Target::Next, Target::Skip(2)));
            body.push(Pending::stmt(BPF_LD | BPF_W | BPF_ABS, hi_off));
            body.push(Pending::jeq(hi, Target::Fail, Target::Next));
        }
        CmpOp::MaskedEq(mask) => {
            body.push(Pending::stmt(BPF_LD | BPF_W | BPF_ABS, lo_off));
            body.push(Pending::stmt(BPF_ALU | BPF_AND | BPF_K, mask as u32));
            body.push(Pending::jeq(lo, Target::Next, Target::Fail));
            body.push(Pending::stmt(BPF_LD | BPF_W | BPF_ABS, hi_off));
            body.push(Pending::stmt(BPF_ALU | BPF_AND | BPF_K, (mask >> 32) as u32));
            body.push(Pending::jeq(hi, Target::Next, Target::Fail));
        }
    }
}

/// Classic BPF instruction, layout of `struct sock_filter`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
struct SockFprog {
    len: libc::c_ushort,
    filter: *const SockFilter,
}

/// A verified BPF program ready for installation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledFilter {
    program: Vec<SockFilter>,
}

impl CompiledFilter {
    pub fn instructions(&self) -> &[SockFilter] {
        &self.program
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Set no_new_privs and load the program into the calling process.
    ///
    /// Async-signal-safe: meant for the forked child right before `execve`.
    pub fn install(&self) -> std::result::Result<(), Errno> {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(Errno::last());
        }

        let fprog = SockFprog {
            len: self.program.len() as libc::c_ushort,
            filter: self.program.as_ptr(),
        };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                0 as libc::c_ulong,
                &fprog as *const SockFprog,
            )
        };
        if rc != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}
