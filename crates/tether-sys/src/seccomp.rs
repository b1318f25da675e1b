//! Seccomp-BPF filter construction.
//!
//! The sandbox policy is a syscall allowlist: anything not explicitly
//! permitted kills the worker with SIGSYS. A small number of syscalls are
//! allowed conditionally on their second argument (`ioctl` restricted to
//! `TCGETS`, `fcntl` restricted to a handful of harmless commands), which
//! BPF can express because the command value is passed in a register, not
//! behind a pointer.
//!
//! ## Filter layout
//!
//! ```text
//! [0-2]    Architecture check (kill on mismatch)
//! [3]      Load syscall number
//! [4..]    Arg-filtered syscalls -> jump to their handler block
//! [..]     Allowlist checks -> ALLOW
//! [..]     RET KILL (default deny)
//! [..]     RET ALLOW
//! [..]     One handler block per arg-filtered syscall:
//!          load args[1], compare against the allowed command values,
//!          ALLOW on match, KILL otherwise
//! ```

// Seccomp return actions
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// BPF instruction classes
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// BPF ld fields
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;

// BPF jmp fields
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_00b7;

// seccomp_data offsets
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS_1: u32 = 24; // args[1], lower 32 bits

/// Maximum allowlist size (BPF jump offsets are u8).
const MAX_ALLOWLIST_SIZE: usize = 200;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
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
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

/// A syscall that is allowed only for specific values of its second
/// argument (the "command" argument of `ioctl` and `fcntl`).
#[derive(Debug, Clone)]
pub struct ArgFilter {
    pub syscall: i64,
    pub allowed_arg1: Vec<u32>,
}

/// Builds an allowlist BPF program.
///
/// `syscalls` are allowed unconditionally; each entry of `arg_filters`
/// gets a handler block that inspects `args[1]`. Everything else kills
/// the process.
///
/// # Panics
///
/// Panics if the allowlist exceeds 200 entries or a handler lands beyond
/// the reach of a u8 jump offset.
pub fn build_allowlist_filter(syscalls: &[i64], arg_filters: &[ArgFilter]) -> Vec<SockFilter> {
    assert!(
        syscalls.len() <= MAX_ALLOWLIST_SIZE,
        "allowlist too large: {} > {} (BPF jump offset overflow)",
        syscalls.len(),
        MAX_ALLOWLIST_SIZE
    );

    let n = syscalls.len();
    let m = arg_filters.len();
    let mut filter = Vec::with_capacity(4 + m + n + 2 + m * 8);

    // === Architecture check ===
    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    filter.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        AUDIT_ARCH_CURRENT,
        1,
        0,
    ));
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));

    // === Load syscall number ===
    filter.push(SockFilter::stmt(
        BPF_LD | BPF_W | BPF_ABS,
        OFFSET_SYSCALL_NR,
    ));

    // === Dispatch to handler blocks ===
    // Handler i starts after arch check (4), dispatch (m), allowlist (n),
    // KILL + ALLOW (2), plus the lengths of the preceding handlers.
    let mut handler_base = 4 + m + n + 2;
    for (i, af) in arg_filters.iter().enumerate() {
        let jt = handler_base - (4 + i) - 1;
        assert!(jt <= u8::MAX as usize, "handler block out of jump range");
        filter.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            af.syscall as u32,
            jt as u8,
            0,
        ));
        handler_base += af.allowed_arg1.len() + 3;
    }

    // === Allowlist checks ===
    for (j, &nr) in syscalls.iter().enumerate() {
        let allow_offset = (n - j) as u8;
        filter.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            nr as u32,
            allow_offset,
            0,
        ));
    }

    // === Default deny ===
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));

    // === ALLOW ===
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

    // === Handler blocks ===
    for af in arg_filters {
        let v = af.allowed_arg1.len();
        assert!(v + 2 <= u8::MAX as usize, "arg filter value list too long");
        filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_1));
        for (k, &val) in af.allowed_arg1.iter().enumerate() {
            filter.push(SockFilter::jump(
                BPF_JMP | BPF_JEQ | BPF_K,
                val,
                (v - k) as u8,
                0,
            ));
        }
        filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    }

    filter
}

/// Packs a BPF program into the byte layout the spawn request carries:
/// 8 bytes per instruction, little-endian `{code: u16, jt: u8, jf: u8, k: u32}`.
pub fn pack_filter(filter: &[SockFilter]) -> Vec<u8> {
    let mut out = Vec::with_capacity(filter.len() * 8);
    for insn in filter {
        out.extend_from_slice(&insn.code.to_le_bytes());
        out.push(insn.jt);
        out.push(insn.jf);
        out.extend_from_slice(&insn.k.to_le_bytes());
    }
    out
}

/// Returns true if the kernel exposes seccomp at all.
pub fn seccomp_available() -> bool {
    // SAFETY: PR_GET_SECCOMP has no side effects.
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}
