//! Low-level Linux plumbing for the tether sandbox.
//!
//! This crate builds seccomp-BPF programs from declarative syscall
//! allowlists and probes the running kernel for the features the sandbox
//! depends on. Filter *construction* happens on the supervisor side; the
//! compiled program is shipped to the fork-server, which installs it in
//! each worker before user code runs.
//!
//! For standard syscalls, use rustix; this crate only covers what rustix
//! does not expose.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod check;
pub mod seccomp;

pub use check::{CheckError, SystemInfo, check};

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
