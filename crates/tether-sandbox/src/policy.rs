//! Declarative syscall and filesystem policy for workers.
//!
//! A [`PolicyBuilder`] collects an allowlist of syscalls (individually or
//! through grouped helpers covering common library needs), read-only file
//! binds, and tmpfs mounts. [`PolicyBuilder::build`] compiles the syscall
//! set to a seccomp-BPF program and yields an opaque [`Policy`] that the
//! fork server applies to each worker before user code runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use tether_sys::seccomp::{self, ArgFilter};

const TCGETS: u32 = 0x5401;

/// One mount inside the worker's filesystem view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MountSpec {
    /// Host file bound read-only at the same path.
    FileRo { path: PathBuf },
    /// In-memory filesystem with a size cap.
    Tmpfs { path: PathBuf, max_size: u64 },
}

/// Compiled worker policy: packed BPF program plus mount table.
#[derive(Debug, Clone)]
pub struct Policy {
    pub(crate) filter: Vec<u8>,
    pub(crate) mounts: Vec<MountSpec>,
}

impl Policy {
    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Packed filter bytes as shipped to the fork server.
    pub fn filter_bytes(&self) -> &[u8] {
        &self.filter
    }
}

/// Builder for a worker [`Policy`].
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    syscalls: Vec<i64>,
    tcgets_ioctl: bool,
    safe_fcntl: bool,
    mounts: Vec<MountSpec>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, nr: i64) {
        if !self.syscalls.contains(&nr) {
            self.syscalls.push(nr);
        }
    }

    /// Allow a single syscall by number.
    pub fn allow_syscall(&mut self, nr: i64) -> &mut Self {
        self.push(nr);
        self
    }

    /// Allow several syscalls by number.
    pub fn allow_syscalls(&mut self, nrs: impl IntoIterator<Item = i64>) -> &mut Self {
        for nr in nrs {
            self.push(nr);
        }
        self
    }

    pub fn allow_read(&mut self) -> &mut Self {
        self.allow_syscalls([libc::SYS_read, libc::SYS_readv, libc::SYS_pread64])
    }

    pub fn allow_write(&mut self) -> &mut Self {
        self.allow_syscalls([libc::SYS_write, libc::SYS_writev, libc::SYS_pwrite64])
    }

    pub fn allow_exit(&mut self) -> &mut Self {
        self.allow_syscalls([libc::SYS_exit, libc::SYS_exit_group])
    }

    pub fn allow_getrlimit(&mut self) -> &mut Self {
        self.allow_syscalls([libc::SYS_getrlimit, libc::SYS_prlimit64])
    }

    /// The getuid/getgid family.
    pub fn allow_get_ids(&mut self) -> &mut Self {
        self.allow_syscalls([
            libc::SYS_getuid,
            libc::SYS_geteuid,
            libc::SYS_getresuid,
            libc::SYS_getgid,
            libc::SYS_getegid,
            libc::SYS_getresgid,
        ])
    }

    /// `ioctl`, restricted to the `TCGETS` command.
    pub fn allow_tcgets(&mut self) -> &mut Self {
        self.tcgets_ioctl = true;
        self
    }

    pub fn allow_time(&mut self) -> &mut Self {
        #[cfg(not(target_arch = "aarch64"))]
        self.allow_syscall(libc::SYS_time);
        self.allow_syscalls([
            libc::SYS_gettimeofday,
            libc::SYS_clock_gettime,
            libc::SYS_clock_getres,
        ])
    }

    pub fn allow_open(&mut self) -> &mut Self {
        #[cfg(not(target_arch = "aarch64"))]
        self.allow_syscall(libc::SYS_open);
        self.allow_syscall(libc::SYS_openat)
    }

    pub fn allow_stat(&mut self) -> &mut Self {
        #[cfg(not(target_arch = "aarch64"))]
        self.allow_syscalls([libc::SYS_stat, libc::SYS_lstat]);
        self.allow_syscalls([libc::SYS_fstat, libc::SYS_newfstatat])
    }

    pub fn allow_handle_signals(&mut self) -> &mut Self {
        self.allow_syscalls([
            libc::SYS_rt_sigaction,
            libc::SYS_rt_sigprocmask,
            libc::SYS_rt_sigreturn,
            libc::SYS_sigaltstack,
        ])
    }

    /// What a stock allocator needs.
    pub fn allow_system_malloc(&mut self) -> &mut Self {
        self.allow_syscalls([
            libc::SYS_brk,
            libc::SYS_mmap,
            libc::SYS_munmap,
            libc::SYS_mremap,
        ])
    }

    /// `fcntl`, restricted to descriptor-flag and dup commands.
    pub fn allow_safe_fcntl(&mut self) -> &mut Self {
        self.safe_fcntl = true;
        self
    }

    /// Extra syscalls the LLVM sanitizer runtimes need.
    pub fn allow_llvm_sanitizers(&mut self) -> &mut Self {
        self.allow_syscalls([
            libc::SYS_madvise,
            libc::SYS_mprotect,
            libc::SYS_sched_yield,
            libc::SYS_membarrier,
            libc::SYS_prctl,
            libc::SYS_readlinkat,
        ])
    }

    /// Bind a host file read-only into the worker.
    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.mounts.push(MountSpec::FileRo { path: path.into() });
        self
    }

    /// Mount a size-capped tmpfs inside the worker.
    pub fn add_tmpfs(&mut self, path: impl Into<PathBuf>, max_size: u64) -> &mut Self {
        self.mounts.push(MountSpec::Tmpfs {
            path: path.into(),
            max_size,
        });
        self
    }

    pub fn allowed_syscalls(&self) -> &[i64] {
        &self.syscalls
    }

    /// Compile the allowlist into a [`Policy`].
    pub fn build(&self) -> Policy {
        let mut arg_filters = Vec::new();
        if self.tcgets_ioctl {
            arg_filters.push(ArgFilter {
                syscall: libc::SYS_ioctl,
                allowed_arg1: vec![TCGETS],
            });
        }
        if self.safe_fcntl {
            arg_filters.push(ArgFilter {
                syscall: libc::SYS_fcntl,
                allowed_arg1: vec![
                    libc::F_GETFD as u32,
                    libc::F_SETFD as u32,
                    libc::F_GETFL as u32,
                    libc::F_SETFL as u32,
                    libc::F_DUPFD as u32,
                    libc::F_DUPFD_CLOEXEC as u32,
                ],
            });
        }

        let program = seccomp::build_allowlist_filter(&self.syscalls, &arg_filters);
        Policy {
            filter: seccomp::pack_filter(&program),
            mounts: self.mounts.clone(),
        }
    }
}
