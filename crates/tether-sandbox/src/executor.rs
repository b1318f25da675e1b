//! Per-worker execution configuration.
//!
//! An [`Executor`] describes everything about a worker that is not the
//! syscall policy: working directory, wall-clock limit, resource limits,
//! and descriptors mapped into the worker at spawn time. The defaults
//! suit a library worker driven entirely over RPC: cwd `/`, no wall
//! clock, unlimited CPU and address space (the allocator and sanitizer
//! runtimes need the latter).

use std::os::fd::RawFd;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Executor {
    cwd: String,
    wall_time_limit: Option<Duration>,
    rlimit_cpu: Option<u64>,
    rlimit_as: Option<u64>,
    fd_maps: Vec<FdMap>,
}

/// A supervisor descriptor installed in the worker under a fixed number.
#[derive(Debug, Clone, Copy)]
pub struct FdMap {
    pub local_fd: RawFd,
    pub target_fd: RawFd,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            cwd: "/".into(),
            wall_time_limit: None,
            rlimit_cpu: None,
            rlimit_as: None,
            fd_maps: Vec::new(),
        }
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cwd(&mut self, cwd: impl Into<String>) -> &mut Self {
        self.cwd = cwd.into();
        self
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn set_wall_time_limit(&mut self, limit: Option<Duration>) -> &mut Self {
        self.wall_time_limit = limit;
        self
    }

    pub fn wall_time_limit(&self) -> Option<Duration> {
        self.wall_time_limit
    }

    /// CPU time limit in seconds; `None` means unlimited.
    pub fn set_rlimit_cpu(&mut self, limit: Option<u64>) -> &mut Self {
        self.rlimit_cpu = limit;
        self
    }

    pub fn rlimit_cpu(&self) -> Option<u64> {
        self.rlimit_cpu
    }

    /// Address-space limit in bytes; `None` means unlimited.
    pub fn set_rlimit_as(&mut self, limit: Option<u64>) -> &mut Self {
        self.rlimit_as = limit;
        self
    }

    pub fn rlimit_as(&self) -> Option<u64> {
        self.rlimit_as
    }

    /// Map a supervisor descriptor into the worker at `target_fd`.
    pub fn map_fd(&mut self, local_fd: RawFd, target_fd: RawFd) -> &mut Self {
        self.fd_maps.push(FdMap {
            local_fd,
            target_fd,
        });
        self
    }

    pub fn fd_maps(&self) -> &[FdMap] {
        &self.fd_maps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_for_library_worker() {
        let exec = Executor::default();
        assert_eq!(exec.cwd(), "/");
        assert!(exec.wall_time_limit().is_none());
        assert!(exec.rlimit_cpu().is_none());
        assert!(exec.rlimit_as().is_none());
        assert!(exec.fd_maps().is_empty());
    }

    #[test]
    fn builder_mutation() {
        let mut exec = Executor::new();
        exec.set_cwd("/work")
            .set_wall_time_limit(Some(Duration::from_secs(5)))
            .map_fd(7, 100);
        assert_eq!(exec.cwd(), "/work");
        assert_eq!(exec.wall_time_limit(), Some(Duration::from_secs(5)));
        assert_eq!(exec.fd_maps()[0].target_fd, 100);
    }
}
