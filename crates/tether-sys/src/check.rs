//! System capability checking.
//!
//! Verifies at runtime that the kernel supports what the sandbox needs.
//! The check runs once and is cached in a static `OnceLock`.
//!
//! | Feature | Minimum | Check method |
//! |---------|---------|--------------|
//! | Kernel | 5.4 (`pidfd` wait support) | `uname` syscall |
//! | Seccomp | enabled | `prctl(PR_GET_SECCOMP)` |

use std::sync::OnceLock;

use rustix::system::uname;
use thiserror::Error;

use crate::seccomp;

/// Information about the system's sandboxing capabilities.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub kernel_version: (u32, u32, u32),
    pub seccomp_enabled: bool,
}

#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("kernel version {}.{}.{} is too old, need at least {}.{}.{}", .found.0, .found.1, .found.2, .required.0, .required.1, .required.2)]
    KernelTooOld {
        required: (u32, u32, u32),
        found: (u32, u32, u32),
    },

    #[error("seccomp is not available")]
    SeccompNotAvailable,

    #[error("failed to read kernel version")]
    KernelVersionReadFailed,
}

// pidfd_open + waitid(P_PIDFD) need 5.4
const MIN_KERNEL_VERSION: (u32, u32, u32) = (5, 4, 0);

static SYSTEM_INFO: OnceLock<Result<SystemInfo, CheckError>> = OnceLock::new();

/// Check system capabilities and cache the result.
pub fn check() -> Result<&'static SystemInfo, &'static CheckError> {
    SYSTEM_INFO.get_or_init(check_impl).as_ref()
}

fn check_impl() -> Result<SystemInfo, CheckError> {
    let kernel_version = get_kernel_version()?;
    if kernel_version < MIN_KERNEL_VERSION {
        return Err(CheckError::KernelTooOld {
            required: MIN_KERNEL_VERSION,
            found: kernel_version,
        });
    }

    let seccomp_enabled = seccomp::seccomp_available();
    if !seccomp_enabled {
        return Err(CheckError::SeccompNotAvailable);
    }

    Ok(SystemInfo {
        kernel_version,
        seccomp_enabled,
    })
}

fn get_kernel_version() -> Result<(u32, u32, u32), CheckError> {
    let uts = uname();
    let release = uts
        .release()
        .to_str()
        .map_err(|_| CheckError::KernelVersionReadFailed)?;
    parse_kernel_version(release)
}

fn parse_kernel_version(release: &str) -> Result<(u32, u32, u32), CheckError> {
    let parts: Vec<&str> = release.split('.').collect();
    if parts.len() < 2 {
        return Err(CheckError::KernelVersionReadFailed);
    }

    let major = parts[0]
        .parse::<u32>()
        .map_err(|_| CheckError::KernelVersionReadFailed)?;

    let minor = parts[1]
        .parse::<u32>()
        .map_err(|_| CheckError::KernelVersionReadFailed)?;

    // Patch may carry a suffix like "0-generic"
    let patch = parts
        .get(2)
        .and_then(|p| p.split('-').next())
        .and_then(|p| p.parse::<u32>().ok())
        .unwrap_or(0);

    Ok((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("5.15.0").unwrap(), (5, 15, 0));
        assert_eq!(parse_kernel_version("6.1.0-generic").unwrap(), (6, 1, 0));
        assert_eq!(
            parse_kernel_version("5.4.0-150-generic").unwrap(),
            (5, 4, 0)
        );
        assert!(parse_kernel_version("weird").is_err());
    }

    #[test]
    fn test_check() {
        match check() {
            Ok(info) => {
                assert!(info.kernel_version >= MIN_KERNEL_VERSION);
                assert!(info.seccomp_enabled);
            }
            Err(e) => {
                println!("system check failed: {e}");
            }
        }
    }
}
