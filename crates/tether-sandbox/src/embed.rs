//! Embedded worker binaries.
//!
//! A worker binary shipped as bytes inside the supervisor is materialized
//! as an anonymous, sealed memfd and executed through `/proc/self/fd/N`,
//! so nothing touches the filesystem.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd};

use rustix::fs::{MemfdFlags, SealFlags, fcntl_add_seals, memfd_create};

/// Write `bytes` into a sealed memfd named `name` (the name only shows up
/// in `/proc`, it carries no meaning).
pub fn create_memfd(name: &str, bytes: &[u8]) -> io::Result<OwnedFd> {
    let fd = memfd_create(name, MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)?;

    let mut file = std::fs::File::from(fd);
    file.write_all(bytes)?;
    file.flush()?;
    let fd = OwnedFd::from(file);

    // The worker must not be able to rewrite its own image.
    fcntl_add_seals(
        &fd,
        SealFlags::SHRINK | SealFlags::GROW | SealFlags::WRITE | SealFlags::SEAL,
    )?;

    Ok(fd)
}

/// Path under which a memfd can be exec'd.
pub fn exec_path(fd: &OwnedFd) -> String {
    format!("/proc/self/fd/{}", fd.as_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn memfd_holds_bytes() {
        let fd = create_memfd("test-blob", b"#!/bin/sh\nexit 0\n").unwrap();
        let mut contents = Vec::new();
        std::fs::File::open(exec_path(&fd))
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"#!/bin/sh\nexit 0\n");
    }

    #[test]
    fn memfd_is_sealed() {
        let fd = create_memfd("sealed", b"payload").unwrap();
        let err = rustix::fs::ftruncate(&fd, 0);
        assert!(err.is_err());
    }
}
