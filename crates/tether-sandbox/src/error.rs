//! Error type for sandbox lifecycle operations.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("system check: {0}")]
    SystemCheck(String),

    #[error("worker binary not found: {0}")]
    BinaryNotFound(String),

    #[error("fork: {0}")]
    Fork(rustix::io::Errno),

    #[error("pidfd: {0}")]
    Pidfd(rustix::io::Errno),

    #[error("comms: {0}")]
    Comms(#[from] io::Error),

    #[error("fork server protocol: {0}")]
    Protocol(String),

    #[error("spawn rejected by fork server: {0}")]
    SpawnRejected(String),
}
