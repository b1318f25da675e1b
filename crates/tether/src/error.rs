//! Error taxonomy for boundary operations.
//!
//! Every operation that crosses into the worker returns one of five
//! kinds; nothing is raised out of band. Destruction paths swallow and
//! log instead of failing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Sandbox not active, fork server failed to start, or the transport
    /// dropped mid-exchange.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An operation ran against state that does not support it, e.g.
    /// synchronizing a pointee with no remote allocation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The worker could not allocate.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Wire-level corruption: tag mismatch, malformed reply.
    #[error("internal: {0}")]
    Internal(String),

    /// Malformed input: over-long name, too many arguments, undecodable
    /// message payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<tether_sandbox::SandboxError> for Error {
    fn from(e: tether_sandbox::SandboxError) -> Self {
        Error::Unavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
