//! tether-sandbox: worker process lifecycle for tether.
//!
//! This crate owns everything below the RPC layer:
//!
//! - **Comms** - framed duplex channel over a unix socketpair, with
//!   `SCM_RIGHTS` descriptor passing
//! - **Policy** - declarative syscall/file/tmpfs allowlist compiled to
//!   seccomp-BPF
//! - **Executor** - per-worker execution config (cwd, limits, fd maps)
//! - **Fork server** - launches the worker binary once; every spawn
//!   request forks a fresh, pre-initialized worker
//! - **Worker** - uniquely-owned handle to one sandboxee: pidfd
//!   signalling, wall-clock watchdog, exit classification
//!
//! The `tether` crate drives these pieces; nothing here knows about
//! typed variables or the call protocol.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod comms;
pub mod embed;
pub mod error;
pub mod executor;
pub mod forkserver;
pub mod policy;
pub mod worker;

pub use comms::Comms;
pub use error::SandboxError;
pub use executor::{Executor, FdMap};
pub use forkserver::{Binary, ForkClient, ForkServer, Spawner};
pub use policy::{MountSpec, Policy, PolicyBuilder};
pub use worker::{TermStatus, TerminationResult, Worker};
