//! tether: call into an untrusted native library as if it were local.
//!
//! A supervisor process drives a sandboxed worker hosting the library.
//! Typed variables mirror memory across the process boundary, a framed
//! RPC channel carries calls and bulk transfers, and a fork server hands
//! out pre-initialized workers so a crashed one is cheap to replace.
//!
//! ```ignore
//! use tether::{Arg, Sandbox, Transaction};
//! use tether::vars::{LenVal, Scalar};
//!
//! let mut sandbox = Sandbox::for_library("libstringop_worker.so");
//! sandbox.init()?;
//!
//! let mut buf = LenVal::new(*b"0123456789");
//! let mut ret = Scalar::new(0i32);
//! sandbox.call("reverse_string", &mut ret, &mut [Arg::ptr_both(&mut buf)])?;
//! assert_eq!(buf.data(), b"9876543210");
//!
//! // Or with crash recovery:
//! let mut tx = Transaction::new(Sandbox::for_library("libstringop_worker.so"))
//!     .with_retries(1);
//! tx.run(|sandbox| { /* calls */ Ok(()) })?;
//! ```
//!
//! One sandbox means one worker and one strictly sequential channel;
//! there is no concurrent calling into a single worker.

pub mod error;
pub mod rpc;
pub mod sandbox;
pub mod transaction;
pub mod vars;
pub mod wire;

pub use error::{Error, Result};
pub use rpc::RpcChannel;
pub use sandbox::{LibSource, Sandbox, SandboxHooks, default_policy_builder};
pub use transaction::Transaction;
pub use vars::{Arg, RemoteAddr, SyncPolicy, Type, Var};

// The lifecycle crate is part of the public surface: hooks receive its
// builder types, and custom spawners implement its contract.
pub use tether_sandbox::{Executor, PolicyBuilder, Spawner, TermStatus, TerminationResult};
