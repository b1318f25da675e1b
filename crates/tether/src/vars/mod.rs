//! Typed variables mirrored across the process boundary.
//!
//! A variable owns a local value and, optionally, a matching allocation
//! in the worker. The [`Var`] trait carries what every kind shares: a
//! wire type, a transfer size, a byte image for bulk transfers, an
//! inline value for the call frame, and the remote slot. Concrete kinds:
//!
//! - [`Scalar<T>`] - integers and floats, passed inline
//! - [`StructVal<T>`] - plain-data structs, passed by pointer
//! - [`LenVal`] - length-prefixed byte buffer the callee may reshape
//! - [`Proto<T>`] - a serialized message behind a [`LenVal`] image
//! - [`FdVar`] - a file descriptor, duplicated into the worker
//!
//! Pointer arguments are expressed as [`Arg::Ptr`] wrapping a borrowed
//! pointee plus a [`SyncPolicy`]; a pointer to a pointer is not
//! representable, which is exactly the invariant the call protocol
//! requires.

mod fd;
mod lenval;
mod proto;
mod scalar;
mod structval;

pub use fd::FdVar;
pub use lenval::LenVal;
pub use proto::Proto;
pub use scalar::{Primitive, Scalar};
pub use structval::StructVal;

use std::fmt;

use crate::error::{Error, Result};
use crate::rpc::RpcChannel;

/// Wire-level variable types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Type {
    Int = 1,
    Float = 2,
    Pointer = 3,
    Fd = 4,
    Struct = 5,
    LenVal = 6,
    Proto = 7,
}

/// An address inside the worker. Deliberately not a pointer type: it is
/// only ever meaningful on the other side of the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteAddr(u64);

impl RemoteAddr {
    pub const NULL: RemoteAddr = RemoteAddr(0);

    pub(crate) fn new(value: u64) -> RemoteAddr {
        RemoteAddr(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// When to copy a pointee's bytes across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Pass the address (or null) and copy nothing.
    None,
    /// Push before the call.
    Before,
    /// Pull after the call.
    After,
    /// Push before and pull after.
    Both,
}

impl SyncPolicy {
    pub fn syncs_before(self) -> bool {
        matches!(self, SyncPolicy::Before | SyncPolicy::Both)
    }

    pub fn syncs_after(self) -> bool {
        matches!(self, SyncPolicy::After | SyncPolicy::Both)
    }
}

/// The remote half of a variable: its worker address, whether it should
/// be released when the variable dies, and the channel to do so.
///
/// Dropping an armed slot frees the allocation best-effort: failures are
/// logged, and a dead channel means the worker (and the address) is
/// already gone, so nothing is attempted.
#[derive(Debug, Default)]
pub struct RemoteSlot {
    addr: Option<RemoteAddr>,
    auto_free: bool,
    channel: Option<RpcChannel>,
}

impl RemoteSlot {
    pub fn addr(&self) -> Option<RemoteAddr> {
        self.addr
    }

    pub fn auto_free(&self) -> bool {
        self.auto_free
    }

    pub(crate) fn arm(&mut self, addr: RemoteAddr, auto_free: bool, rpc: &RpcChannel) {
        self.addr = Some(addr);
        self.auto_free = auto_free;
        self.channel = auto_free.then(|| rpc.clone());
    }

    pub(crate) fn clear(&mut self) {
        self.addr = None;
        self.auto_free = false;
        self.channel = None;
    }

    pub(crate) fn channel(&self) -> Option<&RpcChannel> {
        self.channel.as_ref()
    }
}

impl Drop for RemoteSlot {
    fn drop(&mut self) {
        let (Some(addr), true, Some(channel)) = (self.addr, self.auto_free, self.channel.take())
        else {
            return;
        };
        if !channel.is_alive() {
            return;
        }
        if let Err(err) = channel.free(addr) {
            tracing::warn!(%addr, %err, "failed to free remote allocation");
        }
    }
}

/// A typed slot with an optional mirror allocation in the worker.
pub trait Var: fmt::Debug {
    fn var_type(&self) -> Type;

    /// Byte length of the image at the remote address.
    fn size(&self) -> u64;

    /// Local bytes as they appear in worker memory.
    fn read_payload(&self) -> Vec<u8>;

    /// Overwrite the local value from worker bytes.
    fn write_payload(&mut self, bytes: &[u8]) -> Result<()>;

    /// Inline value for the call frame. Only scalars and descriptors
    /// carry one; everything else travels by pointer.
    fn value_bits(&self) -> u64 {
        0
    }

    /// Accept the inline return value of a call.
    fn set_value_bits(&mut self, _bits: u64) -> Result<()> {
        Err(Error::Internal(format!(
            "{:?} cannot hold an inline return value",
            self.var_type()
        )))
    }

    fn remote_slot(&self) -> &RemoteSlot;

    fn remote_slot_mut(&mut self) -> &mut RemoteSlot;

    fn remote(&self) -> Option<RemoteAddr> {
        self.remote_slot().addr()
    }

    /// Reserve `size()` bytes in the worker. With `auto_free`, the
    /// reservation is released when this variable is dropped while the
    /// sandbox is still alive.
    fn allocate(&mut self, rpc: &RpcChannel, auto_free: bool) -> Result<()> {
        if self.remote().is_some() {
            return Err(Error::FailedPrecondition(
                "variable is already allocated in the worker".into(),
            ));
        }
        let addr = rpc.allocate(self.size())?;
        self.remote_slot_mut().arm(addr, auto_free, rpc);
        Ok(())
    }

    /// Release the worker reservation.
    fn free(&mut self, rpc: &RpcChannel) -> Result<()> {
        let addr = self.remote().ok_or_else(|| {
            Error::FailedPrecondition("variable is not allocated in the worker".into())
        })?;
        rpc.free(addr)?;
        self.remote_slot_mut().clear();
        Ok(())
    }

    /// Push the local bytes to the worker allocation.
    fn transfer_to_sandboxee(&mut self, rpc: &RpcChannel) -> Result<()> {
        let addr = self.remote().ok_or_else(|| {
            Error::FailedPrecondition("cannot push a variable with no remote allocation".into())
        })?;
        if self.size() == 0 {
            return Ok(());
        }
        rpc.transfer_to(addr, &self.read_payload())
    }

    /// Pull the worker bytes into the local value.
    fn transfer_from_sandboxee(&mut self, rpc: &RpcChannel) -> Result<()> {
        let addr = self.remote().ok_or_else(|| {
            Error::FailedPrecondition("cannot pull a variable with no remote allocation".into())
        })?;
        if self.size() == 0 {
            return Ok(());
        }
        let bytes = rpc.transfer_from(addr, self.size())?;
        self.write_payload(&bytes)
    }
}

/// One call argument.
pub enum Arg<'a> {
    /// Passed inline by value; must be an integer or float.
    Val(&'a dyn Var),
    /// Passed as a pointer to `pointee`, synchronized per `sync`.
    Ptr {
        pointee: &'a mut dyn Var,
        sync: SyncPolicy,
    },
    /// A descriptor, duplicated into the worker on first use.
    Fd(&'a mut FdVar),
}

impl<'a> Arg<'a> {
    pub fn val(var: &'a dyn Var) -> Arg<'a> {
        Arg::Val(var)
    }

    pub fn ptr(pointee: &'a mut dyn Var, sync: SyncPolicy) -> Arg<'a> {
        Arg::Ptr { pointee, sync }
    }

    pub fn ptr_none(pointee: &'a mut dyn Var) -> Arg<'a> {
        Arg::ptr(pointee, SyncPolicy::None)
    }

    pub fn ptr_before(pointee: &'a mut dyn Var) -> Arg<'a> {
        Arg::ptr(pointee, SyncPolicy::Before)
    }

    pub fn ptr_after(pointee: &'a mut dyn Var) -> Arg<'a> {
        Arg::ptr(pointee, SyncPolicy::After)
    }

    pub fn ptr_both(pointee: &'a mut dyn Var) -> Arg<'a> {
        Arg::ptr(pointee, SyncPolicy::Both)
    }

    pub fn fd(fd: &'a mut FdVar) -> Arg<'a> {
        Arg::Fd(fd)
    }
}
