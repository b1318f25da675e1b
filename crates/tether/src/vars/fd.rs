//! File descriptor variables.
//!
//! The local half is a supervisor descriptor; the remote half is the
//! number the worker received when the descriptor crossed the boundary
//! as ancillary data. The inline call value is always the worker-side
//! number. Descriptors returned by a call arrive as a worker-side
//! number first and are pulled across in the unpack step.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::error::{Error, Result};
use crate::rpc::RpcChannel;
use crate::vars::{RemoteSlot, Type, Var};

#[derive(Debug)]
pub struct FdVar {
    fd: Option<OwnedFd>,
    remote_fd: Option<i32>,
    remote: RemoteSlot,
}

impl FdVar {
    /// Wrap a supervisor descriptor for passing into the worker.
    pub fn new(fd: impl Into<OwnedFd>) -> FdVar {
        FdVar {
            fd: Some(fd.into()),
            remote_fd: None,
            remote: RemoteSlot::default(),
        }
    }

    /// An empty slot for receiving a descriptor from a call.
    pub fn for_return() -> FdVar {
        FdVar {
            fd: None,
            remote_fd: None,
            remote: RemoteSlot::default(),
        }
    }

    pub fn local_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(OwnedFd::as_fd)
    }

    /// Worker-side descriptor number, once transferred.
    pub fn remote_fd(&self) -> Option<i32> {
        self.remote_fd
    }

    /// Give up ownership of the local descriptor.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

impl Var for FdVar {
    fn var_type(&self) -> Type {
        Type::Fd
    }

    fn size(&self) -> u64 {
        size_of::<i32>() as u64
    }

    fn read_payload(&self) -> Vec<u8> {
        self.remote_fd.unwrap_or(-1).to_le_bytes().to_vec()
    }

    fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        let arr: [u8; 4] = bytes.try_into().map_err(|_| {
            Error::InvalidArgument(format!("fd payload is {} bytes, expected 4", bytes.len()))
        })?;
        let fd = i32::from_le_bytes(arr);
        self.remote_fd = (fd >= 0).then_some(fd);
        Ok(())
    }

    fn value_bits(&self) -> u64 {
        i64::from(self.remote_fd.unwrap_or(-1)) as u64
    }

    fn set_value_bits(&mut self, bits: u64) -> Result<()> {
        let fd = bits as i64 as i32;
        if fd < 0 {
            return Err(Error::Internal(format!(
                "worker returned invalid descriptor {fd}"
            )));
        }
        self.remote_fd = Some(fd);
        Ok(())
    }

    fn remote_slot(&self) -> &RemoteSlot {
        &self.remote
    }

    fn remote_slot_mut(&mut self) -> &mut RemoteSlot {
        &mut self.remote
    }

    /// Duplicate the local descriptor into the worker; the worker-side
    /// number comes back in the reply.
    fn transfer_to_sandboxee(&mut self, rpc: &RpcChannel) -> Result<()> {
        let fd = self.fd.as_ref().ok_or_else(|| {
            Error::FailedPrecondition("no local descriptor to transfer".into())
        })?;
        let remote_fd = rpc.send_fd(fd.as_raw_fd())?;
        self.remote_fd = Some(remote_fd);
        Ok(())
    }

    /// Pull the descriptor behind `remote_fd` back to the supervisor.
    fn transfer_from_sandboxee(&mut self, rpc: &RpcChannel) -> Result<()> {
        let remote_fd = self.remote_fd.ok_or_else(|| {
            Error::FailedPrecondition("no worker-side descriptor to fetch".into())
        })?;
        let fd = rpc.recv_fd(remote_fd)?;
        self.fd = Some(fd);
        Ok(())
    }
}
