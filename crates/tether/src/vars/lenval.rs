//! Length-prefixed byte buffers.
//!
//! A [`LenVal`] appears in worker memory as a 16-byte header
//! `{len: u64, data: u64}` pointing at a separately allocated buffer.
//! The indirection is what lets the callee reshape the value: it may
//! reallocate the buffer and rewrite the header, and the post-call pull
//! picks up both the new length and the new location.

use crate::error::{Error, Result};
use crate::rpc::RpcChannel;
use crate::vars::{RemoteAddr, RemoteSlot, Type, Var};

const HEADER_LEN: u64 = 16;

/// Upper bound on a worker-reported length; anything above this is
/// treated as a corrupted header.
const MAX_DATA_LEN: u64 = 1 << 30;

#[derive(Debug, Default)]
pub struct LenVal {
    data: Vec<u8>,
    data_addr: Option<RemoteAddr>,
    remote: RemoteSlot,
}

impl LenVal {
    pub fn new(data: impl Into<Vec<u8>>) -> LenVal {
        LenVal {
            data: data.into(),
            data_addr: None,
            remote: RemoteSlot::default(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Change the buffer length, swapping the remote data reservation if
    /// one exists. The first `min(old, new)` bytes are preserved, new
    /// bytes are zero. On failure nothing changes, locally or remotely.
    ///
    /// The remote header is rewritten at the next pre-call push, exactly
    /// like locally edited content.
    pub fn resize(&mut self, rpc: &RpcChannel, new_len: usize) -> Result<()> {
        if self.remote().is_some() {
            let new_addr = if new_len == 0 {
                None
            } else {
                Some(rpc.allocate(new_len as u64)?)
            };
            if let Some(old) = self.data_addr {
                if let Err(err) = rpc.free(old) {
                    if let Some(addr) = new_addr {
                        let _ = rpc.free(addr);
                    }
                    return Err(err);
                }
            }
            self.data_addr = new_addr;
        }
        self.data.resize(new_len, 0);
        Ok(())
    }
}

impl Var for LenVal {
    fn var_type(&self) -> Type {
        Type::LenVal
    }

    fn size(&self) -> u64 {
        HEADER_LEN
    }

    fn read_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN as usize);
        out.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.data_addr.map_or(0, RemoteAddr::value).to_le_bytes());
        out
    }

    fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != HEADER_LEN as usize {
            return Err(Error::InvalidArgument(format!(
                "header is {} bytes, expected {HEADER_LEN}",
                bytes.len()
            )));
        }
        let len = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        let addr = u64::from_le_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ]);
        if len > MAX_DATA_LEN {
            return Err(Error::Internal(format!(
                "worker reported implausible buffer length {len}"
            )));
        }
        self.data.resize(len as usize, 0);
        self.data_addr = (addr != 0).then(|| RemoteAddr::new(addr));
        Ok(())
    }

    fn remote_slot(&self) -> &RemoteSlot {
        &self.remote
    }

    fn remote_slot_mut(&mut self) -> &mut RemoteSlot {
        &mut self.remote
    }

    fn allocate(&mut self, rpc: &RpcChannel, auto_free: bool) -> Result<()> {
        if self.remote().is_some() {
            return Err(Error::FailedPrecondition(
                "buffer is already allocated in the worker".into(),
            ));
        }
        let data_addr = if self.data.is_empty() {
            None
        } else {
            Some(rpc.allocate(self.data.len() as u64)?)
        };
        let header = match rpc.allocate(HEADER_LEN) {
            Ok(addr) => addr,
            Err(err) => {
                if let Some(addr) = data_addr {
                    let _ = rpc.free(addr);
                }
                return Err(err);
            }
        };
        self.data_addr = data_addr;
        self.remote_slot_mut().arm(header, auto_free, rpc);
        Ok(())
    }

    fn free(&mut self, rpc: &RpcChannel) -> Result<()> {
        let header = self.remote().ok_or_else(|| {
            Error::FailedPrecondition("buffer is not allocated in the worker".into())
        })?;
        let mut first_err = None;
        if let Some(addr) = self.data_addr.take() {
            if let Err(err) = rpc.free(addr) {
                first_err = Some(err);
            }
        }
        if let Err(err) = rpc.free(header) {
            first_err.get_or_insert(err);
        }
        self.remote_slot_mut().clear();
        first_err.map_or(Ok(()), Err)
    }

    fn transfer_to_sandboxee(&mut self, rpc: &RpcChannel) -> Result<()> {
        let header = self.remote().ok_or_else(|| {
            Error::FailedPrecondition("cannot push a buffer with no remote allocation".into())
        })?;
        match self.data_addr {
            Some(addr) => rpc.transfer_to(addr, &self.data)?,
            None if !self.data.is_empty() => {
                return Err(Error::FailedPrecondition(
                    "buffer grew locally without a remote reservation; resize first".into(),
                ));
            }
            None => {}
        }
        rpc.transfer_to(header, &self.read_payload())
    }

    fn transfer_from_sandboxee(&mut self, rpc: &RpcChannel) -> Result<()> {
        let header = self.remote().ok_or_else(|| {
            Error::FailedPrecondition("cannot pull a buffer with no remote allocation".into())
        })?;
        let bytes = rpc.transfer_from(header, HEADER_LEN)?;
        self.write_payload(&bytes)?;
        if let Some(addr) = self.data_addr {
            if !self.data.is_empty() {
                self.data = rpc.transfer_from(addr, self.data.len() as u64)?;
            }
        }
        Ok(())
    }
}

impl Drop for LenVal {
    fn drop(&mut self) {
        // The header is released by the slot; the data buffer is ours.
        let Some(addr) = self.data_addr else { return };
        if !self.remote.auto_free() {
            return;
        }
        let Some(channel) = self.remote.channel() else {
            return;
        };
        if !channel.is_alive() {
            return;
        }
        if let Err(err) = channel.free(addr) {
            tracing::warn!(%addr, %err, "failed to free remote buffer");
        }
    }
}
