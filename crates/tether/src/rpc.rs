//! Typed request/reply channel to the worker.
//!
//! One [`RpcChannel`] wraps the worker's comms endpoint behind a mutex;
//! every exchange (send one request, read one reply, verify the reply
//! tag) happens under a single lock guard, so the channel stays strictly
//! half-duplex no matter how many clones exist. Clones are cheap and let
//! variables keep a handle for best-effort cleanup on drop.
//!
//! Transport loss marks the channel dead: later operations fail fast
//! with `Unavailable`, and variable destructors go quiet because the
//! remote address space no longer exists.

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tether_sandbox::Comms;

use crate::error::{Error, Result};
use crate::vars::{RemoteAddr, Type};
use crate::wire::{FuncCall, FuncRet, MsgKind};

/// Bulk transfers are split into frames of this many payload bytes.
pub const TRANSFER_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RpcChannel {
    comms: Arc<Mutex<Comms>>,
    alive: Arc<AtomicBool>,
}

impl RpcChannel {
    pub fn new(comms: Comms) -> RpcChannel {
        RpcChannel {
            comms: Arc::new(Mutex::new(comms)),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// False once the transport dropped or the sandbox was terminated.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Comms>> {
        if !self.is_alive() {
            return Err(Error::Unavailable("channel is closed".into()));
        }
        self.comms
            .lock()
            .map_err(|_| Error::Internal("comms lock poisoned".into()))
    }

    fn transport_err(&self, err: &io::Error) -> Error {
        self.mark_dead();
        if err.kind() == io::ErrorKind::InvalidData {
            Error::Internal(format!("transport: {err}"))
        } else {
            Error::Unavailable(format!("transport: {err}"))
        }
    }

    /// One half-duplex exchange: send `kind`, receive `kind | REPLY`.
    fn exchange(&self, kind: MsgKind, payload: &[u8]) -> Result<Vec<u8>> {
        let mut comms = self.lock()?;
        self.exchange_locked(&mut comms, kind, payload)
    }

    fn exchange_locked(
        &self,
        comms: &mut Comms,
        kind: MsgKind,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        comms
            .send_msg(kind as u32, payload)
            .map_err(|e| self.transport_err(&e))?;
        let (reply_kind, reply) = comms.recv_msg().map_err(|e| self.transport_err(&e))?;
        if reply_kind != kind.reply() {
            self.mark_dead();
            return Err(Error::Internal(format!(
                "reply kind {reply_kind:#x} does not match request {:#x}",
                kind as u32
            )));
        }
        Ok(reply)
    }

    /// Invoke a function in the worker.
    pub fn call(&self, rfcall: &FuncCall, expected_ret: Type) -> Result<FuncRet> {
        let reply = self.exchange(MsgKind::Call, &rfcall.encode())?;
        let fret = FuncRet::decode(&reply)?;
        if fret.ret_type != expected_ret as u32 {
            return Err(Error::Internal(format!(
                "function '{}' returned type {} but {} was expected",
                rfcall.func(),
                fret.ret_type,
                expected_ret as u32
            )));
        }
        Ok(fret)
    }

    /// Allocate `size` bytes on the worker heap.
    pub fn allocate(&self, size: u64) -> Result<RemoteAddr> {
        let reply = self.exchange(MsgKind::Allocate, &size.to_le_bytes())?;
        let addr = decode_u64(&reply)?;
        if addr == 0 {
            return Err(Error::ResourceExhausted(format!(
                "worker failed to allocate {size} bytes"
            )));
        }
        Ok(RemoteAddr::new(addr))
    }

    /// Release a worker allocation. A null address is a no-op.
    pub fn free(&self, addr: RemoteAddr) -> Result<()> {
        if addr.is_null() {
            return Ok(());
        }
        let reply = self.exchange(MsgKind::Free, &addr.value().to_le_bytes())?;
        check_status(&reply, "free")
    }

    /// Push bytes into worker memory at `addr`. The whole buffer is
    /// transferred or the call fails.
    pub fn transfer_to(&self, addr: RemoteAddr, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut offset = 0usize;
        for chunk in bytes.chunks(TRANSFER_CHUNK) {
            let mut payload = Vec::with_capacity(16 + chunk.len());
            payload.extend_from_slice(&(addr.value() + offset as u64).to_le_bytes());
            payload.extend_from_slice(&(chunk.len() as u64).to_le_bytes());
            payload.extend_from_slice(chunk);
            let reply = self.exchange(MsgKind::TransferTo, &payload)?;
            check_status(&reply, "transfer to worker")?;
            offset += chunk.len();
        }
        Ok(())
    }

    /// Pull `size` bytes of worker memory starting at `addr`.
    pub fn transfer_from(&self, addr: RemoteAddr, size: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size as usize);
        while (out.len() as u64) < size {
            let want = (size - out.len() as u64).min(TRANSFER_CHUNK as u64);
            let mut payload = [0u8; 16];
            payload[..8].copy_from_slice(&(addr.value() + out.len() as u64).to_le_bytes());
            payload[8..].copy_from_slice(&want.to_le_bytes());
            let reply = self.exchange(MsgKind::TransferFrom, &payload)?;
            if reply.len() as u64 != want {
                self.mark_dead();
                return Err(Error::Internal(format!(
                    "short transfer: wanted {want} bytes, got {}",
                    reply.len()
                )));
            }
            out.extend_from_slice(&reply);
        }
        Ok(out)
    }

    /// Look up a dynamic symbol inside the worker. A null address means
    /// the symbol does not exist.
    pub fn symbol(&self, name: &str) -> Result<RemoteAddr> {
        let reply = self.exchange(MsgKind::Symbol, name.as_bytes())?;
        Ok(RemoteAddr::new(decode_u64(&reply)?))
    }

    /// Ask the worker to terminate. Send-only: the worker exits instead
    /// of replying.
    pub fn exit(&self) -> Result<()> {
        let mut comms = self.lock()?;
        let result = comms
            .send_msg(MsgKind::Exit as u32, &[])
            .map_err(|e| self.transport_err(&e));
        // Either way this channel is done.
        self.mark_dead();
        result
    }

    /// Hand a descriptor to the worker; returns the worker-side number.
    pub fn send_fd(&self, fd: RawFd) -> Result<i32> {
        let mut comms = self.lock()?;
        comms
            .send_msg(MsgKind::FdTo as u32, &[])
            .map_err(|e| self.transport_err(&e))?;
        comms.send_fd(fd).map_err(|e| self.transport_err(&e))?;
        let (reply_kind, reply) = comms.recv_msg().map_err(|e| self.transport_err(&e))?;
        drop(comms);
        if reply_kind != MsgKind::FdTo.reply() {
            self.mark_dead();
            return Err(Error::Internal(format!(
                "reply kind {reply_kind:#x} does not match fd transfer"
            )));
        }
        let remote = decode_u64(&reply)?;
        if remote == u64::MAX {
            return Err(Error::Internal("worker rejected descriptor".into()));
        }
        Ok(remote as i32)
    }

    /// Pull the descriptor behind a worker-side fd number.
    pub fn recv_fd(&self, remote_fd: i32) -> Result<OwnedFd> {
        let mut comms = self.lock()?;
        comms
            .send_msg(MsgKind::FdFrom as u32, &(remote_fd as u64).to_le_bytes())
            .map_err(|e| self.transport_err(&e))?;
        let (reply_kind, reply) = comms.recv_msg().map_err(|e| self.transport_err(&e))?;
        if reply_kind != MsgKind::FdFrom.reply() {
            self.mark_dead();
            return Err(Error::Internal(format!(
                "reply kind {reply_kind:#x} does not match fd fetch"
            )));
        }
        check_status(&reply, "fd fetch")?;
        comms.recv_fd().map_err(|e| self.transport_err(&e))
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Internal(format!("reply is {} bytes, expected 8", bytes.len())))?;
    Ok(u64::from_le_bytes(arr))
}

fn check_status(bytes: &[u8], what: &str) -> Result<()> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Internal(format!("{what}: reply is {} bytes", bytes.len())))?;
    let status = u32::from_le_bytes(arr);
    if status != 0 {
        return Err(Error::Internal(format!(
            "{what}: worker reported status {status}"
        )));
    }
    Ok(())
}
