//! Serialized message variables.
//!
//! A [`Proto`] carries a serde message as MessagePack bytes behind the
//! same header-plus-buffer image as [`LenVal`], so the callee sees a
//! length-prefixed blob it can parse, rewrite and reshape. Decoding is
//! lossless: what the worker wrote back is exactly what
//! [`Proto::get_message`] parses.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::rpc::RpcChannel;
use crate::vars::{LenVal, RemoteSlot, Type, Var};

pub struct Proto<T> {
    inner: LenVal,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Proto<T> {
    pub fn new(message: &T) -> Result<Proto<T>> {
        let bytes = rmp_serde::to_vec(message)
            .map_err(|e| Error::InvalidArgument(format!("cannot serialize message: {e}")))?;
        Ok(Proto {
            inner: LenVal::new(bytes),
            _marker: PhantomData,
        })
    }

    /// Parse the current bytes back into a message.
    pub fn get_message(&self) -> Result<T> {
        rmp_serde::from_slice(self.inner.data())
            .map_err(|e| Error::InvalidArgument(format!("malformed message payload: {e}")))
    }

    pub fn bytes(&self) -> &[u8] {
        self.inner.data()
    }
}

impl<T> std::fmt::Debug for Proto<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proto")
            .field("len", &self.inner.len())
            .field("remote", &self.inner.remote())
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned> Var for Proto<T> {
    fn var_type(&self) -> Type {
        Type::Proto
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_payload(&self) -> Vec<u8> {
        self.inner.read_payload()
    }

    fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_payload(bytes)
    }

    fn remote_slot(&self) -> &RemoteSlot {
        self.inner.remote_slot()
    }

    fn remote_slot_mut(&mut self) -> &mut RemoteSlot {
        self.inner.remote_slot_mut()
    }

    // The buffer semantics live in LenVal; forward every overridden op
    // so the header indirection is preserved.

    fn allocate(&mut self, rpc: &RpcChannel, auto_free: bool) -> Result<()> {
        self.inner.allocate(rpc, auto_free)
    }

    fn free(&mut self, rpc: &RpcChannel) -> Result<()> {
        self.inner.free(rpc)
    }

    fn transfer_to_sandboxee(&mut self, rpc: &RpcChannel) -> Result<()> {
        self.inner.transfer_to_sandboxee(rpc)
    }

    fn transfer_from_sandboxee(&mut self, rpc: &RpcChannel) -> Result<()> {
        self.inner.transfer_from_sandboxee(rpc)
    }
}
