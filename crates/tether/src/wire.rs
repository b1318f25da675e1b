//! Fixed-layout frames of the call protocol.
//!
//! Two records cross the channel per function call: [`FuncCall`] with the
//! function name, per-argument descriptors and inline values, and
//! [`FuncRet`] with the returned value. Control exchanges (allocate,
//! free, bulk transfer, symbol lookup, fd transfer, exit) use small
//! ad-hoc payloads built by the RPC layer.
//!
//! All fields are little-endian and fixed-width; the encoded [`FuncCall`]
//! is always [`FuncCall::ENCODED_LEN`] bytes.

use crate::error::{Error, Result};

/// Maximum number of arguments per call.
pub const MAX_ARGS: usize = 12;

/// Function name capacity, including the NUL padding.
pub const FUNC_NAME_MAX: usize = 128;

/// Request kinds. A reply carries the request kind with [`REPLY`] or'ed
/// in; the channel checks the pairing on every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgKind {
    Call = 1,
    Allocate = 2,
    Free = 3,
    TransferTo = 4,
    TransferFrom = 5,
    Symbol = 6,
    Exit = 7,
    FdTo = 8,
    FdFrom = 9,
}

pub const REPLY: u32 = 0x100;

impl MsgKind {
    #[inline]
    pub fn reply(self) -> u32 {
        self as u32 | REPLY
    }
}

/// One function invocation, packed.
///
/// Integer and float arguments are inlined in `arg_val` (floats as f64
/// bits); pointer arguments carry the remote address of their pointee,
/// described by the `aux_*` slots. Unused argument slots stay zero.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncCall {
    func: String,
    pub argc: u32,
    pub arg_type: [u32; MAX_ARGS],
    pub arg_size: [u64; MAX_ARGS],
    pub aux_type: [u32; MAX_ARGS],
    pub aux_size: [u64; MAX_ARGS],
    pub arg_val: [u64; MAX_ARGS],
    pub ret_type: u32,
    pub ret_size: u64,
}

impl FuncCall {
    /// 128 name + 4 argc + 12*(4+8+4+8+8) + 4 ret type + 8 ret size.
    pub const ENCODED_LEN: usize = FUNC_NAME_MAX + 4 + MAX_ARGS * 32 + 4 + 8;

    pub fn new(func: &str) -> Result<FuncCall> {
        if func.is_empty() {
            return Err(Error::InvalidArgument("empty function name".into()));
        }
        if func.len() >= FUNC_NAME_MAX {
            return Err(Error::InvalidArgument(format!(
                "function name too long: {} bytes (max {})",
                func.len(),
                FUNC_NAME_MAX - 1
            )));
        }
        if func.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument("NUL byte in function name".into()));
        }
        Ok(FuncCall {
            func: func.to_string(),
            argc: 0,
            arg_type: [0; MAX_ARGS],
            arg_size: [0; MAX_ARGS],
            aux_type: [0; MAX_ARGS],
            aux_size: [0; MAX_ARGS],
            arg_val: [0; MAX_ARGS],
            ret_type: 0,
            ret_size: 0,
        })
    }

    pub fn func(&self) -> &str {
        &self.func
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);

        let mut name = [0u8; FUNC_NAME_MAX];
        name[..self.func.len()].copy_from_slice(self.func.as_bytes());
        out.extend_from_slice(&name);

        out.extend_from_slice(&self.argc.to_le_bytes());
        for v in self.arg_type {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.arg_size {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.aux_type {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.aux_size {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.arg_val {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.ret_type.to_le_bytes());
        out.extend_from_slice(&self.ret_size.to_le_bytes());

        debug_assert_eq!(out.len(), Self::ENCODED_LEN);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<FuncCall> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::Internal(format!(
                "call frame is {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }

        let name_end = bytes[..FUNC_NAME_MAX]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FUNC_NAME_MAX);
        let func = std::str::from_utf8(&bytes[..name_end])
            .map_err(|_| Error::Internal("function name is not UTF-8".into()))?
            .to_string();

        let mut cursor = Cursor::at(bytes, FUNC_NAME_MAX);
        let argc = cursor.u32();
        if argc as usize > MAX_ARGS {
            return Err(Error::InvalidArgument(format!(
                "argument count {argc} exceeds {MAX_ARGS}"
            )));
        }

        let mut call = FuncCall {
            func,
            argc,
            arg_type: [0; MAX_ARGS],
            arg_size: [0; MAX_ARGS],
            aux_type: [0; MAX_ARGS],
            aux_size: [0; MAX_ARGS],
            arg_val: [0; MAX_ARGS],
            ret_type: 0,
            ret_size: 0,
        };
        for v in &mut call.arg_type {
            *v = cursor.u32();
        }
        for v in &mut call.arg_size {
            *v = cursor.u64();
        }
        for v in &mut call.aux_type {
            *v = cursor.u32();
        }
        for v in &mut call.aux_size {
            *v = cursor.u64();
        }
        for v in &mut call.arg_val {
            *v = cursor.u64();
        }
        call.ret_type = cursor.u32();
        call.ret_size = cursor.u64();
        Ok(call)
    }
}

/// The returned value of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncRet {
    pub ret_type: u32,
    pub value: u64,
}

impl FuncRet {
    pub const ENCODED_LEN: usize = 12;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.ret_type.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<FuncRet> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::Internal(format!(
                "return frame is {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        let mut cursor = Cursor::at(bytes, 0);
        Ok(FuncRet {
            ret_type: cursor.u32(),
            value: cursor.u64(),
        })
    }
}

/// Bounds-checked little-endian reader. Callers verify total length up
/// front, so reads cannot run past the slice.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn u32(&mut self) -> u32 {
        let b = &self.bytes[self.pos..];
        let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let b = &self.bytes[self.pos..];
        let v = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        self.pos += 8;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn func_call_roundtrip() {
        let mut call = FuncCall::new("reverse_string").unwrap();
        call.argc = 2;
        call.arg_type[0] = 3;
        call.arg_size[0] = 8;
        call.aux_type[0] = 6;
        call.aux_size[0] = 16;
        call.arg_val[0] = 0xdead_beef;
        call.arg_type[1] = 1;
        call.arg_val[1] = 42;
        call.ret_type = 1;
        call.ret_size = 4;

        let bytes = call.encode();
        assert_eq!(bytes.len(), FuncCall::ENCODED_LEN);
        let back = FuncCall::decode(&bytes).unwrap();
        assert_eq!(back, call);
        assert_eq!(back.func(), "reverse_string");
    }

    #[test]
    fn name_too_long_rejected() {
        let name = "f".repeat(FUNC_NAME_MAX);
        assert!(matches!(
            FuncCall::new(&name),
            Err(Error::InvalidArgument(_))
        ));
        // One under the cap still fits with its NUL.
        let name = "f".repeat(FUNC_NAME_MAX - 1);
        assert!(FuncCall::new(&name).is_ok());
    }

    #[test]
    fn empty_name_rejected() {
        assert!(FuncCall::new("").is_err());
    }

    #[test]
    fn truncated_frame_rejected() {
        let call = FuncCall::new("f").unwrap();
        let bytes = call.encode();
        assert!(FuncCall::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn oversize_argc_rejected() {
        let call = FuncCall::new("f").unwrap();
        let mut bytes = call.encode();
        bytes[FUNC_NAME_MAX..FUNC_NAME_MAX + 4].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            FuncCall::decode(&bytes),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn func_ret_roundtrip() {
        let ret = FuncRet {
            ret_type: 2,
            value: f64::to_bits(1.5),
        };
        let back = FuncRet::decode(&ret.encode()).unwrap();
        assert_eq!(back, ret);
    }

    #[test]
    fn reply_tagging() {
        assert_eq!(MsgKind::Call.reply(), 0x101);
        assert_eq!(MsgKind::FdFrom.reply(), 0x109);
    }
}
