//! Plain-data struct variables.

use crate::error::{Error, Result};
use crate::vars::{RemoteSlot, Type, Var};

/// A struct transferred as its raw memory image.
///
/// `T` must be plain data with a layout the worker-side library agrees
/// on: `#[repr(C)]`, `Copy`, and free of pointers or padding the callee
/// would interpret. Structs always travel by pointer; there is no inline
/// form.
#[derive(Debug)]
pub struct StructVal<T: Copy + std::fmt::Debug + 'static> {
    value: T,
    remote: RemoteSlot,
}

impl<T: Copy + std::fmt::Debug + 'static> StructVal<T> {
    pub fn new(value: T) -> StructVal<T> {
        StructVal {
            value,
            remote: RemoteSlot::default(),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Copy + std::fmt::Debug + 'static> Var for StructVal<T> {
    fn var_type(&self) -> Type {
        Type::Struct
    }

    fn size(&self) -> u64 {
        size_of::<T>() as u64
    }

    fn read_payload(&self) -> Vec<u8> {
        // SAFETY: T is Copy plain data; reading its bytes is always valid.
        unsafe {
            std::slice::from_raw_parts((&raw const self.value).cast::<u8>(), size_of::<T>())
                .to_vec()
        }
    }

    fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != size_of::<T>() {
            return Err(Error::InvalidArgument(format!(
                "struct payload is {} bytes, expected {}",
                bytes.len(),
                size_of::<T>()
            )));
        }
        // SAFETY: length checked above; T is Copy plain data, so any byte
        // pattern the worker produced is acceptable to store.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (&raw mut self.value).cast::<u8>(),
                size_of::<T>(),
            );
        }
        Ok(())
    }

    fn remote_slot(&self) -> &RemoteSlot {
        &self.remote
    }

    fn remote_slot_mut(&mut self) -> &mut RemoteSlot {
        &mut self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    #[repr(C)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[test]
    fn payload_roundtrip() {
        let v = StructVal::new(Pair { a: 1, b: 2 });
        assert_eq!(v.var_type(), Type::Struct);
        assert_eq!(v.size(), 8);

        let bytes = v.read_payload();
        assert_eq!(&bytes[..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..], &2u32.to_le_bytes());

        let mut back = StructVal::new(Pair { a: 0, b: 0 });
        back.write_payload(&bytes).unwrap();
        assert_eq!(*back.value(), Pair { a: 1, b: 2 });
    }

    #[test]
    fn wrong_length_rejected() {
        let mut v = StructVal::new(Pair { a: 0, b: 0 });
        assert!(v.write_payload(&[0u8; 3]).is_err());
    }
}
