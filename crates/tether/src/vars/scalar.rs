//! Integer and float variables.

use crate::error::{Error, Result};
use crate::vars::{RemoteSlot, Type, Var};

mod private {
    pub trait Sealed {}
}

/// A primitive that fits an inline argument slot. Integers travel as
/// sign- or zero-extended 64-bit values, floats as f64 bits (f32 is
/// promoted, like a C vararg).
pub trait Primitive: private::Sealed + Copy + std::fmt::Debug + 'static {
    const TYPE: Type;

    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
    fn to_le_vec(self) -> Vec<u8>;
    fn from_le_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_int_primitive {
    ($($t:ty),*) => {$(
        impl private::Sealed for $t {}
        impl Primitive for $t {
            const TYPE: Type = Type::Int;

            fn to_bits(self) -> u64 {
                // Sign-extends signed types, zero-extends unsigned.
                self as i64 as u64
            }

            fn from_bits(bits: u64) -> Self {
                bits as Self
            }

            fn to_le_vec(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }

            fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                Some(Self::from_le_bytes(bytes.try_into().ok()?))
            }
        }
    )*};
}

impl_int_primitive!(i8, i16, i32, i64, u8, u16, u32, u64);

impl private::Sealed for f32 {}
impl Primitive for f32 {
    const TYPE: Type = Type::Float;

    fn to_bits(self) -> u64 {
        f64::from(self).to_bits()
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits) as f32
    }

    fn to_le_vec(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        Some(f32::from_le_bytes(bytes.try_into().ok()?))
    }
}

impl private::Sealed for f64 {}
impl Primitive for f64 {
    const TYPE: Type = Type::Float;

    fn to_bits(self) -> u64 {
        self.to_bits()
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }

    fn to_le_vec(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        Some(f64::from_le_bytes(bytes.try_into().ok()?))
    }
}

/// A single integer or float, usable inline or as a pointee.
#[derive(Debug, Default)]
pub struct Scalar<T: Primitive> {
    value: T,
    remote: RemoteSlot,
}

impl<T: Primitive> Scalar<T> {
    pub fn new(value: T) -> Scalar<T> {
        Scalar {
            value,
            remote: RemoteSlot::default(),
        }
    }

    pub fn value(&self) -> T {
        self.value
    }

    pub fn set_value(&mut self, value: T) {
        self.value = value;
    }
}

impl<T: Primitive> Var for Scalar<T> {
    fn var_type(&self) -> Type {
        T::TYPE
    }

    fn size(&self) -> u64 {
        size_of::<T>() as u64
    }

    fn read_payload(&self) -> Vec<u8> {
        self.value.to_le_vec()
    }

    fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.value = T::from_le_slice(bytes).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "scalar payload is {} bytes, expected {}",
                bytes.len(),
                size_of::<T>()
            ))
        })?;
        Ok(())
    }

    fn value_bits(&self) -> u64 {
        self.value.to_bits()
    }

    fn set_value_bits(&mut self, bits: u64) -> Result<()> {
        self.value = T::from_bits(bits);
        Ok(())
    }

    fn remote_slot(&self) -> &RemoteSlot {
        &self.remote
    }

    fn remote_slot_mut(&mut self) -> &mut RemoteSlot {
        &mut self.remote
    }
}
