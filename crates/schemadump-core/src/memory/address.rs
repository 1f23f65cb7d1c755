use std::fmt;
use std::ops::{Add, Sub};

use crate::error::Result;
use crate::memory::reader::{ReadMemory, read_pod};

/// An absolute address in the target's address space.
///
/// Absence is expressed as `Option<Address>`; there is no sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Typed read at this address, delegated to the reader.
    pub fn read<T: Copy, R: ReadMemory + ?Sized>(self, reader: &R) -> Result<T> {
        read_pod(reader, self.0)
    }

    pub fn read_u64<R: ReadMemory + ?Sized>(self, reader: &R) -> Result<u64> {
        reader.read_u64(self.0)
    }
}

impl Add<u64> for Address {
    type Output = Address;

    fn add(self, offset: u64) -> Address {
        Address(self.0.wrapping_add(offset))
    }
}

impl Sub<u64> for Address {
    type Output = Address;

    fn sub(self, offset: u64) -> Address {
        Address(self.0.wrapping_sub(offset))
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
