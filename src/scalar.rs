//! Typed access for small fixed-width values, so callers don't hand-roll
//! serialization for every config word they keep in the store.

use crate::error::Error;
use crate::platform::StorageBank;
use crate::{Key, Kvs};

/// A value with a fixed little-endian encoding on media.
pub trait Scalar: Copy + PartialEq {
    /// Encoded width in bytes.
    const WIDTH: usize;

    fn encode(self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
}

impl Scalar for bool {
    const WIDTH: usize = 1;

    fn encode(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Scalar for u8 {
    const WIDTH: usize = 1;

    fn encode(self, out: &mut [u8]) {
        out[0] = self;
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl Scalar for u16 {
    const WIDTH: usize = 2;

    fn encode(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self::from_le_bytes(bytes.try_into().unwrap())
    }
}

impl Scalar for u32 {
    const WIDTH: usize = 4;

    fn encode(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self::from_le_bytes(bytes.try_into().unwrap())
    }
}

impl Scalar for u64 {
    const WIDTH: usize = 8;

    fn encode(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self::from_le_bytes(bytes.try_into().unwrap())
    }
}

impl<B, const KLEN: usize> Kvs<B, KLEN>
where
    B: StorageBank,
{
    /// Read a scalar, returning `default` when the object is missing or
    /// too short to hold one.
    pub fn read_or<T: Scalar>(&self, key: &Key<KLEN>, default: T) -> T {
        match self.find(key) {
            Some(entry) if entry.len() as usize >= T::WIDTH => {
                T::decode(&self.map(&entry)[..T::WIDTH])
            }
            _ => default,
        }
    }

    /// Write a scalar only when necessary: a store is skipped when the
    /// value already on media matches `current`, or when nothing is stored
    /// and `current` equals `default`. Saves flash wear for config values
    /// that rarely change.
    pub fn store_if_changed<T: Scalar>(
        &mut self,
        key: &Key<KLEN>,
        current: T,
        default: T,
    ) -> Result<(), Error> {
        const {
            assert!(T::WIDTH <= 8, "scalars wider than 8 bytes are not a thing");
        }
        match self.find(key) {
            Some(entry) if entry.len() as usize >= T::WIDTH => {
                if T::decode(&self.map(&entry)[..T::WIDTH]) == current {
                    return Ok(());
                }
            }
            // A stored object of the wrong shape gets overwritten.
            Some(_) => {}
            None => {
                if current == default {
                    return Ok(());
                }
            }
        }
        let mut buf = [0u8; 8];
        current.encode(&mut buf[..T::WIDTH]);
        self.store(key, &buf[..T::WIDTH])
    }

    /// String flavour of [`Kvs::store_if_changed`], comparing the stored
    /// bytes against `current`.
    pub fn store_str_if_changed(
        &mut self,
        key: &Key<KLEN>,
        current: &str,
        default: &str,
    ) -> Result<(), Error> {
        match self.find(key) {
            Some(entry) => {
                if self.map(&entry) == current.as_bytes() {
                    return Ok(());
                }
            }
            None => {
                if current == default {
                    return Ok(());
                }
            }
        }
        self.store(key, current.as_bytes())
    }
}
