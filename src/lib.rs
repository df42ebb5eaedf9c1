#![doc = include_str!("../README.md")]
#![cfg_attr(not(any(test, feature = "debug-logs")), no_std)]

pub mod error;
mod internal;
pub mod platform;
mod raw;
mod scalar;

use core::fmt;

pub use error::Error;
pub use scalar::Scalar;

use platform::{FaultMonitor, StorageBank};

/// A fixed-width object name. Shorter names are padded with zero bytes,
/// longer names are truncated; two names that agree on the first `KLEN`
/// bytes address the same object. The all-ones name is reserved, it is the
/// erased state of a slot whose key was never committed.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Key<const KLEN: usize = 16>([u8; KLEN]);

impl<const KLEN: usize> Key<KLEN> {
    /// Pad or truncate `src` into a key.
    ///
    /// Tip: use a const context where possible so the conversion happens at
    /// compile time: `const { Key::from_slice(b"my_key") }`.
    pub const fn from_slice(src: &[u8]) -> Self {
        let mut dst = [0u8; KLEN];
        let mut i = 0;
        while i < src.len() && i < KLEN {
            dst[i] = src[i];
            i += 1;
        }
        Self(dst)
    }

    /// Pad or truncate `s` into a key. See [`Key::from_slice`].
    pub const fn from_str(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }

    /// Use `bytes` as a key verbatim, including any 0xFF bytes.
    pub const fn from_raw(bytes: [u8; KLEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; KLEN] {
        &self.0
    }
}

impl<const KLEN: usize> Default for Key<KLEN> {
    fn default() -> Self {
        Self([0u8; KLEN])
    }
}

impl<const KLEN: usize> fmt::Debug for Key<KLEN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // print as a binary string; \0 is more readable than \x00 for the
        // padding bytes
        write!(f, "Key(b\"")?;
        for &byte in &self.0 {
            if byte == 0 {
                write!(f, "\\0")?;
                continue;
            }
            write!(f, "{}", core::ascii::escape_default(byte))?;
        }
        write!(f, "\")")
    }
}

impl<const KLEN: usize> AsRef<[u8]> for Key<KLEN> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Location of one committed object version inside the active bank.
/// Produced by [`Kvs::find`], consumed by [`Kvs::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Entry {
    pub(crate) start: u32,
    pub(crate) len: u32,
}

impl Entry {
    /// Payload size in bytes. Never zero: tombstones are reported as
    /// "not found" rather than surfaced here.
    pub const fn len(&self) -> u32 {
        self.len
    }
}

/// One row of an [`Kvs::enumerate`] listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ListEntry<const KLEN: usize = 16> {
    pub key: Key<KLEN>,
    /// Size of the most recent copy of the object.
    pub size: u32,
    /// Number of copies (including the current one) in the active bank.
    pub revs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bank {
    Left,
    Right,
}

impl Bank {
    pub(crate) fn other(self) -> Self {
        match self {
            Bank::Left => Bank::Right,
            Bank::Right => Bank::Left,
        }
    }
}

/// The store itself: two banks, of which one is active, plus cached free
/// pointers. All persistent state lives on the media; everything here is
/// rederived by scanning on startup.
///
/// Operations are synchronous and run to completion on the caller's stack.
/// A single instance must own its banks exclusively; two engines over the
/// same flash region corrupt each other.
#[derive(Debug)]
pub struct Kvs<B: StorageBank, const KLEN: usize = 16> {
    left: B,
    right: B,
    active: Bank,
    /// Log size used when formatting a fresh bank.
    default_log_size: u32,
    /// Index of the next log slot to write.
    first_free_slot: u32,
    /// Offset of the first free data byte in the active bank.
    first_free_data: u32,
    faults: FaultMonitor,
}

impl<B, const KLEN: usize> Kvs<B, KLEN>
where
    B: StorageBank,
{
    /// Open the store over two banks, formatting the left one if neither
    /// carries a valid header.
    ///
    /// `default_log_size` is the number of log slots reserved when a bank
    /// is formatted (also by every compaction); it bounds how many times
    /// objects can be written between compactions.
    pub fn new(left: B, right: B, default_log_size: u32) -> Result<Self, Error> {
        const {
            assert!(
                KLEN >= 1 && KLEN <= raw::MAX_KEY_BYTES,
                "key width out of range"
            );
            assert!(B::WRITE_BLOCK >= 1, "write block cannot be zero");
            assert!(
                KLEN % B::WRITE_BLOCK == 0,
                "key width must be a multiple of the write block"
            );
        }
        debug_assert_eq!(left.size(), right.size(), "banks must be equally sized");

        let mut kvs = Self {
            left,
            right,
            active: Bank::Left,
            default_log_size,
            first_free_slot: 0,
            first_free_data: 0,
            faults: FaultMonitor::new(),
        };
        kvs.find_current_bank()?;
        kvs.scan_current_bank();
        Ok(kvs)
    }

    /// Exception hook for parts whose flash ECC raises bus faults or NMIs
    /// on uncorrectable reads. Catch the exception, check whether the
    /// faulting address lies within one of the banks, call this with the
    /// offending address and the faulting instruction's address, then
    /// resume past the faulting instruction. The read in flight is then
    /// discarded and the affected entry skipped.
    pub fn on_ecc_fault(&self, flash_addr: u32, insn_addr: u32) {
        self.faults.record(flash_addr, insn_addr);
    }

    /// Find the latest valid version of an object, falling back to older
    /// versions when newer copies fail their checksum.
    pub fn find(&self, key: &Key<KLEN>) -> Option<Entry> {
        self.find_internal(key)
    }

    /// The payload described by `entry`, borrowed straight from the
    /// memory-mapped bank.
    pub fn map(&self, entry: &Entry) -> &[u8] {
        let start = entry.start as usize;
        &self.active_bank().base()[start..start + entry.len as usize]
    }

    /// Copy an object into `buf`, returning the number of bytes copied.
    ///
    /// If the object is larger than `buf`, the copy is truncated; that is
    /// not an error.
    pub fn read(&self, key: &Key<KLEN>, buf: &mut [u8]) -> Result<usize, Error> {
        let entry = self.find(key).ok_or(Error::NotFound)?;
        let payload = self.map(&entry);
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    /// Write a new version of an object, replacing any existing one.
    ///
    /// Compacts automatically when space runs short and retries failed
    /// attempts a few times before reporting [`Error::MediaWrite`]. An
    /// empty `data` writes a tombstone, see [`Kvs::remove`].
    pub fn store(&mut self, key: &Key<KLEN>, data: &[u8]) -> Result<(), Error> {
        self.store_internal(key, data)
    }

    /// Delete an object by writing a tombstone. The old payload stays on
    /// media until the next compaction; wipe the inactive bank afterwards
    /// if the content is sensitive.
    pub fn remove(&mut self, key: &Key<KLEN>) -> Result<(), Error> {
        self.store_internal(key, &[])
    }

    /// Copy the latest valid version of every object into the inactive
    /// bank and make that bank active. Reclaims the space of shadowed
    /// revisions and physically drops tombstones.
    ///
    /// Interrupting a compaction at any point is safe: the target bank's
    /// header is written last, so until then the old bank stays
    /// authoritative and the next open simply ignores the half-copied one.
    pub fn compact(&mut self) -> Result<(), Error> {
        self.compact_banks()
    }

    /// Erase the inactive bank, destroying the previous versions of all
    /// objects. Compacting and then wiping the inactive bank keeps current
    /// content but ensures prior content is gone.
    pub fn wipe_inactive(&mut self) -> Result<(), Error> {
        let inactive = match self.active {
            Bank::Left => &mut self.right,
            Bank::Right => &mut self.left,
        };
        if !inactive.erase() {
            return Err(Error::MediaWrite);
        }
        Ok(())
    }

    /// Erase both banks unconditionally, e.g. for a factory reset or to
    /// purge key material before decommissioning. The store is unusable
    /// afterwards until reopened with [`Kvs::new`].
    pub fn wipe_all(&mut self) -> Result<(), Error> {
        let left_ok = self.left.erase();
        let right_ok = self.right.erase();
        if left_ok && right_ok {
            Ok(())
        } else {
            Err(Error::MediaWrite)
        }
    }

    /// List the distinct objects in the active bank, sorted by key bytes.
    /// Returns the number of `list` rows filled; listings that do not fit
    /// are truncated to the first `list.len()` distinct keys found.
    pub fn enumerate(&self, list: &mut [ListEntry<KLEN>]) -> usize {
        self.enum_objects(list)
    }

    /// Recover the banks, e.g. to serialize their content in a simulation.
    pub fn into_banks(self) -> (B, B) {
        (self.left, self.right)
    }

    /// Number of unused log slots in the active bank.
    pub fn free_log_entries(&self) -> u32 {
        self.log_slot_count().saturating_sub(self.first_free_slot)
    }

    /// Number of unused data bytes in the active bank.
    pub fn free_data_space(&self) -> u32 {
        self.active_bank().size().saturating_sub(self.first_free_data)
    }

    /// Number of log slots in the active bank, used and unused.
    pub fn log_capacity(&self) -> u32 {
        self.active_header().log_size
    }

    /// Total space allocated to data in the active bank, used and unused.
    pub fn data_capacity(&self) -> u32 {
        let reserved = raw::header_size(B::WRITE_BLOCK) as u64
            + self.log_capacity() as u64 * Self::slot_size() as u64;
        (self.block_size() as u64).saturating_sub(reserved) as u32
    }

    /// Total size of the active bank including header, log, and data.
    pub fn block_size(&self) -> u32 {
        self.active_bank().size()
    }

    /// Generation counter of the active bank's header.
    pub fn bank_version(&self) -> u32 {
        self.active_header().version
    }

    pub fn is_left_bank_active(&self) -> bool {
        self.active == Bank::Left
    }

    pub fn is_right_bank_active(&self) -> bool {
        self.active == Bank::Right
    }
}
