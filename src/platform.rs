use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crc::{CRC_32_ISO_HDLC, Crc};

/// CRC-32 as stored on media: reflected polynomial `0xEDB88320`, seed
/// `0xFFFFFFFF`, final complement, then a byte swap of the result. The byte
/// swap is part of the media format, so a hardware-accelerated override of
/// [`StorageBank::crc`] must apply it too.
pub fn crc32(data: &[u8]) -> u32 {
    const ALGO: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    ALGO.checksum(data).swap_bytes()
}

/// One bank of flash storage.
///
/// A bank typically maps 1:1 to an erase block, but may span several. No two
/// banks may share an erase block, and nothing else may live in a block
/// claimed by a bank or it risks being erased.
///
/// Requirements for the underlying storage:
/// * memory mapped for reads
/// * block level erase
/// * byte level writes that can only clear bits
pub trait StorageBank {
    /// Program granularity of the part in bytes. The engine aligns every
    /// write offset and record size to a multiple of this. Implementations
    /// must accept writes of any length at an aligned offset, padding the
    /// final block themselves if the part requires it.
    const WRITE_BLOCK: usize = 1;

    /// Reset the whole bank to the erased (all-ones) state.
    fn erase(&mut self) -> bool;

    /// Program `data` at `offset`. Programming may only clear bits; writing
    /// differing non-ones bits over already-programmed bytes is a caller
    /// error and need not succeed.
    fn write(&mut self, offset: u32, data: &[u8]) -> bool;

    /// Checksum of a byte region, see [`crc32`]. Override when the part has
    /// a CRC peripheral.
    fn crc(&self, data: &[u8]) -> u32 {
        crc32(data)
    }

    /// The memory-mapped content of the bank. The returned view is stable
    /// until the next `erase`.
    fn base(&self) -> &[u8];

    /// Number of bytes of storage in the bank.
    fn size(&self) -> u32 {
        self.base().len() as u32
    }
}

/// Records uncorrectable-ECC faults signalled from a trap handler.
///
/// On parts whose flash ECC raises a bus fault or NMI for uncorrectable
/// reads, the handler detects whether the faulting address lies inside a
/// bank, calls [`FaultMonitor::record`], and resumes past the faulting
/// instruction. The engine clears the flag before each read it depends on
/// and discards the result of any read that tripped it.
#[derive(Debug, Default)]
pub struct FaultMonitor {
    tripped: AtomicBool,
    flash_addr: AtomicU32,
    insn_addr: AtomicU32,
}

impl FaultMonitor {
    pub const fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
            flash_addr: AtomicU32::new(0),
            insn_addr: AtomicU32::new(0),
        }
    }

    /// Flag a fault. Safe to call from interrupt context.
    pub fn record(&self, flash_addr: u32, insn_addr: u32) {
        self.flash_addr.store(flash_addr, Ordering::Relaxed);
        self.insn_addr.store(insn_addr, Ordering::Relaxed);
        self.tripped.store(true, Ordering::Release);
    }

    /// The faulting flash address and program counter of the most recent
    /// fault.
    pub fn last_fault(&self) -> (u32, u32) {
        (
            self.flash_addr.load(Ordering::Relaxed),
            self.insn_addr.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn clear(&self) {
        self.tripped.store(false, Ordering::Relaxed);
    }

    /// Consume the flag, returning whether a fault occurred since `clear`.
    pub(crate) fn take(&self) -> bool {
        self.tripped.swap(false, Ordering::Acquire)
    }
}

/// A RAM-backed bank for tests, host tooling, and simulation.
///
/// `N` is the bank size in bytes, `W` the simulated write block. Writes use
/// the same bit-clearing semantics as NOR flash so that misuse (programming
/// over non-blank bytes) corrupts data here exactly as it would on hardware.
pub struct RamBank<const N: usize, const W: usize = 1> {
    data: [u8; N],
}

impl<const N: usize, const W: usize> RamBank<N, W> {
    pub const fn new() -> Self {
        Self { data: [0xFF; N] }
    }

    /// Wrap existing content, e.g. a bank image loaded from a file.
    pub const fn from_bytes(data: [u8; N]) -> Self {
        Self { data }
    }

    /// The raw content, e.g. for serializing a bank image to a file.
    pub const fn contents(&self) -> &[u8; N] {
        &self.data
    }
}

impl<const N: usize, const W: usize> Default for RamBank<N, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const W: usize> StorageBank for RamBank<N, W> {
    const WRITE_BLOCK: usize = W;

    fn erase(&mut self) -> bool {
        self.data = [0xFF; N];
        true
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> bool {
        let offset = offset as usize;
        if !offset.is_multiple_of(W) || offset + data.len() > N {
            return false;
        }
        for (i, &b) in data.iter().enumerate() {
            self.data[offset + i] &= b;
        }
        true
    }

    fn base(&self) -> &[u8] {
        &self.data
    }
}
