//! On-media layout. Little-endian 32-bit fields throughout; nothing here
//! relies on language-native struct layout, every record is encoded and
//! decoded explicitly so the format stays stable across targets.

/// Marks a formatted bank.
pub(crate) const HEADER_MAGIC: u32 = 0xC0DE_F00D;

/// The erased state of a 32-bit field.
pub(crate) const BLANK_WORD: u32 = 0xFFFF_FFFF;

/// Any `log_size` above this is a torn header write; we run on small MCUs,
/// a 2 GB log is not a real configuration.
pub(crate) const MAX_LOG_SIZE: u32 = 0x8000_0000;

/// Encoded size of [`BankHeader`], before write-block padding.
pub(crate) const HEADER_BYTES: usize = 12;

/// Encoded size of a log slot after the key: `{start, len, crc, header_crc}`.
pub(crate) const TAIL_BYTES: usize = 16;

/// Upper bound on the key width so scratch buffers can live on the stack.
pub(crate) const MAX_KEY_BYTES: usize = 64;

/// Largest padded header: `HEADER_BYTES` rounded up to the largest
/// supported write block (which `KLEN % W == 0` caps at `MAX_KEY_BYTES`).
pub(crate) const MAX_HEADER_SIZE: usize = 64;

/// Largest padded log slot, sized the same way.
pub(crate) const MAX_ENTRY_SIZE: usize = 128;

pub(crate) const fn round_up(value: u32, block: usize) -> u32 {
    let block = block as u32;
    if block <= 1 {
        value
    } else {
        value.div_ceil(block) * block
    }
}

pub(crate) const fn round_up_usize(value: usize, block: usize) -> usize {
    if block <= 1 {
        value
    } else {
        value.div_ceil(block) * block
    }
}

/// Size of the bank header on media, padded to the write block.
pub(crate) const fn header_size(write_block: usize) -> usize {
    round_up_usize(HEADER_BYTES, write_block)
}

/// Size of one log slot on media, padded to the write block.
pub(crate) const fn entry_size(klen: usize, write_block: usize) -> usize {
    round_up_usize(klen + TAIL_BYTES, write_block)
}

/// The bank header at offset 0: `{magic, version, log_size}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BankHeader {
    pub magic: u32,
    pub version: u32,
    pub log_size: u32,
}

impl BankHeader {
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            magic: read_u32(bytes, 0),
            version: read_u32(bytes, 4),
            log_size: read_u32(bytes, 8),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut out = [0u8; HEADER_BYTES];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.log_size.to_le_bytes());
        out
    }

    /// Magic must match and the log size must be sane. An interrupted
    /// compaction never writes header bytes at all, but a torn header from
    /// a dying mid-write part would still read as invalid here.
    pub fn is_valid(&self) -> bool {
        self.magic == HEADER_MAGIC && self.log_size <= MAX_LOG_SIZE
    }
}

/// One decoded log slot: `{key, start, len, crc, header_crc}`.
///
/// `header_crc` covers `{key, start, len, crc}`; a stored value of 0 means
/// the field is unused (media written by earlier layouts). A `len` of 0 is
/// a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawSlot<const KLEN: usize> {
    pub key: [u8; KLEN],
    pub start: u32,
    pub len: u32,
    pub crc: u32,
    pub header_crc: u32,
}

impl<const KLEN: usize> RawSlot<KLEN> {
    /// Byte span of the slot that `header_crc` covers.
    pub const CRC_SPAN: usize = KLEN + TAIL_BYTES - 4;

    pub fn decode(bytes: &[u8]) -> Self {
        let mut key = [0u8; KLEN];
        key.copy_from_slice(&bytes[..KLEN]);
        Self {
            key,
            start: read_u32(bytes, KLEN),
            len: read_u32(bytes, KLEN + 4),
            crc: read_u32(bytes, KLEN + 8),
            header_crc: read_u32(bytes, KLEN + 12),
        }
    }

    /// Both `start` and `len` blank means the slot was never touched. A
    /// slot with only one of them blank is a partially-written header and
    /// must not be treated as free.
    pub fn is_blank(&self) -> bool {
        self.start == BLANK_WORD && self.len == BLANK_WORD
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

// The tail buffer in the append path holds the padded slot minus the key.
const _: () = assert!(MAX_ENTRY_SIZE >= MAX_KEY_BYTES + TAIL_BYTES);
const _: () = assert!(MAX_HEADER_SIZE >= HEADER_BYTES);
