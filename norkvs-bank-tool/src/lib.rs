//! Host-side loading of norkvs bank image pairs, plus summary and CSV
//! export helpers. Images are opened through the engine itself, so whatever
//! the device would see (bank selection, CRC fallback, tombstones) is what
//! gets reported here.

use std::fs;
use std::path::Path;

use norkvs::platform::StorageBank;
use norkvs::{Key, Kvs, ListEntry};

pub mod csv_writer;
pub mod error;

pub use error::Error;

/// Largest number of distinct objects a listing reports.
pub const MAX_OBJECTS: usize = 1024;

/// The log size assumed when opening a pair of blank images. Irrelevant for
/// images that already carry a header.
pub const DEFAULT_LOG_SIZE: u32 = 128;

/// A bank image held in memory. The write path exists only so the engine
/// can be opened over the image; nothing the tool does writes back to disk.
#[derive(Debug)]
pub struct ImageBank {
    data: Vec<u8>,
}

impl ImageBank {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn blank(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
        }
    }

    /// The raw image bytes, e.g. for writing a generated image to disk.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl StorageBank for ImageBank {
    fn erase(&mut self) -> bool {
        self.data.fill(0xFF);
        true
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> bool {
        let offset = offset as usize;
        if offset + data.len() > self.data.len() {
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

/// Open a left/right image pair. A missing right image is treated as a
/// blank bank of the same size, which matches a device that never compacted.
pub fn open_images(left: &Path, right: Option<&Path>) -> Result<Kvs<ImageBank>, Error> {
    let left_data = fs::read(left)?;
    if left_data.is_empty() {
        return Err(Error::EmptyImage);
    }
    let right_bank = match right {
        Some(path) => {
            let right_data = fs::read(path)?;
            if right_data.len() != left_data.len() {
                return Err(Error::SizeMismatch(left_data.len(), right_data.len()));
            }
            ImageBank::new(right_data)
        }
        None => ImageBank::blank(left_data.len()),
    };
    Ok(Kvs::new(
        ImageBank::new(left_data),
        right_bank,
        DEFAULT_LOG_SIZE,
    )?)
}

/// One exported object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub key: Key<16>,
    pub size: u32,
    pub revs: u32,
    pub value: Vec<u8>,
}

impl Object {
    /// Printable form of the key: padding stripped, non-UTF-8 replaced.
    pub fn printable_key(&self) -> String {
        let bytes = self.key.as_bytes();
        let trimmed = match bytes.iter().rposition(|&b| b != 0) {
            Some(last) => &bytes[..=last],
            None => &bytes[..0],
        };
        String::from_utf8_lossy(trimmed).into_owned()
    }
}

/// Collect every live object with its payload, sorted by key.
pub fn collect_objects(kvs: &Kvs<ImageBank>) -> Result<Vec<Object>, Error> {
    let mut list = vec![ListEntry::default(); MAX_OBJECTS];
    let count = kvs.enumerate(&mut list);

    let mut objects = Vec::with_capacity(count);
    for row in &list[..count] {
        // A tombstone still occupies log slots but has no payload to export.
        let value = match kvs.find(&row.key) {
            Some(entry) => kvs.map(&entry).to_vec(),
            None if row.size == 0 => Vec::new(),
            None => return Err(Error::ObjectVanished(format!("{:?}", row.key))),
        };
        objects.push(Object {
            key: row.key,
            size: row.size,
            revs: row.revs,
            value,
        });
    }
    Ok(objects)
}

/// Human-readable state of an opened pair, in the order the device's own
/// diagnostics print it.
pub fn summary(kvs: &Kvs<ImageBank>) -> String {
    let side = if kvs.is_left_bank_active() {
        "left"
    } else {
        "right"
    };
    format!(
        "Active bank:      {}\n\
         Bank version:     {}\n\
         Log capacity:     {}\n\
         Free log entries: {}\n\
         Data capacity:    {}\n\
         Free data space:  {}\n",
        side,
        kvs.bank_version(),
        kvs.log_capacity(),
        kvs.free_log_entries(),
        kvs.data_capacity(),
        kvs.free_data_space(),
    )
}
