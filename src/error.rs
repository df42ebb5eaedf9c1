use thiserror::Error;

/// Errors raised by the storage engine. Marked non-exhaustive to allow for
/// future additions without breaking the API. A caller would typically only
/// branch on `NotFound` and `OutOfSpace`; the media errors mean the flash
/// itself is failing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Not enough data or log space for the object, even after compaction.
    #[error("out of space")]
    OutOfSpace,

    /// A flash erase or program operation failed, or a read-back
    /// verification mismatched. `store` already retries internally before
    /// surfacing this.
    #[error("media write failure")]
    MediaWrite,

    /// A CRC mismatch or uncorrectable ECC fault during a read. Recovered
    /// internally by falling back to the previous version of the object.
    #[error("corrupt entry")]
    CorruptEntry,

    /// No valid version of the requested object exists. Either it was never
    /// stored, or its latest committed entry is a tombstone.
    #[error("not found")]
    NotFound,
}
