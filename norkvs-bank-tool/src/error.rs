use thiserror::Error;

/// Errors that can occur while loading bank images or exporting their
/// content.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("store error: {0}")]
    Store(#[from] norkvs::Error),

    #[error("bank images differ in size ({0} vs {1} bytes)")]
    SizeMismatch(usize, usize),

    #[error("bank image is empty")]
    EmptyImage,

    #[error("object vanished while exporting: {0}")]
    ObjectVanished(String),
}
