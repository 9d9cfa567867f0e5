//! Decoder error taxonomy.
//!
//! Recoverable problems (damaged entries, unusable metadata, lost
//! synchronisation) become `Error` tracepoints inside the decoded
//! stream so they stay visible in context; only failures to open a
//! tracebuffer at all propagate as `Err` values.

use std::io;

/// Everything that can go wrong while decoding a tracebuffer.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The argument stream and format string are inconsistent.
    #[error("formatting failed: {0}")]
    FormattingFailed(String),
    /// A ring entry parsed but referenced a non-metadata region.
    #[error("invalid ring entry: {0}")]
    InvalidEntry(String),
    /// The referenced metadata blob failed its magic or size checks.
    #[error("invalid metadata: {0}")]
    InvalidMeta(String),
    /// The reader could not resynchronise with the writer.
    #[error("ring synchronisation lost: {0}")]
    Synchronisation(String),
    /// The file header or definition did not validate.
    #[error("invalid tracebuffer: {0}")]
    InvalidTracebuffer(String),
    /// Plain file-system failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Decoder result alias.
pub type Result<T> = std::result::Result<T, DecodeError>;
