//! # Output Error Types
//!
//! All errors that can occur while encoding, writing or reading snapshots.

use std::path::PathBuf;

use arbor_core::GroupError;
use thiserror::Error;

/// Errors from the snapshot format, sinks and pipeline.
#[derive(Error, Debug)]
pub enum IoError {
    /// The filesystem refused an operation.
    #[error("{op} {path}: {source}")]
    File {
        /// What was attempted.
        op: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file does not start with the snapshot magic.
    #[error("{path} is not a snapshot file")]
    BadMagic {
        /// File involved.
        path: PathBuf,
    },

    /// Written by an incompatible format version.
    #[error("unsupported snapshot version {version}")]
    UnsupportedVersion {
        /// Version found in the header.
        version: u32,
    },

    /// Stored and computed CRC-32 differ.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum {
        /// Value in the trailer.
        stored: u32,
        /// Value over the file contents.
        computed: u32,
    },

    /// Fewer bytes than the header promises.
    #[error("truncated snapshot: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// Arrays or sections that must agree do not.
    #[error("inconsistent snapshot: {0}")]
    Inconsistent(String),

    /// A collective or transfer failed.
    #[error("process group: {0}")]
    Group(#[from] GroupError),

    /// The writer gave up on a dataset.
    #[error("snapshot writer failed after {attempts} attempt(s): {reason}")]
    WriterFailed {
        /// Attempts made, including the first.
        attempts: u32,
        /// Last error seen.
        reason: String,
    },

    /// The writer is no longer running.
    #[error("snapshot writer has stopped")]
    WriterClosed,
}

impl IoError {
    pub(crate) fn file(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Result type for output operations.
pub type IoResult<T> = Result<T, IoError>;
