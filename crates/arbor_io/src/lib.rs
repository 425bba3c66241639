//! # ARBOR Snapshot Output
//!
//! Everything between "the physics loop has a dataset" and "a file is on
//! disk":
//!
//! - [`SnapshotData`]: one rank's particles at one simulated time
//! - [`format`]: the binary file layout with its CRC-32 trailer
//! - [`FileSink`]: combined or per-process files
//! - [`AsyncSnapshotPipeline`]: single-slot handoff to a writer thread
//!
//! ## Example
//!
//! ```rust,ignore
//! use arbor_io::{AsyncSnapshotPipeline, FileSink, PipelineConfig, SnapshotData};
//!
//! let sink = FileSink::new("out", "snapshot_", group);
//! let mut pipeline = AsyncSnapshotPipeline::spawn(Box::new(sink), PipelineConfig::default())?;
//! pipeline.submit(SnapshotData::new(t, positions, velocities, ids)?)?;
//! let stats = pipeline.finish()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod format;
pub mod pipeline;
pub mod sink;
pub mod snapshot;

pub use error::{IoError, IoResult};
pub use format::{read_file, FileLayout, SnapshotFile, SnapshotHeader};
pub use pipeline::{
    AsyncSnapshotPipeline, FailurePolicy, OutputMode, PipelineConfig, PipelineStats, TrySubmit,
};
pub use sink::{EncodedFile, FileSink, SnapshotSink};
pub use snapshot::SnapshotData;
