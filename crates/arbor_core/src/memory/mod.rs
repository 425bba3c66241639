//! # Memory Accounting
//!
//! Arrays report every host and device allocation to a [`MemoryTracker`]
//! owned by the run. Nothing here is global, so two runs in one process keep
//! separate books.

mod tracker;

pub use tracker::{MemoryTracker, MemoryUsage};
