//! # ARBOR Shared
//!
//! Common types used by the device layer, the snapshot writer and the driver.
//!
//! ## CRITICAL RULE
//!
//! This crate must NEVER depend on a device backend. If you need buffers,
//! put them in `arbor_core`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod constants;
pub mod math;
pub mod naming;

pub use constants::{
    COMBINED_OUTPUT_MAX_PROCS, DEFAULT_EPS, DEFAULT_GALAXY_FORK, DEFAULT_IC_SEED, DEFAULT_ITER_END,
    DEFAULT_LOG_FILE, DEFAULT_QUICK_RATIO, DEFAULT_REBUILD_RATE, DEFAULT_SNAPSHOT_BASE,
    DEFAULT_THETA, DEFAULT_TIME_STEP, DEFAULT_T_END, DEFAULT_WRITER_POLL_US,
    DEFAULT_WRITE_BACKOFF_MS, DEFAULT_WRITE_RETRIES, PRE_GROUP_SEED_SPACE,
};
pub use math::{BodyId, Real2, Real4};
pub use naming::{log_file_name, log_preamble, per_process_file_name, snapshot_file_name, SnapshotKind};
