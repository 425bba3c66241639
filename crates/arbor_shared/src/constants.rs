//! # Runtime Constants
//!
//! Defaults for every tunable the driver reads, plus the fixed limits of the
//! output layout.

// =============================================================================
// PHYSICS DEFAULTS
// =============================================================================

/// Softening length (squared by the solver).
pub const DEFAULT_EPS: f32 = 0.05;

/// Tree opening angle.
pub const DEFAULT_THETA: f32 = 0.75;

/// Integration time step.
pub const DEFAULT_TIME_STEP: f32 = 1.0 / 16.0;

/// N-body end time.
pub const DEFAULT_T_END: f32 = 1.0;

/// N-body end iteration.
pub const DEFAULT_ITER_END: u64 = 1 << 30;

/// Rebuild the tree every step unless told otherwise.
pub const DEFAULT_REBUILD_RATE: u32 = 1;

// =============================================================================
// OUTPUT
// =============================================================================

/// Snapshot base name. Simulated time is appended.
pub const DEFAULT_SNAPSHOT_BASE: &str = "snapshot_";

/// Fraction of particles kept in a quick dump.
pub const DEFAULT_QUICK_RATIO: f64 = 0.1;

/// Up to this many processes share one combined snapshot file.
/// Above it, every process writes its own file.
pub const COMBINED_OUTPUT_MAX_PROCS: usize = 16;

/// Per-process run log.
pub const DEFAULT_LOG_FILE: &str = "gpuLog.log";

/// Writer idle wait between slot checks, in microseconds.
pub const DEFAULT_WRITER_POLL_US: u64 = 100;

/// Snapshot write attempts after the first failure.
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

/// Pause between snapshot write attempts, in milliseconds.
pub const DEFAULT_WRITE_BACKOFF_MS: u64 = 50;

// =============================================================================
// INITIAL CONDITIONS
// =============================================================================

/// Seed for the synthetic generators.
pub const DEFAULT_IC_SEED: u64 = 19_640_304;

/// Worker threads used by the galaxy generator.
pub const DEFAULT_GALAXY_FORK: usize = 4;

/// Seed space used when the galaxy model is generated before the group
/// exists and the real process count is still unknown.
pub const PRE_GROUP_SEED_SPACE: usize = 32_768 * 7;
