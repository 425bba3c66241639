//! # ARBOR Driver
//!
//! Turns a TOML configuration into a running N-body simulation:
//!
//! ```text
//!  config ──▶ launch ──▶ SimulationLifecycle (one per rank)
//!                           │
//!                           ├─ initial   generators and snapshot readers
//!                           ├─ particles DeviceHostArray per attribute
//!                           ├─ solver    GravitySolver step
//!                           ├─ arbor_io  AsyncSnapshotPipeline
//!                           └─ fault     FaultPolicy on failure
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! let config = arbor::RunConfig::from_toml_str("[initial]\nplummer = 4096")?;
//! std::process::exit(arbor::launch(&config));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod fault;
pub mod initial;
pub mod launch;
pub mod lifecycle;
pub mod particles;
pub mod runlog;
pub mod solver;

pub use config::{
    BackendKind, DeviceConfig, GroupConfig, InitialConfig, LoggingConfig, OutputConfig,
    PhysicsConfig, RunConfig, USAGE,
};
pub use error::{
    ConfigError, ConfigResult, FaultKind, LifecycleError, RunError, RunResult, SolverError,
    SolverResult,
};
pub use fault::{FaultAction, FaultPolicy};
pub use initial::{InitialConditionGenerator, InitialConditionSource, InitialConditions, StructuredSnapshotReader};
pub use launch::{launch, launch_with, open_backend};
pub use lifecycle::{GroupSource, GroupTotals, Phase, SimulationLifecycle};
pub use particles::ParticleStore;
pub use runlog::RunLog;
pub use solver::{DirectSolver, GravitySolver};
