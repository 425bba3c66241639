//! # Driver Error Types
//!
//! Every failure of a run ends up as a [`RunError`]. Its [`FaultKind`] is
//! what the fault policy looks at; the variant keeps the detail.

use std::path::PathBuf;

use arbor_core::{DeviceError, DeviceErrorCode, GroupError};
use arbor_io::IoError;
use thiserror::Error;

use crate::lifecycle::Phase;

/// Configuration problems. Reported before any resource is acquired.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unknown keys.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// No initial-condition source was selected.
    #[error("no initial-condition source selected")]
    NoSource,

    /// More than one initial-condition source was selected.
    #[error("several initial-condition sources selected: {}", .0.join(", "))]
    MultipleSources(Vec<&'static str>),

    /// A value is out of range.
    #[error("{field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failures inside a solver step.
#[derive(Error, Debug)]
pub enum SolverError {
    /// A body left the representable range.
    #[error("body {id} became non-finite at t={t}")]
    NonFinite {
        /// Identifier of the first bad body.
        id: u64,
        /// Simulated time of the step.
        t: f64,
    },

    /// A transfer failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The solver gave up for its own reasons.
    #[error("{0}")]
    Failed(String),
}

/// Result type for solver steps.
pub type SolverResult<T> = Result<T, SolverError>;

/// Lifecycle misuse.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// The requested phase does not follow the current one.
    #[error("cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        /// Current phase.
        from: Phase,
        /// Requested phase.
        to: Phase,
    },
}

/// How a fault is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Bad configuration: usage text, exit 0.
    Configuration,
    /// Device or host allocation failure: fatal, no retry.
    FatalResource,
    /// Initial conditions could not be produced.
    InitialConditions,
    /// The physics step or a collective failed.
    Computation,
    /// The snapshot writer gave up.
    OutputOffload,
}

impl FaultKind {
    /// Process exit status for this kind.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Configuration => 0,
            Self::FatalResource => 2,
            Self::InitialConditions => 3,
            Self::Computation => 4,
            Self::OutputOffload => 5,
        }
    }
}

/// Any failure of a run.
#[derive(Error, Debug)]
pub enum RunError {
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A device call failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Reading or building initial conditions failed.
    #[error("initial conditions: {0}")]
    InitialConditions(String),

    /// A solver step failed.
    #[error("solver: {0}")]
    Solver(#[from] SolverError),

    /// A collective failed or the group was aborted.
    #[error("group: {0}")]
    Group(#[from] GroupError),

    /// Snapshot output failed.
    #[error("output: {0}")]
    Output(#[from] IoError),

    /// Phase order violated.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// A panic escaped the physics loop.
    #[error("panic: {0}")]
    Panic(String),
}

impl RunError {
    /// Classifies the error for the fault policy.
    #[must_use]
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Config(_) => FaultKind::Configuration,
            Self::Device(_) => FaultKind::FatalResource,
            Self::Solver(SolverError::Device(err))
                if err.code == DeviceErrorCode::MemoryAllocation =>
            {
                FaultKind::FatalResource
            }
            Self::InitialConditions(_) => FaultKind::InitialConditions,
            Self::Output(IoError::WriterFailed { .. } | IoError::WriterClosed) => {
                FaultKind::OutputOffload
            }
            Self::Output(_) | Self::Solver(_) | Self::Group(_) | Self::Lifecycle(_) | Self::Panic(_) => {
                FaultKind::Computation
            }
        }
    }

    /// Exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

/// Result type for the driver.
pub type RunResult<T> = Result<T, RunError>;
