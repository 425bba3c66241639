//! # Run Configuration
//!
//! Loaded once at startup from TOML. Every section is optional and every
//! key has a default; unknown keys are rejected.
//!
//! ```toml
//! [physics]
//! dt = 0.0625
//! t_end = 10.0
//!
//! [initial]
//! plummer = 100000        # bodies per rank
//!
//! [output]
//! snapshot_base = "run_"
//! snapshot_interval = 1.0
//!
//! [group]
//! ranks = 4
//! ```
//!
//! [`RunConfig::validate`] checks ranges and resolves the initial-condition
//! flags into one [`InitialConditionSource`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use arbor_io::{FailurePolicy, OutputMode, PipelineConfig};
use arbor_shared::{
    COMBINED_OUTPUT_MAX_PROCS, DEFAULT_EPS, DEFAULT_GALAXY_FORK, DEFAULT_IC_SEED, DEFAULT_ITER_END,
    DEFAULT_LOG_FILE, DEFAULT_QUICK_RATIO, DEFAULT_REBUILD_RATE, DEFAULT_SNAPSHOT_BASE,
    DEFAULT_THETA, DEFAULT_TIME_STEP, DEFAULT_T_END, DEFAULT_WRITER_POLL_US,
    DEFAULT_WRITE_BACKOFF_MS, DEFAULT_WRITE_RETRIES,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::initial::InitialConditionSource;

/// Printed when the configuration is unusable.
pub const USAGE: &str = "\
Usage: arbor <config.toml>

  [device]   backend = \"emulated\" | \"wgpu\", device, render_device,
             device_count, capacity_bytes, interop
  [physics]  eps, theta, dt, t_end, iter_end, rebuild_rate
  [output]   dir, snapshot_base, snapshot_interval, snapshot_every,
             quick_dump, quick_ratio, quick_sync, async_writer,
             combined_max_procs, write_retries, write_backoff_ms, writer_poll_us
  [initial]  exactly one of: plummer, sphere, cube, galaxy (bodies per rank)
             or file (+ at most one of restart, collective, disk_mode);
             galaxy_fork, task_var, seed, reduce_bodies
  [logging]  log_file, filter
  [group]    ranks
";

/// Which device backend to open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host-memory device.
    #[default]
    Emulated,
    /// GPU through wgpu (needs the `wgpu` feature).
    Wgpu,
}

/// `[device]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Backend.
    pub backend: BackendKind,
    /// Compute device.
    pub device: u32,
    /// Device owning the graphics context. Defaults to `device`.
    pub render_device: Option<u32>,
    /// Devices exposed by the emulated backend.
    pub device_count: u32,
    /// Emulated device memory limit in bytes.
    pub capacity_bytes: Option<usize>,
    /// Back positions with graphics-interop buffers.
    pub interop: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Emulated,
            device: 0,
            render_device: None,
            device_count: 1,
            capacity_bytes: None,
            interop: false,
        }
    }
}

/// `[physics]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhysicsConfig {
    /// Softening length (squared by the solver).
    pub eps: f32,
    /// Tree opening angle, handed to the solver.
    pub theta: f32,
    /// Time step.
    pub dt: f64,
    /// End time.
    pub t_end: f64,
    /// End iteration.
    pub iter_end: u64,
    /// Rebuild the tree every this many steps.
    pub rebuild_rate: u32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            eps: DEFAULT_EPS,
            theta: DEFAULT_THETA,
            dt: f64::from(DEFAULT_TIME_STEP),
            t_end: f64::from(DEFAULT_T_END),
            iter_end: DEFAULT_ITER_END,
            rebuild_rate: DEFAULT_REBUILD_RATE,
        }
    }
}

/// `[output]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Directory for snapshots and the run log.
    pub dir: PathBuf,
    /// Snapshot base name.
    pub snapshot_base: String,
    /// Simulated time between full snapshots. Non-positive disables.
    pub snapshot_interval: f64,
    /// Iterations between full snapshots. Zero disables.
    pub snapshot_every: u64,
    /// Simulated time between quick dumps. Zero disables.
    pub quick_dump: f64,
    /// Fraction of bodies in a quick dump.
    pub quick_ratio: f64,
    /// Quick dumps wait for a busy writer instead of being skipped.
    pub quick_sync: bool,
    /// Write from a background thread.
    pub async_writer: bool,
    /// Largest group that still writes one combined file.
    pub combined_max_procs: usize,
    /// Retries of a failed file write.
    pub write_retries: u32,
    /// Pause between retries.
    pub write_backoff_ms: u64,
    /// Writer idle wait.
    pub writer_poll_us: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            snapshot_base: DEFAULT_SNAPSHOT_BASE.to_string(),
            snapshot_interval: -1.0,
            snapshot_every: 0,
            quick_dump: 0.0,
            quick_ratio: DEFAULT_QUICK_RATIO,
            quick_sync: true,
            async_writer: true,
            combined_max_procs: COMBINED_OUTPUT_MAX_PROCS,
            write_retries: DEFAULT_WRITE_RETRIES,
            write_backoff_ms: DEFAULT_WRITE_BACKOFF_MS,
            writer_poll_us: DEFAULT_WRITER_POLL_US,
        }
    }
}

impl OutputConfig {
    /// Pipeline settings derived from this section.
    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            mode: if self.async_writer {
                OutputMode::Background
            } else {
                OutputMode::Inline
            },
            poll_interval: Duration::from_micros(self.writer_poll_us),
            failure: FailurePolicy {
                max_retries: self.write_retries,
                backoff: Duration::from_millis(self.write_backoff_ms),
            },
        }
    }
}

/// `[initial]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitialConfig {
    /// Snapshot file to start from.
    pub file: Option<PathBuf>,
    /// Every rank reads its own `{file}-{rank}`.
    pub restart: bool,
    /// Every rank reads its slice of one combined file.
    pub collective: bool,
    /// Every rank reads the whole file, rotated and shuffled.
    pub disk_mode: bool,
    /// Plummer sphere, bodies per rank.
    pub plummer: Option<usize>,
    /// Uniform sphere, bodies per rank.
    pub sphere: Option<usize>,
    /// Uniform cube, bodies per rank.
    pub cube: Option<usize>,
    /// Exponential disk galaxy, bodies per rank.
    pub galaxy: Option<usize>,
    /// Worker threads for the galaxy generator.
    pub galaxy_fork: usize,
    /// Environment variable holding the task id, read before the group
    /// starts.
    pub task_var: Option<String>,
    /// Generator seed.
    pub seed: u64,
    /// Keep every k-th body of a file source.
    pub reduce_bodies: u32,
}

impl Default for InitialConfig {
    fn default() -> Self {
        Self {
            file: None,
            restart: false,
            collective: false,
            disk_mode: false,
            plummer: None,
            sphere: None,
            cube: None,
            galaxy: None,
            galaxy_fork: DEFAULT_GALAXY_FORK,
            task_var: None,
            seed: DEFAULT_IC_SEED,
            reduce_bodies: 1,
        }
    }
}

impl InitialConfig {
    fn resolve(&self) -> ConfigResult<InitialConditionSource> {
        let mut chosen = Vec::new();
        let mut source = None;

        let generators = [
            ("plummer", self.plummer.map(|n| InitialConditionSource::Plummer { n })),
            ("sphere", self.sphere.map(|n| InitialConditionSource::Sphere { n })),
            ("cube", self.cube.map(|n| InitialConditionSource::Cube { n })),
            (
                "galaxy",
                self.galaxy.map(|n| InitialConditionSource::Galaxy {
                    n,
                    fork: self.galaxy_fork,
                    task_var: self.task_var.clone(),
                }),
            ),
        ];
        for (name, candidate) in generators {
            if candidate.is_some() {
                chosen.push(name);
                source = candidate;
            }
        }

        let modes = [
            ("restart", self.restart),
            ("collective", self.collective),
            ("disk_mode", self.disk_mode),
        ];
        let active: Vec<&'static str> = modes
            .iter()
            .filter(|(_, on)| *on)
            .map(|(name, _)| *name)
            .collect();
        match &self.file {
            Some(path) => {
                if active.len() > 1 {
                    return Err(ConfigError::MultipleSources(active));
                }
                let path = path.clone();
                chosen.push("file");
                source = Some(match active.first().copied() {
                    Some("restart") => InitialConditionSource::PerProcessRestart { path },
                    Some("collective") => InitialConditionSource::CombinedFile { path },
                    Some(_) => InitialConditionSource::ShuffledDisk { path },
                    None => InitialConditionSource::ScatterFromRoot { path },
                });
            }
            None => {
                if let Some(flag) = active.first() {
                    return Err(ConfigError::invalid("initial.file", format!("{flag} needs a file")));
                }
            }
        }

        match (chosen.len(), source) {
            (1, Some(source)) => Ok(source),
            (0, _) => Err(ConfigError::NoSource),
            _ => Err(ConfigError::MultipleSources(chosen)),
        }
    }
}

/// `[logging]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Per-process run log, relative to the output directory.
    pub log_file: String,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: DEFAULT_LOG_FILE.to_string(),
            filter: "info".to_string(),
        }
    }
}

/// `[group]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupConfig {
    /// Ranks to run as threads of this process.
    pub ranks: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self { ranks: 1 }
    }
}

/// The whole run configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// `[device]`
    pub device: DeviceConfig,
    /// `[physics]`
    pub physics: PhysicsConfig,
    /// `[output]`
    pub output: OutputConfig,
    /// `[initial]`
    pub initial: InitialConfig,
    /// `[logging]`
    pub logging: LoggingConfig,
    /// `[group]`
    pub group: GroupConfig,
}

impl RunConfig {
    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses TOML text.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Render device, falling back to the compute device.
    #[must_use]
    pub fn render_device(&self) -> u32 {
        self.device.render_device.unwrap_or(self.device.device)
    }

    /// Checks every range and picks the initial-condition source.
    pub fn validate(&self) -> ConfigResult<InitialConditionSource> {
        let physics = &self.physics;
        if !(physics.dt.is_finite() && physics.dt > 0.0) {
            return Err(ConfigError::invalid("physics.dt", "must be positive"));
        }
        if !physics.t_end.is_finite() {
            return Err(ConfigError::invalid("physics.t_end", "must be finite"));
        }
        if !(physics.eps.is_finite() && physics.eps >= 0.0) {
            return Err(ConfigError::invalid("physics.eps", "must be non-negative"));
        }
        if !(physics.theta.is_finite() && physics.theta > 0.0) {
            return Err(ConfigError::invalid("physics.theta", "must be positive"));
        }
        if physics.rebuild_rate == 0 {
            return Err(ConfigError::invalid("physics.rebuild_rate", "must be at least 1"));
        }

        let output = &self.output;
        if !(output.quick_ratio > 0.0 && output.quick_ratio <= 1.0) {
            return Err(ConfigError::invalid("output.quick_ratio", "must be in (0, 1]"));
        }
        if !(output.quick_dump.is_finite() && output.quick_dump >= 0.0) {
            return Err(ConfigError::invalid("output.quick_dump", "must be non-negative"));
        }
        if !output.snapshot_interval.is_finite() {
            return Err(ConfigError::invalid("output.snapshot_interval", "must be finite"));
        }
        if output.snapshot_base.is_empty() {
            return Err(ConfigError::invalid("output.snapshot_base", "must not be empty"));
        }
        if output.combined_max_procs == 0 {
            return Err(ConfigError::invalid("output.combined_max_procs", "must be at least 1"));
        }

        if self.group.ranks == 0 {
            return Err(ConfigError::invalid("group.ranks", "must be at least 1"));
        }

        let device = &self.device;
        if device.backend == BackendKind::Emulated {
            if device.device_count == 0 {
                return Err(ConfigError::invalid("device.device_count", "must be at least 1"));
            }
            for (field, id) in [("device.device", device.device), ("device.render_device", self.render_device())] {
                if id >= device.device_count {
                    return Err(ConfigError::invalid(
                        field,
                        format!("{id} exceeds {} emulated device(s)", device.device_count),
                    ));
                }
            }
        }
        if device.backend == BackendKind::Wgpu && !cfg!(feature = "wgpu") {
            return Err(ConfigError::invalid("device.backend", "built without the wgpu feature"));
        }

        let initial = &self.initial;
        if initial.reduce_bodies == 0 {
            return Err(ConfigError::invalid("initial.reduce_bodies", "must be at least 1"));
        }
        if initial.galaxy_fork == 0 {
            return Err(ConfigError::invalid("initial.galaxy_fork", "must be at least 1"));
        }
        initial.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_driver() {
        let config = RunConfig::default();
        assert!((config.physics.eps - 0.05).abs() < f32::EPSILON);
        assert!((config.physics.theta - 0.75).abs() < f32::EPSILON);
        assert!((config.physics.dt - 0.0625).abs() < f64::EPSILON);
        assert_eq!(config.physics.iter_end, 1 << 30);
        assert_eq!(config.output.snapshot_base, "snapshot_");
        assert_eq!(config.logging.log_file, "gpuLog.log");
        assert_eq!(config.render_device(), 0);
    }

    #[test]
    fn test_empty_config_has_no_source() {
        let config = RunConfig::from_toml_str("").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoSource)));
    }

    #[test]
    fn test_generator_source() {
        let config = RunConfig::from_toml_str(
            r#"
            [initial]
            sphere = 500
            [group]
            ranks = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.validate().unwrap(), InitialConditionSource::Sphere { n: 500 });
    }

    #[test]
    fn test_several_sources_rejected() {
        let config = RunConfig::from_toml_str(
            r#"
            [initial]
            plummer = 10
            file = "ic.bin"
            "#,
        )
        .unwrap();
        match config.validate() {
            Err(ConfigError::MultipleSources(names)) => assert_eq!(names, vec!["plummer", "file"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_file_modes() {
        let pick = |extra: &str| {
            let text = format!("[initial]\nfile = \"ic\"\n{extra}");
            RunConfig::from_toml_str(&text).unwrap().validate()
        };
        let path = PathBuf::from("ic");
        assert_eq!(
            pick("").unwrap(),
            InitialConditionSource::ScatterFromRoot { path: path.clone() }
        );
        assert_eq!(
            pick("restart = true").unwrap(),
            InitialConditionSource::PerProcessRestart { path: path.clone() }
        );
        assert_eq!(
            pick("collective = true").unwrap(),
            InitialConditionSource::CombinedFile { path: path.clone() }
        );
        assert_eq!(
            pick("disk_mode = true").unwrap(),
            InitialConditionSource::ShuffledDisk { path }
        );
        assert!(pick("restart = true\ndisk_mode = true").is_err());
    }

    #[test]
    fn test_mode_without_file_rejected() {
        let config = RunConfig::from_toml_str("[initial]\nrestart = true\ncube = 5").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "initial.file", .. })
        ));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            RunConfig::from_toml_str("[physics]\ntimestep = 1.0"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_quick_ratio_range() {
        let mut config = RunConfig::from_toml_str("[initial]\ncube = 8").unwrap();
        config.output.quick_ratio = 0.0;
        assert!(config.validate().is_err());
        config.output.quick_ratio = 1.5;
        assert!(config.validate().is_err());
        config.output.quick_ratio = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_render_device_must_exist() {
        let config =
            RunConfig::from_toml_str("[device]\nrender_device = 1\n[initial]\ncube = 8").unwrap();
        assert!(config.validate().is_err());
        let config = RunConfig::from_toml_str(
            "[device]\nrender_device = 1\ndevice_count = 2\n[initial]\ncube = 8",
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.render_device(), 1);
    }

    #[test]
    fn test_pipeline_settings() {
        let mut output = OutputConfig::default();
        output.async_writer = false;
        output.write_retries = 7;
        let pipeline = output.pipeline();
        assert_eq!(pipeline.mode, OutputMode::Inline);
        assert_eq!(pipeline.failure.max_retries, 7);
    }
}
