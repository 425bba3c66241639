//! # Initial Conditions
//!
//! Exactly one source fills each rank's particle arrays:
//!
//! ```text
//!  source               who reads / generates        ids
//!  ───────────────────  ───────────────────────────  ──────────────────
//!  Plummer/Sphere/Cube  every rank, seeded by rank   rank * n + i
//!  Galaxy               every rank (or pre-group)    rank * n + i
//!  ScatterFromRoot      rank 0 reads, sends chunks   from the file
//!  CombinedFile         every rank reads its slice   from the file
//!  PerProcessRestart    every rank reads {file}-rank from the file
//!  ShuffledDisk         every rank reads everything  rank * n + i
//! ```
//!
//! Generated models carry mass `1 / (n * nprocs)` per body, so the group
//! total is one whatever the rank count.

mod generators;
mod reader;

pub use generators::{CubeModel, GalaxyModel, PlummerModel, SphereModel};
pub use reader::{
    CombinedFileReader, RestartReader, ScatterReader, ShuffledDiskReader,
};

use std::path::PathBuf;

use arbor_core::ProcessGroup;
use arbor_io::SnapshotData;
use arbor_shared::{BodyId, Real4, PRE_GROUP_SEED_SPACE};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::RunResult;

/// Where the initial particles come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitialConditionSource {
    /// Every rank reads its contiguous slice of one combined file.
    CombinedFile {
        /// Combined snapshot.
        path: PathBuf,
    },
    /// Every rank reads `{path}-{rank}`.
    PerProcessRestart {
        /// Base name of the per-rank files.
        path: PathBuf,
    },
    /// Rank 0 reads the file and ships one chunk to every peer.
    ScatterFromRoot {
        /// Combined snapshot.
        path: PathBuf,
    },
    /// Plummer sphere with `n` bodies per rank.
    Plummer {
        /// Bodies per rank.
        n: usize,
    },
    /// Uniform sphere with `n` bodies per rank.
    Sphere {
        /// Bodies per rank.
        n: usize,
    },
    /// Uniform cube with `n` bodies per rank.
    Cube {
        /// Bodies per rank.
        n: usize,
    },
    /// Exponential disk with `n` bodies per rank.
    Galaxy {
        /// Bodies per rank.
        n: usize,
        /// Worker threads.
        fork: usize,
        /// Environment variable naming the task id before the group starts.
        task_var: Option<String>,
    },
    /// Every rank reads the same file, rotated and shuffled per rank.
    ShuffledDisk {
        /// Snapshot read by every rank.
        path: PathBuf,
    },
}

impl InitialConditionSource {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CombinedFile { .. } => "combined-file",
            Self::PerProcessRestart { .. } => "restart",
            Self::ScatterFromRoot { .. } => "scatter",
            Self::Plummer { .. } => "plummer",
            Self::Sphere { .. } => "sphere",
            Self::Cube { .. } => "cube",
            Self::Galaxy { .. } => "galaxy",
            Self::ShuffledDisk { .. } => "shuffled-disk",
        }
    }

    /// Whether particles come from a structured file.
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(
            self,
            Self::CombinedFile { .. }
                | Self::PerProcessRestart { .. }
                | Self::ScatterFromRoot { .. }
                | Self::ShuffledDisk { .. }
        )
    }
}

/// One rank's initial particles.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitialConditions {
    /// Positions with mass in `w`.
    pub positions: Vec<Real4>,
    /// Velocities.
    pub velocities: Vec<Real4>,
    /// Identifiers.
    pub ids: Vec<BodyId>,
    /// Bodies per particle class, classes stored back to back.
    pub class_counts: [u64; 3],
    /// Simulated time to start from.
    pub t_current: f64,
}

impl InitialConditions {
    /// Number of bodies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when this rank holds no bodies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Sum of body masses.
    #[must_use]
    pub fn total_mass(&self) -> f64 {
        self.positions.iter().map(|p| f64::from(p.mass())).sum()
    }

    /// Multiplies every mass by `factor`.
    pub fn scale_mass(&mut self, factor: f64) {
        for p in &mut self.positions {
            p.w = (f64::from(p.w) * factor) as f32;
        }
    }

    /// Whether the three arrays agree in length and the counts sum to it.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let n = self.ids.len();
        self.positions.len() == n
            && self.velocities.len() == n
            && self.class_counts.iter().sum::<u64>() == n as u64
    }
}

impl From<SnapshotData> for InitialConditions {
    fn from(snapshot: SnapshotData) -> Self {
        Self {
            positions: snapshot.positions().to_vec(),
            velocities: snapshot.velocities().to_vec(),
            ids: snapshot.ids().to_vec(),
            class_counts: snapshot.class_counts(),
            t_current: snapshot.t_current(),
        }
    }
}

/// Produces a rank's bodies from nothing but the rank and the group size.
pub trait InitialConditionGenerator: Send + Sync {
    /// Model name for logs.
    fn name(&self) -> &'static str;

    /// Generates the bodies of `rank` in a group of `nprocs`.
    fn generate(&self, rank: usize, nprocs: usize) -> InitialConditions;
}

/// Reads a rank's bodies from snapshot files, possibly collectively.
pub trait StructuredSnapshotReader {
    /// Every rank of `group` calls this together.
    fn read(&self, group: &dyn ProcessGroup) -> RunResult<InitialConditions>;
}

/// Per-rank random stream. Same seed and rank give the same bodies.
pub(crate) fn rank_rng(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}

/// Keeps every `factor`-th body and scales the kept masses by `factor`.
#[must_use]
pub fn reduce_bodies(ic: InitialConditions, factor: u32) -> InitialConditions {
    if factor <= 1 {
        return ic;
    }
    let k = factor as usize;
    let keep = |i: &usize| i % k == 0;

    let mut start = 0u64;
    let mut class_counts = [0u64; 3];
    for (slot, count) in class_counts.iter_mut().zip(ic.class_counts) {
        let end = start + count;
        // Multiples of k in [start, end).
        *slot = end.div_ceil(k as u64) - start.div_ceil(k as u64);
        start = end;
    }

    let positions = ic
        .positions
        .iter()
        .enumerate()
        .filter(|(i, _)| keep(i))
        .map(|(_, p)| Real4::position(p.x, p.y, p.z, p.w * factor as f32))
        .collect();
    let velocities = ic
        .velocities
        .iter()
        .enumerate()
        .filter(|(i, _)| keep(i))
        .map(|(_, v)| *v)
        .collect();
    let ids = ic
        .ids
        .iter()
        .enumerate()
        .filter(|(i, _)| keep(i))
        .map(|(_, id)| *id)
        .collect();

    InitialConditions {
        positions,
        velocities,
        ids,
        class_counts,
        t_current: ic.t_current,
    }
}

/// Generates the galaxy before the group exists, when the task id can be
/// read from `task_var`.
///
/// Masses are left unscaled; [`load`] divides them by the group size later.
#[must_use]
pub fn pregenerate(source: &InitialConditionSource, seed: u64) -> Option<InitialConditions> {
    let InitialConditionSource::Galaxy { n, fork, task_var } = source else {
        return None;
    };
    let var = task_var.as_deref()?;
    let task = match std::env::var(var).ok().and_then(|v| v.trim().parse::<usize>().ok()) {
        Some(task) => task,
        None => {
            tracing::warn!(var, "task id unavailable, generating after group start");
            return None;
        }
    };
    tracing::info!(task, n, "generating galaxy before group start");
    let model = GalaxyModel::new(*n, seed).with_fork(*fork).unscaled();
    Some(model.generate(task, PRE_GROUP_SEED_SPACE))
}

/// Builds this rank's initial conditions from `source`.
///
/// Collective for the file sources: every rank must call it.
pub fn load(
    source: &InitialConditionSource,
    group: &dyn ProcessGroup,
    seed: u64,
    reduce: u32,
    pregenerated: Option<InitialConditions>,
) -> RunResult<InitialConditions> {
    let rank = group.rank();
    let nprocs = group.size();

    let ic = match source {
        InitialConditionSource::Plummer { n } => PlummerModel::new(*n, seed).generate(rank, nprocs),
        InitialConditionSource::Sphere { n } => SphereModel::new(*n, seed).generate(rank, nprocs),
        InitialConditionSource::Cube { n } => CubeModel::new(*n, seed).generate(rank, nprocs),
        InitialConditionSource::Galaxy { n, fork, .. } => match pregenerated {
            Some(mut ic) => {
                ic.scale_mass(1.0 / nprocs as f64);
                ic
            }
            None => GalaxyModel::new(*n, seed)
                .with_fork(*fork)
                .generate(rank, nprocs),
        },
        InitialConditionSource::CombinedFile { path } => CombinedFileReader::new(path).read(group)?,
        InitialConditionSource::PerProcessRestart { path } => RestartReader::new(path).read(group)?,
        InitialConditionSource::ScatterFromRoot { path } => ScatterReader::new(path).read(group)?,
        InitialConditionSource::ShuffledDisk { path } => {
            ShuffledDiskReader::new(path, seed).read(group)?
        }
    };

    Ok(if source.is_file() {
        reduce_bodies(ic, reduce)
    } else {
        ic
    })
}
