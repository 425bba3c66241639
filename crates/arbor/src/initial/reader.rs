//! Initial conditions from snapshot files.
//!
//! The input format is the one the runtime writes, so a run can restart
//! from its own output.

use std::path::{Path, PathBuf};

use arbor_core::{ProcessGroup, Tag};
use arbor_io::format::{decode_section, encode_section};
use arbor_io::{read_file, IoError, SnapshotData, SnapshotFile};
use arbor_shared::{per_process_file_name, BodyId, Real4};
use rand::seq::SliceRandom;
use rand::Rng;

use super::{rank_rng, InitialConditions, StructuredSnapshotReader};
use crate::error::{RunError, RunResult};

fn input_error(err: &IoError) -> RunError {
    RunError::InitialConditions(err.to_string())
}

/// Bounds of `rank`'s contiguous share of `n` bodies.
fn share(n: usize, rank: usize, nprocs: usize) -> (usize, usize) {
    (rank * n / nprocs, (rank + 1) * n / nprocs)
}

/// Class counts of the body range `[start, end)` when classes are stored
/// back to back.
fn split_class_counts(counts: [u64; 3], start: usize, end: usize) -> [u64; 3] {
    let (start, end) = (start as u64, end as u64);
    let mut out = [0; 3];
    let mut lo = 0u64;
    for (slot, count) in out.iter_mut().zip(counts) {
        let hi = lo + count;
        *slot = hi.min(end).saturating_sub(lo.max(start));
        lo = hi;
    }
    out
}

fn slice(file: &SnapshotFile, start: usize, end: usize) -> InitialConditions {
    InitialConditions {
        positions: file.positions[start..end].to_vec(),
        velocities: file.velocities[start..end].to_vec(),
        ids: file.ids[start..end].to_vec(),
        class_counts: split_class_counts(file.header.class_counts, start, end),
        t_current: file.header.t_current,
    }
}

/// Every rank reads one combined file and keeps its contiguous slice.
#[derive(Clone, Debug)]
pub struct CombinedFileReader {
    path: PathBuf,
}

impl CombinedFileReader {
    /// Reader for `path`.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl StructuredSnapshotReader for CombinedFileReader {
    fn read(&self, group: &dyn ProcessGroup) -> RunResult<InitialConditions> {
        let file = read_file(&self.path).map_err(|e| input_error(&e))?;
        let n = file.ids.len();
        let (start, end) = share(n, group.rank(), group.size());
        tracing::debug!(path = %self.path.display(), start, end, "reading combined slice");
        Ok(slice(&file, start, end))
    }
}

/// Every rank reads its own `{path}-{rank}`.
#[derive(Clone, Debug)]
pub struct RestartReader {
    path: PathBuf,
}

impl RestartReader {
    /// Reader for files named after `path`.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// File read by `rank`.
    #[must_use]
    pub fn path_for(&self, rank: usize) -> PathBuf {
        PathBuf::from(per_process_file_name(&self.path.to_string_lossy(), rank))
    }
}

impl StructuredSnapshotReader for RestartReader {
    fn read(&self, group: &dyn ProcessGroup) -> RunResult<InitialConditions> {
        let path = self.path_for(group.rank());
        let file = read_file(&path).map_err(|e| input_error(&e))?;
        let n = file.ids.len();
        Ok(slice(&file, 0, n))
    }
}

/// Rank 0 reads the file and sends every peer its chunk; the start time
/// is broadcast from rank 0.
#[derive(Clone, Debug)]
pub struct ScatterReader {
    path: PathBuf,
}

impl ScatterReader {
    /// Reader for `path`.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn scatter(&self, group: &dyn ProcessGroup) -> RunResult<InitialConditions> {
        let file = read_file(&self.path).map_err(|e| input_error(&e))?;
        let n = file.ids.len();
        let nprocs = group.size();
        for peer in 1..nprocs {
            let (start, end) = share(n, peer, nprocs);
            let chunk = slice(&file, start, end);
            let section = SnapshotData::new(
                chunk.t_current,
                chunk.positions,
                chunk.velocities,
                chunk.ids,
            )
            .and_then(|s| s.with_class_counts(chunk.class_counts))
            .map_err(|e| input_error(&e))?;
            group.send(peer, Tag::INITIAL_CONDITIONS, encode_section(&section))?;
        }
        let (start, end) = share(n, 0, nprocs);
        Ok(slice(&file, start, end))
    }

    fn receive(group: &dyn ProcessGroup) -> RunResult<InitialConditions> {
        let bytes = group.recv(0, Tag::INITIAL_CONDITIONS)?;
        let section = decode_section(&bytes).map_err(|e| input_error(&e))?;
        Ok(InitialConditions {
            positions: section.positions,
            velocities: section.velocities,
            ids: section.ids,
            class_counts: section.class_counts,
            t_current: section.t_current,
        })
    }
}

impl StructuredSnapshotReader for ScatterReader {
    fn read(&self, group: &dyn ProcessGroup) -> RunResult<InitialConditions> {
        let mut ic = if group.rank() == 0 {
            self.scatter(group)?
        } else {
            Self::receive(group)?
        };
        ic.t_current = group.broadcast_f64(0, ic.t_current)?;
        Ok(ic)
    }
}

/// Every rank reads the whole file, rotates it about the z axis by a
/// rank-seeded angle and shuffles the body order. Masses are divided by
/// the group size and ids renumbered per rank.
#[derive(Clone, Debug)]
pub struct ShuffledDiskReader {
    path: PathBuf,
    seed: u64,
}

impl ShuffledDiskReader {
    /// Reader for `path`.
    #[must_use]
    pub fn new(path: &Path, seed: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            seed,
        }
    }
}

fn rotate_z(v: Real4, sin: f32, cos: f32) -> Real4 {
    Real4::new(v.x * cos - v.y * sin, v.x * sin + v.y * cos, v.z, v.w)
}

impl StructuredSnapshotReader for ShuffledDiskReader {
    fn read(&self, group: &dyn ProcessGroup) -> RunResult<InitialConditions> {
        let file = read_file(&self.path).map_err(|e| input_error(&e))?;
        let rank = group.rank();
        let nprocs = group.size();
        let n = file.ids.len();
        let mut rng = rank_rng(self.seed, rank as u64);

        let angle: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
        let (sin, cos) = angle.sin_cos();
        let scale = 1.0 / nprocs as f32;

        let mut bodies: Vec<(Real4, Real4)> = file
            .positions
            .iter()
            .zip(&file.velocities)
            .map(|(p, v)| {
                let mut p = rotate_z(*p, sin, cos);
                p.w *= scale;
                (p, rotate_z(*v, sin, cos))
            })
            .collect();
        bodies.shuffle(&mut rng);

        let first = (rank * n) as BodyId;
        let (positions, velocities) = bodies.into_iter().unzip();
        Ok(InitialConditions {
            positions,
            velocities,
            ids: (0..n as BodyId).map(|i| first + i).collect(),
            class_counts: file.header.class_counts,
            t_current: file.header.t_current,
        })
    }
}
