//! Where snapshots end up.
//!
//! Writing is split in two so the pipeline can retry the part that may
//! fail transiently without repeating the collective part:
//!
//! 1. [`SnapshotSink::assemble`] gathers sections and encodes file images.
//!    Every rank calls it for every dataset, in the same order.
//! 2. [`SnapshotSink::persist`] puts one image on disk. Safe to retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_core::{ProcessGroup, Tag};
use arbor_shared::{per_process_file_name, snapshot_file_name, COMBINED_OUTPUT_MAX_PROCS};

use crate::error::{IoError, IoResult};
use crate::format::{
    decode_section, encode_file, encode_section, write_atomic, FileLayout, SnapshotHeader,
};
use crate::snapshot::SnapshotData;

/// A fully encoded file waiting to be persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFile {
    /// Destination.
    pub path: PathBuf,
    /// File image.
    pub bytes: Vec<u8>,
}

/// Destination for snapshot datasets.
pub trait SnapshotSink: Send {
    /// Turns a dataset into the files this rank must persist.
    ///
    /// May exchange data with other ranks. Ranks that contribute to a file
    /// written elsewhere return nothing.
    fn assemble(&mut self, snapshot: &SnapshotData) -> IoResult<Vec<EncodedFile>>;

    /// Persists one file and returns the bytes written.
    fn persist(&mut self, file: &EncodedFile) -> IoResult<u64>;
}

/// Writes snapshot files into a directory.
///
/// Up to `combined_max_procs` processes share one combined file written by
/// rank 0. Larger groups write one file per rank, named with a `-{rank}`
/// suffix.
pub struct FileSink {
    dir: PathBuf,
    base: String,
    group: Arc<dyn ProcessGroup>,
    combined_max_procs: usize,
}

impl FileSink {
    /// Creates a sink writing `{dir}/{base}_{t:010.4}` style names.
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>, group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            dir: dir.into(),
            base: base.into(),
            group,
            combined_max_procs: COMBINED_OUTPUT_MAX_PROCS,
        }
    }

    /// Overrides the combined-file process limit.
    #[must_use]
    pub fn with_combined_max_procs(mut self, limit: usize) -> Self {
        self.combined_max_procs = limit;
        self
    }

    /// Layout used for this group.
    #[must_use]
    pub fn layout(&self) -> FileLayout {
        if self.group.size() <= self.combined_max_procs {
            FileLayout::Combined
        } else {
            FileLayout::PerProcess
        }
    }

    /// Output directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path this rank's file for `snapshot` would get, if it writes one.
    #[must_use]
    pub fn path_for(&self, snapshot: &SnapshotData) -> PathBuf {
        let name = snapshot_file_name(&self.base, snapshot.t_current(), snapshot.kind());
        match self.layout() {
            FileLayout::Combined => self.dir.join(name),
            FileLayout::PerProcess => self
                .dir
                .join(per_process_file_name(&name, self.group.rank())),
        }
    }

    fn header(&self, snapshot: &SnapshotData, layout: FileLayout, n: usize, counts: [u64; 3]) -> SnapshotHeader {
        SnapshotHeader {
            kind: snapshot.kind(),
            layout,
            t_current: snapshot.t_current(),
            n_bodies: n as u64,
            class_counts: counts,
            rank: self.group.rank() as u32,
            nprocs: self.group.size() as u32,
        }
    }

    fn assemble_per_process(&self, snapshot: &SnapshotData) -> EncodedFile {
        let header = self.header(
            snapshot,
            FileLayout::PerProcess,
            snapshot.n_bodies(),
            snapshot.class_counts(),
        );
        EncodedFile {
            path: self.path_for(snapshot),
            bytes: encode_file(
                &header,
                snapshot.positions(),
                snapshot.velocities(),
                snapshot.ids(),
            ),
        }
    }

    fn assemble_combined(&self, snapshot: &SnapshotData) -> IoResult<Option<EncodedFile>> {
        let rank = self.group.rank();
        if rank != 0 {
            self.group
                .send(0, Tag::SNAPSHOT_SECTION, encode_section(snapshot))?;
            return Ok(None);
        }

        let mut positions = snapshot.positions().to_vec();
        let mut velocities = snapshot.velocities().to_vec();
        let mut ids = snapshot.ids().to_vec();
        let mut counts = snapshot.class_counts();

        for source in 1..self.group.size() {
            let section = decode_section(&self.group.recv(source, Tag::SNAPSHOT_SECTION)?)?;
            if section.kind != snapshot.kind() || section.t_current.to_bits() != snapshot.t_current().to_bits() {
                return Err(IoError::Inconsistent(format!(
                    "rank {source} sent {:?} at t={} while root holds {:?} at t={}",
                    section.kind,
                    section.t_current,
                    snapshot.kind(),
                    snapshot.t_current()
                )));
            }
            positions.extend_from_slice(&section.positions);
            velocities.extend_from_slice(&section.velocities);
            ids.extend_from_slice(&section.ids);
            for (total, part) in counts.iter_mut().zip(section.class_counts) {
                *total += part;
            }
        }

        let header = self.header(snapshot, FileLayout::Combined, ids.len(), counts);
        Ok(Some(EncodedFile {
            path: self.path_for(snapshot),
            bytes: encode_file(&header, &positions, &velocities, &ids),
        }))
    }
}

impl SnapshotSink for FileSink {
    fn assemble(&mut self, snapshot: &SnapshotData) -> IoResult<Vec<EncodedFile>> {
        match self.layout() {
            FileLayout::PerProcess => Ok(vec![self.assemble_per_process(snapshot)]),
            FileLayout::Combined => Ok(self.assemble_combined(snapshot)?.into_iter().collect()),
        }
    }

    fn persist(&mut self, file: &EncodedFile) -> IoResult<u64> {
        write_atomic(&file.path, &file.bytes)?;
        tracing::debug!(path = %file.path.display(), bytes = file.bytes.len(), "snapshot written");
        Ok(file.bytes.len() as u64)
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("dir", &self.dir)
            .field("base", &self.base)
            .field("rank", &self.group.rank())
            .field("layout", &self.layout())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::read_file;
    use arbor_core::{LocalGroup, SoloGroup};
    use arbor_shared::{Real4, SnapshotKind};
    use std::thread;

    fn snapshot(rank: u64, n: usize, t: f64) -> SnapshotData {
        let positions = vec![Real4::position(rank as f32, 0.0, 0.0, 0.5); n];
        let velocities = vec![Real4::ZERO; n];
        let ids = (0..n as u64).map(|i| rank * 1000 + i).collect();
        SnapshotData::new(t, positions, velocities, ids).unwrap()
    }

    #[test]
    fn test_single_rank_combined_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path(), "snap_", Arc::new(SoloGroup::new()));
        assert_eq!(sink.layout(), FileLayout::Combined);

        let files = sink.assemble(&snapshot(0, 4, 2.5)).unwrap();
        assert_eq!(files.len(), 1);
        let name = files[0].path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "snap__00002.5000");

        sink.persist(&files[0]).unwrap();
        let file = read_file(&files[0].path).unwrap();
        assert_eq!(file.header.n_bodies, 4);
        assert_eq!(file.header.kind, SnapshotKind::Full);
    }

    #[test]
    fn test_combined_gathers_all_ranks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let handles: Vec<_> = LocalGroup::create(3)
            .into_iter()
            .map(|group| {
                let path = path.clone();
                thread::spawn(move || {
                    let rank = group.rank() as u64;
                    let mut sink = FileSink::new(path, "run", Arc::new(group));
                    let files = sink.assemble(&snapshot(rank, 2 + rank as usize, 1.0)).unwrap();
                    for file in &files {
                        sink.persist(file).unwrap();
                    }
                    files.len()
                })
            })
            .collect();
        let written: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(written, vec![1, 0, 0]);

        let file = read_file(&path.join("run_00001.0000")).unwrap();
        assert_eq!(file.header.n_bodies, 2 + 3 + 4);
        assert_eq!(file.header.nprocs, 3);
        assert_eq!(file.header.class_counts, [9, 0, 0]);
        assert_eq!(&file.ids[..3], &[0, 1, 1000]);
        assert_eq!(file.ids[8], 2003);
    }

    #[test]
    fn test_per_process_layout_above_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let handles: Vec<_> = LocalGroup::create(2)
            .into_iter()
            .map(|group| {
                let path = path.clone();
                thread::spawn(move || {
                    let rank = group.rank() as u64;
                    let mut sink =
                        FileSink::new(path, "run", Arc::new(group)).with_combined_max_procs(1);
                    assert_eq!(sink.layout(), FileLayout::PerProcess);
                    for file in sink.assemble(&snapshot(rank, 3, 0.5)).unwrap() {
                        sink.persist(&file).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for rank in 0..2u64 {
            let file = read_file(&path.join(format!("run_00000.5000-{rank}"))).unwrap();
            assert_eq!(file.header.layout, FileLayout::PerProcess);
            assert_eq!(file.header.rank as u64, rank);
            assert_eq!(file.ids[0], rank * 1000);
        }
    }

    #[test]
    fn test_mismatched_time_rejected() {
        let mut groups = LocalGroup::create(2);
        let second = groups.pop().unwrap();
        let first = groups.pop().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let peer = thread::spawn(move || {
            let mut sink = FileSink::new(path, "run", Arc::new(second));
            sink.assemble(&snapshot(1, 1, 3.0)).unwrap()
        });
        let mut sink = FileSink::new(dir.path(), "run", Arc::new(first));
        let err = sink.assemble(&snapshot(0, 1, 2.0)).unwrap_err();
        assert!(matches!(err, IoError::Inconsistent(_)));
        assert!(peer.join().unwrap().is_empty());
    }
}
