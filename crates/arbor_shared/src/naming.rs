//! File naming rules.
//!
//! Snapshot names embed the simulated time as `%010.4f`, so a dump at
//! `t = 2.5` with base `snap_` becomes `snap__00002.5000`.

use serde::{Deserialize, Serialize};

/// What a snapshot contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SnapshotKind {
    /// Every particle.
    Full = 0,
    /// A strided sample of particles.
    Quick = 1,
}

impl SnapshotKind {
    /// Converts from u8.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Full),
            1 => Some(Self::Quick),
            _ => None,
        }
    }
}

/// Builds the combined-file name for a snapshot at simulated time `t`.
#[must_use]
pub fn snapshot_file_name(base: &str, t: f64, kind: SnapshotKind) -> String {
    match kind {
        SnapshotKind::Full => format!("{base}_{t:010.4}"),
        SnapshotKind::Quick => format!("{base}_quick_{t:010.4}"),
    }
}

/// Appends the rank to a combined-file name.
#[must_use]
pub fn per_process_file_name(name: &str, rank: usize) -> String {
    format!("{name}-{rank}")
}

/// Run-log file name. Multi-process runs get `-{nprocs}-{rank}` appended.
#[must_use]
pub fn log_file_name(base: &str, nprocs: usize, rank: usize) -> String {
    if nprocs > 1 {
        format!("{base}-{nprocs}-{rank}")
    } else {
        base.to_string()
    }
}

/// Prefix put in front of every run-log line.
#[must_use]
pub fn log_preamble(rank: usize) -> String {
    format!("PROC-{rank:05} ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_name_embeds_time() {
        let name = snapshot_file_name("snap_", 2.5, SnapshotKind::Full);
        assert_eq!(name, "snap__00002.5000");
        assert!(name.contains("2.5000"));
    }

    #[test]
    fn test_quick_and_per_process_names() {
        let quick = snapshot_file_name("run", 0.125, SnapshotKind::Quick);
        assert_eq!(quick, "run_quick_00000.1250");
        assert_eq!(per_process_file_name("run_00001.0000", 17), "run_00001.0000-17");
    }

    #[test]
    fn test_log_names() {
        assert_eq!(log_file_name("gpuLog.log", 1, 0), "gpuLog.log");
        assert_eq!(log_file_name("gpuLog.log", 4, 2), "gpuLog.log-4-2");
        assert_eq!(log_preamble(3), "PROC-00003 ");
    }
}
