//! # Process Groups
//!
//! A run is a group of cooperating processes, each holding a slice of the
//! particles. [`ProcessGroup`] is the small set of collectives the runtime
//! needs: rank/size, an all-gather from which the reductions and the barrier
//! are derived, tagged point-to-point bytes, and a group-wide abort.
//!
//! ```text
//!  rank 0        rank 1        rank 2
//!    │ all_gather(x0) │ (x1)       │ (x2)
//!    └───────────────┬┴────────────┘
//!                    ▼
//!              [x0, x1, x2] on every rank
//! ```
//!
//! [`SoloGroup`] is the one-process group. [`LocalGroup`] runs several ranks
//! as threads of one process.

mod local;
mod solo;

pub use local::LocalGroup;
pub use solo::SoloGroup;

use thiserror::Error;

/// Errors from group operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// Some rank aborted the group.
    #[error("group aborted with code {code}")]
    Aborted {
        /// Abort code passed by the aborting rank.
        code: i32,
    },
    /// A rank outside `0..size` was named.
    #[error("rank {rank} is outside a group of {size}")]
    InvalidRank {
        /// Requested rank.
        rank: usize,
        /// Group size.
        size: usize,
    },
    /// The peer is gone.
    #[error("channel to rank {peer} closed")]
    Closed {
        /// The peer rank.
        peer: usize,
    },
    /// Used after `finalize`.
    #[error("group already finalized")]
    Finalized,
}

/// Result type for group operations.
pub type GroupResult<T> = Result<T, GroupError>;

/// Message tag for point-to-point traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag(pub u16);

impl Tag {
    /// Initial-condition chunks scattered from the reader.
    pub const INITIAL_CONDITIONS: Self = Self(1);
    /// Snapshot sections gathered by the combined-file writer.
    pub const SNAPSHOT_SECTION: Self = Self(2);
}

/// Collectives over a group of processes.
///
/// Every rank must call collective operations in the same order.
pub trait ProcessGroup: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of processes.
    fn size(&self) -> usize;

    /// Gathers one value from every rank, indexed by rank.
    fn all_gather_u64(&self, value: u64) -> GroupResult<Vec<u64>>;

    /// Sends bytes to `dest`. Never blocks on the receiver.
    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> GroupResult<()>;

    /// Receives the next message from `source` with `tag`.
    fn recv(&self, source: usize, tag: Tag) -> GroupResult<Vec<u8>>;

    /// Marks the whole group aborted with `code`. Blocked ranks wake with
    /// [`GroupError::Aborted`]. Ending the process is left to the caller.
    fn abort(&self, code: i32);

    /// Whether any rank aborted.
    fn is_aborted(&self) -> bool;

    /// Leaves the group after a final barrier.
    fn finalize(&self) -> GroupResult<()>;

    /// Waits for every rank.
    fn barrier(&self) -> GroupResult<()> {
        self.all_gather_u64(0).map(|_| ())
    }

    /// Returns `root`'s value on every rank.
    fn broadcast_f64(&self, root: usize, value: f64) -> GroupResult<f64> {
        let size = self.size();
        let all = self.all_gather_u64(value.to_bits())?;
        all.get(root)
            .map(|bits| f64::from_bits(*bits))
            .ok_or(GroupError::InvalidRank { rank: root, size })
    }

    /// Sums across ranks. Only `root` gets `Some`.
    fn reduce_sum_f64(&self, root: usize, value: f64) -> GroupResult<Option<f64>> {
        let total = self.all_reduce_sum_f64(value)?;
        Ok((self.rank() == root).then_some(total))
    }

    /// Sums across ranks, result on every rank.
    fn all_reduce_sum_f64(&self, value: f64) -> GroupResult<f64> {
        let all = self.all_gather_u64(value.to_bits())?;
        // Fixed rank order keeps the sum identical everywhere.
        Ok(all.into_iter().map(f64::from_bits).sum())
    }

    /// Sums across ranks, result on every rank.
    fn all_reduce_sum_u64(&self, value: u64) -> GroupResult<u64> {
        let all = self.all_gather_u64(value)?;
        Ok(all.into_iter().sum())
    }
}

fn check_rank(rank: usize, size: usize) -> GroupResult<()> {
    if rank < size {
        Ok(())
    } else {
        Err(GroupError::InvalidRank { rank, size })
    }
}
