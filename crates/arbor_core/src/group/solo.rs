//! The single-process group.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::Mutex;

use super::{check_rank, GroupError, GroupResult, ProcessGroup, Tag};

/// Group of exactly one process.
///
/// Messages to self are queued and returned in order.
#[derive(Debug)]
pub struct SoloGroup {
    inbox: Mutex<HashMap<Tag, VecDeque<Vec<u8>>>>,
    code: AtomicI32,
    finalized: AtomicBool,
}

const NOT_ABORTED: i32 = i32::MIN;

impl SoloGroup {
    /// Creates the group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inbox: Mutex::new(HashMap::new()),
            code: AtomicI32::new(NOT_ABORTED),
            finalized: AtomicBool::new(false),
        }
    }

    fn live(&self) -> GroupResult<()> {
        match self.code.load(Ordering::Acquire) {
            NOT_ABORTED => {}
            code => return Err(GroupError::Aborted { code }),
        }
        if self.finalized.load(Ordering::Acquire) {
            return Err(GroupError::Finalized);
        }
        Ok(())
    }
}

impl Default for SoloGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for SoloGroup {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_u64(&self, value: u64) -> GroupResult<Vec<u64>> {
        self.live()?;
        Ok(vec![value])
    }

    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> GroupResult<()> {
        self.live()?;
        check_rank(dest, 1)?;
        self.inbox.lock().entry(tag).or_default().push_back(payload);
        Ok(())
    }

    fn recv(&self, source: usize, tag: Tag) -> GroupResult<Vec<u8>> {
        self.live()?;
        check_rank(source, 1)?;
        // Nobody else can ever send, so an empty queue would wait forever.
        self.inbox
            .lock()
            .get_mut(&tag)
            .and_then(VecDeque::pop_front)
            .ok_or(GroupError::Closed { peer: 0 })
    }

    fn abort(&self, code: i32) {
        let code = code.max(NOT_ABORTED + 1);
        if self
            .code
            .compare_exchange(NOT_ABORTED, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::error!(code, "group aborted");
        }
    }

    fn is_aborted(&self) -> bool {
        self.code.load(Ordering::Acquire) != NOT_ABORTED
    }

    fn finalize(&self) -> GroupResult<()> {
        self.live()?;
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collectives_are_identity() {
        let group = SoloGroup::new();
        assert_eq!(group.all_reduce_sum_u64(5).unwrap(), 5);
        assert_eq!(group.reduce_sum_f64(0, 1.5).unwrap(), Some(1.5));
        assert!((group.broadcast_f64(0, 2.5).unwrap() - 2.5).abs() < f64::EPSILON);
        assert!(group.broadcast_f64(1, 2.5).is_err());
    }

    #[test]
    fn test_self_messages_in_order() {
        let group = SoloGroup::new();
        group.send(0, Tag::SNAPSHOT_SECTION, vec![1]).unwrap();
        group.send(0, Tag::SNAPSHOT_SECTION, vec![2]).unwrap();
        assert_eq!(group.recv(0, Tag::SNAPSHOT_SECTION).unwrap(), vec![1]);
        assert_eq!(group.recv(0, Tag::SNAPSHOT_SECTION).unwrap(), vec![2]);
        assert!(group.recv(0, Tag::SNAPSHOT_SECTION).is_err());
        assert!(group.send(1, Tag::SNAPSHOT_SECTION, vec![]).is_err());
    }

    #[test]
    fn test_abort_and_finalize() {
        let group = SoloGroup::new();
        group.finalize().unwrap();
        assert_eq!(group.barrier().unwrap_err(), GroupError::Finalized);

        let group = SoloGroup::new();
        group.abort(3);
        assert!(group.is_aborted());
        assert_eq!(group.barrier().unwrap_err(), GroupError::Aborted { code: 3 });
    }
}
