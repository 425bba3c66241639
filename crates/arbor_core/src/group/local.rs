//! Several ranks as threads of one process.
//!
//! Collectives meet at a generation-counted rendezvous. Point-to-point
//! messages go through one unbounded channel per (source, dest, tag).
//! Every wait wakes periodically to notice an abort.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use super::{check_rank, GroupError, GroupResult, ProcessGroup, Tag};

/// How often blocked ranks look for an abort.
const ABORT_POLL: Duration = Duration::from_millis(10);

const NOT_ABORTED: i32 = i32::MIN;

type Mailbox = (Sender<Vec<u8>>, Receiver<Vec<u8>>);

struct Rendezvous {
    generation: u64,
    arrived: usize,
    values: Vec<u64>,
    published: Vec<u64>,
}

struct Shared {
    size: usize,
    rendezvous: Mutex<Rendezvous>,
    completed: Condvar,
    mailboxes: Mutex<HashMap<(usize, usize, Tag), Mailbox>>,
    /// Abort code, or `NOT_ABORTED`.
    code: AtomicI32,
    finalized: Vec<AtomicBool>,
}

impl Shared {
    fn mailbox(&self, source: usize, dest: usize, tag: Tag) -> Mailbox {
        self.mailboxes
            .lock()
            .entry((source, dest, tag))
            .or_insert_with(unbounded)
            .clone()
    }

    fn aborted(&self) -> GroupResult<()> {
        match self.code.load(Ordering::Acquire) {
            NOT_ABORTED => Ok(()),
            code => Err(GroupError::Aborted { code }),
        }
    }
}

/// One rank of an in-process group.
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates a group of `size` ranks. Element `i` is rank `i`.
    ///
    /// A size of zero is treated as one.
    #[must_use]
    pub fn create(size: usize) -> Vec<Self> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            size,
            rendezvous: Mutex::new(Rendezvous {
                generation: 0,
                arrived: 0,
                values: vec![0; size],
                published: Vec::new(),
            }),
            completed: Condvar::new(),
            mailboxes: Mutex::new(HashMap::new()),
            code: AtomicI32::new(NOT_ABORTED),
            finalized: (0..size).map(|_| AtomicBool::new(false)).collect(),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn live(&self) -> GroupResult<()> {
        self.shared.aborted()?;
        if self.shared.finalized[self.rank].load(Ordering::Acquire) {
            return Err(GroupError::Finalized);
        }
        Ok(())
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_gather_u64(&self, value: u64) -> GroupResult<Vec<u64>> {
        self.live()?;
        let shared = &self.shared;
        let mut state = shared.rendezvous.lock();
        let generation = state.generation;
        state.values[self.rank] = value;
        state.arrived += 1;

        if state.arrived == shared.size {
            let values = std::mem::replace(&mut state.values, vec![0; shared.size]);
            state.published = values;
            state.arrived = 0;
            state.generation += 1;
            shared.completed.notify_all();
            return Ok(state.published.clone());
        }

        loop {
            if let Err(err) = shared.aborted() {
                return Err(err);
            }
            shared.completed.wait_for(&mut state, ABORT_POLL);
            // The next round cannot complete without us, so `published`
            // still holds this round's values.
            if state.generation != generation {
                return Ok(state.published.clone());
            }
        }
    }

    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> GroupResult<()> {
        self.live()?;
        check_rank(dest, self.shared.size)?;
        let (sender, _) = self.shared.mailbox(self.rank, dest, tag);
        sender
            .send(payload)
            .map_err(|_| GroupError::Closed { peer: dest })
    }

    fn recv(&self, source: usize, tag: Tag) -> GroupResult<Vec<u8>> {
        self.live()?;
        check_rank(source, self.shared.size)?;
        let (_, receiver) = self.shared.mailbox(source, self.rank, tag);
        loop {
            match receiver.recv_timeout(ABORT_POLL) {
                Ok(payload) => return Ok(payload),
                Err(RecvTimeoutError::Timeout) => self.shared.aborted()?,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(GroupError::Closed { peer: source })
                }
            }
        }
    }

    fn abort(&self, code: i32) {
        let code = code.max(NOT_ABORTED + 1);
        if self
            .shared
            .code
            .compare_exchange(NOT_ABORTED, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::error!(rank = self.rank, code, "group aborted");
        }
        self.shared.completed.notify_all();
    }

    fn is_aborted(&self) -> bool {
        self.shared.code.load(Ordering::Acquire) != NOT_ABORTED
    }

    fn finalize(&self) -> GroupResult<()> {
        self.barrier()?;
        self.shared.finalized[self.rank].store(true, Ordering::Release);
        Ok(())
    }
}

impl fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run<R: Send + 'static>(
        size: usize,
        f: impl Fn(LocalGroup) -> R + Send + Sync + Clone + 'static,
    ) -> Vec<R> {
        let handles: Vec<_> = LocalGroup::create(size)
            .into_iter()
            .map(|group| {
                let f = f.clone();
                thread::spawn(move || f(group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_all_gather_orders_by_rank() {
        let results = run(4, |group| group.all_gather_u64(group.rank() as u64 * 10).unwrap());
        for gathered in results {
            assert_eq!(gathered, vec![0, 10, 20, 30]);
        }
    }

    #[test]
    fn test_repeated_collectives_stay_in_step() {
        let results = run(3, |group| {
            (0..50)
                .map(|round| group.all_reduce_sum_u64(round + group.rank() as u64).unwrap())
                .collect::<Vec<_>>()
        });
        let expected: Vec<u64> = (0..50).map(|round| 3 * round + 3).collect();
        for sums in results {
            assert_eq!(sums, expected);
        }
    }

    #[test]
    fn test_reduce_only_root_gets_value() {
        let results = run(3, |group| group.reduce_sum_f64(0, 0.5).unwrap());
        assert_eq!(results[0], Some(1.5));
        assert_eq!(results[1], None);
        assert_eq!(results[2], None);
    }

    #[test]
    fn test_broadcast_from_root() {
        let results = run(3, |group| {
            let mine = if group.rank() == 0 { 2.5 } else { -1.0 };
            group.broadcast_f64(0, mine).unwrap()
        });
        assert!(results.iter().all(|v| (*v - 2.5).abs() < f64::EPSILON));
    }

    #[test]
    fn test_point_to_point() {
        let results = run(2, |group| {
            if group.rank() == 1 {
                group.send(0, Tag::SNAPSHOT_SECTION, vec![1, 2, 3]).unwrap();
                Vec::new()
            } else {
                group.recv(1, Tag::SNAPSHOT_SECTION).unwrap()
            }
        });
        assert_eq!(results[0], vec![1, 2, 3]);
    }

    #[test]
    fn test_abort_wakes_blocked_ranks() {
        let results = run(3, |group| {
            if group.rank() == 2 {
                thread::sleep(Duration::from_millis(30));
                group.abort(9);
                Err(GroupError::Aborted { code: 9 })
            } else {
                group.barrier()
            }
        });
        for result in results {
            assert_eq!(result, Err(GroupError::Aborted { code: 9 }));
        }
    }

    #[test]
    fn test_abort_wakes_receiver() {
        let results = run(2, |group| {
            if group.rank() == 0 {
                group.recv(1, Tag::INITIAL_CONDITIONS).map(|_| ())
            } else {
                thread::sleep(Duration::from_millis(20));
                group.abort(4);
                Ok(())
            }
        });
        assert_eq!(results[0], Err(GroupError::Aborted { code: 4 }));
    }

    #[test]
    fn test_invalid_rank() {
        let group = LocalGroup::create(2).remove(0);
        assert_eq!(
            group.send(5, Tag::SNAPSHOT_SECTION, vec![]).unwrap_err(),
            GroupError::InvalidRank { rank: 5, size: 2 }
        );
    }
}
