//! Single-slot handoff channel.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use thiserror::Error;

#[derive(Debug)]
struct Shared {
    writing_finished: AtomicBool,
    handoffs: AtomicU64,
    completions: AtomicU64,
}

/// Why a value could not be staged. The value is handed back.
#[derive(Debug)]
pub enum StageError<T> {
    /// The writer still holds the previous value.
    Busy(T),
    /// The consumer is gone.
    Closed(T),
}

impl<T> fmt::Display for StageError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy(_) => f.write_str("handoff slot is busy"),
            Self::Closed(_) => f.write_str("handoff slot is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for StageError<T> {}

impl<T> StageError<T> {
    /// Recovers the value that was not staged.
    pub fn into_inner(self) -> T {
        match self {
            Self::Busy(value) | Self::Closed(value) => value,
        }
    }
}

/// Why nothing was taken.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeError {
    /// Nothing arrived in time.
    #[error("no value staged")]
    Timeout,
    /// The producer is gone and the slot is empty.
    #[error("handoff slot is closed")]
    Closed,
}

/// Handoff counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandoffStats {
    /// Values staged.
    pub handoffs: u64,
    /// Values the consumer finished with.
    pub completions: u64,
}

/// Physics-side end of the slot.
#[derive(Debug)]
pub struct SlotProducer<T> {
    data: Sender<T>,
    busy: Sender<()>,
    shared: Arc<Shared>,
}

/// Writer-side end of the slot.
#[derive(Debug)]
pub struct SlotConsumer<T> {
    data: Receiver<T>,
    busy: Receiver<()>,
    shared: Arc<Shared>,
}

/// Creates a connected producer/consumer pair with an empty slot.
#[must_use]
pub fn handoff_slot<T>() -> (SlotProducer<T>, SlotConsumer<T>) {
    let (data_tx, data_rx) = bounded(1);
    // Holds one token while a value is outstanding.
    let (busy_tx, busy_rx) = bounded(1);
    let shared = Arc::new(Shared {
        writing_finished: AtomicBool::new(true),
        handoffs: AtomicU64::new(0),
        completions: AtomicU64::new(0),
    });
    (
        SlotProducer {
            data: data_tx,
            busy: busy_tx,
            shared: Arc::clone(&shared),
        },
        SlotConsumer {
            data: data_rx,
            busy: busy_rx,
            shared,
        },
    )
}

fn stats(shared: &Shared) -> HandoffStats {
    HandoffStats {
        handoffs: shared.handoffs.load(Ordering::Relaxed),
        completions: shared.completions.load(Ordering::Relaxed),
    }
}

impl<T> SlotProducer<T> {
    /// Stages `value`, blocking while the writer still holds the previous one.
    pub fn stage(&self, value: T) -> Result<(), StageError<T>> {
        if self.busy.send(()).is_err() {
            return Err(StageError::Closed(value));
        }
        self.publish(value)
    }

    /// Stages `value` only if the slot is free right now.
    pub fn try_stage(&self, value: T) -> Result<(), StageError<T>> {
        match self.busy.try_send(()) {
            Ok(()) => self.publish(value),
            Err(TrySendError::Full(())) => Err(StageError::Busy(value)),
            Err(TrySendError::Disconnected(())) => Err(StageError::Closed(value)),
        }
    }

    /// Stages `value`, waiting at most `timeout` for the slot.
    pub fn stage_timeout(&self, value: T, timeout: Duration) -> Result<(), StageError<T>> {
        match self.busy.send_timeout((), timeout) {
            Ok(()) => self.publish(value),
            Err(SendTimeoutError::Timeout(())) => Err(StageError::Busy(value)),
            Err(SendTimeoutError::Disconnected(())) => Err(StageError::Closed(value)),
        }
    }

    fn publish(&self, value: T) -> Result<(), StageError<T>> {
        self.shared.writing_finished.store(false, Ordering::Release);
        match self.data.send(value) {
            Ok(()) => {
                self.shared.handoffs.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.shared.writing_finished.store(true, Ordering::Release);
                Err(StageError::Closed(err.into_inner()))
            }
        }
    }

    /// True when nothing is outstanding.
    #[inline]
    #[must_use]
    pub fn is_writing_finished(&self) -> bool {
        self.shared.writing_finished.load(Ordering::Acquire)
    }

    /// Handoff counters.
    #[must_use]
    pub fn stats(&self) -> HandoffStats {
        stats(&self.shared)
    }
}

impl<T> SlotConsumer<T> {
    /// Waits for a staged value.
    pub fn take(&self) -> Result<Staged<'_, T>, TakeError> {
        match self.data.recv() {
            Ok(value) => Ok(Staged {
                value,
                consumer: self,
            }),
            Err(_) => Err(TakeError::Closed),
        }
    }

    /// Waits at most `timeout` for a staged value.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Staged<'_, T>, TakeError> {
        match self.data.recv_timeout(timeout) {
            Ok(value) => Ok(Staged {
                value,
                consumer: self,
            }),
            Err(RecvTimeoutError::Timeout) => Err(TakeError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TakeError::Closed),
        }
    }

    /// True when nothing is outstanding.
    #[inline]
    #[must_use]
    pub fn is_writing_finished(&self) -> bool {
        self.shared.writing_finished.load(Ordering::Acquire)
    }

    /// Handoff counters.
    #[must_use]
    pub fn stats(&self) -> HandoffStats {
        stats(&self.shared)
    }

    fn complete(&self) {
        self.shared.completions.fetch_add(1, Ordering::Relaxed);
        self.shared.writing_finished.store(true, Ordering::Release);
        let _ = self.busy.try_recv();
    }
}

/// A value the consumer is working on.
///
/// The slot stays busy until this is dropped.
#[derive(Debug)]
pub struct Staged<'a, T> {
    value: T,
    consumer: &'a SlotConsumer<T>,
}

impl<T> Deref for Staged<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Staged<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Staged<'_, T> {
    fn drop(&mut self) {
        self.consumer.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_starts_free() {
        let (producer, consumer) = handoff_slot::<u32>();
        assert!(producer.is_writing_finished());
        assert!(consumer.is_writing_finished());
    }

    #[test]
    fn test_stage_marks_busy_until_drop() {
        let (producer, consumer) = handoff_slot::<u32>();
        producer.stage(7).unwrap();
        assert!(!producer.is_writing_finished());

        let staged = consumer.take().unwrap();
        assert_eq!(*staged, 7);
        assert!(!producer.is_writing_finished());
        assert!(matches!(producer.try_stage(8), Err(StageError::Busy(8))));

        drop(staged);
        assert!(producer.is_writing_finished());
        producer.try_stage(8).unwrap();
        assert_eq!(producer.stats().handoffs, 2);
        assert_eq!(consumer.stats().completions, 1);
    }

    #[test]
    fn test_stage_blocks_while_writer_busy() {
        let (producer, consumer) = handoff_slot::<u32>();
        producer.stage(1).unwrap();

        let writer = thread::spawn(move || {
            let first = consumer.take().unwrap();
            thread::sleep(Duration::from_millis(50));
            let value = *first;
            drop(first);
            let second = consumer.take().unwrap();
            (value, *second)
        });

        let start = Instant::now();
        producer.stage(2).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(writer.join().unwrap(), (1, 2));
    }

    #[test]
    fn test_stage_timeout_returns_value() {
        let (producer, _consumer) = handoff_slot::<String>();
        producer.stage("a".into()).unwrap();
        let err = producer
            .stage_timeout("b".into(), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.into_inner(), "b");
    }

    #[test]
    fn test_closed_when_consumer_dropped() {
        let (producer, consumer) = handoff_slot::<u32>();
        drop(consumer);
        assert!(matches!(producer.stage(1), Err(StageError::Closed(1))));
    }

    #[test]
    fn test_take_timeout_and_close() {
        let (producer, consumer) = handoff_slot::<u32>();
        assert_eq!(
            consumer.take_timeout(Duration::from_millis(5)).unwrap_err(),
            TakeError::Timeout
        );
        drop(producer);
        assert_eq!(consumer.take().unwrap_err(), TakeError::Closed);
    }
}
