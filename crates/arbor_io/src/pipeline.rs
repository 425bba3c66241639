//! # Asynchronous Snapshot Pipeline
//!
//! Moves finished datasets off the physics thread.
//!
//! ```text
//!   physics thread                         writer thread
//!   ──────────────                         ─────────────
//!   submit(snapshot) ──▶ [ handoff slot ] ──▶ assemble (collective, once)
//!     blocks only while                        persist  (retried)
//!     the slot is busy                         stats / failure record
//!                                                   │
//!   finish() ── "simulation finished" ──────────────┘ drains, then exits
//! ```
//!
//! A write that still fails after the configured retries is recorded and
//! the writer stops. The next `submit`, `try_submit` or `finish` returns it
//! as [`IoError::WriterFailed`]. Datasets are never dropped silently.
//!
//! In [`OutputMode::Inline`] the same assemble/persist sequence runs on the
//! calling thread instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arbor_core::{handoff_slot, SlotConsumer, SlotProducer, StageError, TakeError};
use arbor_shared::{DEFAULT_WRITER_POLL_US, DEFAULT_WRITE_BACKOFF_MS, DEFAULT_WRITE_RETRIES};
use parking_lot::Mutex;

use crate::error::{IoError, IoResult};
use crate::sink::SnapshotSink;
use crate::snapshot::SnapshotData;

/// Where writes happen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Dedicated writer thread behind the handoff slot.
    #[default]
    Background,
    /// On the submitting thread.
    Inline,
}

/// What to do when persisting a file fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Attempts after the first failure.
    pub max_retries: u32,
    /// Pause before each retry.
    pub backoff: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_WRITE_RETRIES,
            backoff: Duration::from_millis(DEFAULT_WRITE_BACKOFF_MS),
        }
    }
}

/// Pipeline configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Background writer or inline writes.
    pub mode: OutputMode,
    /// Longest the idle writer sleeps before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Retry policy for persisting files.
    pub failure: FailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::Background,
            poll_interval: Duration::from_micros(DEFAULT_WRITER_POLL_US),
            failure: FailurePolicy::default(),
        }
    }
}

/// Pipeline counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Datasets fully written.
    pub datasets: u64,
    /// Files persisted by this rank.
    pub files: u64,
    /// Bytes persisted by this rank.
    pub bytes: u64,
    /// Persist attempts that were retried.
    pub retries: u64,
    /// Time the producer spent waiting for the slot (nanoseconds).
    pub producer_wait_ns: u64,
    /// Longest single dataset write (nanoseconds).
    pub max_write_ns: u64,
}

/// Outcome of [`AsyncSnapshotPipeline::try_submit`].
#[derive(Debug)]
pub enum TrySubmit {
    /// The dataset was handed over (or written, inline).
    Accepted,
    /// The writer is still busy. The dataset is returned untouched.
    Busy(SnapshotData),
}

#[derive(Clone, Debug)]
struct WriterFailure {
    attempts: u32,
    reason: String,
}

impl WriterFailure {
    fn to_error(&self) -> IoError {
        IoError::WriterFailed {
            attempts: self.attempts,
            reason: self.reason.clone(),
        }
    }
}

type SharedStats = Arc<Mutex<PipelineStats>>;
type SharedFailure = Arc<Mutex<Option<WriterFailure>>>;

enum Engine {
    Background {
        producer: Option<SlotProducer<SnapshotData>>,
        writer: Option<JoinHandle<()>>,
        finished: Arc<AtomicBool>,
    },
    Inline {
        sink: Box<dyn SnapshotSink>,
        policy: FailurePolicy,
    },
}

/// Single-slot snapshot pipeline.
pub struct AsyncSnapshotPipeline {
    engine: Engine,
    stats: SharedStats,
    failure: SharedFailure,
}

impl AsyncSnapshotPipeline {
    /// Starts the pipeline. In background mode this spawns the writer.
    pub fn spawn(sink: Box<dyn SnapshotSink>, config: PipelineConfig) -> IoResult<Self> {
        let stats = SharedStats::default();
        let failure = SharedFailure::default();

        let engine = match config.mode {
            OutputMode::Inline => Engine::Inline {
                sink,
                policy: config.failure,
            },
            OutputMode::Background => {
                let (producer, consumer) = handoff_slot();
                let finished = Arc::new(AtomicBool::new(false));

                let writer_finished = Arc::clone(&finished);
                let writer_stats = Arc::clone(&stats);
                let writer_failure = Arc::clone(&failure);
                let writer = thread::Builder::new()
                    .name("arbor-writer".to_string())
                    .spawn(move || {
                        writer_loop(
                            &consumer,
                            sink,
                            &writer_finished,
                            &writer_stats,
                            &writer_failure,
                            config,
                        );
                    })
                    .map_err(|e| IoError::file("spawn writer", "arbor-writer", e))?;

                Engine::Background {
                    producer: Some(producer),
                    writer: Some(writer),
                    finished,
                }
            }
        };

        tracing::info!(mode = ?config.mode, "snapshot pipeline started");
        Ok(Self {
            engine,
            stats,
            failure,
        })
    }

    fn check_failure(&self) -> IoResult<()> {
        match &*self.failure.lock() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> IoError {
        self.failure
            .lock()
            .as_ref()
            .map_or(IoError::WriterClosed, WriterFailure::to_error)
    }

    /// Hands `snapshot` to the writer, blocking while the slot is busy.
    pub fn submit(&mut self, snapshot: SnapshotData) -> IoResult<()> {
        self.check_failure()?;
        let start = Instant::now();
        let staged = match &mut self.engine {
            Engine::Inline { sink, policy } => {
                let outcome = write_dataset(sink.as_mut(), &snapshot, policy, &self.stats);
                return outcome.map_err(|failure| {
                    let err = failure.to_error();
                    *self.failure.lock() = Some(failure);
                    err
                });
            }
            Engine::Background { producer, .. } => match producer {
                Some(producer) => producer.stage(snapshot),
                None => return Err(IoError::WriterClosed),
            },
        };
        match staged {
            Ok(()) => {
                self.stats.lock().producer_wait_ns += start.elapsed().as_nanos() as u64;
                // The slot also frees when the writer gives up.
                self.check_failure()
            }
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Hands `snapshot` over only if the writer is idle.
    pub fn try_submit(&mut self, snapshot: SnapshotData) -> IoResult<TrySubmit> {
        self.check_failure()?;
        let staged = match &mut self.engine {
            Engine::Inline { .. } => {
                return self.submit(snapshot).map(|()| TrySubmit::Accepted);
            }
            Engine::Background { producer, .. } => match producer {
                Some(producer) => producer.try_stage(snapshot),
                None => return Err(IoError::WriterClosed),
            },
        };
        match staged {
            Ok(()) => self.check_failure().map(|()| TrySubmit::Accepted),
            Err(StageError::Busy(snapshot)) => Ok(TrySubmit::Busy(snapshot)),
            Err(StageError::Closed(_)) => Err(self.closed_error()),
        }
    }

    /// True when no dataset is outstanding.
    #[must_use]
    pub fn is_writing_finished(&self) -> bool {
        match &self.engine {
            Engine::Inline { .. } => true,
            Engine::Background { producer, .. } => producer
                .as_ref()
                .map_or(true, SlotProducer::is_writing_finished),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }

    /// Signals the end of the simulation, waits for the writer to drain and
    /// returns the final counters or the recorded failure.
    pub fn finish(mut self) -> IoResult<PipelineStats> {
        self.stop();
        self.check_failure()?;
        let stats = self.stats();
        tracing::info!(
            datasets = stats.datasets,
            files = stats.files,
            bytes = stats.bytes,
            retries = stats.retries,
            "snapshot pipeline finished"
        );
        Ok(stats)
    }

    fn stop(&mut self) {
        if let Engine::Background {
            producer,
            writer,
            finished,
        } = &mut self.engine
        {
            finished.store(true, Ordering::Release);
            drop(producer.take());
            if let Some(handle) = writer.take() {
                if handle.join().is_err() {
                    let mut failure = self.failure.lock();
                    failure.get_or_insert(WriterFailure {
                        attempts: 0,
                        reason: "writer thread panicked".to_string(),
                    });
                }
            }
        }
    }
}

impl Drop for AsyncSnapshotPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AsyncSnapshotPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.engine {
            Engine::Background { .. } => OutputMode::Background,
            Engine::Inline { .. } => OutputMode::Inline,
        };
        f.debug_struct("AsyncSnapshotPipeline")
            .field("mode", &mode)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Writer thread main loop.
fn writer_loop(
    consumer: &SlotConsumer<SnapshotData>,
    mut sink: Box<dyn SnapshotSink>,
    finished: &AtomicBool,
    stats: &Mutex<PipelineStats>,
    failure: &Mutex<Option<WriterFailure>>,
    config: PipelineConfig,
) {
    loop {
        match consumer.take_timeout(config.poll_interval) {
            Ok(staged) => {
                if let Err(fault) = write_dataset(sink.as_mut(), &staged, &config.failure, stats) {
                    tracing::error!(
                        attempts = fault.attempts,
                        reason = %fault.reason,
                        t = staged.t_current(),
                        "snapshot writer giving up"
                    );
                    // Recorded before the slot frees so the producer sees it.
                    *failure.lock() = Some(fault);
                    drop(staged);
                    break;
                }
            }
            Err(TakeError::Timeout) => {
                if finished.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(TakeError::Closed) => break,
        }
    }
}

/// Assembles once, then persists every file with retries.
fn write_dataset(
    sink: &mut dyn SnapshotSink,
    snapshot: &SnapshotData,
    policy: &FailurePolicy,
    stats: &Mutex<PipelineStats>,
) -> Result<(), WriterFailure> {
    let start = Instant::now();
    let files = sink.assemble(snapshot).map_err(|err| WriterFailure {
        attempts: 1,
        reason: err.to_string(),
    })?;

    let mut bytes = 0;
    for file in &files {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match sink.persist(file) {
                Ok(written) => {
                    bytes += written;
                    break;
                }
                Err(err) if attempt <= policy.max_retries => {
                    tracing::warn!(
                        attempt,
                        path = %file.path.display(),
                        %err,
                        "snapshot write failed, retrying"
                    );
                    stats.lock().retries += 1;
                    thread::sleep(policy.backoff);
                }
                Err(err) => {
                    return Err(WriterFailure {
                        attempts: attempt,
                        reason: err.to_string(),
                    })
                }
            }
        }
    }

    let elapsed = start.elapsed().as_nanos() as u64;
    let mut s = stats.lock();
    s.datasets += 1;
    s.files += files.len() as u64;
    s.bytes += bytes;
    s.max_write_ns = s.max_write_ns.max(elapsed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::EncodedFile;
    use arbor_shared::Real4;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    /// Records datasets in memory, optionally failing the first persists.
    struct MemorySink {
        seen: Arc<Mutex<Vec<(f64, usize)>>>,
        failures_left: Arc<AtomicU32>,
        delay: Duration,
    }

    impl SnapshotSink for MemorySink {
        fn assemble(&mut self, snapshot: &SnapshotData) -> IoResult<Vec<EncodedFile>> {
            thread::sleep(self.delay);
            self.seen
                .lock()
                .push((snapshot.t_current(), snapshot.n_bodies()));
            Ok(vec![EncodedFile {
                path: PathBuf::from("mem"),
                bytes: vec![0; snapshot.n_bodies()],
            }])
        }

        fn persist(&mut self, file: &EncodedFile) -> IoResult<u64> {
            let left = self.failures_left.load(Ordering::Acquire);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::Release);
                return Err(IoError::file(
                    "write",
                    &file.path,
                    std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                ));
            }
            Ok(file.bytes.len() as u64)
        }
    }

    fn sink(failures: u32, delay: Duration) -> (Box<MemorySink>, Arc<Mutex<Vec<(f64, usize)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink {
            seen: Arc::clone(&seen),
            failures_left: Arc::new(AtomicU32::new(failures)),
            delay,
        };
        (Box::new(sink), seen)
    }

    fn dataset(t: f64, n: usize) -> SnapshotData {
        SnapshotData::new(t, vec![Real4::ZERO; n], vec![Real4::ZERO; n], vec![0; n]).unwrap()
    }

    fn quick_policy(max_retries: u32) -> PipelineConfig {
        PipelineConfig {
            failure: FailurePolicy {
                max_retries,
                backoff: Duration::from_millis(1),
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_every_submission_written_in_order() {
        let (sink, seen) = sink(0, Duration::ZERO);
        let mut pipeline = AsyncSnapshotPipeline::spawn(sink, quick_policy(0)).unwrap();
        for i in 0..10 {
            pipeline.submit(dataset(f64::from(i), 5)).unwrap();
        }
        let stats = pipeline.finish().unwrap();
        assert_eq!(stats.datasets, 10);
        assert_eq!(stats.bytes, 50);

        let seen = seen.lock();
        let times: Vec<f64> = seen.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, (0..10).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn test_try_submit_reports_busy() {
        let (sink, _seen) = sink(0, Duration::from_millis(100));
        let mut pipeline = AsyncSnapshotPipeline::spawn(sink, quick_policy(0)).unwrap();
        pipeline.submit(dataset(0.0, 1)).unwrap();
        assert!(!pipeline.is_writing_finished());

        match pipeline.try_submit(dataset(1.0, 3)).unwrap() {
            TrySubmit::Busy(returned) => assert_eq!(returned.n_bodies(), 3),
            TrySubmit::Accepted => panic!("slot should be busy"),
        }
        let stats = pipeline.finish().unwrap();
        assert_eq!(stats.datasets, 1);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let (sink, _seen) = sink(2, Duration::ZERO);
        let mut pipeline = AsyncSnapshotPipeline::spawn(sink, quick_policy(3)).unwrap();
        pipeline.submit(dataset(0.0, 4)).unwrap();
        let stats = pipeline.finish().unwrap();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.datasets, 1);
    }

    #[test]
    fn test_exhausted_retries_surface_on_next_submit() {
        let (sink, _seen) = sink(10, Duration::ZERO);
        let mut pipeline = AsyncSnapshotPipeline::spawn(sink, quick_policy(1)).unwrap();
        pipeline.submit(dataset(0.0, 4)).unwrap();

        // Blocks until the writer frees the slot, by which time the failure
        // is recorded.
        let err = pipeline.submit(dataset(1.0, 4)).unwrap_err();
        assert!(matches!(err, IoError::WriterFailed { attempts: 2, .. }));
        assert!(matches!(pipeline.finish(), Err(IoError::WriterFailed { .. })));
    }

    #[test]
    fn test_submit_waiting_on_failing_writer_is_rejected() {
        for round in 0..20 {
            let (sink, seen) = sink(u32::MAX, Duration::from_millis(20));
            let mut pipeline = AsyncSnapshotPipeline::spawn(sink, quick_policy(0)).unwrap();
            pipeline.submit(dataset(0.0, 2)).unwrap();

            // Still blocked on the slot when the writer gives up.
            let waiting = pipeline.submit(dataset(1.0, 2));
            assert!(
                matches!(waiting, Err(IoError::WriterFailed { attempts: 1, .. })),
                "round {round}: {waiting:?}"
            );
            assert_eq!(seen.lock().len(), 1);
            assert!(matches!(pipeline.finish(), Err(IoError::WriterFailed { .. })));
        }
    }

    #[test]
    fn test_inline_mode_writes_on_caller() {
        let (sink, seen) = sink(0, Duration::ZERO);
        let config = PipelineConfig {
            mode: OutputMode::Inline,
            ..quick_policy(0)
        };
        let mut pipeline = AsyncSnapshotPipeline::spawn(sink, config).unwrap();
        pipeline.submit(dataset(0.5, 2)).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert!(pipeline.is_writing_finished());
        assert!(matches!(
            pipeline.try_submit(dataset(1.0, 2)).unwrap(),
            TrySubmit::Accepted
        ));
        assert_eq!(pipeline.finish().unwrap().datasets, 2);
    }

    #[test]
    fn test_inline_failure_is_sticky() {
        let (sink, _seen) = sink(5, Duration::ZERO);
        let config = PipelineConfig {
            mode: OutputMode::Inline,
            ..quick_policy(0)
        };
        let mut pipeline = AsyncSnapshotPipeline::spawn(sink, config).unwrap();
        assert!(pipeline.submit(dataset(0.0, 1)).is_err());
        assert!(pipeline.submit(dataset(1.0, 1)).is_err());
    }
}
