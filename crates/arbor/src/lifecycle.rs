//! # Simulation Lifecycle
//!
//! ```text
//!  Bootstrap ──▶ InitialConditionLoad ──▶ DeviceUpload ──▶ Iterate ──┐
//!      │                  │                     │              │      │
//!      └──────────────────┴──────────┬──────────┴──────────────┴──────┘
//!                                    ▼
//!                                Shutdown
//! ```
//!
//! Each step is a method. [`SimulationLifecycle::run`] drives them in order,
//! turns a failure into an exit status through the [`FaultPolicy`] and
//! always ends in [`Shutdown`](Phase::Shutdown) so device memory and the
//! run log are released on every path.
//!
//! The snapshot writer exists only while `Iterate` runs.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use arbor_core::{DeviceBackend, DeviceContext, DeviceId, MemoryTracker, ProcessGroup, SoloGroup};
use arbor_io::{AsyncSnapshotPipeline, FileSink, PipelineStats};

use crate::config::RunConfig;
use crate::error::{LifecycleError, RunError, RunResult};
use crate::fault::FaultPolicy;
use crate::initial::{self, InitialConditionSource, InitialConditions};
use crate::particles::ParticleStore;
use crate::runlog::RunLog;
use crate::solver::{DirectSolver, GravitySolver};

/// Lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Configuration resolved, group joined.
    Bootstrap,
    /// Particles read or generated on the host.
    InitialConditionLoad,
    /// Particles on the device, totals reduced.
    DeviceUpload,
    /// Solver stepping, writer running.
    Iterate,
    /// Resources released.
    Shutdown,
}

impl Phase {
    /// Whether `next` may follow `self`. Shutdown follows anything but
    /// itself.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Bootstrap | Self::InitialConditionLoad | Self::DeviceUpload | Self::Iterate,
                Self::Shutdown
            ) | (Self::Bootstrap, Self::InitialConditionLoad)
                | (Self::InitialConditionLoad, Self::DeviceUpload)
                | (Self::DeviceUpload, Self::Iterate)
        )
    }
}

/// Where the process group comes from.
pub enum GroupSource {
    /// Create a one-rank group.
    Solo,
    /// Use this group and finalize it at shutdown.
    Owned(Arc<dyn ProcessGroup>),
    /// Use this group; whoever supplied it finalizes it.
    Borrowed(Arc<dyn ProcessGroup>),
}

/// State created by bootstrap.
struct Booted {
    source: InitialConditionSource,
    group: Arc<dyn ProcessGroup>,
    owns_group: bool,
    ctx: DeviceContext,
    runlog: RunLog,
}

/// Totals over the whole group after upload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GroupTotals {
    /// Bodies on every rank.
    pub bodies: u64,
    /// Mass on every rank.
    pub mass: f64,
}

/// One rank's run, from configuration to exit status.
pub struct SimulationLifecycle {
    config: RunConfig,
    backend: Arc<dyn DeviceBackend>,
    group_source: Option<GroupSource>,
    tracker: MemoryTracker,
    solver: Box<dyn GravitySolver>,
    phase: Phase,
    booted: Option<Booted>,
    pregenerated: Option<InitialConditions>,
    initial: Option<InitialConditions>,
    particles: Option<ParticleStore>,
    totals: Option<GroupTotals>,
    pipeline_stats: Option<PipelineStats>,
    iterations: u64,
    started: Instant,
}

fn illegal(from: Phase, to: Phase) -> RunError {
    LifecycleError::IllegalTransition { from, to }.into()
}

fn check_advance(from: Phase, to: Phase) -> RunResult<()> {
    if from.can_advance_to(to) {
        Ok(())
    } else {
        Err(illegal(from, to))
    }
}

/// Fails fast once any rank aborted.
fn check_aborted(group: &dyn ProcessGroup) -> RunResult<()> {
    if group.is_aborted() {
        // An aborted group fails every collective with its code.
        group.barrier()?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

impl SimulationLifecycle {
    /// Lifecycle in [`Phase::Bootstrap`] using the reference solver.
    #[must_use]
    pub fn new(config: RunConfig, backend: Arc<dyn DeviceBackend>, group: GroupSource) -> Self {
        let solver = Box::new(DirectSolver::new(config.physics.eps, config.physics.dt));
        Self {
            config,
            backend,
            group_source: Some(group),
            tracker: MemoryTracker::new(),
            solver,
            phase: Phase::Bootstrap,
            booted: None,
            pregenerated: None,
            initial: None,
            particles: None,
            totals: None,
            pipeline_stats: None,
            iterations: 0,
            started: Instant::now(),
        }
    }

    /// Replaces the solver.
    #[must_use]
    pub fn with_solver(mut self, solver: Box<dyn GravitySolver>) -> Self {
        self.solver = solver;
        self
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The group, once bootstrapped.
    #[must_use]
    pub fn group(&self) -> Option<&Arc<dyn ProcessGroup>> {
        self.booted.as_ref().map(|b| &b.group)
    }

    /// Allocation counters of this rank.
    #[must_use]
    pub fn tracker(&self) -> &MemoryTracker {
        &self.tracker
    }

    /// Local particles, between upload and shutdown.
    #[must_use]
    pub fn particles(&self) -> Option<&ParticleStore> {
        self.particles.as_ref()
    }

    /// Group-wide totals, after upload.
    #[must_use]
    pub fn totals(&self) -> Option<GroupTotals> {
        self.totals
    }

    /// Writer counters, after iterate.
    #[must_use]
    pub fn pipeline_stats(&self) -> Option<&PipelineStats> {
        self.pipeline_stats.as_ref()
    }

    /// Completed solver steps.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Simulated time.
    #[must_use]
    pub fn t_current(&self) -> f64 {
        self.solver.t_current()
    }

    /// Validates the configuration, pre-generates the galaxy when the task
    /// id is known, then joins the group and activates the device.
    ///
    /// A configuration error returns before the group or device is touched.
    pub fn bootstrap(&mut self) -> RunResult<()> {
        if self.booted.is_some() || self.phase != Phase::Bootstrap {
            return Err(illegal(self.phase, Phase::Bootstrap));
        }
        let started = Instant::now();
        let source = self.config.validate()?;
        self.pregenerated = initial::pregenerate(&source, self.config.initial.seed);

        let (group, owns_group): (Arc<dyn ProcessGroup>, bool) = match self.group_source.take() {
            Some(GroupSource::Owned(group)) => (group, true),
            Some(GroupSource::Borrowed(group)) => (group, false),
            Some(GroupSource::Solo) | None => (Arc::new(SoloGroup::new()), true),
        };
        let rank = group.rank();
        let nprocs = group.size();

        let device = &self.config.device;
        let ctx = DeviceContext::new(Arc::clone(&self.backend), DeviceId(device.device))
            .with_render_device(DeviceId(self.config.render_device()))
            .with_tracker(self.tracker.clone());
        ctx.activate()?;

        let mut runlog = RunLog::new(
            &self.config.output.dir,
            &self.config.logging.log_file,
            nprocs,
            rank,
        );
        let physics = &self.config.physics;
        runlog.line(format!(
            "backend: {} device: {} render device: {} processes: {nprocs}",
            self.backend.name(),
            ctx.compute_device(),
            ctx.render_device()
        ));
        runlog.line(format!(
            "eps: {} theta: {} dt: {} tEnd: {} iterEnd: {} rebuild: {}",
            physics.eps, physics.theta, physics.dt, physics.t_end, physics.iter_end, physics.rebuild_rate
        ));
        runlog.phase("Bootstrap", started.elapsed());

        tracing::info!(
            rank,
            nprocs,
            source = source.name(),
            backend = self.backend.name(),
            "bootstrap complete"
        );
        self.booted = Some(Booted {
            source,
            group,
            owns_group,
            ctx,
            runlog,
        });
        Ok(())
    }

    /// Builds this rank's particles from the configured source.
    /// Collective for file sources.
    pub fn load_initial_conditions(&mut self) -> RunResult<()> {
        let to = Phase::InitialConditionLoad;
        check_advance(self.phase, to)?;
        let booted = self.booted.as_mut().ok_or(illegal(self.phase, to))?;
        self.phase = to;

        let started = Instant::now();
        let initial = &self.config.initial;
        let ic = initial::load(
            &booted.source,
            booted.group.as_ref(),
            initial.seed,
            initial.reduce_bodies,
            self.pregenerated.take(),
        )?;
        if !ic.is_consistent() {
            return Err(RunError::InitialConditions(format!(
                "{} produced mismatched arrays",
                booted.source.name()
            )));
        }
        self.solver.set_t_current(ic.t_current);

        booted.runlog.line(format!(
            "initial conditions: {} bodies: {} t: {}",
            booted.source.name(),
            ic.len(),
            ic.t_current
        ));
        booted.runlog.phase("Initial conditions", started.elapsed());
        tracing::info!(rank = booted.group.rank(), n = ic.len(), t = ic.t_current, "initial conditions loaded");
        self.initial = Some(ic);
        Ok(())
    }

    /// Sizes and fills every device array, then reduces count and mass
    /// across the group.
    pub fn upload(&mut self) -> RunResult<()> {
        let to = Phase::DeviceUpload;
        check_advance(self.phase, to)?;
        let booted = self.booted.as_mut().ok_or(illegal(self.phase, to))?;
        let ic = self.initial.take().ok_or(illegal(self.phase, to))?;
        self.phase = to;

        let started = Instant::now();
        let mut particles = ParticleStore::load(&booted.ctx, &ic, self.config.device.interop)?;
        drop(ic);
        let upload = particles.upload();
        let n = particles.len() as u64;
        let local_mass = particles.local_mass();
        // Shutdown frees whatever was allocated, even if the upload failed.
        self.particles = Some(particles);
        upload?;

        let group = booted.group.as_ref();
        let bodies = group.all_reduce_sum_u64(n)?;
        let mass = group.all_reduce_sum_f64(local_mass)?;
        self.totals = Some(GroupTotals { bodies, mass });

        let usage = self.tracker.usage();
        booted.runlog.line(format!("Combined Mass: {mass} nTotal: {bodies}"));
        booted.runlog.line(format!(
            "device memory: {} bytes host memory: {} bytes",
            usage.device_bytes, usage.host_bytes
        ));
        booted.runlog.phase("Device upload", started.elapsed());
        tracing::info!(
            rank = group.rank(),
            local = n,
            total = bodies,
            mass,
            device_bytes = usage.device_bytes,
            "particles on device"
        );
        Ok(())
    }

    /// Steps the solver until the end time or iteration, handing snapshots
    /// to the writer at the configured cadence.
    pub fn iterate(&mut self) -> RunResult<()> {
        let to = Phase::Iterate;
        check_advance(self.phase, to)?;
        let from = self.phase;
        let (Some(booted), Some(particles)) = (self.booted.as_mut(), self.particles.as_mut()) else {
            return Err(illegal(from, to));
        };
        self.phase = to;

        let started = Instant::now();
        let output = &self.config.output;
        let sink = FileSink::new(&output.dir, &output.snapshot_base, Arc::clone(&booted.group))
            .with_combined_max_procs(output.combined_max_procs);
        let mut pipeline = AsyncSnapshotPipeline::spawn(Box::new(sink), output.pipeline())?;

        let stepped = step_loop(
            &self.config,
            booted.group.as_ref(),
            self.solver.as_mut(),
            particles,
            &mut pipeline,
            &mut self.iterations,
        );
        // Drain the writer on every path; the loop's error wins.
        let finished = pipeline.finish();
        stepped?;
        let stats = finished?;

        booted.runlog.line(format!(
            "snapshots: {} datasets {} files {} bytes {} retries, producer waited {:.6} sec",
            stats.datasets,
            stats.files,
            stats.bytes,
            stats.retries,
            stats.producer_wait_ns as f64 * 1e-9
        ));
        booted.runlog.phase("Iterate", started.elapsed());
        tracing::info!(
            rank = booted.group.rank(),
            iterations = self.iterations,
            t = self.solver.t_current(),
            datasets = stats.datasets,
            "iteration finished"
        );
        self.pipeline_stats = Some(stats);
        Ok(())
    }

    /// Flushes the run log, frees the particles and finalizes an owned
    /// group. Reachable from any phase; a second call does nothing.
    ///
    /// `status` is the exit status so far. The group is only finalized on
    /// success; a finalize failure changes the returned status.
    pub fn shutdown(&mut self, status: i32) -> i32 {
        if !self.phase.can_advance_to(Phase::Shutdown) {
            return status;
        }
        self.phase = Phase::Shutdown;
        let mut status = status;

        if let Some(mut particles) = self.particles.take() {
            if let Err(err) = particles.free() {
                tracing::warn!(%err, "releasing particle arrays failed");
            }
        }
        self.initial = None;
        self.pregenerated = None;

        let Some(mut booted) = self.booted.take() else {
            return status;
        };
        let usage = self.tracker.usage();
        booted.runlog.line(format!(
            "peak device memory: {} bytes peak host memory: {} bytes",
            usage.device_peak, usage.host_peak
        ));
        booted
            .runlog
            .phase("Finished total", self.started.elapsed());
        if let Err(err) = booted.runlog.flush() {
            tracing::warn!(path = %booted.runlog.path().display(), %err, "run log not written");
        }

        if booted.owns_group && status == 0 {
            if let Err(err) = booted.group.finalize() {
                let policy = FaultPolicy::new(booted.group.size());
                status = policy.escalate(&err.into(), booted.group.as_ref());
            }
        }
        tracing::info!(rank = booted.group.rank(), status, "shutdown complete");
        status
    }

    fn run_phases(&mut self) -> RunResult<()> {
        self.bootstrap()?;
        self.load_initial_conditions()?;
        self.upload()?;
        self.iterate()
    }

    /// Runs every phase and returns the exit status.
    ///
    /// A failure or panic is logged with the rank and escalated: with more
    /// than one rank the whole group is aborted.
    pub fn run(mut self) -> i32 {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_phases()));
        let result = outcome.unwrap_or_else(|payload| Err(RunError::Panic(panic_message(payload.as_ref()))));
        let status = match &result {
            Ok(()) => 0,
            Err(err) => self.escalate(err),
        };
        self.shutdown(status)
    }

    fn escalate(&self, err: &RunError) -> i32 {
        match &self.booted {
            Some(booted) => FaultPolicy::new(booted.group.size()).escalate(err, booted.group.as_ref()),
            None => {
                let action = FaultPolicy::new(1).decide(err);
                tracing::error!(%err, kind = ?err.kind(), "run failed before the group started");
                action.exit_code()
            }
        }
    }
}

impl std::fmt::Debug for SimulationLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationLifecycle")
            .field("phase", &self.phase)
            .field("backend", &self.backend.name())
            .field("iterations", &self.iterations)
            .field("particles", &self.particles)
            .finish_non_exhaustive()
    }
}

/// Next time-based trigger, or `None` when disabled.
struct Cadence {
    interval: f64,
    next: f64,
}

impl Cadence {
    fn new(interval: f64, t_start: f64) -> Option<Self> {
        (interval > 0.0).then_some(Self {
            interval,
            next: t_start + interval,
        })
    }

    /// True once `t` reaches the next trigger; moves the trigger past `t`.
    fn due(&mut self, t: f64, tolerance: f64) -> bool {
        if t + tolerance < self.next {
            return false;
        }
        while self.next <= t + tolerance {
            self.next += self.interval;
        }
        true
    }
}

fn step_loop(
    config: &RunConfig,
    group: &dyn ProcessGroup,
    solver: &mut dyn GravitySolver,
    particles: &mut ParticleStore,
    pipeline: &mut AsyncSnapshotPipeline,
    iterations: &mut u64,
) -> RunResult<()> {
    let physics = &config.physics;
    let output = &config.output;
    let rank = group.rank();
    let tolerance = physics.dt * 1e-6;

    let t_start = solver.t_current();
    let mut full = Cadence::new(output.snapshot_interval, t_start);
    let mut quick = Cadence::new(output.quick_dump, t_start);

    while solver.t_current() + tolerance < physics.t_end && *iterations < physics.iter_end {
        check_aborted(group)?;
        solver.iterate(particles)?;
        *iterations += 1;
        let t = solver.t_current();
        tracing::trace!(rank, iteration = *iterations, t, "step");

        let by_time = full.as_mut().is_some_and(|c| c.due(t, tolerance));
        let by_count = output.snapshot_every > 0 && *iterations % output.snapshot_every == 0;
        if by_time || by_count {
            tracing::debug!(rank, t, "full snapshot");
            pipeline.submit(particles.snapshot(t)?)?;
        }

        if quick.as_mut().is_some_and(|c| c.due(t, tolerance)) {
            quick_dump(config, group, particles, pipeline, t)?;
        }
    }
    Ok(())
}

/// Without `quick_sync` a dump is skipped when any rank's writer is busy.
/// The decision is collective so every writer sees the same datasets.
fn quick_dump(
    config: &RunConfig,
    group: &dyn ProcessGroup,
    particles: &mut ParticleStore,
    pipeline: &mut AsyncSnapshotPipeline,
    t: f64,
) -> RunResult<()> {
    let output = &config.output;
    if !output.quick_sync {
        let busy = u64::from(!pipeline.is_writing_finished());
        if group.all_reduce_sum_u64(busy)? > 0 {
            tracing::info!(rank = group.rank(), t, "writer busy, quick dump skipped");
            return Ok(());
        }
    }
    let sample = particles.snapshot(t)?.quick_sample(output.quick_ratio);
    tracing::debug!(rank = group.rank(), t, n = sample.n_bodies(), "quick dump");
    pipeline.submit(sample)?;
    Ok(())
}
