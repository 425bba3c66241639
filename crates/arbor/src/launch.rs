//! # Launcher
//!
//! ```text
//!  RunConfig ──validate──▶ backend ──┬── ranks == 1 ──▶ lifecycle on this thread
//!      │                             └── ranks  > 1 ──▶ LocalGroup, one thread per rank
//!      └── invalid ──▶ usage, exit 0
//! ```
//!
//! The exit status is the first non-zero rank status, or zero.

use std::sync::Arc;
use std::thread;

use arbor_core::{DeviceBackend, DeviceResult, EmulatedDevice, LocalGroup, ProcessGroup};
#[cfg(not(feature = "wgpu"))]
use arbor_core::{DeviceError, DeviceErrorCode};

use crate::config::{BackendKind, DeviceConfig, RunConfig, USAGE};
use crate::error::{FaultKind, RunError};
use crate::lifecycle::{GroupSource, SimulationLifecycle};
use crate::solver::{DirectSolver, GravitySolver};

/// Opens the configured device backend.
pub fn open_backend(device: &DeviceConfig) -> DeviceResult<Arc<dyn DeviceBackend>> {
    match device.backend {
        BackendKind::Emulated => {
            let emulated = match device.capacity_bytes {
                Some(capacity) => EmulatedDevice::with_capacity(device.device_count, capacity),
                None => EmulatedDevice::new(device.device_count),
            };
            Ok(Arc::new(emulated))
        }
        #[cfg(feature = "wgpu")]
        BackendKind::Wgpu => Ok(Arc::new(arbor_core::WgpuDevice::open()?)),
        #[cfg(not(feature = "wgpu"))]
        BackendKind::Wgpu => Err(DeviceError::new(
            DeviceErrorCode::NotSupported,
            "built without the wgpu feature",
        )),
    }
}

/// Runs `config` with the reference solver.
#[must_use]
pub fn launch(config: &RunConfig) -> i32 {
    launch_with(config, &|config: &RunConfig, _rank: usize| -> Box<dyn GravitySolver> {
        Box::new(DirectSolver::new(config.physics.eps, config.physics.dt))
    })
}

/// Runs `config`, asking `solver` for each rank's solver.
#[must_use]
pub fn launch_with<F>(config: &RunConfig, solver: &F) -> i32
where
    F: Fn(&RunConfig, usize) -> Box<dyn GravitySolver> + Sync,
{
    if let Err(err) = config.validate() {
        tracing::error!(%err, "configuration rejected");
        eprintln!("{err}\n\n{USAGE}");
        return FaultKind::Configuration.exit_code();
    }

    let backend = match open_backend(&config.device) {
        Ok(backend) => backend,
        Err(err) => {
            let err = RunError::from(err);
            tracing::error!(%err, "device backend unavailable");
            return err.exit_code();
        }
    };
    tracing::info!(backend = backend.name(), ranks = config.group.ranks, "launching");

    if config.group.ranks == 1 {
        return SimulationLifecycle::new(config.clone(), backend, GroupSource::Solo)
            .with_solver(solver(config, 0))
            .run();
    }

    let groups: Vec<Arc<LocalGroup>> = LocalGroup::create(config.group.ranks)
        .into_iter()
        .map(Arc::new)
        .collect();

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(groups.len());
        for group in &groups {
            let rank = group.rank();
            let member: Arc<dyn ProcessGroup> = group.clone();
            let lifecycle = SimulationLifecycle::new(
                config.clone(),
                Arc::clone(&backend),
                GroupSource::Owned(member),
            )
            .with_solver(solver(config, rank));
            let spawned = thread::Builder::new()
                .name(format!("arbor-rank-{rank}"))
                .spawn_scoped(scope, move || lifecycle.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    let code = FaultKind::FatalResource.exit_code();
                    tracing::error!(rank, %err, "cannot start rank thread");
                    // Ranks already running would wait for this one forever.
                    group.abort(code);
                    break;
                }
            }
        }

        let mut status = 0;
        for (rank, handle) in handles.into_iter().enumerate() {
            let code = handle.join().unwrap_or_else(|_| {
                tracing::error!(rank, "rank thread panicked");
                FaultKind::Computation.exit_code()
            });
            if status == 0 {
                status = code;
            }
        }
        if groups.first().is_some_and(|g| g.is_aborted()) && status == 0 {
            status = FaultKind::FatalResource.exit_code();
        }
        status
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::DeviceErrorCode;

    #[test]
    fn test_emulated_backend_capacity() {
        let mut device = DeviceConfig::default();
        device.device_count = 2;
        device.capacity_bytes = Some(64);
        let backend = open_backend(&device).unwrap();
        assert_eq!(backend.device_count(), 2);
        let err = backend.malloc(128).unwrap_err();
        assert_eq!(err.code, DeviceErrorCode::MemoryAllocation);
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn test_wgpu_needs_feature() {
        let mut device = DeviceConfig::default();
        device.backend = BackendKind::Wgpu;
        match open_backend(&device) {
            Err(err) => assert_eq!(err.code, DeviceErrorCode::NotSupported),
            Ok(backend) => panic!("opened {} without the feature", backend.name()),
        }
    }

    #[test]
    fn test_invalid_config_exits_zero() {
        let config = RunConfig::default();
        assert_eq!(launch(&config), 0);
    }
}
