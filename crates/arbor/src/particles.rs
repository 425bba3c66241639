//! The local particle set on host and device.
//!
//! One [`DeviceHostArray`] per attribute. Positions may be backed by
//! graphics-interop buffers so a renderer can draw them in place.

use arbor_core::{AllocOptions, DeviceContext, DeviceHostArray, DeviceResult};
use arbor_io::SnapshotData;
use arbor_shared::{BodyId, Real2, Real4};

use crate::error::RunResult;
use crate::initial::InitialConditions;

/// Particle arrays of one rank.
pub struct ParticleStore {
    /// Positions, mass in `w`.
    pub positions: DeviceHostArray<Real4>,
    /// Velocities.
    pub velocities: DeviceHostArray<Real4>,
    /// Predicted positions.
    pub predicted_positions: DeviceHostArray<Real4>,
    /// Predicted velocities.
    pub predicted_velocities: DeviceHostArray<Real4>,
    /// Identifiers.
    pub ids: DeviceHostArray<BodyId>,
    /// Per-body `(t_begin, t_end)`.
    pub times: DeviceHostArray<Real2>,
    class_counts: [u64; 3],
}

impl ParticleStore {
    /// Sizes every array to `ic` and fills the host mirrors. Nothing is
    /// copied to the device yet.
    pub fn load(ctx: &DeviceContext, ic: &InitialConditions, interop: bool) -> DeviceResult<Self> {
        let n = ic.len();
        let mut store = Self {
            positions: DeviceHostArray::new(ctx.clone()),
            velocities: DeviceHostArray::new(ctx.clone()),
            predicted_positions: DeviceHostArray::new(ctx.clone()),
            predicted_velocities: DeviceHostArray::new(ctx.clone()),
            ids: DeviceHostArray::new(ctx.clone()),
            times: DeviceHostArray::new(ctx.clone()),
            class_counts: ic.class_counts,
        };
        store.positions.alloc(n, AllocOptions::PLAIN.interop(interop))?;
        store.velocities.alloc(n, AllocOptions::PLAIN)?;
        store.predicted_positions.alloc(n, AllocOptions::PLAIN)?;
        store.predicted_velocities.alloc(n, AllocOptions::PLAIN)?;
        store.ids.alloc(n, AllocOptions::PLAIN)?;
        store.times.alloc(n, AllocOptions::PLAIN)?;

        let t = ic.t_current as f32;
        store.positions.host_mut().copy_from_slice(&ic.positions);
        store.velocities.host_mut().copy_from_slice(&ic.velocities);
        store.predicted_positions.host_mut().copy_from_slice(&ic.positions);
        store.predicted_velocities.host_mut().copy_from_slice(&ic.velocities);
        store.ids.host_mut().copy_from_slice(&ic.ids);
        store.times.host_mut().fill(Real2::splat(t));
        Ok(store)
    }

    /// Pushes every host mirror to its device buffer.
    pub fn upload(&mut self) -> DeviceResult<()> {
        self.times.upload()?;
        self.positions.upload()?;
        self.velocities.upload()?;
        self.predicted_positions.upload()?;
        self.predicted_velocities.upload()?;
        self.ids.upload()
    }

    /// Number of local bodies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.size()
    }

    /// True when this rank holds no bodies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Particle class counts of the local bodies.
    #[must_use]
    pub fn class_counts(&self) -> [u64; 3] {
        self.class_counts
    }

    /// Mass held in the host mirror.
    #[must_use]
    pub fn local_mass(&self) -> f64 {
        self.positions
            .host()
            .iter()
            .map(|p| f64::from(p.mass()))
            .sum()
    }

    /// Downloads positions, velocities and ids and packages them at `t`.
    pub fn snapshot(&mut self, t: f64) -> RunResult<SnapshotData> {
        self.positions.download()?;
        self.velocities.download()?;
        self.ids.download()?;
        let snapshot = SnapshotData::new(
            t,
            self.positions.host().to_vec(),
            self.velocities.host().to_vec(),
            self.ids.host().to_vec(),
        )?
        .with_class_counts(self.class_counts)?;
        Ok(snapshot)
    }

    /// Releases every array. Idempotent.
    pub fn free(&mut self) -> DeviceResult<()> {
        let results = [
            self.positions.free(),
            self.velocities.free(),
            self.predicted_positions.free(),
            self.predicted_velocities.free(),
            self.ids.free(),
            self.times.free(),
        ];
        results.into_iter().collect()
    }
}

impl std::fmt::Debug for ParticleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleStore")
            .field("len", &self.len())
            .field("interop", &self.positions.is_interop())
            .field("class_counts", &self.class_counts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initial::{CubeModel, InitialConditionGenerator};
    use arbor_core::{DeviceBackend, DeviceId, EmulatedDevice, MemoryTracker};
    use std::sync::Arc;

    fn context(device: &Arc<EmulatedDevice>) -> DeviceContext {
        let backend: Arc<dyn DeviceBackend> = device.clone();
        DeviceContext::new(backend, DeviceId(0)).with_tracker(MemoryTracker::new())
    }

    #[test]
    fn test_upload_then_snapshot_roundtrips() {
        let device = Arc::new(EmulatedDevice::new(1));
        let ic = CubeModel::new(32, 1).generate(0, 1);
        let mut store = ParticleStore::load(&context(&device), &ic, true).unwrap();
        store.upload().unwrap();

        // Clobber the mirror; the snapshot must come from the device.
        store.positions.host_mut().fill(Real4::ZERO);
        let snapshot = store.snapshot(0.5).unwrap();
        assert_eq!(snapshot.positions(), ic.positions.as_slice());
        assert_eq!(snapshot.ids(), ic.ids.as_slice());
        assert_eq!(snapshot.n_bodies(), 32);
        assert!((store.local_mass() - ic.total_mass()).abs() < 1e-9);
    }

    #[test]
    fn test_free_releases_device_memory() {
        let device = Arc::new(EmulatedDevice::new(1));
        let ic = CubeModel::new(16, 1).generate(0, 1);
        let mut store = ParticleStore::load(&context(&device), &ic, true).unwrap();
        assert!(device.used_bytes() > 0);
        assert_eq!(device.live_graphics_buffers(), 1);

        store.free().unwrap();
        store.free().unwrap();
        assert_eq!(device.used_bytes(), 0);
        assert_eq!(device.live_graphics_buffers(), 0);
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let device = Arc::new(EmulatedDevice::with_capacity(1, 1024));
        let ic = CubeModel::new(1000, 1).generate(0, 1);
        let err = ParticleStore::load(&context(&device), &ic, false).unwrap_err();
        assert_eq!(err.code, arbor_core::DeviceErrorCode::MemoryAllocation);
    }

    #[test]
    fn test_empty_rank_is_fine() {
        let device = Arc::new(EmulatedDevice::new(1));
        let mut store =
            ParticleStore::load(&context(&device), &InitialConditions::default(), false).unwrap();
        store.upload().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.snapshot(0.0).unwrap().n_bodies(), 0);
    }
}
