//! The dataset handed from the physics loop to the writer.

use arbor_shared::{BodyId, Real4, SnapshotKind};

use crate::error::{IoError, IoResult};

/// One rank's particles at one simulated time.
///
/// The three arrays always have the same length.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotData {
    kind: SnapshotKind,
    t_current: f64,
    class_counts: [u64; 3],
    positions: Vec<Real4>,
    velocities: Vec<Real4>,
    ids: Vec<BodyId>,
}

impl SnapshotData {
    /// Builds a full snapshot. All particles go in the first class.
    pub fn new(
        t_current: f64,
        positions: Vec<Real4>,
        velocities: Vec<Real4>,
        ids: Vec<BodyId>,
    ) -> IoResult<Self> {
        if positions.len() != velocities.len() || positions.len() != ids.len() {
            return Err(IoError::Inconsistent(format!(
                "{} positions, {} velocities, {} ids",
                positions.len(),
                velocities.len(),
                ids.len()
            )));
        }
        Ok(Self {
            kind: SnapshotKind::Full,
            t_current,
            class_counts: [positions.len() as u64, 0, 0],
            positions,
            velocities,
            ids,
        })
    }

    /// Replaces the particle class counts. They must sum to the body count.
    pub fn with_class_counts(mut self, class_counts: [u64; 3]) -> IoResult<Self> {
        let total: u64 = class_counts.iter().sum();
        if total != self.ids.len() as u64 {
            return Err(IoError::Inconsistent(format!(
                "class counts sum to {total}, snapshot holds {}",
                self.ids.len()
            )));
        }
        self.class_counts = class_counts;
        Ok(self)
    }

    /// Evenly strided subset of `ceil(n * ratio)` bodies.
    ///
    /// `ratio` is clamped to `(0, 1]`. A non-empty snapshot always keeps at
    /// least one body.
    #[must_use]
    pub fn quick_sample(&self, ratio: f64) -> Self {
        let n = self.ids.len();
        let ratio = ratio.clamp(f64::MIN_POSITIVE, 1.0);
        let keep = ((n as f64 * ratio).ceil() as usize).clamp(n.min(1), n);

        let picks = (0..keep).map(|i| i * n / keep);
        let positions = picks.clone().map(|i| self.positions[i]).collect();
        let velocities = picks.clone().map(|i| self.velocities[i]).collect();
        let ids = picks.map(|i| self.ids[i]).collect();
        Self {
            kind: SnapshotKind::Quick,
            t_current: self.t_current,
            class_counts: [keep as u64, 0, 0],
            positions,
            velocities,
            ids,
        }
    }

    /// Full or quick.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> SnapshotKind {
        self.kind
    }

    /// Simulated time of the dataset.
    #[inline]
    #[must_use]
    pub fn t_current(&self) -> f64 {
        self.t_current
    }

    /// Number of bodies.
    #[inline]
    #[must_use]
    pub fn n_bodies(&self) -> usize {
        self.ids.len()
    }

    /// Particle class counts.
    #[inline]
    #[must_use]
    pub fn class_counts(&self) -> [u64; 3] {
        self.class_counts
    }

    /// Positions with mass in `w`.
    #[inline]
    #[must_use]
    pub fn positions(&self) -> &[Real4] {
        &self.positions
    }

    /// Velocities.
    #[inline]
    #[must_use]
    pub fn velocities(&self) -> &[Real4] {
        &self.velocities
    }

    /// Identifiers.
    #[inline]
    #[must_use]
    pub fn ids(&self) -> &[BodyId] {
        &self.ids
    }

    /// Sum of particle masses.
    #[must_use]
    pub fn total_mass(&self) -> f64 {
        self.positions.iter().map(|p| f64::from(p.mass())).sum()
    }

    pub(crate) fn from_parts(
        kind: SnapshotKind,
        t_current: f64,
        class_counts: [u64; 3],
        positions: Vec<Real4>,
        velocities: Vec<Real4>,
        ids: Vec<BodyId>,
    ) -> Self {
        Self {
            kind,
            t_current,
            class_counts,
            positions,
            velocities,
            ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies(n: usize) -> SnapshotData {
        let positions = (0..n).map(|i| Real4::position(i as f32, 0.0, 0.0, 1.0)).collect();
        let velocities = vec![Real4::ZERO; n];
        let ids = (0..n as u64).collect();
        SnapshotData::new(2.5, positions, velocities, ids).unwrap()
    }

    #[test]
    fn test_mismatched_arrays_rejected() {
        let err = SnapshotData::new(0.0, vec![Real4::ZERO; 2], vec![Real4::ZERO; 2], vec![0]);
        assert!(matches!(err, Err(IoError::Inconsistent(_))));
    }

    #[test]
    fn test_class_counts_must_sum() {
        assert!(bodies(10).with_class_counts([4, 4, 2]).is_ok());
        assert!(bodies(10).with_class_counts([4, 4, 1]).is_err());
    }

    #[test]
    fn test_quick_sample_is_strided() {
        let quick = bodies(100).quick_sample(0.1);
        assert_eq!(quick.kind(), SnapshotKind::Quick);
        assert_eq!(quick.n_bodies(), 10);
        assert_eq!(quick.ids(), &[0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);
        assert!((quick.t_current() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_quick_sample_rounds_up() {
        assert_eq!(bodies(7).quick_sample(0.1).n_bodies(), 1);
        assert_eq!(bodies(7).quick_sample(1.0).n_bodies(), 7);
        assert_eq!(bodies(0).quick_sample(0.5).n_bodies(), 0);
    }
}
