//! # Gravity Solver
//!
//! The lifecycle only needs three things from a solver: advance one step,
//! report the simulated time, accept a start time. Tree construction and
//! force approximation live behind [`GravitySolver`].
//!
//! [`DirectSolver`] is a softened direct-summation kick-drift-kick
//! integrator over the local bodies. It ignores bodies on other ranks.

use arbor_shared::Real4;

use crate::error::{SolverError, SolverResult};
use crate::particles::ParticleStore;

/// One gravity step at a time.
pub trait GravitySolver: Send {
    /// Advances the bodies by one step.
    fn iterate(&mut self, particles: &mut ParticleStore) -> SolverResult<()>;

    /// Current simulated time.
    fn t_current(&self) -> f64;

    /// Sets the simulated time, e.g. from a restart file.
    fn set_t_current(&mut self, t: f64);
}

/// Direct summation with Plummer softening.
#[derive(Debug)]
pub struct DirectSolver {
    eps2: f32,
    dt: f64,
    t: f64,
    /// Accelerations from the end of the previous step.
    accelerations: Vec<[f32; 3]>,
}

impl DirectSolver {
    /// Solver with softening `eps` and fixed step `dt`.
    #[must_use]
    pub fn new(eps: f32, dt: f64) -> Self {
        Self {
            eps2: eps * eps,
            dt,
            t: 0.0,
            accelerations: Vec::new(),
        }
    }

    fn compute_accelerations(&self, positions: &[Real4]) -> Vec<[f32; 3]> {
        positions
            .iter()
            .map(|pi| {
                let mut acc = [0.0f32; 3];
                for pj in positions {
                    let dx = pj.x - pi.x;
                    let dy = pj.y - pi.y;
                    let dz = pj.z - pi.z;
                    let r2 = dx * dx + dy * dy + dz * dz + self.eps2;
                    if r2 == 0.0 {
                        continue;
                    }
                    let inv_r = 1.0 / r2.sqrt();
                    let f = pj.mass() * inv_r * inv_r * inv_r;
                    acc[0] += f * dx;
                    acc[1] += f * dy;
                    acc[2] += f * dz;
                }
                acc
            })
            .collect()
    }
}

fn kick(velocities: &mut [Real4], accelerations: &[[f32; 3]], h: f32) {
    for (v, a) in velocities.iter_mut().zip(accelerations) {
        v.x += a[0] * h;
        v.y += a[1] * h;
        v.z += a[2] * h;
    }
}

impl GravitySolver for DirectSolver {
    fn iterate(&mut self, particles: &mut ParticleStore) -> SolverResult<()> {
        particles.positions.download()?;
        particles.velocities.download()?;

        if self.accelerations.len() != particles.len() {
            self.accelerations = self.compute_accelerations(particles.positions.host());
        }
        let h = self.dt as f32;

        kick(particles.velocities.host_mut(), &self.accelerations, 0.5 * h);
        let velocities = particles.velocities.host().to_vec();
        for (p, v) in particles.positions.host_mut().iter_mut().zip(&velocities) {
            p.x += v.x * h;
            p.y += v.y * h;
            p.z += v.z * h;
        }
        self.accelerations = self.compute_accelerations(particles.positions.host());
        kick(particles.velocities.host_mut(), &self.accelerations, 0.5 * h);

        self.t += self.dt;
        let bad = particles
            .positions
            .host()
            .iter()
            .zip(particles.velocities.host())
            .position(|(p, v)| !(p.is_finite() && v.is_finite()));
        if let Some(index) = bad {
            return Err(SolverError::NonFinite {
                id: particles.ids.host().get(index).copied().unwrap_or_default(),
                t: self.t,
            });
        }

        particles.positions.upload()?;
        particles.velocities.upload()?;
        Ok(())
    }

    fn t_current(&self) -> f64 {
        self.t
    }

    fn set_t_current(&mut self, t: f64) {
        self.t = t;
    }
}
