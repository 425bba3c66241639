//! Seeded synthetic models.
//!
//! Every model draws from a ChaCha8 stream selected by rank, so a rank's
//! bodies depend only on the seed, the rank and the per-rank count.

use std::f64::consts::PI;
use std::thread;

use arbor_shared::{BodyId, Real4};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::{rank_rng, InitialConditionGenerator, InitialConditions};

/// Radius beyond which Plummer samples are redrawn.
const PLUMMER_CUTOFF: f64 = 10.0;

/// Disk scale length and height of the galaxy model.
const DISK_SCALE_LENGTH: f64 = 1.0;
const DISK_SCALE_HEIGHT: f64 = 0.1;
const DISK_CUTOFF: f64 = 10.0 * DISK_SCALE_LENGTH;

/// Velocity dispersion as a fraction of the circular speed.
const DISK_DISPERSION: f64 = 0.05;

fn body_mass(n: usize, nprocs: usize) -> f32 {
    (1.0 / (n.max(1) as f64 * nprocs.max(1) as f64)) as f32
}

fn first_id(rank: usize, n: usize) -> BodyId {
    (rank * n) as BodyId
}

/// Direction uniform on the unit sphere, scaled by `length`.
fn isotropic(rng: &mut ChaCha8Rng, length: f64) -> (f64, f64, f64) {
    let z: f64 = rng.gen_range(-1.0..=1.0);
    let phi: f64 = rng.gen_range(0.0..2.0 * PI);
    let planar = (1.0 - z * z).max(0.0).sqrt();
    (
        length * planar * phi.cos(),
        length * planar * phi.sin(),
        length * z,
    )
}

fn assemble(
    rank: usize,
    n: usize,
    body: impl FnMut() -> (Real4, Real4),
) -> InitialConditions {
    let (positions, velocities): (Vec<Real4>, Vec<Real4>) = std::iter::repeat_with(body).take(n).unzip();
    let first = first_id(rank, n);
    InitialConditions {
        positions,
        velocities,
        ids: (0..n as BodyId).map(|i| first + i).collect(),
        class_counts: [n as u64, 0, 0],
        t_current: 0.0,
    }
}

/// Bodies uniformly filling the unit ball, at rest.
#[derive(Clone, Copy, Debug)]
pub struct SphereModel {
    n: usize,
    seed: u64,
}

impl SphereModel {
    /// `n` bodies per rank.
    #[must_use]
    pub fn new(n: usize, seed: u64) -> Self {
        Self { n, seed }
    }
}

impl InitialConditionGenerator for SphereModel {
    fn name(&self) -> &'static str {
        "sphere"
    }

    fn generate(&self, rank: usize, nprocs: usize) -> InitialConditions {
        let mut rng = rank_rng(self.seed, rank as u64);
        let mass = body_mass(self.n, nprocs);
        assemble(rank, self.n, || loop {
            let x: f32 = rng.gen_range(-1.0..1.0);
            let y: f32 = rng.gen_range(-1.0..1.0);
            let z: f32 = rng.gen_range(-1.0..1.0);
            if x * x + y * y + z * z <= 1.0 {
                break (Real4::position(x, y, z, mass), Real4::ZERO);
            }
        })
    }
}

/// Bodies uniformly filling `[-1, 1)^3`, at rest.
#[derive(Clone, Copy, Debug)]
pub struct CubeModel {
    n: usize,
    seed: u64,
}

impl CubeModel {
    /// `n` bodies per rank.
    #[must_use]
    pub fn new(n: usize, seed: u64) -> Self {
        Self { n, seed }
    }
}

impl InitialConditionGenerator for CubeModel {
    fn name(&self) -> &'static str {
        "cube"
    }

    fn generate(&self, rank: usize, nprocs: usize) -> InitialConditions {
        let mut rng = rank_rng(self.seed, rank as u64);
        let mass = body_mass(self.n, nprocs);
        assemble(rank, self.n, || {
            let p = Real4::position(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                mass,
            );
            (p, Real4::ZERO)
        })
    }
}

/// Plummer sphere in virial units (G = M = 1, E = -1/4).
#[derive(Clone, Copy, Debug)]
pub struct PlummerModel {
    n: usize,
    seed: u64,
}

impl PlummerModel {
    /// `n` bodies per rank.
    #[must_use]
    pub fn new(n: usize, seed: u64) -> Self {
        Self { n, seed }
    }
}

impl InitialConditionGenerator for PlummerModel {
    fn name(&self) -> &'static str {
        "plummer"
    }

    fn generate(&self, rank: usize, nprocs: usize) -> InitialConditions {
        let mut rng = rank_rng(self.seed, rank as u64);
        let mass = body_mass(self.n, nprocs);
        let length_scale = 3.0 * PI / 16.0;
        let velocity_scale = 1.0 / length_scale.sqrt();

        assemble(rank, self.n, || {
            let r = loop {
                let m: f64 = rng.gen_range(f64::EPSILON..1.0);
                let r = 1.0 / (m.powf(-2.0 / 3.0) - 1.0).sqrt();
                if r.is_finite() && r < PLUMMER_CUTOFF {
                    break r;
                }
            };
            // Von Neumann rejection on g(q) = q^2 (1 - q^2)^3.5.
            let q = loop {
                let q: f64 = rng.gen();
                let y: f64 = rng.gen_range(0.0..0.1);
                if y < q * q * (1.0 - q * q).powf(3.5) {
                    break q;
                }
            };
            let speed = q * 2f64.sqrt() * (1.0 + r * r).powf(-0.25);

            let (x, y, z) = isotropic(&mut rng, r * length_scale);
            let (vx, vy, vz) = isotropic(&mut rng, speed * velocity_scale);
            (
                Real4::position(x as f32, y as f32, z as f32, mass),
                Real4::velocity(vx as f32, vy as f32, vz as f32),
            )
        })
    }
}

/// Thin exponential disk on near-circular orbits.
///
/// Large models can be generated by several worker threads; each worker
/// owns its own stream so the result does not depend on scheduling.
#[derive(Clone, Copy, Debug)]
pub struct GalaxyModel {
    n: usize,
    seed: u64,
    fork: usize,
    scale_mass: bool,
}

impl GalaxyModel {
    /// `n` bodies per rank, generated on one thread.
    #[must_use]
    pub fn new(n: usize, seed: u64) -> Self {
        Self {
            n,
            seed,
            fork: 1,
            scale_mass: true,
        }
    }

    /// Splits generation over `fork` threads.
    #[must_use]
    pub fn with_fork(mut self, fork: usize) -> Self {
        self.fork = fork.max(1);
        self
    }

    /// Gives every body mass `1 / n`, ignoring the group size.
    #[must_use]
    pub fn unscaled(mut self) -> Self {
        self.scale_mass = false;
        self
    }

    fn chunk(&self, rank: usize, worker: usize, count: usize, mass: f32) -> Vec<(Real4, Real4)> {
        let stream = ((rank as u64) << 16) | worker as u64;
        let mut rng = rank_rng(self.seed, stream);
        (0..count).map(|_| disk_body(&mut rng, mass)).collect()
    }
}

fn enclosed_disk_mass(r: f64) -> f64 {
    let x = r / DISK_SCALE_LENGTH;
    1.0 - (1.0 + x) * (-x).exp()
}

fn disk_body(rng: &mut ChaCha8Rng, mass: f32) -> (Real4, Real4) {
    // Surface density e^{-R/h} makes R Gamma(2, h) distributed.
    let r = loop {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(f64::EPSILON..1.0);
        let r = -DISK_SCALE_LENGTH * (u1 * u2).ln();
        if r < DISK_CUTOFF {
            break r;
        }
    };
    let u: f64 = rng.gen_range(1e-6..1.0 - 1e-6);
    let z = DISK_SCALE_HEIGHT * (2.0 * u - 1.0).atanh();
    let phi: f64 = rng.gen_range(0.0..2.0 * PI);

    let circular = (enclosed_disk_mass(r) / r.max(1e-3)).sqrt();
    let jitter = |rng: &mut ChaCha8Rng| DISK_DISPERSION * circular * rng.gen_range(-1.0..1.0);
    let (sin, cos) = phi.sin_cos();
    let vx = -circular * sin + jitter(rng);
    let vy = circular * cos + jitter(rng);
    let vz = jitter(rng);

    (
        Real4::position((r * cos) as f32, (r * sin) as f32, z as f32, mass),
        Real4::velocity(vx as f32, vy as f32, vz as f32),
    )
}

impl InitialConditionGenerator for GalaxyModel {
    fn name(&self) -> &'static str {
        "galaxy"
    }

    fn generate(&self, rank: usize, nprocs: usize) -> InitialConditions {
        let mass = if self.scale_mass {
            body_mass(self.n, nprocs)
        } else {
            body_mass(self.n, 1)
        };
        let workers = self.fork.min(self.n.max(1));
        let per_worker = self.n / workers;
        let extra = self.n % workers;

        let chunks: Vec<Vec<(Real4, Real4)>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let count = per_worker + usize::from(worker < extra);
                    scope.spawn(move || self.chunk(rank, worker, count, mass))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_default())
                .collect()
        });

        let mut bodies = chunks.into_iter().flatten();
        assemble(rank, self.n, || bodies.next().unwrap_or_default())
    }
}
