//! Particle element types.
//!
//! These are the exact layouts stored in host and device arrays, so every
//! type here is `Pod` and `#[repr(C)]`.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Globally unique particle identifier.
pub type BodyId = u64;

/// Four packed single-precision components.
///
/// Positions carry the particle mass in `w`. Velocities leave `w` at zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Real4 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
    /// Fourth component (mass for positions)
    pub w: f32,
}

impl Real4 {
    /// Creates a new Real4
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// All components zero
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    /// Position with mass.
    #[must_use]
    pub const fn position(x: f32, y: f32, z: f32, mass: f32) -> Self {
        Self::new(x, y, z, mass)
    }

    /// Velocity (fourth component zero).
    #[must_use]
    pub const fn velocity(x: f32, y: f32, z: f32) -> Self {
        Self::new(x, y, z, 0.0)
    }

    /// Mass stored in the fourth component.
    #[inline]
    #[must_use]
    pub const fn mass(self) -> f32 {
        self.w
    }

    /// Squared length of the xyz part.
    #[inline]
    #[must_use]
    pub fn length_squared3(self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Whether every component is finite.
    #[inline]
    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
}

/// Two packed single-precision components.
///
/// Used for per-particle time pairs (`t_begin`, `t_end`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Real2 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
}

impl Real2 {
    /// Creates a new Real2
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Both components set to `v`.
    #[must_use]
    pub const fn splat(v: f32) -> Self {
        Self::new(v, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts_are_packed() {
        assert_eq!(std::mem::size_of::<Real4>(), 16);
        assert_eq!(std::mem::size_of::<Real2>(), 8);
    }

    #[test]
    fn test_position_carries_mass() {
        let p = Real4::position(1.0, 2.0, 3.0, 0.5);
        assert!((p.mass() - 0.5).abs() < f32::EPSILON);
        assert!((p.length_squared3() - 14.0).abs() < 1e-6);
        assert!(!Real4::new(f32::NAN, 0.0, 0.0, 0.0).is_finite());
    }
}
