//! Orthorhombic periodic cell.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// An orthorhombic simulation cell with edge lengths in angstroms.
///
/// Triclinic cells are not supported; the reciprocal-space machinery assumes
/// a diagonal lattice matrix throughout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodicBox {
    pub lengths: Vector3<f64>,
}

impl PeriodicBox {
    pub fn new(lx: f64, ly: f64, lz: f64) -> Self {
        Self {
            lengths: Vector3::new(lx, ly, lz),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lengths.iter().all(|&l| l.is_finite() && l > 0.0)
    }

    pub fn volume(&self) -> f64 {
        self.lengths.x * self.lengths.y * self.lengths.z
    }

    /// Wraps a displacement vector to its minimum-image representative.
    pub fn minimum_image(&self, dr: Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            dr.x - self.lengths.x * (dr.x / self.lengths.x).round(),
            dr.y - self.lengths.y * (dr.y / self.lengths.y).round(),
            dr.z - self.lengths.z * (dr.z / self.lengths.z).round(),
        )
    }
}
