use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// How a particle's local multipole frame is built from its neighbors.
///
/// The variants mirror the axis conventions of the AMOEBA force field: a
/// z-axis defining atom, an optional x-axis defining atom, and for the
/// bisector-style frames a third (y) atom. `NoAxis` is the isotropic
/// fallback for particles whose multipole is a bare charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisType {
    ZThenX,
    Bisector,
    ZBisect,
    ThreeFold,
    ZOnly,
    NoAxis,
}

/// Indices of the neighboring particles that define a local frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDef {
    pub axis: AxisType,
    pub z_particle: Option<usize>,
    pub x_particle: Option<usize>,
    pub y_particle: Option<usize>,
}

impl FrameDef {
    pub fn isotropic() -> Self {
        Self {
            axis: AxisType::NoAxis,
            z_particle: None,
            x_particle: None,
            y_particle: None,
        }
    }

    pub fn z_then_x(z: usize, x: usize) -> Self {
        Self {
            axis: AxisType::ZThenX,
            z_particle: Some(z),
            x_particle: Some(x),
            y_particle: None,
        }
    }

    pub fn bisector(z: usize, x: usize) -> Self {
        Self {
            axis: AxisType::Bisector,
            z_particle: Some(z),
            x_particle: Some(x),
            y_particle: None,
        }
    }

    pub fn z_only(z: usize) -> Self {
        Self {
            axis: AxisType::ZOnly,
            z_particle: Some(z),
            x_particle: None,
            y_particle: None,
        }
    }
}

/// Permanent multipole and polarizability parameters of one particle.
///
/// The dipole and quadrupole are stored in the particle's local frame and
/// rotated into the lab frame each time positions change. The quadrupole is
/// traceless symmetric and stored in the convention where the interaction
/// energy with an external potential phi is
/// `q * phi + d . grad(phi) + Q : grad(grad(phi))`.
///
/// Units: charge in e, dipole in e*Angstrom, quadrupole in e*Angstrom^2,
/// polarizability in Angstrom^3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipoleParams {
    pub charge: f64,
    pub local_dipole: Vector3<f64>,
    pub local_quadrupole: Matrix3<f64>,
    pub frame: FrameDef,
    pub polarizability: f64,
    /// Thole damping width for induced interactions with this particle.
    pub thole: f64,
}

impl MultipoleParams {
    pub fn point_charge(charge: f64) -> Self {
        Self {
            charge,
            local_dipole: Vector3::zeros(),
            local_quadrupole: Matrix3::zeros(),
            frame: FrameDef::isotropic(),
            polarizability: 0.0,
            thole: 0.39,
        }
    }

    /// Thole damping radius `polarizability^(1/6)`, the pair product of which
    /// sets the length scale of the damped interaction.
    pub fn damping_radius(&self) -> f64 {
        if self.polarizability > 0.0 {
            self.polarizability.powf(1.0 / 6.0)
        } else {
            0.0
        }
    }
}

/// A particle's multipole moments rotated into the lab frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LabMultipole {
    pub charge: f64,
    pub dipole: Vector3<f64>,
    pub quadrupole: Matrix3<f64>,
}
