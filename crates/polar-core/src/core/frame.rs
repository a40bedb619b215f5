//! Local-frame handling for permanent multipoles.
//!
//! Each particle's dipole and quadrupole are stored in a local frame defined
//! by up to three neighboring particles. This module builds the rotation into
//! the lab frame from the current positions, and provides the dual
//! operation: distributing a lab-frame torque onto the frame-defining
//! particles as forces, using the analytic derivative of the frame
//! construction. The redistribution is exact: the distributed forces sum to
//! zero and their moment about the particle reproduces the torque.

use super::models::{AxisType, FrameDef, LabMultipole, MultipoleParams};
use nalgebra::{Matrix3, Vector3};

const DEGENERATE_FRAME_TOLERANCE: f64 = 1e-8;

/// The orthonormal frame axes of one particle, with the geometry needed to
/// differentiate them.
struct Frame {
    x: Vector3<f64>,
    y: Vector3<f64>,
    z: Vector3<f64>,
}

#[inline]
fn reject(a: Vector3<f64>, unit: Vector3<f64>) -> Vector3<f64> {
    a - unit * unit.dot(&a)
}

/// Deterministic unit vector not parallel to `z`, used for frames that only
/// constrain the z axis.
#[inline]
fn arbitrary_perpendicular_seed(z: &Vector3<f64>) -> Vector3<f64> {
    if z.x.abs() < 0.866 {
        Vector3::x()
    } else {
        Vector3::y()
    }
}

fn bond(positions: &[Vector3<f64>], i: usize, neighbor: Option<usize>) -> Option<Vector3<f64>> {
    let j = neighbor?;
    let v = positions[j] - positions[i];
    (v.norm() > DEGENERATE_FRAME_TOLERANCE).then_some(v)
}

fn build_frame(positions: &[Vector3<f64>], i: usize, def: &FrameDef) -> Option<Frame> {
    let finish = |z: Vector3<f64>, x_seed: Vector3<f64>| -> Option<Frame> {
        let x = reject(x_seed, z);
        let xn = x.norm();
        if xn <= DEGENERATE_FRAME_TOLERANCE {
            return None;
        }
        let x = x / xn;
        Some(Frame { x, y: z.cross(&x), z })
    };

    match def.axis {
        AxisType::NoAxis => Some(Frame {
            x: Vector3::x(),
            y: Vector3::y(),
            z: Vector3::z(),
        }),
        AxisType::ZOnly => {
            let u = bond(positions, i, def.z_particle)?;
            let z = u.normalize();
            finish(z, arbitrary_perpendicular_seed(&z))
        }
        AxisType::ZThenX => {
            let u = bond(positions, i, def.z_particle)?;
            let v = bond(positions, i, def.x_particle)?;
            finish(u.normalize(), v)
        }
        AxisType::Bisector => {
            let u = bond(positions, i, def.z_particle)?;
            let v = bond(positions, i, def.x_particle)?;
            let b = u.normalize() + v.normalize();
            let bn = b.norm();
            if bn <= DEGENERATE_FRAME_TOLERANCE {
                return None;
            }
            finish(b / bn, v)
        }
        AxisType::ZBisect => {
            let u = bond(positions, i, def.z_particle)?;
            let v = bond(positions, i, def.x_particle)?;
            let w = bond(positions, i, def.y_particle)?;
            let z = u.normalize();
            finish(z, v.normalize() + w.normalize())
        }
        AxisType::ThreeFold => {
            let u = bond(positions, i, def.z_particle)?;
            let v = bond(positions, i, def.x_particle)?;
            let w = bond(positions, i, def.y_particle)?;
            let b = u.normalize() + v.normalize() + w.normalize();
            let bn = b.norm();
            if bn <= DEGENERATE_FRAME_TOLERANCE {
                return None;
            }
            finish(b / bn, v)
        }
    }
}

/// Rotation matrix taking local-frame components to the lab frame. Columns
/// are the lab-frame images of the local x, y, z axes. Degenerate geometry
/// (collinear or coincident frame atoms) falls back to the identity.
pub fn rotation_matrix(positions: &[Vector3<f64>], i: usize, def: &FrameDef) -> Matrix3<f64> {
    match build_frame(positions, i, def) {
        Some(f) => Matrix3::from_columns(&[f.x, f.y, f.z]),
        None => Matrix3::identity(),
    }
}

/// Rotates one particle's permanent moments into the lab frame.
pub fn rotate_to_lab(
    params: &MultipoleParams,
    positions: &[Vector3<f64>],
    i: usize,
) -> LabMultipole {
    let r = rotation_matrix(positions, i, &params.frame);
    LabMultipole {
        charge: params.charge,
        dipole: r * params.local_dipole,
        quadrupole: r * params.local_quadrupole * r.transpose(),
    }
}

/// Lab-frame moments for every particle.
pub fn compute_lab_multipoles(
    positions: &[Vector3<f64>],
    params: &[MultipoleParams],
) -> Vec<LabMultipole> {
    params
        .iter()
        .enumerate()
        .map(|(i, p)| rotate_to_lab(p, positions, i))
        .collect()
}

/// Distributes the torque on particle `i` onto its frame-defining particles
/// as forces, adding into `forces`.
///
/// The energy depends on the frame orientation alone, so an infinitesimal
/// displacement of a defining atom changes the energy only through the
/// rotation it induces: `dE = -torque . dtheta`. The expressions below are
/// the exact Jacobians `dtheta/dr` of the frame construction in
/// [`build_frame`]; translation invariance fixes the force on `i` itself.
pub fn distribute_torque(
    positions: &[Vector3<f64>],
    i: usize,
    def: &FrameDef,
    torque: Vector3<f64>,
    forces: &mut [Vector3<f64>],
) {
    let Some(frame) = build_frame(positions, i, def) else {
        return;
    };
    // build_frame only succeeds when the axis type's defining particles are
    // present, so the index fallbacks below are unreachable.
    let zp = def.z_particle.unwrap_or(i);
    let xp = def.x_particle.unwrap_or(i);
    let yp = def.y_particle.unwrap_or(i);
    let (yhat, zhat) = (frame.y, frame.z);
    let tau_z = torque.dot(&zhat);
    let tau_cross_z = torque.cross(&zhat);

    let mut add = |j: usize, f: Vector3<f64>| {
        forces[j] += f;
        forces[i] -= f;
    };

    match def.axis {
        AxisType::NoAxis => {}
        AxisType::ZOnly => {
            // Rotation about z is not resolvable from a single axis; a
            // z-only site carries no transverse moments, so that component
            // of the torque vanishes identically.
            let u = positions[zp] - positions[i];
            add(zp, tau_cross_z / u.norm());
        }
        AxisType::ZThenX => {
            let u = positions[zp] - positions[i];
            let v = positions[xp] - positions[i];
            let wn = reject(v, zhat).norm();
            let f_z = tau_cross_z / u.norm() - yhat * (v.dot(&zhat) * tau_z / (u.norm() * wn));
            let f_x = yhat * (tau_z / wn);
            add(zp, f_z);
            add(xp, f_x);
        }
        AxisType::Bisector => {
            let u = positions[zp] - positions[i];
            let v = positions[xp] - positions[i];
            let (uh, vh) = (u.normalize(), v.normalize());
            let bn = (uh + vh).norm();
            let wn = reject(v, zhat).norm();
            let g = tau_cross_z / bn - yhat * (tau_z * v.dot(&zhat) / (wn * bn));
            let h = yhat * (tau_z / wn);
            add(zp, reject(g, uh) / u.norm());
            add(xp, reject(g, vh) / v.norm() + h);
        }
        AxisType::ZBisect => {
            let u = positions[zp] - positions[i];
            let v = positions[xp] - positions[i];
            let w = positions[yp] - positions[i];
            let (vh, wh) = (v.normalize(), w.normalize());
            let b = vh + wh;
            let tn = reject(b, zhat).norm();
            let f_z = tau_cross_z / u.norm() - yhat * (b.dot(&zhat) * tau_z / (u.norm() * tn));
            let h = yhat * (tau_z / tn);
            add(zp, f_z);
            add(xp, reject(h, vh) / v.norm());
            add(yp, reject(h, wh) / w.norm());
        }
        AxisType::ThreeFold => {
            let u = positions[zp] - positions[i];
            let v = positions[xp] - positions[i];
            let w = positions[yp] - positions[i];
            let (uh, vh, wh) = (u.normalize(), v.normalize(), w.normalize());
            let bn = (uh + vh + wh).norm();
            let tn = reject(v, zhat).norm();
            let g = tau_cross_z / bn - yhat * (tau_z * v.dot(&zhat) / (tn * bn));
            let h = yhat * (tau_z / tn);
            add(zp, reject(g, uh) / u.norm());
            add(xp, reject(g, vh) / v.norm() + h);
            add(yp, reject(g, wh) / w.norm());
        }
    }
}
