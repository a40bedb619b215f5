//! Real-space multipole interactions.
//!
//! Every pairwise quantity here derives from one object: the derivatives of
//! the (optionally Ewald-screened) potential of a source multipole, taken to
//! third order at the receiver. Energies, fields, field gradients, forces and
//! torques are contractions of those derivatives with the receiver's moments,
//! so the force is the exact gradient of the energy by construction.
//!
//! The screened radial kernels `B_k` satisfy `-(1/r) dB_k/dr = B_{k+1}` with
//! `B_0 = erfc(alpha r)/r`; at `alpha = 0` they reduce to the bare Coulomb
//! coefficients `(2k-1)!!/r^(2k+1)`, so the same kernels serve both the PME
//! real-space sum and the open-boundary path. Exclusion rules enter through
//! per-order coefficients `B_k - (1 - scale * damp_k) R_k`, which folds the
//! scaled bare subtraction for bonded pairs into the same pass.
//!
//! Fields are returned in e/A^2; energies, forces and torques carry the
//! Coulomb conversion to kcal/mol.

use super::models::{LabMultipole, MultipoleParams, PeriodicBox};
use super::scaling::ScaleTables;
use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Coulomb constant in kcal*A/(mol*e^2).
pub const ELECTRIC: f64 = 332.063713;

const SQRT_PI: f64 = 1.772_453_850_905_516;

/// Screened radial kernels `B_0..B_5` at separation `r`.
///
/// `alpha = 0` yields the bare `(2k-1)!!/r^(2k+1)` series exactly.
pub fn screened_kernels(r: f64, alpha: f64) -> [f64; 6] {
    let r2 = r * r;
    if alpha == 0.0 {
        return bare_kernels(r);
    }
    let ar = alpha * r;
    let mut b = [0.0; 6];
    b[0] = libm::erfc(ar) / r;
    let alsq2 = 2.0 * alpha * alpha;
    let exp2a = (-ar * ar).exp();
    let mut alsq2n = 1.0 / (SQRT_PI * alpha);
    for k in 1..6 {
        alsq2n *= alsq2;
        b[k] = ((2 * k - 1) as f64 * b[k - 1] + alsq2n * exp2a) / r2;
    }
    b
}

/// Bare Coulomb kernels `(2k-1)!!/r^(2k+1)`.
pub fn bare_kernels(r: f64) -> [f64; 6] {
    let r2 = r * r;
    let mut b = [0.0; 6];
    b[0] = 1.0 / r;
    for k in 1..6 {
        b[k] = (2 * k - 1) as f64 * b[k - 1] / r2;
    }
    b
}

/// Thole damping between a pair of polarizable sites.
#[derive(Debug, Clone, Copy)]
pub struct Damping {
    /// Dimensionless damping strength; the smaller of the two sites' values.
    pub thole: f64,
    /// Product of the two sites' damping radii (polarizability^(1/6)).
    pub radius_product: f64,
}

impl Damping {
    pub fn between(a: &MultipoleParams, b: &MultipoleParams) -> Self {
        Self {
            thole: a.thole.min(b.thole),
            radius_product: a.damping_radius() * b.damping_radius(),
        }
    }

    /// Damping factors `[s3, s5, s7, s9]` applied to the bare kernels
    /// `R_1..R_4`. Non-polarizable pairs are undamped.
    pub fn factors(&self, r: f64) -> [f64; 4] {
        if self.radius_product <= 0.0 || self.thole <= 0.0 {
            return [1.0; 4];
        }
        let u = r / self.radius_product;
        let v = self.thole * u * u * u;
        // Large v underflows exp; short-circuit to the undamped limit.
        if v > 50.0 {
            return [1.0; 4];
        }
        let e = (-v).exp();
        [
            1.0 - e,
            1.0 - (1.0 + v) * e,
            1.0 - (1.0 + v + 0.6 * v * v) * e,
            1.0 - (1.0 + v + (18.0 / 35.0) * v * v + (9.0 / 35.0) * v * v * v) * e,
        ]
    }
}

/// Per-order interaction coefficients for one pair and one channel.
///
/// `scale` is the group scale factor for the channel (m, d, p or u) and
/// `damping` is the Thole model for channels that couple induced dipoles.
/// The result is `B_k - (1 - scale * s_k) R_k`: the screened kernel minus
/// the excluded fraction of the bare one.
pub fn pair_coefficients(r: f64, alpha: f64, scale: f64, damping: Option<&Damping>) -> [f64; 6] {
    let bn = screened_kernels(r, alpha);
    let rr = bare_kernels(r);
    let s = match damping {
        Some(d) => d.factors(r),
        None => [1.0; 4],
    };
    let mut c = [0.0; 6];
    c[0] = bn[0] - (1.0 - scale) * rr[0];
    for k in 1..5 {
        c[k] = bn[k] - (1.0 - scale * s[k - 1]) * rr[k];
    }
    c[5] = bn[5] - (1.0 - scale) * rr[5];
    c
}

/// Potential of a source multipole and its derivatives to third order,
/// evaluated at displacement `rv` = receiver - source.
#[derive(Debug, Clone)]
pub struct PotentialDerivs {
    pub phi: f64,
    /// `d phi / d rv_a`.
    pub grad: Vector3<f64>,
    /// `d^2 phi / d rv_a d rv_b`.
    pub hess: Matrix3<f64>,
    /// `d^3 phi / d rv_a d rv_b d rv_c`, stored as one symmetric matrix in
    /// `(a, b)` per value of `c`.
    pub third: [Matrix3<f64>; 3],
}

/// Expands the derivatives of `phi(rv) = q B_0 + (d.rv) B_1 + (rv.Q.rv) B_2`
/// using `d B_k / d rv_a = -rv_a B_{k+1}`.
pub fn potential_derivs(rv: Vector3<f64>, src: &LabMultipole, b: &[f64; 6]) -> PotentialDerivs {
    let d = src.dipole;
    let qv = src.quadrupole * rv;
    let dr = d.dot(&rv);
    let qr = qv.dot(&rv);

    // Moment-contracted kernels: S_k = q B_k + (d.rv) B_{k+1} + (rv.Q.rv) B_{k+2}.
    let s1 = src.charge * b[1] + dr * b[2] + qr * b[3];
    let s2 = src.charge * b[2] + dr * b[3] + qr * b[4];
    let s3 = src.charge * b[3] + dr * b[4] + qr * b[5];

    let phi = src.charge * b[0] + dr * b[1] + qr * b[2];
    let grad = -rv * s1 + d * b[1] + qv * (2.0 * b[2]);
    let hess = Matrix3::identity() * (-s1) + rv * rv.transpose() * s2
        - (d * rv.transpose() + rv * d.transpose()) * b[2]
        + src.quadrupole * (2.0 * b[2])
        - (qv * rv.transpose() + rv * qv.transpose()) * (2.0 * b[3]);

    let mut third = [Matrix3::zeros(); 3];
    for c in 0..3 {
        for a in 0..3 {
            for bb in 0..3 {
                let d_ab = if a == bb { 1.0 } else { 0.0 };
                let d_ac = if a == c { 1.0 } else { 0.0 };
                let d_bc = if bb == c { 1.0 } else { 0.0 };
                third[c][(a, bb)] = (d_ab * rv[c] + d_ac * rv[bb] + d_bc * rv[a]) * s2
                    - rv[a] * rv[bb] * rv[c] * s3
                    - (d_ab * d[c] + d_ac * d[bb] + d_bc * d[a]) * b[2]
                    + (d[a] * rv[bb] * rv[c] + d[bb] * rv[a] * rv[c] + d[c] * rv[a] * rv[bb])
                        * b[3]
                    - 2.0
                        * (src.quadrupole[(a, bb)] * rv[c]
                            + src.quadrupole[(a, c)] * rv[bb]
                            + src.quadrupole[(bb, c)] * rv[a])
                        * b[3]
                    - 2.0 * (d_ab * qv[c] + d_ac * qv[bb] + d_bc * qv[a]) * b[3]
                    + 2.0
                        * (qv[a] * rv[bb] * rv[c] + qv[bb] * rv[a] * rv[c] + qv[c] * rv[a] * rv[bb])
                        * b[4];
            }
        }
    }

    PotentialDerivs { phi, grad, hess, third }
}

/// Interaction energy of a receiver multipole in the source potential,
/// without the Coulomb conversion.
pub fn interaction_energy(recv: &LabMultipole, pd: &PotentialDerivs) -> f64 {
    recv.charge * pd.phi
        + recv.dipole.dot(&pd.grad)
        + recv.quadrupole.component_mul(&pd.hess).sum()
}

/// Force on the receiver, without the Coulomb conversion. The source feels
/// the opposite force.
pub fn force_on(recv: &LabMultipole, pd: &PotentialDerivs) -> Vector3<f64> {
    let mut f = pd.grad * recv.charge + pd.hess * recv.dipole;
    for c in 0..3 {
        let col = Vector3::new(
            recv.quadrupole[(0, c)],
            recv.quadrupole[(1, c)],
            recv.quadrupole[(2, c)],
        );
        f += pd.third[c] * col;
    }
    -f
}

#[inline]
fn axial(m: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(
        m[(1, 2)] - m[(2, 1)],
        m[(2, 0)] - m[(0, 2)],
        m[(0, 1)] - m[(1, 0)],
    )
}

/// Torque on the receiver's permanent moments, without the Coulomb
/// conversion.
pub fn torque_on(recv: &LabMultipole, pd: &PotentialDerivs) -> Vector3<f64> {
    -recv.dipole.cross(&pd.grad) - axial(&(recv.quadrupole * pd.hess)) * 2.0
}

#[inline]
pub(crate) fn dipole_source(u: Vector3<f64>) -> LabMultipole {
    LabMultipole {
        charge: 0.0,
        dipole: u,
        quadrupole: Matrix3::zeros(),
    }
}

/// Real-space evaluation context: Ewald screening, cutoff and boundary
/// handling shared by every pairwise pass.
#[derive(Debug, Clone, Copy)]
pub struct RealSpace {
    pub alpha: f64,
    pub cutoff: Option<f64>,
    pub cell: Option<PeriodicBox>,
}

impl RealSpace {
    /// Screened real-space half of an Ewald decomposition.
    pub fn ewald(alpha: f64, cutoff: f64, cell: PeriodicBox) -> Self {
        Self {
            alpha,
            cutoff: Some(cutoff),
            cell: Some(cell),
        }
    }

    /// Full-range bare Coulomb for non-periodic systems.
    pub fn open() -> Self {
        Self {
            alpha: 0.0,
            cutoff: None,
            cell: None,
        }
    }

    #[inline]
    fn displacement(&self, ri: Vector3<f64>, rj: Vector3<f64>) -> Vector3<f64> {
        let dr = ri - rj;
        match &self.cell {
            Some(cell) => cell.minimum_image(dr),
            None => dr,
        }
    }

    #[inline]
    fn within_cutoff(&self, r2: f64) -> bool {
        match self.cutoff {
            Some(c) => r2 <= c * c,
            None => true,
        }
    }

    /// Permanent-permanent energy, accumulating forces and frame torques.
    ///
    /// Applies m-channel exclusion scaling; with Ewald screening this also
    /// subtracts the full bare interaction of excluded pairs, which the
    /// reciprocal sum counts at full strength.
    pub fn permanent_interactions(
        &self,
        positions: &[Vector3<f64>],
        multipoles: &[LabMultipole],
        scales: &ScaleTables,
        forces: &mut [Vector3<f64>],
        torques: &mut [Vector3<f64>],
    ) -> f64 {
        let n = positions.len();
        let mut energy = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let rv = self.displacement(positions[i], positions[j]);
                let r2 = rv.norm_squared();
                if !self.within_cutoff(r2) {
                    continue;
                }
                let r = r2.sqrt();
                let m = scales.pair(i, j).m;
                if self.alpha == 0.0 && m == 0.0 {
                    continue;
                }
                let b = pair_coefficients(r, self.alpha, m, None);
                let pd_i = potential_derivs(rv, &multipoles[j], &b);
                energy += interaction_energy(&multipoles[i], &pd_i);
                let f = force_on(&multipoles[i], &pd_i) * ELECTRIC;
                forces[i] += f;
                forces[j] -= f;
                torques[i] += torque_on(&multipoles[i], &pd_i) * ELECTRIC;
                let pd_j = potential_derivs(-rv, &multipoles[i], &b);
                torques[j] += torque_on(&multipoles[j], &pd_j) * ELECTRIC;
            }
        }
        energy * ELECTRIC
    }

    /// Fields of the permanent multipoles at every site, for the d and p
    /// exclusion channels, in e/A^2. Each receiver row is an independent
    /// gather, so the result is deterministic under parallel evaluation.
    pub fn permanent_fields(
        &self,
        positions: &[Vector3<f64>],
        multipoles: &[LabMultipole],
        params: &[MultipoleParams],
        scales: &ScaleTables,
    ) -> (Vec<Vector3<f64>>, Vec<Vector3<f64>>) {
        let n = positions.len();
        let row = |i: usize| -> (Vector3<f64>, Vector3<f64>) {
            let mut e_d = Vector3::zeros();
            let mut e_p = Vector3::zeros();
            for j in 0..n {
                if j == i {
                    continue;
                }
                let rv = self.displacement(positions[i], positions[j]);
                let r2 = rv.norm_squared();
                if !self.within_cutoff(r2) {
                    continue;
                }
                let r = r2.sqrt();
                let scale = scales.pair(i, j);
                let damping = Damping::between(&params[i], &params[j]);
                let b_d = pair_coefficients(r, self.alpha, scale.d, Some(&damping));
                let b_p = pair_coefficients(r, self.alpha, scale.p, Some(&damping));
                e_d -= potential_derivs(rv, &multipoles[j], &b_d).grad;
                e_p -= potential_derivs(rv, &multipoles[j], &b_p).grad;
            }
            (e_d, e_p)
        };

        #[cfg(feature = "parallel")]
        let rows: Vec<_> = (0..n).into_par_iter().map(row).collect();
        #[cfg(not(feature = "parallel"))]
        let rows: Vec<_> = (0..n).map(row).collect();

        rows.into_iter().unzip()
    }

    /// Field of a set of induced dipoles at every site (u channel), added
    /// into `out`, in e/A^2.
    pub fn induced_dipole_field(
        &self,
        positions: &[Vector3<f64>],
        params: &[MultipoleParams],
        scales: &ScaleTables,
        induced: &[Vector3<f64>],
        out: &mut [Vector3<f64>],
    ) {
        let n = positions.len();
        let row = |i: usize| -> Vector3<f64> {
            let mut e = Vector3::zeros();
            for j in 0..n {
                if j == i {
                    continue;
                }
                let rv = self.displacement(positions[i], positions[j]);
                let r2 = rv.norm_squared();
                if !self.within_cutoff(r2) {
                    continue;
                }
                let r = r2.sqrt();
                let scale = scales.pair(i, j);
                let damping = Damping::between(&params[i], &params[j]);
                let b = pair_coefficients(r, self.alpha, scale.u, Some(&damping));
                e -= potential_derivs(rv, &dipole_source(induced[j]), &b).grad;
            }
            e
        };

        #[cfg(feature = "parallel")]
        let rows: Vec<_> = (0..n).into_par_iter().map(row).collect();
        #[cfg(not(feature = "parallel"))]
        let rows: Vec<_> = (0..n).map(row).collect();

        for (o, e) in out.iter_mut().zip(rows) {
            *o += e;
        }
    }

    /// Forces from the interaction of two sets of induced dipoles
    /// (u channel), scaled by `prefactor` and added into `forces`.
    ///
    /// The accumulated quantity is `prefactor * grad(sum_ij a_i . T_ij . b_j)`
    /// over unordered pairs, symmetrized over the two sets. Used both for the
    /// mutual part of the polarization gradient and for the extrapolated
    /// solver's cross terms.
    pub fn induced_pair_forces(
        &self,
        positions: &[Vector3<f64>],
        params: &[MultipoleParams],
        scales: &ScaleTables,
        a: &[Vector3<f64>],
        b_set: &[Vector3<f64>],
        prefactor: f64,
        forces: &mut [Vector3<f64>],
    ) {
        let n = positions.len();
        for i in 0..n {
            for j in (i + 1)..n {
                let rv = self.displacement(positions[i], positions[j]);
                let r2 = rv.norm_squared();
                if !self.within_cutoff(r2) {
                    continue;
                }
                let r = r2.sqrt();
                let scale = scales.pair(i, j);
                let damping = Damping::between(&params[i], &params[j]);
                let c = pair_coefficients(r, self.alpha, scale.u, Some(&damping));
                let pd_b = potential_derivs(rv, &dipole_source(b_set[j]), &c);
                let pd_a = potential_derivs(rv, &dipole_source(a[j]), &c);
                let f = -(pd_b.hess * a[i] + pd_a.hess * b_set[i])
                    * (0.5 * prefactor * ELECTRIC);
                forces[i] += f;
                forces[j] -= f;
            }
        }
    }

    /// Forces and frame torques from induced dipoles interacting with the
    /// permanent multipoles, added into the buffers.
    ///
    /// The polarization energy couples the d-converged dipoles to p-scaled
    /// fields and vice versa, so its exact gradient mixes the channels: each
    /// site acts through the effective dipoles `u_d/2` on the p channel and
    /// `u_p/2` on the d channel.
    pub fn permanent_induced_interactions(
        &self,
        positions: &[Vector3<f64>],
        multipoles: &[LabMultipole],
        params: &[MultipoleParams],
        scales: &ScaleTables,
        u_d: &[Vector3<f64>],
        u_p: &[Vector3<f64>],
        forces: &mut [Vector3<f64>],
        torques: &mut [Vector3<f64>],
    ) {
        let n = positions.len();
        for i in 0..n {
            for j in 0..n {
                if j == i {
                    continue;
                }
                let rv = self.displacement(positions[i], positions[j]);
                let r2 = rv.norm_squared();
                if !self.within_cutoff(r2) {
                    continue;
                }
                let r = r2.sqrt();
                let scale = scales.pair(i, j);
                let damping = Damping::between(&params[i], &params[j]);
                let b_p = pair_coefficients(r, self.alpha, scale.p, Some(&damping));
                let b_d = pair_coefficients(r, self.alpha, scale.d, Some(&damping));

                // Force on the induced site i from permanent j.
                let pd_p = potential_derivs(rv, &multipoles[j], &b_p);
                let pd_d = potential_derivs(rv, &multipoles[j], &b_d);
                let f = -(pd_p.hess * u_d[i] + pd_d.hess * u_p[i]) * (0.5 * ELECTRIC);
                forces[i] += f;
                forces[j] -= f;

                // Torque on permanent j from the mixed effective dipole at i.
                let rev_p = potential_derivs(-rv, &dipole_source(u_d[i] * 0.5), &b_p);
                let rev_d = potential_derivs(-rv, &dipole_source(u_p[i] * 0.5), &b_d);
                torques[j] += (torque_on(&multipoles[j], &rev_p)
                    + torque_on(&multipoles[j], &rev_d))
                    * ELECTRIC;
            }
        }
    }

    /// Electrostatic potential at arbitrary query points, in kcal/(mol e).
    ///
    /// Sources are the permanent multipoles plus, when given, the total
    /// induced dipoles. Query points are not particles, so no exclusion
    /// scaling applies.
    pub fn potential_at_points(
        &self,
        positions: &[Vector3<f64>],
        multipoles: &[LabMultipole],
        induced_total: Option<&[Vector3<f64>]>,
        points: &[Vector3<f64>],
    ) -> Vec<f64> {
        let row = |p: &Vector3<f64>| -> f64 {
            let mut phi = 0.0;
            for (j, mp) in multipoles.iter().enumerate() {
                let rv = self.displacement(*p, positions[j]);
                let r2 = rv.norm_squared();
                if !self.within_cutoff(r2) || r2 == 0.0 {
                    continue;
                }
                let b = screened_kernels(r2.sqrt(), self.alpha);
                phi += potential_derivs(rv, mp, &b).phi;
                if let Some(u) = induced_total {
                    phi += potential_derivs(rv, &dipole_source(u[j]), &b).phi;
                }
            }
            phi * ELECTRIC
        };

        #[cfg(feature = "parallel")]
        let out: Vec<f64> = points.par_iter().map(row).collect();
        #[cfg(not(feature = "parallel"))]
        let out: Vec<f64> = points.iter().map(row).collect();

        out
    }
}

/// Polarization energy `-1/2 sum_i u_d_i . E_p_i` in kcal/mol, with the
/// fields in e/A^2.
pub fn polarization_energy(u_d: &[Vector3<f64>], e_p: &[Vector3<f64>]) -> f64 {
    -0.5 * ELECTRIC
        * u_d
            .iter()
            .zip(e_p)
            .map(|(u, e)| u.dot(e))
            .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::MultipoleParams;

    fn full_scales(n: usize) -> ScaleTables {
        ScaleTables::full_strength(n)
    }

    fn point_charge_multipole(q: f64) -> LabMultipole {
        LabMultipole {
            charge: q,
            dipole: Vector3::zeros(),
            quadrupole: Matrix3::zeros(),
        }
    }

    fn sample_multipole(seed: f64) -> LabMultipole {
        // A traceless symmetric quadrupole and a skew dipole, deterministic
        // in the seed.
        let d = Vector3::new(0.3 * seed, -0.2, 0.15 * seed);
        let q = Matrix3::new(
            0.1 * seed, 0.05, -0.02, //
            0.05, -0.04 * seed, 0.03, //
            -0.02, 0.03, -0.1 * seed + 0.04 * seed,
        );
        let q = (q + q.transpose()) * 0.5;
        let q = q - Matrix3::identity() * (q.trace() / 3.0);
        LabMultipole {
            charge: 0.2 * seed,
            dipole: d,
            quadrupole: q,
        }
    }

    #[test]
    fn bare_kernels_match_double_factorial_series() {
        let r: f64 = 1.7;
        let b = bare_kernels(r);
        assert!((b[0] - 1.0 / r).abs() < 1e-14);
        assert!((b[1] - 1.0 / r.powi(3)).abs() < 1e-14);
        assert!((b[2] - 3.0 / r.powi(5)).abs() < 1e-14);
        assert!((b[3] - 15.0 / r.powi(7)).abs() < 1e-14);
        assert!((b[4] - 105.0 / r.powi(9)).abs() < 1e-14);
        assert!((b[5] - 945.0 / r.powi(11)).abs() < 1e-15);
    }

    #[test]
    fn screened_kernels_reduce_to_bare_at_zero_alpha() {
        let b = screened_kernels(2.3, 0.0);
        let rr = bare_kernels(2.3);
        for k in 0..6 {
            assert!((b[k] - rr[k]).abs() < 1e-14);
        }
    }

    #[test]
    fn screened_kernel_zero_order_is_complementary_error_function() {
        let (r, alpha) = (3.1, 0.4);
        let b = screened_kernels(r, alpha);
        assert!((b[0] - libm::erfc(alpha * r) / r).abs() < 1e-14);
    }

    #[test]
    fn screened_plus_excluded_reconstructs_bare() {
        // scale = 1 with Ewald screening must give bn; scale = 1 without
        // screening must give the bare kernels.
        let c = pair_coefficients(2.0, 0.0, 1.0, None);
        let rr = bare_kernels(2.0);
        for k in 0..6 {
            assert!((c[k] - rr[k]).abs() < 1e-14);
        }
    }

    #[test]
    fn fully_excluded_open_pair_has_zero_coefficients() {
        let c = pair_coefficients(1.5, 0.0, 0.0, None);
        for k in 0..6 {
            assert!(c[k].abs() < 1e-14);
        }
    }

    #[test]
    fn thole_factors_grow_toward_unity() {
        let damping = Damping {
            thole: 0.39,
            radius_product: 1.5,
        };
        let near = damping.factors(0.5);
        let far = damping.factors(6.0);
        for k in 0..4 {
            // The seventh-order factor undershoots zero by O(1e-5) at very
            // short range before turning toward unity.
            assert!(near[k] > -1e-4 && near[k] < 1.0);
            assert!(far[k] > near[k]);
            assert!(far[k] <= 1.0 + 1e-12);
        }
    }

    #[test]
    fn point_charges_follow_coulombs_law() {
        let positions = vec![Vector3::zeros(), Vector3::new(0.0, 0.0, 2.5)];
        let multipoles = vec![point_charge_multipole(0.7), point_charge_multipole(-0.4)];
        let mut forces = vec![Vector3::zeros(); 2];
        let mut torques = vec![Vector3::zeros(); 2];
        let energy = RealSpace::open().permanent_interactions(
            &positions,
            &multipoles,
            &full_scales(2),
            &mut forces,
            &mut torques,
        );
        let expected = ELECTRIC * 0.7 * (-0.4) / 2.5;
        assert!((energy - expected).abs() < 1e-10);
        // Attractive: force on particle 0 points toward particle 1 (+z).
        let f_mag = ELECTRIC * 0.7 * 0.4 / (2.5 * 2.5);
        assert!((forces[0].z - f_mag).abs() < 1e-10);
        assert!((forces[0] + forces[1]).norm() < 1e-12);
        assert!(torques[0].norm() < 1e-14);
    }

    #[test]
    fn charge_dipole_energy_matches_closed_form() {
        let positions = vec![Vector3::zeros(), Vector3::new(1.0, 2.0, -1.5)];
        let d = Vector3::new(0.2, -0.1, 0.3);
        let multipoles = vec![
            point_charge_multipole(0.5),
            LabMultipole {
                charge: 0.0,
                dipole: d,
                quadrupole: Matrix3::zeros(),
            },
        ];
        let mut forces = vec![Vector3::zeros(); 2];
        let mut torques = vec![Vector3::zeros(); 2];
        let energy = RealSpace::open().permanent_interactions(
            &positions,
            &multipoles,
            &full_scales(2),
            &mut forces,
            &mut torques,
        );
        // U = -q (d . rv) / r^3 with rv from the charge to the dipole.
        let rv = positions[1] - positions[0];
        let expected = -ELECTRIC * 0.5 * d.dot(&rv) / rv.norm().powi(3);
        assert!((energy - expected).abs() < 1e-10);
    }

    #[test]
    fn forces_are_the_gradient_of_the_energy() {
        let mut positions = vec![Vector3::new(0.1, -0.3, 0.2), Vector3::new(1.9, 1.1, -0.7)];
        let multipoles = vec![sample_multipole(1.0), sample_multipole(-0.7)];
        let scales = full_scales(2);
        let space = RealSpace::open();

        let energy_of = |positions: &[Vector3<f64>]| -> f64 {
            let mut f = vec![Vector3::zeros(); 2];
            let mut t = vec![Vector3::zeros(); 2];
            space.permanent_interactions(positions, &multipoles, &scales, &mut f, &mut t)
        };

        let mut forces = vec![Vector3::zeros(); 2];
        let mut torques = vec![Vector3::zeros(); 2];
        space.permanent_interactions(&positions, &multipoles, &scales, &mut forces, &mut torques);

        let h = 1e-5;
        for axis in 0..3 {
            let orig = positions[0][axis];
            positions[0][axis] = orig + h;
            let e_plus = energy_of(&positions);
            positions[0][axis] = orig - h;
            let e_minus = energy_of(&positions);
            positions[0][axis] = orig;
            let numeric = -(e_plus - e_minus) / (2.0 * h);
            assert!(
                (forces[0][axis] - numeric).abs() < 1e-5,
                "axis {axis}: analytic {} vs numeric {numeric}",
                forces[0][axis]
            );
        }
    }

    #[test]
    fn pair_conserves_angular_momentum() {
        let positions = vec![Vector3::new(0.4, 0.0, -0.2), Vector3::new(-1.2, 2.0, 1.1)];
        let multipoles = vec![sample_multipole(0.8), sample_multipole(1.3)];
        let mut forces = vec![Vector3::zeros(); 2];
        let mut torques = vec![Vector3::zeros(); 2];
        RealSpace::open().permanent_interactions(
            &positions,
            &multipoles,
            &full_scales(2),
            &mut forces,
            &mut torques,
        );
        // Total torque about particle 1: frame torques plus the moment of
        // the force couple must vanish for an isolated pair.
        let total =
            torques[0] + torques[1] + (positions[0] - positions[1]).cross(&forces[0]);
        assert!(total.norm() < 1e-9, "residual torque {total:?}");
    }

    #[test]
    fn permanent_field_of_a_charge_is_radial() {
        let positions = vec![Vector3::zeros(), Vector3::new(0.0, 3.0, 0.0)];
        let multipoles = vec![point_charge_multipole(1.0), point_charge_multipole(0.0)];
        let params = vec![
            MultipoleParams::point_charge(1.0),
            MultipoleParams::point_charge(0.0),
        ];
        let (e_d, e_p) =
            RealSpace::open().permanent_fields(&positions, &multipoles, &params, &full_scales(2));
        // Field at site 1 from a unit charge at the origin: (1/9) along +y.
        assert!((e_d[1].y - 1.0 / 9.0).abs() < 1e-12);
        assert!(e_d[1].x.abs() < 1e-14 && e_d[1].z.abs() < 1e-14);
        assert_eq!(e_d[1], e_p[1]);
    }

    #[test]
    fn induced_field_matches_dipole_formula() {
        let positions = vec![Vector3::zeros(), Vector3::new(0.0, 0.0, 2.0)];
        let params = vec![
            MultipoleParams::point_charge(0.0),
            MultipoleParams::point_charge(0.0),
        ];
        let u = vec![Vector3::new(0.0, 0.0, 0.1), Vector3::zeros()];
        let mut out = vec![Vector3::zeros(); 2];
        RealSpace::open().induced_dipole_field(
            &positions,
            &params,
            &full_scales(2),
            &u,
            &mut out,
        );
        // On-axis field of a dipole: E_z = 2 u / r^3 (undamped since both
        // sites have zero polarizability).
        assert!((out[1].z - 2.0 * 0.1 / 8.0).abs() < 1e-12);
        // Site 1 carries no dipole, so nothing acts back on site 0.
        assert!(out[0].norm() < 1e-14);
    }

    #[test]
    fn potential_at_point_matches_coulomb() {
        let positions = vec![Vector3::zeros()];
        let multipoles = vec![point_charge_multipole(0.5)];
        let phi = RealSpace::open().potential_at_points(
            &positions,
            &multipoles,
            None,
            &[Vector3::new(0.0, 0.0, 4.0)],
        );
        assert!((phi[0] - ELECTRIC * 0.5 / 4.0).abs() < 1e-10);
    }

    #[test]
    fn minimum_image_is_applied_to_pairs() {
        let cell = PeriodicBox::new(10.0, 10.0, 10.0);
        let space = RealSpace::ewald(0.0, 4.0, cell);
        // 9 A apart directly, but 1 A through the boundary.
        let positions = vec![Vector3::new(0.5, 0.0, 0.0), Vector3::new(9.5, 0.0, 0.0)];
        let multipoles = vec![point_charge_multipole(1.0), point_charge_multipole(1.0)];
        let mut forces = vec![Vector3::zeros(); 2];
        let mut torques = vec![Vector3::zeros(); 2];
        let energy = space.permanent_interactions(
            &positions,
            &multipoles,
            &full_scales(2),
            &mut forces,
            &mut torques,
        );
        assert!((energy - ELECTRIC).abs() < 1e-10);
    }

    #[test]
    fn polarization_energy_sign_convention() {
        let u = vec![Vector3::new(0.0, 0.0, 0.01)];
        let e = vec![Vector3::new(0.0, 0.0, 0.2)];
        let epol = polarization_energy(&u, &e);
        assert!((epol + 0.5 * ELECTRIC * 0.002).abs() < 1e-12);
        assert!(epol < 0.0);
    }
}
