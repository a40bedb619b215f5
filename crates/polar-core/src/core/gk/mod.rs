//! Generalized Kirkwood implicit solvent.
//!
//! Born radii follow the Grycuk integral formulation: the inverse-cube radius
//! is the base value minus a pairwise descreening sum, with a tabulated neck
//! correction for the solvent-excluded region between nearby spheres and an
//! optional tanh rescaling that caps the radius at the tabulated maximum.
//!
//! The solvation energy couples site charges and dipoles through the
//! generalized Born kernel `f = sqrt(r^2 + Bi Bj exp(-r^2 / (c Bi Bj)))`
//! with the Kirkwood dielectric factor of the matching multipole order.
//! The permanent, permanent-induced, and induced-induced couplings are
//! separate gradient passes that accumulate a shared `dE/dB` buffer; each
//! carries its explicit position dependence, and a final chain-rule pass
//! converts the Born-radius derivatives into forces. Dipole sites feel the
//! reaction field as a frame torque.

pub mod neck;

use super::field::ELECTRIC;
use super::models::LabMultipole;
use nalgebra::Vector3;
use neck::{neck_value, NeckTableError, NeckTables};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Gaussian cross-term exponent of the generalized Born kernel.
const GK_C: f64 = 2.455;
/// Cap applied when a descreening sum drives the inverse cube negative.
const MAX_BORN_RADIUS: f64 = 30.0;
/// Tanh rescaling shape parameters.
const TANH_BETA: [f64; 3] = [0.9563, 0.2578, 0.0810];

const FOUR_PI: f64 = 4.0 * std::f64::consts::PI;

#[derive(Debug, Error)]
pub enum GkError {
    #[error("neck tables failed to load: {0}")]
    NeckTables(&'static NeckTableError),
    #[error("particle {index} has non-positive Born base radius {radius}")]
    InvalidRadius { index: usize, radius: f64 },
}

/// Per-particle solvation parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GkParticle {
    /// Base (intrinsic) Born radius, in angstroms.
    pub radius: f64,
    /// Factor applied to the radius when this particle descreens others.
    pub descreen_scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GkSettings {
    pub solvent_dielectric: f64,
    pub solute_dielectric: f64,
    pub tanh_rescaling: bool,
    pub neck_correction: bool,
    pub include_cavity_term: bool,
    /// Solvent probe radius for the cavity term, in angstroms.
    pub probe_radius: f64,
    /// Cavity surface tension, in kcal/(mol A^2).
    pub surface_tension: f64,
}

impl Default for GkSettings {
    fn default() -> Self {
        Self {
            solvent_dielectric: 78.3,
            solute_dielectric: 1.0,
            tanh_rescaling: true,
            neck_correction: true,
            include_cavity_term: true,
            probe_radius: 1.4,
            surface_tension: 0.0054,
        }
    }
}

/// Born radii with the per-particle chain factor `dB/dnu`, where `nu` is the
/// scaled descreening sum.
pub struct BornRadii {
    pub radii: Vec<f64>,
    chain: Vec<f64>,
}

/// Pairwise descreening integral of `1/s^6` over the scaled sphere of radius
/// `s` at distance `r`, excluding the region inside the base radius `rho`,
/// together with its radial derivative.
fn descreen_integral(r: f64, s: f64, rho: f64) -> (f64, f64) {
    if s <= 0.0 || rho >= r + s {
        return (0.0, 0.0);
    }
    let b = r + s;
    let (mut value, mut deriv) = (0.0, 0.0);

    let (a, da_dr) = if r < s {
        let edge = s - r;
        if rho < edge {
            // The base sphere is engulfed: complete shells from rho to the
            // inner edge contribute in full.
            value += FOUR_PI / 3.0 * (rho.powi(-3) - edge.powi(-3));
            deriv += -FOUR_PI * edge.powi(-4);
            (edge, -1.0)
        } else {
            (rho, 0.0)
        }
    } else {
        let inner = r - s;
        if rho < inner {
            (inner, 1.0)
        } else {
            (rho, 0.0)
        }
    };
    if a >= b {
        return (value, deriv);
    }

    let pi = std::f64::consts::PI;
    let (b3, b4, b2) = (b.powi(-3), b.powi(-4), b.powi(-2));
    let (a3, a4, a2) = (a.powi(-3), a.powi(-4), a.powi(-2));

    value += -(2.0 * pi / 3.0) * (b3 - a3);
    deriv += 2.0 * pi * (b4 - a4 * da_dr);

    let c2 = (r * r - s * s) / r;
    let dc2 = 1.0 + (s * s) / (r * r);
    value += (pi / 4.0) * c2 * (b4 - a4);
    deriv += (pi / 4.0)
        * (dc2 * (b4 - a4) + c2 * (-4.0 * b.powi(-5) + 4.0 * a.powi(-5) * da_dr));

    value += (pi / 2.0) / r * (b2 - a2);
    deriv += (pi / 2.0)
        * (-(b2 - a2) / (r * r) + (-2.0 * b3 + 2.0 * a3 * da_dr) / r);

    (value, deriv)
}

/// Dielectric factor for multipole order `l`.
fn kirkwood_factor(l: i32, solvent: f64, solute: f64) -> f64 {
    let lf = l as f64;
    ELECTRIC * (lf + 1.0) * (solute - solvent) / (solute * ((lf + 1.0) * solvent + lf * solute))
}

pub struct GkModel {
    settings: GkSettings,
    particles: Vec<GkParticle>,
    tables: &'static NeckTables,
    /// Charge (l = 0) and dipole (l = 1) Kirkwood factors, with the
    /// symmetrized cross factor between them.
    f0: f64,
    f1: f64,
    f01: f64,
}

impl GkModel {
    pub fn new(settings: GkSettings, particles: Vec<GkParticle>) -> Result<Self, GkError> {
        for (index, p) in particles.iter().enumerate() {
            if !(p.radius > 0.0) {
                return Err(GkError::InvalidRadius {
                    index,
                    radius: p.radius,
                });
            }
        }
        let tables = NeckTables::load().map_err(GkError::NeckTables)?;
        let f0 = kirkwood_factor(0, settings.solvent_dielectric, settings.solute_dielectric);
        let f1 = kirkwood_factor(1, settings.solvent_dielectric, settings.solute_dielectric);
        Ok(Self {
            settings,
            particles,
            tables,
            f0,
            f1,
            f01: 0.5 * (f0 + f1),
        })
    }

    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }

    fn descreen_radius(&self, j: usize) -> f64 {
        self.particles[j].radius * self.particles[j].descreen_scale
    }

    /// Descreening sum and its conversion into Born radii.
    pub fn born_radii(&self, positions: &[Vector3<f64>]) -> BornRadii {
        let n = self.particles.len();
        let mut radii = Vec::with_capacity(n);
        let mut chain = Vec::with_capacity(n);
        for i in 0..n {
            let rho = self.particles[i].radius;
            let mut psi = 0.0;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let r = (positions[i] - positions[j]).norm();
                let (iv, _) = descreen_integral(r, self.descreen_radius(j), rho);
                psi += iv;
                if self.settings.neck_correction {
                    let (nv, _) =
                        neck_value(self.tables, rho, self.particles[j].radius, r);
                    psi += nv;
                }
            }
            let nu = 3.0 / FOUR_PI * psi;
            let rho3 = rho.powi(-3);
            let (inv3, dinv3_dnu) = if self.settings.tanh_rescaling {
                let cap = rho3 - MAXIMUM_RESCALE_INV3;
                let w = nu / cap;
                let t = TANH_BETA[0] * w - TANH_BETA[1] * w * w + TANH_BETA[2] * w * w * w;
                let tanh_t = t.tanh();
                let sech2 = 1.0 - tanh_t * tanh_t;
                let dt_dw = TANH_BETA[0] - 2.0 * TANH_BETA[1] * w + 3.0 * TANH_BETA[2] * w * w;
                (rho3 - cap * tanh_t, -sech2 * dt_dw)
            } else {
                (rho3 - nu, -1.0)
            };
            if inv3 > MAX_BORN_RADIUS.powi(-3) {
                let b = inv3.powf(-1.0 / 3.0);
                // dB/dnu = -(1/3) inv3^(-4/3) * dinv3/dnu.
                chain.push(-b.powi(4) / 3.0 * dinv3_dnu);
                radii.push(b);
            } else {
                // Overflowed radii are pinned at the cap with no gradient.
                chain.push(0.0);
                radii.push(MAX_BORN_RADIUS);
            }
        }
        debug!(
            min = radii.iter().cloned().fold(f64::INFINITY, f64::min),
            max = radii.iter().cloned().fold(0.0, f64::max),
            "computed born radii"
        );
        BornRadii { radii, chain }
    }

    /// Reaction field of a set of site dipoles at every site, added into
    /// `out`, in e/A^2 scaled by the dipole Kirkwood factor over ELECTRIC
    /// so it composes with the vacuum fields.
    pub fn reaction_field(
        &self,
        positions: &[Vector3<f64>],
        born: &BornRadii,
        dipoles: &[Vector3<f64>],
        out: &mut [Vector3<f64>],
    ) {
        let n = positions.len();
        let f1 = self.f1 / ELECTRIC;
        for i in 0..n {
            let mut e = Vector3::zeros();
            for j in 0..n {
                if j == i {
                    // Self reaction of the site's own dipole.
                    let g0 = (1.0 - 1.0 / GK_C) / born.radii[i].powi(3);
                    e -= dipoles[i] * (f1 * g0);
                    continue;
                }
                let rv = positions[i] - positions[j];
                let k = PairKernel::new(rv, born.radii[i], born.radii[j]);
                e -= (dipoles[j] * k.g + rv * (2.0 * dipoles[j].dot(&rv) * k.gp)) * f1;
            }
            out[i] += e;
        }
    }

    /// Reaction field of the permanent charges and dipoles, the fixed-field
    /// contribution driving polarization, in e/A^2 scaled as in
    /// [`Self::reaction_field`].
    pub fn fixed_reaction_field(
        &self,
        positions: &[Vector3<f64>],
        born: &BornRadii,
        multipoles: &[LabMultipole],
        out: &mut [Vector3<f64>],
    ) {
        let n = positions.len();
        let f01 = self.f01 / ELECTRIC;
        let f1 = self.f1 / ELECTRIC;
        for i in 0..n {
            let mut e = Vector3::zeros();
            for j in 0..n {
                if j == i {
                    let g0 = (1.0 - 1.0 / GK_C) / born.radii[i].powi(3);
                    e -= multipoles[i].dipole * (f1 * g0);
                    continue;
                }
                let rv = positions[i] - positions[j];
                let k = PairKernel::new(rv, born.radii[i], born.radii[j]);
                e += rv * (f01 * multipoles[j].charge * k.g);
                let d = multipoles[j].dipole;
                e -= (d * k.g + rv * (2.0 * d.dot(&rv) * k.gp)) * f1;
            }
            out[i] += e;
        }
    }

    /// Solvation energy of the permanent multipoles with explicit-position
    /// forces and frame torques, in kcal/mol. Born-radius derivatives are
    /// accumulated into `de_db` for one chain-rule pass at the end; the
    /// caller finishes with [`Self::distribute_born_forces`].
    pub fn permanent_energy_forces(
        &self,
        positions: &[Vector3<f64>],
        born: &BornRadii,
        multipoles: &[LabMultipole],
        forces: &mut [Vector3<f64>],
        torques: &mut [Vector3<f64>],
        de_db: &mut [f64],
    ) -> f64 {
        let n = positions.len();
        let mut energy = 0.0;

        for i in 0..n {
            // Self terms, halved by the double-sum convention. A dipole
            // exerts no torque through its own isotropic reaction factor.
            let b = born.radii[i];
            let q = multipoles[i].charge;
            let mu = multipoles[i].dipole;
            let g0 = (1.0 - 1.0 / GK_C) / b.powi(3);
            energy += 0.5 * (self.f0 * q * q / b + self.f1 * mu.norm_squared() * g0);
            de_db[i] += 0.5
                * (-self.f0 * q * q / (b * b)
                    - 3.0 * self.f1 * mu.norm_squared() * g0 / b);

            for j in (i + 1)..n {
                let rv = positions[i] - positions[j];
                let k = PairKernel::new(rv, born.radii[i], born.radii[j]);
                let (qi, qj) = (multipoles[i].charge, multipoles[j].charge);
                let (mi, mj) = (multipoles[i].dipole, multipoles[j].dipole);
                let (mi_r, mj_r) = (mi.dot(&rv), mj.dot(&rv));

                energy += self.f0 * qi * qj * k.one_over_f
                    + self.f01 * (qi * mj_r - qj * mi_r) * k.g
                    + self.f1 * (mi.dot(&mj) * k.g + 2.0 * mi_r * mj_r * k.gp);

                // Position gradient at fixed Born radii.
                let mut grad = rv * (-self.f0 * qi * qj * k.g);
                grad += (rv * (2.0 * (qi * mj_r - qj * mi_r) * k.gp)
                    + (mj * qi - mi * qj) * k.g)
                    * self.f01;
                grad += (rv * (2.0 * mi.dot(&mj) * k.gp)
                    + (mi * mj_r + mj * mi_r) * (2.0 * k.gp)
                    + rv * (4.0 * mi_r * mj_r * k.gpp))
                    * self.f1;
                forces[i] -= grad;
                forces[j] += grad;

                // Born-radius dependence through the kernel product.
                let de_dp = self.f0 * qi * qj * k.d_one_over_f
                    + self.f01 * (qi * mj_r - qj * mi_r) * k.dg
                    + self.f1 * (mi.dot(&mj) * k.dg + 2.0 * mi_r * mj_r * k.dgp);
                de_db[i] += de_dp * born.radii[j];
                de_db[j] += de_dp * born.radii[i];

                // Reaction-field torques on the permanent dipoles.
                let e_at_i =
                    rv * (self.f01 * qj * k.g) - (mj * k.g + rv * (2.0 * mj_r * k.gp)) * self.f1;
                let e_at_j =
                    -rv * (self.f01 * qi * k.g) - (mi * k.g + rv * (2.0 * mi_r * k.gp)) * self.f1;
                torques[i] += multipoles[i].dipole.cross(&e_at_i);
                torques[j] += multipoles[j].dipole.cross(&e_at_j);
            }
        }

        if self.settings.include_cavity_term {
            energy += self.cavity_energy(born, de_db);
        }
        energy
    }

    /// Gradients of the reaction-field coupling between the permanent
    /// multipoles and the induced dipoles, taken at fixed dipoles.
    ///
    /// The coupling energy rides inside the polarization energy via
    /// [`Self::fixed_reaction_field`] at half weight, but the stationarity
    /// of the induced dipoles doubles the fixed-field term in the gradient,
    /// so the coupling differentiates at full weight here. `induced` is the
    /// channel mean.
    pub fn permanent_induced_gradient(
        &self,
        positions: &[Vector3<f64>],
        born: &BornRadii,
        multipoles: &[LabMultipole],
        induced: &[Vector3<f64>],
        forces: &mut [Vector3<f64>],
        torques: &mut [Vector3<f64>],
        de_db: &mut [f64],
    ) {
        let n = positions.len();
        for i in 0..n {
            let b = born.radii[i];
            let g0 = (1.0 - 1.0 / GK_C) / b.powi(3);
            let (di, ui) = (multipoles[i].dipole, induced[i]);
            de_db[i] += -3.0 * self.f1 * ui.dot(&di) * g0 / b;
            torques[i] += di.cross(&(-ui * (self.f1 * g0)));

            for j in (i + 1)..n {
                let rv = positions[i] - positions[j];
                let k = PairKernel::new(rv, born.radii[i], born.radii[j]);
                let (qi, qj) = (multipoles[i].charge, multipoles[j].charge);
                let (di, dj) = (multipoles[i].dipole, multipoles[j].dipole);
                let (ui, uj) = (induced[i], induced[j]);
                let (ui_r, uj_r) = (ui.dot(&rv), uj.dot(&rv));
                let (di_r, dj_r) = (di.dot(&rv), dj.dot(&rv));

                // Coupling a g + f1 s1 g + 2 f1 s2 gp per pair.
                let a = self.f01 * (qi * uj_r - qj * ui_r);
                let s1 = ui.dot(&dj) + di.dot(&uj);
                let s2 = ui_r * dj_r + di_r * uj_r;

                let mut grad = (uj * qi - ui * qj) * (self.f01 * k.g) + rv * (2.0 * a * k.gp);
                grad += (rv * (2.0 * s1 * k.gp)
                    + (ui * dj_r + dj * ui_r + di * uj_r + uj * di_r) * (2.0 * k.gp)
                    + rv * (4.0 * s2 * k.gpp))
                    * self.f1;
                forces[i] -= grad;
                forces[j] += grad;

                let de_dp = a * k.dg + self.f1 * (s1 * k.dg + 2.0 * s2 * k.dgp);
                de_db[i] += de_dp * born.radii[j];
                de_db[j] += de_dp * born.radii[i];

                // Reaction field of the induced dipoles on the frames.
                let e_at_i = -(uj * k.g + rv * (2.0 * uj_r * k.gp)) * self.f1;
                let e_at_j = -(ui * k.g + rv * (2.0 * ui_r * k.gp)) * self.f1;
                torques[i] += di.cross(&e_at_i);
                torques[j] += dj.cross(&e_at_j);
            }
        }
    }

    /// Gradients of the induced-induced reaction coupling, weighted.
    ///
    /// The two sets are the d- and p-channel dipoles, or a cross-order pair
    /// with its tail-sum weight for the extrapolated solver.
    pub fn mutual_induced_gradient(
        &self,
        positions: &[Vector3<f64>],
        born: &BornRadii,
        u_a: &[Vector3<f64>],
        u_b: &[Vector3<f64>],
        weight: f64,
        forces: &mut [Vector3<f64>],
        de_db: &mut [f64],
    ) {
        let n = positions.len();
        for i in 0..n {
            let b = born.radii[i];
            let g0 = (1.0 - 1.0 / GK_C) / b.powi(3);
            de_db[i] += -1.5 * weight * self.f1 * u_a[i].dot(&u_b[i]) * g0 / b;

            for j in (i + 1)..n {
                let rv = positions[i] - positions[j];
                let k = PairKernel::new(rv, born.radii[i], born.radii[j]);
                let (ai_r, aj_r) = (u_a[i].dot(&rv), u_a[j].dot(&rv));
                let (bi_r, bj_r) = (u_b[i].dot(&rv), u_b[j].dot(&rv));
                let s1 = u_a[i].dot(&u_b[j]) + u_b[i].dot(&u_a[j]);
                let s2 = ai_r * bj_r + bi_r * aj_r;

                let mut grad = rv * (2.0 * s1 * k.gp)
                    + (u_a[i] * bj_r + u_b[j] * ai_r + u_b[i] * aj_r + u_a[j] * bi_r)
                        * (2.0 * k.gp)
                    + rv * (4.0 * s2 * k.gpp);
                grad *= 0.5 * weight * self.f1;
                forces[i] -= grad;
                forces[j] += grad;

                let de_dp = 0.5 * weight * self.f1 * (s1 * k.dg + 2.0 * s2 * k.dgp);
                de_db[i] += de_dp * born.radii[j];
                de_db[j] += de_dp * born.radii[i];
            }
        }
    }

    /// ACE-style cavity term, accumulating its Born-radius derivative.
    fn cavity_energy(&self, born: &BornRadii, de_db: &mut [f64]) -> f64 {
        let mut energy = 0.0;
        for (i, p) in self.particles.iter().enumerate() {
            let reff = p.radius + self.settings.probe_radius;
            let ratio = p.radius / born.radii[i];
            let e = self.settings.surface_tension * FOUR_PI * reff * reff * ratio.powi(6);
            energy += e;
            de_db[i] += -6.0 * e / born.radii[i];
        }
        energy
    }

    /// Chain-rules the accumulated `dE/dB` through the descreening geometry
    /// into forces, once all energy passes have contributed.
    pub fn distribute_born_forces(
        &self,
        positions: &[Vector3<f64>],
        born: &BornRadii,
        de_db: &[f64],
        forces: &mut [Vector3<f64>],
    ) {
        let n = positions.len();
        for i in 0..n {
            let weight = de_db[i] * born.chain[i] * 3.0 / FOUR_PI;
            if weight == 0.0 {
                continue;
            }
            let rho = self.particles[i].radius;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let rv = positions[i] - positions[j];
                let r = rv.norm();
                let (_, mut dpsi) = descreen_integral(r, self.descreen_radius(j), rho);
                if self.settings.neck_correction {
                    let (_, nd) = neck_value(self.tables, rho, self.particles[j].radius, r);
                    dpsi += nd;
                }
                if dpsi == 0.0 {
                    continue;
                }
                let f = rv * (weight * dpsi / r);
                forces[i] -= f;
                forces[j] += f;
            }
        }
    }
}

/// Tanh rescaling asymptote: the rescaled inverse cube approaches the
/// tabulated maximum neck radius from above.
const MAXIMUM_RESCALE_INV3: f64 = 1.0 / (neck::MAXIMUM_NECK_RADIUS
    * neck::MAXIMUM_NECK_RADIUS
    * neck::MAXIMUM_NECK_RADIUS);

/// Generalized Born pair kernel and the derivatives the energy needs:
/// with respect to `r` (through `g`, `gp`, `gpp`, all per `d(r^2)`) and with
/// respect to the Born radius product (`d_*` fields).
struct PairKernel {
    one_over_f: f64,
    g: f64,
    gp: f64,
    gpp: f64,
    d_one_over_f: f64,
    dg: f64,
    dgp: f64,
}

impl PairKernel {
    fn new(rv: Vector3<f64>, bi: f64, bj: f64) -> Self {
        let r2 = rv.norm_squared();
        let p = bi * bj;
        let e = (-r2 / (GK_C * p)).exp();
        let f2 = r2 + p * e;
        let f = f2.sqrt();
        let (f3, f5, f7) = (f2 * f, f2 * f2 * f, f2 * f2 * f2 * f);
        let ec = 1.0 - e / GK_C;

        let g = ec / f3;
        let gp = e / (GK_C * GK_C * p) / f3 - 1.5 * ec * ec / f5;
        let gpp = -e / (GK_C.powi(3) * p * p) / f3 - 4.5 * e * ec / (GK_C * GK_C * p) / f5
            + 3.75 * ec * ec * ec / f7;

        // Derivatives in the Born product at fixed r^2.
        let df2_dp = e * (1.0 + r2 / (GK_C * p));
        let de_dp = e * r2 / (GK_C * p * p);
        let d_one_over_f = -0.5 * df2_dp / f3;
        let dg = (-de_dp / GK_C) / f3 - 1.5 * ec * df2_dp / f5;
        let dgp = (de_dp / (GK_C * GK_C * p) - e / (GK_C * GK_C * p * p)) / f3
            - 1.5 * (e / (GK_C * GK_C * p)) * df2_dp / f5
            + 3.0 * ec * (de_dp / GK_C) / f5
            + 3.75 * ec * ec * df2_dp / f7;

        Self {
            one_over_f: 1.0 / f,
            g,
            gp,
            gpp,
            d_one_over_f,
            dg,
            dgp,
        }
    }
}
