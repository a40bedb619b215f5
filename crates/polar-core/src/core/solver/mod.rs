//! Self-consistent induced dipoles.
//!
//! Each polarizable site carries two induced dipole sets, one driven by the
//! d-scaled fixed field and one by the p-scaled field; both satisfy
//! `u = alpha (E_fixed + T u)` with the same mutual coupling `T`. The solver
//! is agnostic to how that coupling is evaluated: the caller supplies a
//! closure producing the mutual fields of both sets at once, which lets the
//! periodic path fold its reciprocal-space work for the two sets into one
//! transform.

pub mod diis;
pub mod extrapolation;

use diis::DiisAccelerator;
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Conversion from e*A to Debye.
pub const DEBYE: f64 = 4.80321;

/// Residual history depth for DIIS.
const MAX_DIIS_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarization {
    /// No mutual coupling: `u = alpha E_fixed`.
    Direct,
    /// Full self-consistent iteration with DIIS acceleration.
    Mutual,
    /// Fixed-order perturbation expansion with coefficient extrapolation.
    Extrapolated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub polarization: Polarization,
    /// Convergence target for the induced-dipole RMS change, in Debye.
    pub target_epsilon: f64,
    pub max_iterations: usize,
    /// Extrapolation coefficients for [`Polarization::Extrapolated`].
    pub coefficients: Vec<f64>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            polarization: Polarization::Mutual,
            target_epsilon: 1e-5,
            max_iterations: 60,
            coefficients: extrapolation::OPT_COEFFICIENTS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScfDiagnostics {
    pub iterations: usize,
    pub converged: bool,
    /// RMS dipole change of the last iteration, in Debye.
    pub residual: f64,
}

/// Converged (or extrapolated) induced dipoles for both exclusion channels.
pub struct ScfSolution {
    pub u_d: Vec<Vector3<f64>>,
    pub u_p: Vec<Vector3<f64>>,
    /// Per-order dipoles, retained only by the extrapolated path for its
    /// cross-order force terms.
    pub orders_d: Vec<Vec<Vector3<f64>>>,
    pub orders_p: Vec<Vec<Vector3<f64>>>,
    pub diagnostics: ScfDiagnostics,
}

fn induce(polarizabilities: &[f64], field: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    polarizabilities
        .iter()
        .zip(field)
        .map(|(&a, e)| e * a)
        .collect()
}

fn pack(u_d: &[Vector3<f64>], u_p: &[Vector3<f64>]) -> DVector<f64> {
    let mut v = DVector::zeros(6 * u_d.len());
    for (i, (d, p)) in u_d.iter().zip(u_p).enumerate() {
        for a in 0..3 {
            v[6 * i + a] = d[a];
            v[6 * i + 3 + a] = p[a];
        }
    }
    v
}

fn unpack(v: &DVector<f64>, u_d: &mut [Vector3<f64>], u_p: &mut [Vector3<f64>]) {
    for i in 0..u_d.len() {
        for a in 0..3 {
            u_d[i][a] = v[6 * i + a];
            u_p[i][a] = v[6 * i + 3 + a];
        }
    }
}

/// Solves for the induced dipoles given the fixed fields of the permanent
/// multipoles (d and p channels, in e/A^2).
///
/// `mutual_fields` evaluates the field of both induced sets at every site.
/// Non-convergence of the mutual path is reported in the diagnostics and
/// logged, never fatal; the last iterate is returned.
pub fn solve<F>(
    polarizabilities: &[f64],
    e_d: &[Vector3<f64>],
    e_p: &[Vector3<f64>],
    settings: &SolverSettings,
    mut mutual_fields: F,
) -> ScfSolution
where
    F: FnMut(&[Vector3<f64>], &[Vector3<f64>]) -> (Vec<Vector3<f64>>, Vec<Vector3<f64>>),
{
    let n = polarizabilities.len();
    let mut u_d = induce(polarizabilities, e_d);
    let mut u_p = induce(polarizabilities, e_p);

    match settings.polarization {
        Polarization::Direct => ScfSolution {
            u_d,
            u_p,
            orders_d: Vec::new(),
            orders_p: Vec::new(),
            diagnostics: ScfDiagnostics {
                iterations: 0,
                converged: true,
                residual: 0.0,
            },
        },
        Polarization::Extrapolated => {
            let m = settings.coefficients.len();
            let mut orders_d = vec![u_d.clone()];
            let mut orders_p = vec![u_p.clone()];
            for order in 1..m {
                let (t_d, t_p) = mutual_fields(&orders_d[order - 1], &orders_p[order - 1]);
                orders_d.push(induce(polarizabilities, &t_d));
                orders_p.push(induce(polarizabilities, &t_p));
            }
            let u_d = extrapolation::combine(&orders_d, &settings.coefficients);
            let u_p = extrapolation::combine(&orders_p, &settings.coefficients);
            ScfSolution {
                u_d,
                u_p,
                orders_d,
                orders_p,
                diagnostics: ScfDiagnostics {
                    iterations: m.saturating_sub(1),
                    converged: true,
                    residual: 0.0,
                },
            }
        }
        Polarization::Mutual => {
            let mut accelerator = DiisAccelerator::new(MAX_DIIS_HISTORY);
            let mut diagnostics = ScfDiagnostics {
                iterations: 0,
                converged: false,
                residual: f64::INFINITY,
            };

            for iter in 1..=settings.max_iterations {
                let (t_d, t_p) = mutual_fields(&u_d, &u_p);
                let mut next_d = Vec::with_capacity(n);
                let mut next_p = Vec::with_capacity(n);
                let mut delta2 = 0.0;
                for i in 0..n {
                    let nd = (e_d[i] + t_d[i]) * polarizabilities[i];
                    let np = (e_p[i] + t_p[i]) * polarizabilities[i];
                    delta2 += (nd - u_d[i]).norm_squared() + (np - u_p[i]).norm_squared();
                    next_d.push(nd);
                    next_p.push(np);
                }
                let rms = DEBYE * (delta2 / (2 * n.max(1)) as f64).sqrt();
                diagnostics.iterations = iter;
                diagnostics.residual = rms;
                debug!(iteration = iter, rms_debye = rms, "induced dipole sweep");

                let state = pack(&next_d, &next_p);
                let residual = &state - pack(&u_d, &u_p);
                accelerator.push(state.clone(), residual);
                match accelerator.extrapolate() {
                    Some(mixed) => unpack(&mixed, &mut u_d, &mut u_p),
                    None => unpack(&state, &mut u_d, &mut u_p),
                }

                if rms < settings.target_epsilon {
                    diagnostics.converged = true;
                    break;
                }
            }

            if !diagnostics.converged {
                warn!(
                    iterations = diagnostics.iterations,
                    residual_debye = diagnostics.residual,
                    target_debye = settings.target_epsilon,
                    "induced dipoles did not converge; using last iterate"
                );
            }

            ScfSolution {
                u_d,
                u_p,
                orders_d: Vec::new(),
                orders_p: Vec::new(),
                diagnostics,
            }
        }
    }
}
