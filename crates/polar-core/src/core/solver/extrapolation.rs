//! Perturbation-theory extrapolation of the induced dipoles (OPT).
//!
//! Instead of iterating the mutual field to convergence, the dipoles are
//! expanded in powers of the coupling, `u^(0) = alpha E_fixed` and
//! `u^(n+1) = alpha T u^(n)`, and a fixed linear combination of the partial
//! sums stands in for the converged result. The default coefficients are the
//! OPT3 fit.

use nalgebra::Vector3;

/// Default extrapolation coefficients (OPT3).
pub const OPT_COEFFICIENTS: [f64; 4] = [-0.154, 0.017, 0.658, 0.474];

/// Combines per-order dipoles into the extrapolated set:
/// `u = sum_n c_n * (u^(0) + ... + u^(n))`.
pub fn combine(orders: &[Vec<Vector3<f64>>], coefficients: &[f64]) -> Vec<Vector3<f64>> {
    let n_sites = orders.first().map_or(0, Vec::len);
    let mut out = vec![Vector3::zeros(); n_sites];
    let mut partial = vec![Vector3::zeros(); n_sites];
    for (order, &c) in orders.iter().zip(coefficients) {
        for (p, u) in partial.iter_mut().zip(order) {
            *p += u;
        }
        for (o, p) in out.iter_mut().zip(&partial) {
            *o += p * c;
        }
    }
    out
}

/// Tail sums `a_k = sum_{n >= k} c_n` used to weight the cross-order force
/// terms `u^(p) . grad T . u^(q)`, which carry weight `a_{p+q+1}`.
pub fn gradient_weights(coefficients: &[f64]) -> Vec<f64> {
    let mut weights = vec![0.0; coefficients.len() + 1];
    let mut tail = 0.0;
    for k in (0..coefficients.len()).rev() {
        tail += coefficients[k];
        weights[k] = tail;
    }
    weights
}
