//! Cardinal B-splines for charge spreading and potential interpolation.
//!
//! Spreading uses order-5 splines so that the interpolated reciprocal
//! potential is three times differentiable, which the quadrupole force
//! contraction requires.

/// Interpolation order.
pub const PME_ORDER: usize = 5;

/// Values and derivatives of the order-5 spline at the grid nodes touched
/// by one particle along one axis.
///
/// Entry `j` belongs to the node `floor(s) - j` (wrapped), where `s` is the
/// particle coordinate in grid units; the spline argument there is `w + j`
/// with `w` the fractional part of `s`. Derivatives are taken with respect
/// to `s`, so they already point along the particle coordinate.
#[derive(Debug, Clone, Copy)]
pub struct SplineSet {
    pub theta: [f64; PME_ORDER],
    pub d1: [f64; PME_ORDER],
    pub d2: [f64; PME_ORDER],
    pub d3: [f64; PME_ORDER],
}

/// Raises `M_{n-1}(w + j)` values to `M_n(w + j)` in place.
fn raise(values: &mut [f64; PME_ORDER], w: f64, n: usize) {
    let prev = *values;
    let at = |j: isize| -> f64 {
        if (0..PME_ORDER as isize).contains(&j) {
            prev[j as usize]
        } else {
            0.0
        }
    };
    for j in 0..PME_ORDER {
        let u = w + j as f64;
        values[j] = (u * at(j as isize) + (n as f64 - u) * at(j as isize - 1)) / (n - 1) as f64;
    }
}

/// Evaluates the spline set at fractional offset `w` in `[0, 1)`.
pub fn spline_set(w: f64) -> SplineSet {
    // M_2(w + j): w at j = 0, 1 - w at j = 1.
    let mut values = [0.0; PME_ORDER];
    values[0] = w;
    values[1] = 1.0 - w;
    let m2 = values;
    raise(&mut values, w, 3);
    let m3 = values;
    raise(&mut values, w, 4);
    let m4 = values;
    raise(&mut values, w, 5);
    let m5 = values;

    let at = |m: &[f64; PME_ORDER], j: isize| -> f64 {
        if (0..PME_ORDER as isize).contains(&j) {
            m[j as usize]
        } else {
            0.0
        }
    };

    let mut set = SplineSet {
        theta: m5,
        d1: [0.0; PME_ORDER],
        d2: [0.0; PME_ORDER],
        d3: [0.0; PME_ORDER],
    };
    for j in 0..PME_ORDER as isize {
        // M_n'(u) = M_{n-1}(u) - M_{n-1}(u - 1), applied repeatedly.
        set.d1[j as usize] = at(&m4, j) - at(&m4, j - 1);
        set.d2[j as usize] = at(&m3, j) - 2.0 * at(&m3, j - 1) + at(&m3, j - 2);
        set.d3[j as usize] =
            at(&m2, j) - 3.0 * at(&m2, j - 1) + 3.0 * at(&m2, j - 2) - at(&m2, j - 3);
    }
    set
}

/// Squared DFT moduli of the spline sampled at the integers, per axis size.
///
/// These appear in the reciprocal-space denominator. The order-5 spline has
/// an exact zero at the Nyquist frequency, which is patched by averaging the
/// neighboring entries.
pub fn spline_moduli(size: usize) -> Vec<f64> {
    // M_5 at the integers 1..=4.
    let m5 = spline_set(0.0).theta;
    let samples = [m5[1], m5[2], m5[3], m5[4]];

    let mut moduli = Vec::with_capacity(size);
    for k in 0..size {
        let (mut re, mut im) = (0.0, 0.0);
        for (j, s) in samples.iter().enumerate() {
            let arg = 2.0 * std::f64::consts::PI * (k * j) as f64 / size as f64;
            re += s * arg.cos();
            im += s * arg.sin();
        }
        moduli.push(re * re + im * im);
    }
    for k in 0..size {
        if moduli[k] < 1e-7 {
            let prev = moduli[(k + size - 1) % size];
            let next = moduli[(k + 1) % size];
            moduli[k] = 0.5 * (prev + next);
        }
    }
    moduli
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spline_values_sum_to_one() {
        for &w in &[0.0, 0.13, 0.5, 0.77, 0.999] {
            let s = spline_set(w);
            let sum: f64 = s.theta.iter().sum();
            assert!((sum - 1.0).abs() < 1e-13, "w = {w}: sum = {sum}");
        }
    }

    #[test]
    fn spline_derivatives_sum_to_zero() {
        for &w in &[0.05, 0.4, 0.91] {
            let s = spline_set(w);
            assert!(s.d1.iter().sum::<f64>().abs() < 1e-13);
            assert!(s.d2.iter().sum::<f64>().abs() < 1e-13);
            assert!(s.d3.iter().sum::<f64>().abs() < 1e-13);
        }
    }

    #[test]
    fn spline_at_integer_offsets_matches_known_values() {
        let s = spline_set(0.0);
        let expected = [0.0, 1.0 / 24.0, 11.0 / 24.0, 11.0 / 24.0, 1.0 / 24.0];
        for j in 0..PME_ORDER {
            assert!((s.theta[j] - expected[j]).abs() < 1e-14);
        }
    }

    #[test]
    fn first_derivative_matches_finite_difference() {
        let h = 1e-6;
        let w = 0.37;
        let plus = spline_set(w + h);
        let minus = spline_set(w - h);
        let s = spline_set(w);
        for j in 0..PME_ORDER {
            let fd = (plus.theta[j] - minus.theta[j]) / (2.0 * h);
            assert!((s.d1[j] - fd).abs() < 1e-8, "node {j}");
        }
    }

    #[test]
    fn moduli_are_positive_after_patching() {
        for &size in &[24, 30, 64] {
            let m = spline_moduli(size);
            assert_eq!(m.len(), size);
            assert!(m.iter().all(|&v| v > 0.0));
        }
    }
}
