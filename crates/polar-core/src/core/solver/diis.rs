//! DIIS acceleration for the induced-dipole fixed point.
//!
//! Keeps a short history of iterates and their residuals and extrapolates
//! the next iterate by minimizing the norm of the linearly combined
//! residual under the constraint that the coefficients sum to one. The
//! constrained least-squares system is the usual bordered matrix
//! `B_ij = <r_i, r_j>` with a `-1` border and a `-1` right-hand side.

use nalgebra::{DMatrix, DVector};
use std::collections::VecDeque;

pub struct DiisAccelerator {
    capacity: usize,
    states: VecDeque<DVector<f64>>,
    residuals: VecDeque<DVector<f64>>,
}

impl DiisAccelerator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            states: VecDeque::with_capacity(capacity),
            residuals: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.residuals.clear();
    }

    /// Records one iterate and its residual, evicting the oldest entry when
    /// the history is full.
    pub fn push(&mut self, state: DVector<f64>, residual: DVector<f64>) {
        if self.states.len() == self.capacity {
            self.states.pop_front();
            self.residuals.pop_front();
        }
        self.states.push_back(state);
        self.residuals.push_back(residual);
    }

    /// Extrapolated iterate, or `None` when the history is too short or the
    /// bordered system is singular. A `None` caller falls back to the plain
    /// iterate.
    pub fn extrapolate(&self) -> Option<DVector<f64>> {
        let m = self.states.len();
        if m < 2 {
            return None;
        }

        let mut b = DMatrix::zeros(m + 1, m + 1);
        for i in 0..m {
            for j in 0..=i {
                let dot = self.residuals[i].dot(&self.residuals[j]);
                b[(i, j)] = dot;
                b[(j, i)] = dot;
            }
            b[(i, m)] = -1.0;
            b[(m, i)] = -1.0;
        }

        let mut rhs = DVector::zeros(m + 1);
        rhs[m] = -1.0;

        let solution = b.lu().solve(&rhs)?;
        let coeffs = solution.rows(0, m);
        if coeffs.iter().any(|c| !c.is_finite()) {
            return None;
        }

        let mut out = DVector::zeros(self.states[0].len());
        for (c, state) in coeffs.iter().zip(&self.states) {
            out.axpy(*c, state, 1.0);
        }
        Some(out)
    }
}
