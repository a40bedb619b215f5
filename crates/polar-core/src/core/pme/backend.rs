//! Pluggable lattice transform backend.
//!
//! The reciprocal-space pass is written against this trait so that the 3-D
//! transform can be swapped out, along with two knobs on the spreading pass:
//! accumulating spread weights in fixed-point integers and visiting
//! particles in grid order both make the pass bitwise deterministic
//! regardless of accumulation order.

use num_complex::Complex64;
use rustfft::FftPlanner;

pub trait LatticeBackend: Send {
    /// In-place forward 3-D transform of a row-major `[x][y][z]` grid.
    fn forward(&mut self, dims: [usize; 3], grid: &mut [Complex64]);

    /// In-place unnormalized inverse 3-D transform.
    fn inverse(&mut self, dims: [usize; 3], grid: &mut [Complex64]);

    /// When true, spread weights are accumulated in 64-bit fixed point and
    /// converted once, making the sum independent of accumulation order.
    fn use_fixed_point_spreading(&self) -> bool {
        false
    }

    /// When true, particles are spread in order of their starting grid
    /// index.
    fn sort_grid_index(&self) -> bool {
        false
    }
}

/// Default backend: separable 1-D transforms via rustfft.
pub struct RustFftBackend {
    planner: FftPlanner<f64>,
}

impl RustFftBackend {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    fn transform(&mut self, dims: [usize; 3], grid: &mut [Complex64], forward: bool) {
        let [nx, ny, nz] = dims;
        let plan = |planner: &mut FftPlanner<f64>, len: usize| {
            if forward {
                planner.plan_fft_forward(len)
            } else {
                planner.plan_fft_inverse(len)
            }
        };

        // z rows are contiguous.
        let fft_z = plan(&mut self.planner, nz);
        for row in grid.chunks_exact_mut(nz) {
            fft_z.process(row);
        }

        // y and x with gather/scatter through a scratch row.
        let fft_y = plan(&mut self.planner, ny);
        let mut row = vec![Complex64::default(); ny];
        for x in 0..nx {
            for z in 0..nz {
                for y in 0..ny {
                    row[y] = grid[(x * ny + y) * nz + z];
                }
                fft_y.process(&mut row);
                for y in 0..ny {
                    grid[(x * ny + y) * nz + z] = row[y];
                }
            }
        }

        let fft_x = plan(&mut self.planner, nx);
        let mut row = vec![Complex64::default(); nx];
        for y in 0..ny {
            for z in 0..nz {
                for x in 0..nx {
                    row[x] = grid[(x * ny + y) * nz + z];
                }
                fft_x.process(&mut row);
                for x in 0..nx {
                    grid[(x * ny + y) * nz + z] = row[x];
                }
            }
        }
    }
}

impl Default for RustFftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LatticeBackend for RustFftBackend {
    fn forward(&mut self, dims: [usize; 3], grid: &mut [Complex64]) {
        self.transform(dims, grid, true);
    }

    fn inverse(&mut self, dims: [usize; 3], grid: &mut [Complex64]) {
        self.transform(dims, grid, false);
    }
}
