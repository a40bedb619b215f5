//! Smooth particle-mesh Ewald for point multipoles.
//!
//! The reciprocal sum spreads each site's charge, dipole and quadrupole onto
//! a regular grid through order-5 B-splines and their derivatives, convolves
//! with the Ewald influence function in Fourier space, and interpolates the
//! resulting potential and its derivatives back at the sites. Spreading and
//! interpolation use the same spline derivatives, so the two passes are
//! exact adjoints and the interpolated forces are the exact gradient of the
//! interpolated energy.
//!
//! Two independent dipole sets (the d- and p-converged induced dipoles) are
//! convolved in a single transform by packing them into the real and
//! imaginary parts of the grid; the influence function is real and even, so
//! the channels never mix.
//!
//! Potentials are returned in e/A; the Coulomb conversion is applied by the
//! caller alongside the real-space terms.

pub mod backend;
pub mod bspline;

use super::field::{interaction_energy, PotentialDerivs, ELECTRIC};
use super::models::{LabMultipole, PeriodicBox};
use backend::LatticeBackend;
use bspline::{spline_moduli, spline_set, SplineSet, PME_ORDER};
use nalgebra::{Matrix3, Vector3};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

const SQRT_PI: f64 = 1.772_453_850_905_516;
const FIXED_POINT_SCALE: f64 = 4_294_967_296.0; // 2^32

/// Ewald splitting parameter and mesh dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PmeParameters {
    pub alpha: f64,
    pub grid: [usize; 3],
}

/// Coefficient of the self-field correction `c * u` that removes a dipole's
/// interaction with its own spreading Gaussian from the reciprocal sum.
pub fn self_field_coefficient(alpha: f64) -> f64 {
    4.0 * alpha.powi(3) / (3.0 * SQRT_PI)
}

/// Ewald self energy of the permanent multipoles, including the background
/// correction for a non-neutral cell, in kcal/mol.
pub fn self_energy(alpha: f64, volume: f64, multipoles: &[LabMultipole]) -> f64 {
    let a2 = alpha * alpha;
    let mut moments = 0.0;
    let mut net_charge = 0.0;
    for m in multipoles {
        let qq: f64 = m.quadrupole.iter().map(|v| v * v).sum();
        moments += m.charge * m.charge
            + (2.0 * a2 / 3.0) * m.dipole.norm_squared()
            + (8.0 * a2 * a2 / 5.0) * qq;
        net_charge += m.charge;
    }
    let background = -ELECTRIC * std::f64::consts::PI * net_charge * net_charge
        / (2.0 * a2 * volume);
    -ELECTRIC * alpha / SQRT_PI * moments + background
}

/// Which packed channel to interpolate from.
#[derive(Clone, Copy)]
enum Channel {
    Re,
    Im,
}

struct ParticleSplines {
    anchor: [usize; 3],
    axes: [SplineSet; 3],
}

/// Reciprocal-space evaluation context. Owns the mesh and retains the last
/// convolved potential grid, which serves follow-up potential queries at
/// arbitrary points.
pub struct PmeGrid {
    params: PmeParameters,
    cell: PeriodicBox,
    moduli: [Vec<f64>; 3],
    influence: Vec<f64>,
    grid: Vec<Complex64>,
    backend: Box<dyn LatticeBackend>,
}

impl PmeGrid {
    pub fn new(params: PmeParameters, cell: PeriodicBox, backend: Box<dyn LatticeBackend>) -> Self {
        let [nx, ny, nz] = params.grid;
        let moduli = [spline_moduli(nx), spline_moduli(ny), spline_moduli(nz)];
        let mut pme = Self {
            params,
            cell,
            moduli,
            influence: Vec::new(),
            grid: vec![Complex64::default(); nx * ny * nz],
            backend,
        };
        pme.rebuild_influence();
        pme
    }

    pub fn parameters(&self) -> PmeParameters {
        self.params
    }

    pub fn set_cell(&mut self, cell: PeriodicBox) {
        if cell != self.cell {
            self.cell = cell;
            self.rebuild_influence();
        }
    }

    /// The Ewald influence function `exp(-pi^2 m^2 / alpha^2) / (pi V m^2 B)`
    /// on the half-open frequency mesh, zero at the origin.
    fn rebuild_influence(&mut self) {
        let [nx, ny, nz] = self.params.grid;
        let lengths = self.cell.lengths;
        let volume = self.cell.volume();
        let alpha = self.params.alpha;
        let pi = std::f64::consts::PI;

        let freq = |k: usize, n: usize, l: f64| -> f64 {
            let k = k as isize;
            let n = n as isize;
            let wrapped = if k <= n / 2 { k } else { k - n };
            wrapped as f64 / l
        };

        let mut influence = vec![0.0; nx * ny * nz];
        for kx in 0..nx {
            let mx = freq(kx, nx, lengths.x);
            for ky in 0..ny {
                let my = freq(ky, ny, lengths.y);
                for kz in 0..nz {
                    if kx == 0 && ky == 0 && kz == 0 {
                        continue;
                    }
                    let mz = freq(kz, nz, lengths.z);
                    let m2 = mx * mx + my * my + mz * mz;
                    let denom = pi
                        * volume
                        * m2
                        * self.moduli[0][kx]
                        * self.moduli[1][ky]
                        * self.moduli[2][kz];
                    influence[(kx * ny + ky) * nz + kz] =
                        (-pi * pi * m2 / (alpha * alpha)).exp() / denom;
                }
            }
        }
        self.influence = influence;
    }

    fn particle_splines(&self, r: Vector3<f64>) -> ParticleSplines {
        let mut anchor = [0usize; 3];
        let mut axes = [spline_set(0.0); 3];
        for a in 0..3 {
            let n = self.params.grid[a];
            let mut frac = r[a] / self.cell.lengths[a];
            frac -= frac.floor();
            let s = frac * n as f64;
            let k0 = s.floor();
            // frac can round up to 1.0 for tiny negative coordinates.
            let k0 = (k0 as usize).min(n - 1);
            anchor[a] = k0;
            axes[a] = spline_set(s - k0 as f64);
        }
        ParticleSplines { anchor, axes }
    }

    #[inline]
    fn node(&self, anchor: usize, j: usize, axis: usize) -> usize {
        let n = self.params.grid[axis];
        (anchor + n - j) % n
    }

    fn spread_order(&self, positions: &[Vector3<f64>]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..positions.len()).collect();
        if self.backend.sort_grid_index() {
            let [_, ny, nz] = self.params.grid;
            let key = |&i: &usize| -> usize {
                let sp = self.particle_splines(positions[i]);
                (sp.anchor[0] * ny + sp.anchor[1]) * nz + sp.anchor[2]
            };
            order.sort_by_key(key);
        }
        order
    }

    fn accumulate<W>(&mut self, positions: &[Vector3<f64>], weight: W)
    where
        W: Fn(usize, &ParticleSplines, [usize; 3]) -> Complex64,
    {
        let order = self.spread_order(positions);
        let len = self.grid.len();

        if self.backend.use_fixed_point_spreading() {
            let mut fixed = vec![(0i64, 0i64); len];
            self.for_each_node(positions, &order, |i, idx, sp, j| {
                let w = weight(i, sp, j);
                fixed[idx].0 += (w.re * FIXED_POINT_SCALE).round() as i64;
                fixed[idx].1 += (w.im * FIXED_POINT_SCALE).round() as i64;
            });
            for (g, (re, im)) in self.grid.iter_mut().zip(fixed) {
                *g = Complex64::new(re as f64 / FIXED_POINT_SCALE, im as f64 / FIXED_POINT_SCALE);
            }
        } else {
            let mut dense = vec![Complex64::default(); len];
            self.for_each_node(positions, &order, |i, idx, sp, j| {
                dense[idx] += weight(i, sp, j);
            });
            self.grid = dense;
        }
    }

    fn for_each_node<F>(&self, positions: &[Vector3<f64>], order: &[usize], mut visit: F)
    where
        F: FnMut(usize, usize, &ParticleSplines, [usize; 3]),
    {
        let [_, ny, nz] = self.params.grid;
        for &i in order {
            let sp = self.particle_splines(positions[i]);
            for jx in 0..PME_ORDER {
                let gx = self.node(sp.anchor[0], jx, 0);
                for jy in 0..PME_ORDER {
                    let gy = self.node(sp.anchor[1], jy, 1);
                    for jz in 0..PME_ORDER {
                        let gz = self.node(sp.anchor[2], jz, 2);
                        let idx = (gx * ny + gy) * nz + gz;
                        visit(i, idx, &sp, [jx, jy, jz]);
                    }
                }
            }
        }
    }

    /// Fractional chain-rule factor for one axis.
    #[inline]
    fn chain(&self, axis: usize) -> f64 {
        self.params.grid[axis] as f64 / self.cell.lengths[axis]
    }

    fn chain_factors(&self) -> Vector3<f64> {
        Vector3::new(self.chain(0), self.chain(1), self.chain(2))
    }

    fn convolve(&mut self) {
        let dims = self.params.grid;
        self.backend.forward(dims, &mut self.grid);
        for (g, &h) in self.grid.iter_mut().zip(&self.influence) {
            *g *= h;
        }
        self.backend.inverse(dims, &mut self.grid);
    }

    fn gather_one(&self, r: Vector3<f64>, channel: Channel) -> PotentialDerivs {
        let sp = self.particle_splines(r);
        let [_, ny, nz] = self.params.grid;

        // s[a][b][c] accumulates theta^(a)_x theta^(b)_y theta^(c)_z sums.
        let mut s = [[[0.0f64; 4]; 4]; 4];
        for jx in 0..PME_ORDER {
            let gx = self.node(sp.anchor[0], jx, 0);
            let wx = [
                sp.axes[0].theta[jx],
                sp.axes[0].d1[jx],
                sp.axes[0].d2[jx],
                sp.axes[0].d3[jx],
            ];
            for jy in 0..PME_ORDER {
                let gy = self.node(sp.anchor[1], jy, 1);
                let wy = [
                    sp.axes[1].theta[jy],
                    sp.axes[1].d1[jy],
                    sp.axes[1].d2[jy],
                    sp.axes[1].d3[jy],
                ];
                for jz in 0..PME_ORDER {
                    let gz = self.node(sp.anchor[2], jz, 2);
                    let v = self.grid[(gx * ny + gy) * nz + gz];
                    let v = match channel {
                        Channel::Re => v.re,
                        Channel::Im => v.im,
                    };
                    let wz = [
                        sp.axes[2].theta[jz],
                        sp.axes[2].d1[jz],
                        sp.axes[2].d2[jz],
                        sp.axes[2].d3[jz],
                    ];
                    for a in 0..4 {
                        for b in 0..4 - a {
                            for c in 0..4 - a - b {
                                s[a][b][c] += wx[a] * wy[b] * wz[c] * v;
                            }
                        }
                    }
                }
            }
        }

        let f = Vector3::new(self.chain(0), self.chain(1), self.chain(2));
        let entry = |orders: [usize; 3]| -> f64 {
            s[orders[0]][orders[1]][orders[2]]
                * f.x.powi(orders[0] as i32)
                * f.y.powi(orders[1] as i32)
                * f.z.powi(orders[2] as i32)
        };
        let orders_of = |axes: &[usize]| -> [usize; 3] {
            let mut o = [0usize; 3];
            for &a in axes {
                o[a] += 1;
            }
            o
        };

        let grad = Vector3::new(entry([1, 0, 0]), entry([0, 1, 0]), entry([0, 0, 1]));
        let mut hess = Matrix3::zeros();
        for a in 0..3 {
            for b in 0..3 {
                hess[(a, b)] = entry(orders_of(&[a, b]));
            }
        }
        let mut third = [Matrix3::zeros(); 3];
        for c in 0..3 {
            for a in 0..3 {
                for b in 0..3 {
                    third[c][(a, b)] = entry(orders_of(&[a, b, c]));
                }
            }
        }

        PotentialDerivs {
            phi: entry([0, 0, 0]),
            grad,
            hess,
            third,
        }
    }

    /// Spreads the permanent multipoles, convolves, and interpolates the
    /// reciprocal potential derivatives at every site. The convolved grid is
    /// retained for later point queries.
    pub fn multipole_pass(
        &mut self,
        positions: &[Vector3<f64>],
        sources: &[LabMultipole],
    ) -> Vec<PotentialDerivs> {
        let f = self.chain_factors();
        self.accumulate(positions, |i, sp, j| {
            Complex64::new(multipole_weight(f, &sources[i], sp, j), 0.0)
        });
        self.convolve();
        positions
            .iter()
            .map(|&r| self.gather_one(r, Channel::Re))
            .collect()
    }

    /// Convolves two induced-dipole sets in one transform via the packed
    /// real/imaginary channels.
    pub fn dipole_pair_pass(
        &mut self,
        positions: &[Vector3<f64>],
        u_re: &[Vector3<f64>],
        u_im: &[Vector3<f64>],
    ) -> (Vec<PotentialDerivs>, Vec<PotentialDerivs>) {
        let f = self.chain_factors();
        self.accumulate(positions, |i, sp, j| {
            Complex64::new(
                dipole_weight(f, u_re[i], sp, j),
                dipole_weight(f, u_im[i], sp, j),
            )
        });
        self.convolve();
        let re = positions
            .iter()
            .map(|&r| self.gather_one(r, Channel::Re))
            .collect();
        let im = positions
            .iter()
            .map(|&r| self.gather_one(r, Channel::Im))
            .collect();
        (re, im)
    }

    /// Interpolates the retained reciprocal potential at arbitrary points,
    /// in e/A.
    pub fn potential_at_points(&self, points: &[Vector3<f64>]) -> Vec<f64> {
        points
            .iter()
            .map(|&p| self.gather_one(p, Channel::Re).phi)
            .collect()
    }
}

/// Spread weight of one multipole on one grid node. Spline derivatives are
/// taken with respect to the particle position, which keeps spreading the
/// exact adjoint of interpolation.
fn multipole_weight(
    f: Vector3<f64>,
    m: &LabMultipole,
    sp: &ParticleSplines,
    j: [usize; 3],
) -> f64 {
    let (tx, ty, tz) = (&sp.axes[0], &sp.axes[1], &sp.axes[2]);
    let (t0x, t0y, t0z) = (tx.theta[j[0]], ty.theta[j[1]], tz.theta[j[2]]);
    let (t1x, t1y, t1z) = (tx.d1[j[0]], ty.d1[j[1]], tz.d1[j[2]]);

    let mut w = m.charge * t0x * t0y * t0z;
    w += m.dipole.x * f.x * t1x * t0y * t0z
        + m.dipole.y * f.y * t0x * t1y * t0z
        + m.dipole.z * f.z * t0x * t0y * t1z;
    let q = &m.quadrupole;
    w += q[(0, 0)] * f.x * f.x * tx.d2[j[0]] * t0y * t0z
        + q[(1, 1)] * f.y * f.y * t0x * ty.d2[j[1]] * t0z
        + q[(2, 2)] * f.z * f.z * t0x * t0y * tz.d2[j[2]]
        + 2.0 * q[(0, 1)] * f.x * f.y * t1x * t1y * t0z
        + 2.0 * q[(0, 2)] * f.x * f.z * t1x * t0y * t1z
        + 2.0 * q[(1, 2)] * f.y * f.z * t0x * t1y * t1z;
    w
}

fn dipole_weight(f: Vector3<f64>, u: Vector3<f64>, sp: &ParticleSplines, j: [usize; 3]) -> f64 {
    let (tx, ty, tz) = (&sp.axes[0], &sp.axes[1], &sp.axes[2]);
    u.x * f.x * tx.d1[j[0]] * ty.theta[j[1]] * tz.theta[j[2]]
        + u.y * f.y * tx.theta[j[0]] * ty.d1[j[1]] * tz.theta[j[2]]
        + u.z * f.z * tx.theta[j[0]] * ty.theta[j[1]] * tz.d1[j[2]]
}

/// Reciprocal-space energy of the sources against their own interpolated
/// potential, in kcal/mol.
pub fn reciprocal_energy(sources: &[LabMultipole], derivs: &[PotentialDerivs]) -> f64 {
    0.5 * ELECTRIC
        * sources
            .iter()
            .zip(derivs)
            .map(|(m, pd)| interaction_energy(m, pd))
            .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::backend::RustFftBackend;
    use super::*;
    use crate::core::field::{force_on, RealSpace};
    use crate::core::scaling::ScaleTables;

    fn charge(q: f64) -> LabMultipole {
        LabMultipole {
            charge: q,
            dipole: Vector3::zeros(),
            quadrupole: Matrix3::zeros(),
        }
    }

    fn make_grid(alpha: f64, n: usize, box_len: f64) -> PmeGrid {
        PmeGrid::new(
            PmeParameters {
                alpha,
                grid: [n, n, n],
            },
            PeriodicBox::new(box_len, box_len, box_len),
            Box::new(RustFftBackend::new()),
        )
    }

    #[test]
    fn ewald_sum_reproduces_coulomb_for_an_isolated_pair() {
        // A well-separated neutral pair in a large cell: the full Ewald
        // energy must match bare Coulomb to interpolation accuracy.
        let alpha = 0.45;
        let cell = PeriodicBox::new(25.0, 25.0, 25.0);
        let positions = vec![
            Vector3::new(11.0, 12.5, 12.5),
            Vector3::new(14.0, 12.5, 12.5),
        ];
        let sources = vec![charge(0.8), charge(-0.8)];

        let mut pme = make_grid(alpha, 56, 25.0);
        let derivs = pme.multipole_pass(&positions, &sources);
        let recip = reciprocal_energy(&sources, &derivs);

        let scales = ScaleTables::full_strength(2);
        let mut forces = vec![Vector3::zeros(); 2];
        let mut torques = vec![Vector3::zeros(); 2];
        let real = RealSpace::ewald(alpha, 12.0, cell).permanent_interactions(
            &positions,
            &sources,
            &scales,
            &mut forces,
            &mut torques,
        );
        let selfe = self_energy(alpha, cell.volume(), &sources);

        let total = real + recip + selfe;
        let coulomb = ELECTRIC * 0.8 * (-0.8) / 3.0;
        assert!(
            (total - coulomb).abs() < 5e-3 * coulomb.abs(),
            "ewald {total} vs coulomb {coulomb}"
        );
    }

    #[test]
    fn ewald_forces_match_coulomb_for_an_isolated_pair() {
        // The periodic images of the pair pull on it with a force falling
        // off as 1/L^3, so the cell must be large for bare Coulomb to be
        // the right expectation at this tolerance.
        let alpha = 0.4;
        let cell = PeriodicBox::new(40.0, 40.0, 40.0);
        let positions = vec![
            Vector3::new(20.0, 18.25, 20.0),
            Vector3::new(20.0, 21.75, 20.0),
        ];
        let sources = vec![charge(1.0), charge(-1.0)];

        let mut pme = make_grid(alpha, 96, 40.0);
        let derivs = pme.multipole_pass(&positions, &sources);
        let scales = ScaleTables::full_strength(2);
        let mut forces = vec![Vector3::zeros(); 2];
        let mut torques = vec![Vector3::zeros(); 2];
        RealSpace::ewald(alpha, 9.5, cell).permanent_interactions(
            &positions,
            &sources,
            &scales,
            &mut forces,
            &mut torques,
        );
        for i in 0..2 {
            forces[i] += force_on(&sources[i], &derivs[i]) * ELECTRIC;
        }

        // Attractive pair along +y, 3.5 A apart.
        let coulomb = ELECTRIC / (3.5 * 3.5);
        assert!((forces[0].y - coulomb).abs() < 5e-3 * coulomb);
        assert!((forces[0] + forces[1]).norm() < 5e-3 * coulomb);
    }

    #[test]
    fn packed_dipole_channels_match_separate_passes() {
        let positions = vec![
            Vector3::new(3.0, 4.0, 5.0),
            Vector3::new(9.0, 2.0, 7.0),
            Vector3::new(5.5, 8.0, 1.0),
        ];
        let u_a = vec![
            Vector3::new(0.1, 0.0, -0.05),
            Vector3::new(0.0, 0.2, 0.0),
            Vector3::new(-0.07, 0.03, 0.12),
        ];
        let u_b = vec![
            Vector3::new(-0.02, 0.06, 0.0),
            Vector3::new(0.11, 0.0, -0.04),
            Vector3::new(0.0, -0.09, 0.05),
        ];
        let zero = vec![Vector3::zeros(); 3];

        let mut pme = make_grid(0.5, 24, 12.0);
        let (packed_a, packed_b) = pme.dipole_pair_pass(&positions, &u_a, &u_b);
        let (solo_a, _) = pme.dipole_pair_pass(&positions, &u_a, &zero);
        let (solo_b, _) = pme.dipole_pair_pass(&positions, &u_b, &zero);

        for i in 0..3 {
            assert!((packed_a[i].phi - solo_a[i].phi).abs() < 1e-12);
            assert!((packed_b[i].phi - solo_b[i].phi).abs() < 1e-12);
            assert!((packed_a[i].grad - solo_a[i].grad).norm() < 1e-12);
            assert!((packed_b[i].grad - solo_b[i].grad).norm() < 1e-12);
        }
    }

    #[test]
    fn spreading_and_interpolation_are_adjoint() {
        // sum_i m_i . Phi[sources_b]_i must equal sum_j m_j . Phi[sources_a]_j
        // because the influence function is symmetric.
        let positions_a = vec![Vector3::new(2.0, 3.0, 4.0)];
        let positions_b = vec![Vector3::new(7.5, 5.0, 9.0)];
        let src_a = vec![charge(0.9)];
        let src_b = vec![charge(-0.6)];

        let mut pme = make_grid(0.6, 30, 15.0);
        let phi_b_at_a: f64 = {
            pme.multipole_pass(&positions_b, &src_b);
            pme.potential_at_points(&positions_a)[0]
        };
        let phi_a_at_b: f64 = {
            pme.multipole_pass(&positions_a, &src_a);
            pme.potential_at_points(&positions_b)[0]
        };
        let lhs = 0.9 * phi_b_at_a;
        let rhs = -0.6 * phi_a_at_b;
        assert!((lhs - rhs).abs() < 1e-10 * lhs.abs().max(1.0));
    }

    #[test]
    fn self_energy_of_a_single_charge() {
        let sources = vec![charge(1.0)];
        let alpha = 0.3;
        let volume = 1000.0;
        let e = self_energy(alpha, volume, &sources);
        let expected = -ELECTRIC * alpha / SQRT_PI
            - ELECTRIC * std::f64::consts::PI / (2.0 * alpha * alpha * volume);
        assert!((e - expected).abs() < 1e-10);
    }
}
