//! Stateful multipole force evaluation.
//!
//! [`MultipoleForce`] owns the grid, exclusion tables, and solvent model for
//! one particle system and runs the full pipeline per evaluation: frame
//! rotation, permanent real- and reciprocal-space sums, the induced-dipole
//! solve, polarization forces, reaction-field terms, and the mapping of frame
//! torques back onto atomic forces. Dipole, potential, and moment queries
//! read the snapshot of the most recent evaluation and are rejected before
//! the first `execute` or after anything invalidates it.

use nalgebra::Vector3;
use tracing::{debug, instrument};

use crate::core::field::{
    dipole_source, force_on, polarization_energy, torque_on, PotentialDerivs, RealSpace, ELECTRIC,
};
use crate::core::frame::{compute_lab_multipoles, distribute_torque};
use crate::core::gk::{GkModel, GkParticle};
use crate::core::models::{LabMultipole, MultipoleParams, Topology};
use crate::core::pme::backend::RustFftBackend;
use crate::core::pme::{
    reciprocal_energy, self_energy, self_field_coefficient, PmeGrid, PmeParameters,
};
use crate::core::scaling::ScaleTables;
use crate::core::solver::{self, extrapolation, Polarization, ScfDiagnostics, DEBYE};

use super::config::ForceConfig;
use super::error::EngineError;

/// Result of one force evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Total potential energy in kcal/mol.
    pub energy: f64,
    pub permanent_energy: f64,
    pub polarization_energy: f64,
    pub solvation_energy: f64,
    /// Per-particle forces in kcal/(mol A), present when requested.
    pub forces: Option<Vec<Vector3<f64>>>,
    pub scf: ScfDiagnostics,
}

/// State retained from the last evaluation for read-only queries.
struct Snapshot {
    lab: Vec<LabMultipole>,
    /// Mean of the d- and p-channel induced dipoles per site.
    induced: Vec<Vector3<f64>>,
}

pub struct MultipoleForce {
    config: ForceConfig,
    params: Vec<MultipoleParams>,
    scales: ScaleTables,
    real: RealSpace,
    pme: Option<PmeGrid>,
    gk: Option<GkModel>,
    positions: Option<Vec<Vector3<f64>>>,
    snapshot: Option<Snapshot>,
}

impl MultipoleForce {
    /// Validates the configuration against the topology and allocates the
    /// grid, exclusion tables, and solvent model.
    pub fn new(
        config: ForceConfig,
        params: Vec<MultipoleParams>,
        topology: &Topology,
        solvent_particles: Option<Vec<GkParticle>>,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        if topology.num_particles() != params.len() {
            return Err(EngineError::ParameterCount {
                expected: topology.num_particles(),
                actual: params.len(),
            });
        }
        if !topology.is_consistent() {
            return Err(EngineError::Topology(
                "bond lists reference particles out of range or are asymmetric".into(),
            ));
        }
        Self::check_params(&params)?;

        let scales = ScaleTables::build(topology, &config.scaling);
        let (real, pme) = match (&config.cell, &config.pme) {
            (Some(cell), Some(pme_params)) => (
                RealSpace::ewald(pme_params.alpha, config.real_space_cutoff, *cell),
                Some(PmeGrid::new(
                    *pme_params,
                    *cell,
                    Box::new(RustFftBackend::new()),
                )),
            ),
            _ => (RealSpace::open(), None),
        };
        let gk = match (&config.solvent, solvent_particles) {
            (Some(settings), Some(particles)) => {
                if particles.len() != params.len() {
                    return Err(EngineError::ParameterCount {
                        expected: params.len(),
                        actual: particles.len(),
                    });
                }
                Some(GkModel::new(settings.clone(), particles)?)
            }
            (Some(_), None) => {
                return Err(EngineError::Configuration(
                    "implicit solvent is enabled but no per-particle radii were given".into(),
                ));
            }
            (None, _) => None,
        };

        Ok(Self {
            config,
            params,
            scales,
            real,
            pme,
            gk,
            positions: None,
            snapshot: None,
        })
    }

    fn check_params(params: &[MultipoleParams]) -> Result<(), EngineError> {
        for (i, p) in params.iter().enumerate() {
            if !(p.polarizability >= 0.0) || !p.polarizability.is_finite() {
                return Err(EngineError::Configuration(format!(
                    "particle {i} has unphysical polarizability {}",
                    p.polarizability
                )));
            }
        }
        Ok(())
    }

    /// Marks the cached multipole state dirty and stores the new positions.
    pub fn set_positions(&mut self, positions: &[Vector3<f64>]) -> Result<(), EngineError> {
        if positions.len() != self.params.len() {
            return Err(EngineError::ParameterCount {
                expected: self.params.len(),
                actual: positions.len(),
            });
        }
        self.positions = Some(positions.to_vec());
        self.snapshot = None;
        Ok(())
    }

    /// Hot-swaps the force-field parameters without reallocating the grid or
    /// exclusion tables. The particle count must be unchanged.
    pub fn copy_parameters_to_context(
        &mut self,
        params: Vec<MultipoleParams>,
    ) -> Result<(), EngineError> {
        if params.len() != self.params.len() {
            return Err(EngineError::ParameterCount {
                expected: self.params.len(),
                actual: params.len(),
            });
        }
        Self::check_params(&params)?;
        self.params = params;
        self.snapshot = None;
        Ok(())
    }

    /// Runs one full evaluation and returns the energy breakdown.
    ///
    /// Forces and torques are always assembled internally so the solvent and
    /// torque stages stay on a single code path; `include_forces` only
    /// controls whether the force buffer is returned. `include_energy` is
    /// accepted for interface symmetry, the energy comes at no extra cost.
    #[instrument(skip_all, name = "multipole_force_execute", fields(particles = self.params.len()))]
    pub fn execute(
        &mut self,
        include_forces: bool,
        _include_energy: bool,
    ) -> Result<Evaluation, EngineError> {
        let positions = self
            .positions
            .clone()
            .ok_or(EngineError::PositionsNotSet)?;
        let n = positions.len();
        let lab = compute_lab_multipoles(&positions, &self.params);
        let polarizabilities: Vec<f64> = self.params.iter().map(|p| p.polarizability).collect();

        let mut forces = vec![Vector3::zeros(); n];
        let mut torques = vec![Vector3::zeros(); n];

        // Permanent multipole electrostatics.
        let mut permanent_energy = self.real.permanent_interactions(
            &positions,
            &lab,
            &self.scales,
            &mut forces,
            &mut torques,
        );
        let g1 = self_field_coefficient(self.real.alpha);
        let mut derivs_perm: Option<Vec<PotentialDerivs>> = None;
        if let Some(pme) = self.pme.as_mut() {
            let derivs = pme.multipole_pass(&positions, &lab);
            permanent_energy += reciprocal_energy(&lab, &derivs);
            // The cell was validated alongside the grid in `new`.
            let volume = self.real.cell.map(|c| c.volume()).unwrap_or(0.0);
            permanent_energy += self_energy(self.real.alpha, volume, &lab);
            for i in 0..n {
                forces[i] += force_on(&lab[i], &derivs[i]) * ELECTRIC;
                torques[i] += torque_on(&lab[i], &derivs[i]) * ELECTRIC;
            }
            derivs_perm = Some(derivs);
        }

        let born = self.gk.as_ref().map(|gk| gk.born_radii(&positions));

        // Fixed fields of the permanent multipoles, d and p channels.
        let (mut e_d, mut e_p) =
            self.real
                .permanent_fields(&positions, &lab, &self.params, &self.scales);
        if let Some(derivs) = &derivs_perm {
            for i in 0..n {
                let recip = -derivs[i].grad + lab[i].dipole * g1;
                e_d[i] += recip;
                e_p[i] += recip;
            }
        }
        if let (Some(gk), Some(born)) = (self.gk.as_ref(), born.as_ref()) {
            gk.fixed_reaction_field(&positions, born, &lab, &mut e_d);
            gk.fixed_reaction_field(&positions, born, &lab, &mut e_p);
        }

        // Induced dipole solve. The mutual-field closure mirrors the fixed
        // pass: screened real space, reciprocal grid with the Gaussian
        // self-field restored, and the solvent reaction field.
        let solver_settings = self.config.solver.clone();
        let scf = {
            let real = &self.real;
            let params = &self.params[..];
            let scales = &self.scales;
            let gk = self.gk.as_ref();
            let born = born.as_ref();
            let mut pme = self.pme.as_mut();
            solver::solve(&polarizabilities, &e_d, &e_p, &solver_settings, |ud, up| {
                let mut t_d = vec![Vector3::zeros(); n];
                let mut t_p = vec![Vector3::zeros(); n];
                real.induced_dipole_field(&positions, params, scales, ud, &mut t_d);
                real.induced_dipole_field(&positions, params, scales, up, &mut t_p);
                if let Some(pme) = pme.as_deref_mut() {
                    let (dd, dp) = pme.dipole_pair_pass(&positions, ud, up);
                    for i in 0..n {
                        t_d[i] += -dd[i].grad + ud[i] * g1;
                        t_p[i] += -dp[i].grad + up[i] * g1;
                    }
                }
                if let (Some(gk), Some(born)) = (gk, born) {
                    gk.reaction_field(&positions, born, ud, &mut t_d);
                    gk.reaction_field(&positions, born, up, &mut t_p);
                }
                (t_d, t_p)
            })
        };
        let pol_energy = polarization_energy(&scf.u_d, &e_p);
        let u_mix: Vec<Vector3<f64>> = scf
            .u_d
            .iter()
            .zip(&scf.u_p)
            .map(|(d, p)| (d + p) * 0.5)
            .collect();

        // Polarization forces and torques, real space.
        self.real.permanent_induced_interactions(
            &positions,
            &lab,
            &self.params,
            &self.scales,
            &scf.u_d,
            &scf.u_p,
            &mut forces,
            &mut torques,
        );
        match solver_settings.polarization {
            Polarization::Direct => {}
            Polarization::Mutual => {
                self.real.induced_pair_forces(
                    &positions,
                    &self.params,
                    &self.scales,
                    &scf.u_d,
                    &scf.u_p,
                    1.0,
                    &mut forces,
                );
            }
            Polarization::Extrapolated => {
                // The truncated series is not variational; the missing force
                // terms are the weighted cross-order dipole interactions.
                let weights = extrapolation::gradient_weights(&solver_settings.coefficients);
                for p in 0..scf.orders_d.len() {
                    for q in 0..scf.orders_p.len() {
                        let Some(&w) = weights.get(p + q + 1) else {
                            continue;
                        };
                        if w == 0.0 {
                            continue;
                        }
                        self.real.induced_pair_forces(
                            &positions,
                            &self.params,
                            &self.scales,
                            &scf.orders_d[p],
                            &scf.orders_p[q],
                            w,
                            &mut forces,
                        );
                    }
                }
            }
        }

        // Polarization forces and torques, reciprocal space.
        if let Some(derivs) = derivs_perm.as_deref() {
            self.reciprocal_polarization(
                &positions,
                &lab,
                &scf,
                &u_mix,
                derivs,
                g1,
                &mut forces,
                &mut torques,
            );
        }

        // Implicit solvent energy, forces, and torques. The reported energy
        // covers the permanent multipoles and the cavity term; the induced
        // coupling already rides inside the polarization energy through the
        // fixed reaction field, so only its gradients are assembled here.
        let mut solvation_energy = 0.0;
        if let (Some(gk), Some(born)) = (self.gk.as_ref(), born.as_ref()) {
            let mut de_db = vec![0.0; n];
            solvation_energy = gk.permanent_energy_forces(
                &positions,
                born,
                &lab,
                &mut forces,
                &mut torques,
                &mut de_db,
            );
            gk.permanent_induced_gradient(
                &positions,
                born,
                &lab,
                &u_mix,
                &mut forces,
                &mut torques,
                &mut de_db,
            );
            match solver_settings.polarization {
                Polarization::Direct => {}
                Polarization::Mutual => {
                    gk.mutual_induced_gradient(
                        &positions,
                        born,
                        &scf.u_d,
                        &scf.u_p,
                        1.0,
                        &mut forces,
                        &mut de_db,
                    );
                }
                Polarization::Extrapolated => {
                    let weights = extrapolation::gradient_weights(&solver_settings.coefficients);
                    for p in 0..scf.orders_d.len() {
                        for q in 0..scf.orders_p.len() {
                            let Some(&w) = weights.get(p + q + 1) else {
                                continue;
                            };
                            if w == 0.0 {
                                continue;
                            }
                            gk.mutual_induced_gradient(
                                &positions,
                                born,
                                &scf.orders_d[p],
                                &scf.orders_p[q],
                                w,
                                &mut forces,
                                &mut de_db,
                            );
                        }
                    }
                }
            }
            gk.distribute_born_forces(&positions, born, &de_db, &mut forces);
        }

        // Map frame torques onto the defining particles.
        for i in 0..n {
            distribute_torque(&positions, i, &self.params[i].frame, torques[i], &mut forces);
        }

        // Leave the retained reciprocal grid holding the total (permanent
        // plus induced) potential for later point queries.
        if let Some(pme) = self.pme.as_mut() {
            let combined: Vec<LabMultipole> = lab
                .iter()
                .zip(&u_mix)
                .map(|(m, u)| LabMultipole {
                    charge: m.charge,
                    dipole: m.dipole + u,
                    quadrupole: m.quadrupole,
                })
                .collect();
            let _ = pme.multipole_pass(&positions, &combined);
        }

        debug!(
            permanent = permanent_energy,
            polarization = pol_energy,
            solvation = solvation_energy,
            scf_iterations = scf.diagnostics.iterations,
            "evaluation complete"
        );

        let diagnostics = scf.diagnostics;
        self.snapshot = Some(Snapshot {
            lab,
            induced: u_mix,
        });

        Ok(Evaluation {
            energy: permanent_energy + pol_energy + solvation_energy,
            permanent_energy,
            polarization_energy: pol_energy,
            solvation_energy,
            forces: include_forces.then_some(forces),
            scf: diagnostics,
        })
    }

    /// Reciprocal-space part of the polarization gradient: induced dipoles
    /// against the permanent potential, permanent moments against the
    /// induced potential, and the channel cross terms of the chosen solver.
    #[allow(clippy::too_many_arguments)]
    fn reciprocal_polarization(
        &mut self,
        positions: &[Vector3<f64>],
        lab: &[LabMultipole],
        scf: &solver::ScfSolution,
        u_mix: &[Vector3<f64>],
        derivs_perm: &[PotentialDerivs],
        g1: f64,
        forces: &mut [Vector3<f64>],
        torques: &mut [Vector3<f64>],
    ) {
        let Some(pme) = self.pme.as_mut() else {
            return;
        };
        let n = positions.len();
        let (derivs_ud, derivs_up) = pme.dipole_pair_pass(positions, &scf.u_d, &scf.u_p);
        for i in 0..n {
            forces[i] += force_on(&dipole_source(u_mix[i]), &derivs_perm[i]) * ELECTRIC;
            let mut mean = average_derivs(&derivs_ud[i], &derivs_up[i]);
            forces[i] += force_on(&lab[i], &mean) * ELECTRIC;
            // Remove the Gaussian self field before taking the torque.
            mean.grad -= u_mix[i] * g1;
            torques[i] += torque_on(&lab[i], &mean) * ELECTRIC;
        }
        match self.config.solver.polarization {
            Polarization::Direct => {}
            Polarization::Mutual => {
                for i in 0..n {
                    let f = (force_on(&dipole_source(scf.u_d[i]), &derivs_up[i])
                        + force_on(&dipole_source(scf.u_p[i]), &derivs_ud[i]))
                        * (0.5 * ELECTRIC);
                    forces[i] += f;
                }
            }
            Polarization::Extrapolated => {
                let weights = extrapolation::gradient_weights(&self.config.solver.coefficients);
                let m = scf.orders_d.len();
                let mut order_derivs = Vec::with_capacity(m);
                for order in 0..m {
                    order_derivs.push(pme.dipole_pair_pass(
                        positions,
                        &scf.orders_d[order],
                        &scf.orders_p[order],
                    ));
                }
                for p in 0..m {
                    for q in 0..m {
                        let Some(&w) = weights.get(p + q + 1) else {
                            continue;
                        };
                        if w == 0.0 {
                            continue;
                        }
                        let (d_of_p, _) = &order_derivs[p];
                        let (_, p_of_q) = &order_derivs[q];
                        for i in 0..n {
                            let f = (force_on(&dipole_source(scf.orders_d[p][i]), &p_of_q[i])
                                + force_on(&dipole_source(scf.orders_p[q][i]), &d_of_p[i]))
                                * (0.5 * w * ELECTRIC);
                            forces[i] += f;
                        }
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> Result<&Snapshot, EngineError> {
        self.snapshot.as_ref().ok_or(EngineError::NotEvaluated)
    }

    /// Lab-frame permanent dipoles from the last evaluation, in e A.
    pub fn lab_frame_permanent_dipoles(&self) -> Result<Vec<Vector3<f64>>, EngineError> {
        Ok(self.snapshot()?.lab.iter().map(|m| m.dipole).collect())
    }

    /// Induced dipoles from the last evaluation (channel mean), in e A.
    pub fn induced_dipoles(&self) -> Result<Vec<Vector3<f64>>, EngineError> {
        Ok(self.snapshot()?.induced.clone())
    }

    /// Permanent plus induced dipole per particle, in e A.
    pub fn total_dipoles(&self) -> Result<Vec<Vector3<f64>>, EngineError> {
        let snap = self.snapshot()?;
        Ok(snap
            .lab
            .iter()
            .zip(&snap.induced)
            .map(|(m, u)| m.dipole + u)
            .collect())
    }

    /// Electrostatic potential of the permanent and induced moments at
    /// arbitrary query points, in kcal/(mol e).
    pub fn electrostatic_potential(
        &self,
        points: &[Vector3<f64>],
    ) -> Result<Vec<f64>, EngineError> {
        let snap = self.snapshot()?;
        let positions = self
            .positions
            .as_ref()
            .ok_or(EngineError::PositionsNotSet)?;
        let mut phi =
            self.real
                .potential_at_points(positions, &snap.lab, Some(&snap.induced), points);
        if let Some(pme) = &self.pme {
            for (out, recip) in phi.iter_mut().zip(pme.potential_at_points(points)) {
                *out += recip * ELECTRIC;
            }
        }
        Ok(phi)
    }

    /// Aggregate multipole moments about the geometric center, as 13 scalars:
    /// net charge (e), dipole x/y/z (Debye), then the traceless quadrupole
    /// 3x3 in row-major order (Debye A). Induced dipoles are included.
    pub fn system_multipole_moments(&self) -> Result<[f64; 13], EngineError> {
        let snap = self.snapshot()?;
        let positions = self
            .positions
            .as_ref()
            .ok_or(EngineError::PositionsNotSet)?;
        let n = positions.len().max(1) as f64;
        let center: Vector3<f64> = positions.iter().sum::<Vector3<f64>>() / n;

        let mut charge = 0.0;
        let mut dipole = Vector3::zeros();
        let mut m2 = nalgebra::Matrix3::<f64>::zeros();
        for (i, m) in snap.lab.iter().enumerate() {
            let rc = positions[i] - center;
            let d = m.dipole + snap.induced[i];
            charge += m.charge;
            dipole += rc * m.charge + d;
            m2 += rc * rc.transpose() * m.charge
                + rc * d.transpose()
                + d * rc.transpose()
                + m.quadrupole * 2.0;
        }
        let traceless = m2 * 1.5 - nalgebra::Matrix3::identity() * (0.5 * m2.trace());

        let mut out = [0.0; 13];
        out[0] = charge;
        for a in 0..3 {
            out[1 + a] = dipole[a] * DEBYE;
        }
        for a in 0..3 {
            for b in 0..3 {
                out[4 + 3 * a + b] = traceless[(a, b)] * DEBYE;
            }
        }
        Ok(out)
    }

    /// Ewald splitting parameter and mesh dimensions, when periodic.
    pub fn pme_parameters(&self) -> Option<PmeParameters> {
        self.pme.as_ref().map(|p| p.parameters())
    }

    /// Mesh a companion dispersion sum would use; shared with the
    /// electrostatic mesh here.
    pub fn dispersion_pme_parameters(&self) -> Option<PmeParameters> {
        self.pme_parameters()
    }
}

fn average_derivs(a: &PotentialDerivs, b: &PotentialDerivs) -> PotentialDerivs {
    PotentialDerivs {
        phi: 0.5 * (a.phi + b.phi),
        grad: (a.grad + b.grad) * 0.5,
        hess: (a.hess + b.hess) * 0.5,
        third: [
            (a.third[0] + b.third[0]) * 0.5,
            (a.third[1] + b.third[1]) * 0.5,
            (a.third[2] + b.third[2]) * 0.5,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::PeriodicBox;
    use crate::core::solver::SolverSettings;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() < tol, "{a} vs {b}");
    }

    /// Central-difference check of every force component against the energy.
    fn assert_forces_match_gradient(
        force: &mut MultipoleForce,
        positions: &mut [Vector3<f64>],
        tol: f64,
    ) {
        force.set_positions(positions).unwrap();
        let forces = force.execute(true, true).unwrap().forces.unwrap();

        let h = 1e-5;
        for p in 0..positions.len() {
            for axis in 0..3 {
                let orig = positions[p][axis];
                positions[p][axis] = orig + h;
                force.set_positions(positions).unwrap();
                let ep = force.execute(false, true).unwrap().energy;
                positions[p][axis] = orig - h;
                force.set_positions(positions).unwrap();
                let em = force.execute(false, true).unwrap().energy;
                positions[p][axis] = orig;
                let numeric = -(ep - em) / (2.0 * h);
                assert!(
                    (forces[p][axis] - numeric).abs() < tol,
                    "particle {p} axis {axis}: {} vs {numeric}",
                    forces[p][axis]
                );
            }
        }
    }

    fn water_like_params() -> (Vec<MultipoleParams>, Topology) {
        // A bent three-site molecule with charges and polarizabilities.
        let mut o = MultipoleParams::point_charge(-0.8);
        o.polarizability = 0.8;
        o.thole = 0.39;
        let mut h = MultipoleParams::point_charge(0.4);
        h.polarizability = 0.3;
        h.thole = 0.39;
        let topology = Topology::from_bonds(3, &[(0, 1), (0, 2)]);
        (vec![o, h.clone(), h], topology)
    }

    fn water_like_positions() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.96, 0.0, 0.0),
            Vector3::new(-0.24, 0.93, 0.0),
        ]
    }

    #[test]
    fn execute_before_positions_is_a_state_error() {
        let (params, topology) = water_like_params();
        let mut force =
            MultipoleForce::new(ForceConfig::default(), params, &topology, None).unwrap();
        assert!(matches!(
            force.execute(true, true),
            Err(EngineError::PositionsNotSet)
        ));
    }

    #[test]
    fn queries_before_execute_are_rejected() {
        let (params, topology) = water_like_params();
        let mut force =
            MultipoleForce::new(ForceConfig::default(), params, &topology, None).unwrap();
        force.set_positions(&water_like_positions()).unwrap();
        assert!(matches!(
            force.induced_dipoles(),
            Err(EngineError::NotEvaluated)
        ));
        assert!(matches!(
            force.system_multipole_moments(),
            Err(EngineError::NotEvaluated)
        ));
    }

    #[test]
    fn two_point_charges_reduce_to_coulomb() {
        let params = vec![
            MultipoleParams::point_charge(1.0),
            MultipoleParams::point_charge(-1.0),
        ];
        let topology = Topology::isolated(2);
        let mut force =
            MultipoleForce::new(ForceConfig::default(), params, &topology, None).unwrap();
        force
            .set_positions(&[Vector3::zeros(), Vector3::new(3.0, 0.0, 0.0)])
            .unwrap();
        let eval = force.execute(true, true).unwrap();
        assert_close(eval.energy, -ELECTRIC / 3.0, 1e-10);
        let forces = eval.forces.unwrap();
        // Attractive pair pulls toward each other.
        assert_close(forces[0].x, ELECTRIC / 9.0, 1e-10);
        assert_close(forces[1].x, -ELECTRIC / 9.0, 1e-10);
    }

    #[test]
    fn bonded_pair_energy_is_excluded() {
        let params = vec![
            MultipoleParams::point_charge(1.0),
            MultipoleParams::point_charge(-1.0),
        ];
        let topology = Topology::from_bonds(2, &[(0, 1)]);
        let mut force =
            MultipoleForce::new(ForceConfig::default(), params, &topology, None).unwrap();
        force
            .set_positions(&[Vector3::zeros(), Vector3::new(3.0, 0.0, 0.0)])
            .unwrap();
        let eval = force.execute(false, true).unwrap();
        assert_close(eval.energy, 0.0, 1e-12);
        assert!(eval.forces.is_none());
    }

    #[test]
    fn forces_match_the_numerical_gradient_with_polarization() {
        let (params, topology) = water_like_params();
        let config = ForceConfig {
            solver: SolverSettings {
                target_epsilon: 1e-9,
                ..SolverSettings::default()
            },
            ..ForceConfig::default()
        };
        let mut force = MultipoleForce::new(config, params, &topology, None).unwrap();
        let mut positions = water_like_positions();
        // Push one hydrogen off the bench geometry so nothing is symmetric.
        positions[2].z = 0.2;
        assert_forces_match_gradient(&mut force, &mut positions, 1e-4);
    }

    #[test]
    fn extrapolated_forces_match_the_numerical_gradient() {
        let (params, topology) = water_like_params();
        let config = ForceConfig {
            solver: SolverSettings {
                polarization: Polarization::Extrapolated,
                ..SolverSettings::default()
            },
            ..ForceConfig::default()
        };
        let mut force = MultipoleForce::new(config, params, &topology, None).unwrap();
        let mut positions = water_like_positions();
        positions[2].z = 0.2;
        assert_forces_match_gradient(&mut force, &mut positions, 1e-4);
    }

    fn solvated_config(polarization: Polarization) -> (ForceConfig, Vec<GkParticle>) {
        let config = ForceConfig {
            solver: SolverSettings {
                polarization,
                target_epsilon: 1e-9,
                ..SolverSettings::default()
            },
            solvent: Some(crate::core::gk::GkSettings::default()),
            ..ForceConfig::default()
        };
        let particles = vec![
            GkParticle {
                radius: 1.6,
                descreen_scale: 0.8,
            },
            GkParticle {
                radius: 1.2,
                descreen_scale: 0.8,
            },
            GkParticle {
                radius: 1.2,
                descreen_scale: 0.8,
            },
        ];
        (config, particles)
    }

    #[test]
    fn solvated_mutual_forces_match_the_numerical_gradient() {
        let (params, topology) = water_like_params();
        let (config, particles) = solvated_config(Polarization::Mutual);
        let mut force =
            MultipoleForce::new(config, params, &topology, Some(particles)).unwrap();
        let mut positions = water_like_positions();
        positions[2].z = 0.2;
        assert_forces_match_gradient(&mut force, &mut positions, 1e-3);
    }

    #[test]
    fn solvated_direct_forces_match_the_numerical_gradient() {
        let (params, topology) = water_like_params();
        let (config, particles) = solvated_config(Polarization::Direct);
        let mut force =
            MultipoleForce::new(config, params, &topology, Some(particles)).unwrap();
        let mut positions = water_like_positions();
        positions[2].z = 0.2;
        assert_forces_match_gradient(&mut force, &mut positions, 1e-3);
    }

    #[test]
    fn periodic_mutual_forces_match_the_numerical_gradient() {
        let (params, topology) = water_like_params();
        let config = ForceConfig {
            cell: Some(PeriodicBox::new(12.0, 12.0, 12.0)),
            pme: Some(PmeParameters {
                alpha: 0.5,
                grid: [24, 24, 24],
            }),
            real_space_cutoff: 5.5,
            solver: SolverSettings {
                target_epsilon: 1e-9,
                ..SolverSettings::default()
            },
            ..ForceConfig::default()
        };
        let mut force = MultipoleForce::new(config, params, &topology, None).unwrap();
        let mut positions = vec![
            Vector3::new(6.0, 6.0, 6.0),
            Vector3::new(6.96, 6.0, 6.0),
            Vector3::new(5.76, 6.93, 6.2),
        ];
        assert_forces_match_gradient(&mut force, &mut positions, 5e-3);
    }

    #[test]
    fn parameter_roundtrip_reproduces_the_energy() {
        let (params, topology) = water_like_params();
        let mut force =
            MultipoleForce::new(ForceConfig::default(), params.clone(), &topology, None).unwrap();
        force.set_positions(&water_like_positions()).unwrap();
        let before = force.execute(false, true).unwrap().energy;

        force.copy_parameters_to_context(params).unwrap();
        assert!(matches!(
            force.induced_dipoles(),
            Err(EngineError::NotEvaluated)
        ));
        let after = force.execute(false, true).unwrap().energy;
        assert_close(before, after, 1e-12);
    }

    #[test]
    fn parameter_swap_with_wrong_count_fails() {
        let (params, topology) = water_like_params();
        let mut force =
            MultipoleForce::new(ForceConfig::default(), params.clone(), &topology, None).unwrap();
        assert!(matches!(
            force.copy_parameters_to_context(params[..2].to_vec()),
            Err(EngineError::ParameterCount {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn net_charge_and_dipole_moments_are_reported() {
        let params = vec![
            MultipoleParams::point_charge(1.0),
            MultipoleParams::point_charge(-1.0),
        ];
        let topology = Topology::isolated(2);
        let mut force =
            MultipoleForce::new(ForceConfig::default(), params, &topology, None).unwrap();
        force
            .set_positions(&[Vector3::zeros(), Vector3::new(2.0, 0.0, 0.0)])
            .unwrap();
        force.execute(false, true).unwrap();
        let moments = force.system_multipole_moments().unwrap();
        assert_close(moments[0], 0.0, 1e-12);
        // +q at -1 A and -q at +1 A from the center: dipole -2 e A along x.
        assert_close(moments[1], -2.0 * DEBYE, 1e-10);
        assert_close(moments[2], 0.0, 1e-12);
    }

    #[test]
    fn potential_query_sees_both_charges() {
        let params = vec![
            MultipoleParams::point_charge(1.0),
            MultipoleParams::point_charge(1.0),
        ];
        let topology = Topology::isolated(2);
        let mut force =
            MultipoleForce::new(ForceConfig::default(), params, &topology, None).unwrap();
        force
            .set_positions(&[Vector3::new(-2.0, 0.0, 0.0), Vector3::new(2.0, 0.0, 0.0)])
            .unwrap();
        force.execute(false, true).unwrap();
        let phi = force
            .electrostatic_potential(&[Vector3::zeros()])
            .unwrap();
        assert_close(phi[0], 2.0 * ELECTRIC / 2.0, 1e-10);
    }

    #[test]
    fn periodic_energy_matches_open_coulomb_for_a_tight_pair() {
        // A close pair in a large cell: the periodic images are negligible
        // and the Ewald total must land on bare Coulomb.
        let params = vec![
            MultipoleParams::point_charge(1.0),
            MultipoleParams::point_charge(-1.0),
        ];
        let topology = Topology::isolated(2);
        let config = ForceConfig {
            cell: Some(PeriodicBox::new(25.0, 25.0, 25.0)),
            pme: Some(PmeParameters {
                alpha: 0.45,
                grid: [56, 56, 56],
            }),
            real_space_cutoff: 9.0,
            ..ForceConfig::default()
        };
        let mut force = MultipoleForce::new(config, params, &topology, None).unwrap();
        force
            .set_positions(&[
                Vector3::new(12.0, 12.5, 12.5),
                Vector3::new(15.0, 12.5, 12.5),
            ])
            .unwrap();
        let eval = force.execute(true, true).unwrap();
        let coulomb = -ELECTRIC / 3.0;
        assert!(
            (eval.energy - coulomb).abs() < 5e-3 * coulomb.abs(),
            "{} vs {coulomb}",
            eval.energy
        );
    }

    #[test]
    fn solvation_lowers_the_energy_of_an_ion_pair() {
        let params = vec![
            MultipoleParams::point_charge(1.0),
            MultipoleParams::point_charge(-1.0),
        ];
        let topology = Topology::isolated(2);
        let config = ForceConfig {
            solvent: Some(crate::core::gk::GkSettings {
                include_cavity_term: false,
                ..Default::default()
            }),
            ..ForceConfig::default()
        };
        let gk_particles = vec![
            GkParticle {
                radius: 1.5,
                descreen_scale: 0.8,
            };
            2
        ];
        let mut force =
            MultipoleForce::new(config, params, &topology, Some(gk_particles)).unwrap();
        force
            .set_positions(&[Vector3::zeros(), Vector3::new(4.0, 0.0, 0.0)])
            .unwrap();
        let eval = force.execute(false, true).unwrap();
        assert!(eval.solvation_energy < 0.0);
        assert!(eval.energy < 0.0);
    }

    #[test]
    fn missing_solvent_radii_fail_at_construction() {
        let (params, topology) = water_like_params();
        let config = ForceConfig {
            solvent: Some(Default::default()),
            ..ForceConfig::default()
        };
        assert!(matches!(
            MultipoleForce::new(config, params, &topology, None),
            Err(EngineError::Configuration(_))
        ));
    }
}
