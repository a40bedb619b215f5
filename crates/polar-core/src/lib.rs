//! # PolarMM Core Library
//!
//! A library for polarizable atomic multipole electrostatics: permanent
//! charge, dipole, and quadrupole interactions with self-consistent induced
//! dipoles, evaluated either in a periodic cell via smooth particle-mesh
//! Ewald or with open boundaries, optionally coupled to a generalized
//! Kirkwood implicit-solvent model.
//!
//! ## Architectural Philosophy
//!
//! The library is split into two layers with a strict dependency direction:
//!
//! - **[`core`]: The Foundation.** Stateless mathematics: local-frame
//!   multipole rotation and torque mapping, screened pairwise kernels, the
//!   particle-mesh Ewald machinery, the induced-dipole solvers, exclusion
//!   scaling, and the Born-radius/reaction-field model. Every function is a
//!   pure map from inputs to outputs and is tested in isolation.
//!
//! - **[`engine`]: The Evaluation Layer.** The stateful
//!   [`engine::force::MultipoleForce`] owns per-system resources (grid,
//!   exclusion tables, solvent model), tracks position and parameter
//!   validity, and runs the full evaluation pipeline, exposing energies,
//!   forces, and post-evaluation queries for dipoles, potentials, and
//!   aggregate moments.
//!
//! Units throughout are angstroms, electron charges, and kcal/mol.

pub mod core;
pub mod engine;
