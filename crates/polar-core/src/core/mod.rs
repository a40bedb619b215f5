//! # Core Module
//!
//! This module provides the stateless building blocks of the polarizable
//! multipole electrostatics model, serving as the computational core of the
//! library.
//!
//! ## Overview
//!
//! The core module implements the mathematics of atomic multipole
//! electrostatics with self-consistent induced dipoles. Everything here is a
//! pure function of its inputs; the stateful orchestration (caching, position
//! tracking, configuration) lives in the `engine` layer.
//!
//! ## Architecture
//!
//! The module is organized into specialized submodules that handle different
//! aspects of the model:
//!
//! - **Parameter Representation** ([`models`]) - Local-frame multipole
//!   parameters, bonded topology, and the periodic cell
//! - **Frame Rotation** ([`frame`]) - Local-to-lab multipole rotation and the
//!   mapping of frame torques onto anchor-particle forces
//! - **Pairwise Interactions** ([`field`]) - Real-space screened Coulomb
//!   kernels, energies, forces, torques, and field evaluation
//! - **Reciprocal Space** ([`pme`]) - Smooth particle-mesh Ewald spreading,
//!   convolution, and gathering for multipolar sources
//! - **Induced Dipoles** ([`solver`]) - Direct, DIIS-accelerated mutual, and
//!   extrapolated polarization solvers
//! - **Exclusion Rules** ([`scaling`]) - Bonded-neighbor scale factors for the
//!   permanent, direct, polarization, and mutual channels
//! - **Implicit Solvent** ([`gk`]) - Generalized Kirkwood Born radii,
//!   solvation energies, and reaction fields
//!
//! ## Conventions
//!
//! Lengths are in angstroms, charges in electron units, and energies in
//! kcal/mol; the Coulomb factor is applied once at energy assembly so fields
//! and potential derivatives stay in electron units throughout.

pub mod field;
pub mod frame;
pub mod gk;
pub mod models;
pub mod pme;
pub mod scaling;
pub mod solver;
