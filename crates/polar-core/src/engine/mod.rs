//! # Engine Module
//!
//! This module implements the stateful evaluation layer on top of the
//! stateless `core` mathematics: configuration, cached per-system state, and
//! the full per-call pipeline from positions to energies, forces, and
//! diagnostic queries.
//!
//! ## Overview
//!
//! A [`force::MultipoleForce`] is constructed once per particle system from a
//! validated [`config::ForceConfig`], the per-particle multipole parameters,
//! and the bonded topology. It owns the reciprocal-space grid, the exclusion
//! tables, and the optional implicit-solvent model, so repeated evaluations
//! reuse every allocation. Positions flow in through an explicit
//! "positions changed" signal that invalidates the cached multipole state.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Boundary conditions, mesh parameters,
//!   solver settings, and exclusion factors, loadable from TOML
//! - **Force Evaluation** ([`force`]) - The composite pipeline and its
//!   post-evaluation dipole, potential, and moment queries
//! - **Error Handling** ([`error`]) - Engine-specific error types and
//!   error propagation

pub mod config;
pub mod error;
pub mod force;
