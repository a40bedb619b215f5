//! Data models for the electrostatics engine: per-particle multipole
//! parameters with their local-frame definitions, and the reduced bonded
//! topology (covalent shells and polarization groups) from which the
//! exclusion scale tables are derived.

pub mod cell;
pub mod multipole;
pub mod topology;

pub use cell::PeriodicBox;
pub use multipole::{AxisType, FrameDef, LabMultipole, MultipoleParams};
pub use topology::Topology;
