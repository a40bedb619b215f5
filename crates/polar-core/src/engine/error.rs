use thiserror::Error;

use crate::core::gk::GkError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Parameter count mismatch: system has {expected} particles, got {actual}")]
    ParameterCount { expected: usize, actual: usize },

    #[error("Positions have not been set before evaluation")]
    PositionsNotSet,

    #[error("Dipoles, potentials, and moments are only valid after an execute call")]
    NotEvaluated,

    #[error("Implicit solvent setup failed: {source}")]
    Solvent {
        #[from]
        source: GkError,
    },

    #[error("Topology is inconsistent: {0}")]
    Topology(String),

    #[error("Internal logic error: {0}")]
    Internal(String),
}
