use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::gk::GkSettings;
use crate::core::models::PeriodicBox;
use crate::core::pme::bspline::PME_ORDER;
use crate::core::pme::PmeParameters;
use crate::core::scaling::ScaleFactors;
use crate::core::solver::SolverSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Full evaluation settings for a multipole force.
///
/// Periodic systems require both a `cell` and `pme`; open-boundary systems
/// leave both out and may add a generalized Kirkwood `solvent` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceConfig {
    /// Real-space cutoff for the screened Ewald sum, in angstroms.
    pub real_space_cutoff: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell: Option<PeriodicBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pme: Option<PmeParameters>,
    pub solver: SolverSettings,
    pub scaling: ScaleFactors,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solvent: Option<GkSettings>,
}

impl Default for ForceConfig {
    fn default() -> Self {
        Self {
            real_space_cutoff: 7.0,
            cell: None,
            pme: None,
            solver: SolverSettings::default(),
            scaling: ScaleFactors::default(),
            solvent: None,
        }
    }
}

impl ForceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Toml {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.cell, &self.pme) {
            (Some(cell), Some(pme)) => {
                if !cell.is_valid() {
                    return Err(ConfigError::Invalid(format!(
                        "periodic cell lengths must be positive, got {:?}",
                        cell.lengths
                    )));
                }
                if !(pme.alpha > 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "ewald alpha must be positive, got {}",
                        pme.alpha
                    )));
                }
                for (axis, &n) in pme.grid.iter().enumerate() {
                    if n < PME_ORDER {
                        return Err(ConfigError::Invalid(format!(
                            "pme grid axis {axis} has {n} points, need at least {PME_ORDER}"
                        )));
                    }
                    if !is_smooth(n) {
                        warn!(axis, size = n, "pme grid size is not a product of small primes, transforms will be slow");
                    }
                }
                let half_min = 0.5 * cell.lengths.min();
                if self.real_space_cutoff > half_min {
                    return Err(ConfigError::Invalid(format!(
                        "real-space cutoff {} exceeds half the shortest cell length {half_min}",
                        self.real_space_cutoff
                    )));
                }
                if self.solvent.is_some() {
                    return Err(ConfigError::Invalid(
                        "implicit solvent is only available with open boundaries".into(),
                    ));
                }
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(ConfigError::Invalid(
                    "a periodic cell requires pme parameters".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "pme parameters require a periodic cell".into(),
                ));
            }
        }
        if !(self.real_space_cutoff > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "real-space cutoff must be positive, got {}",
                self.real_space_cutoff
            )));
        }
        if !(self.solver.target_epsilon > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "solver target epsilon must be positive, got {}",
                self.solver.target_epsilon
            )));
        }
        if self.solver.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "solver max_iterations must be at least 1".into(),
            ));
        }
        if let Some(solvent) = &self.solvent {
            if !(solvent.solvent_dielectric > 0.0) || !(solvent.solute_dielectric > 0.0) {
                return Err(ConfigError::Invalid(
                    "solvent and solute dielectrics must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn is_periodic(&self) -> bool {
        self.cell.is_some()
    }
}

/// Grid sizes whose only prime factors are 2, 3, 5, or 7 keep the FFT fast.
fn is_smooth(n: usize) -> bool {
    let mut n = n;
    for p in [2, 3, 5, 7] {
        while n % p == 0 {
            n /= p;
        }
    }
    n == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_validates() {
        assert!(ForceConfig::default().validate().is_ok());
    }

    #[test]
    fn smooth_grid_sizes_are_recognized() {
        assert!(is_smooth(64));
        assert!(is_smooth(90));
        assert!(!is_smooth(66));
    }

    #[test]
    fn cell_without_pme_is_rejected() {
        let config = ForceConfig {
            cell: Some(PeriodicBox::new(20.0, 20.0, 20.0)),
            ..ForceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn cutoff_larger_than_half_the_cell_is_rejected() {
        let config = ForceConfig {
            cell: Some(PeriodicBox::new(12.0, 20.0, 20.0)),
            pme: Some(PmeParameters {
                alpha: 0.4,
                grid: [24, 32, 32],
            }),
            real_space_cutoff: 7.0,
            ..ForceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn solvent_with_periodic_cell_is_rejected() {
        let config = ForceConfig {
            cell: Some(PeriodicBox::new(20.0, 20.0, 20.0)),
            pme: Some(PmeParameters {
                alpha: 0.4,
                grid: [32, 32, 32],
            }),
            solvent: Some(GkSettings::default()),
            ..ForceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ForceConfig {
            cell: Some(PeriodicBox::new(25.0, 25.0, 25.0)),
            pme: Some(PmeParameters {
                alpha: 0.45,
                grid: [56, 56, 56],
            }),
            ..ForceConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        let back: ForceConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn loads_a_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("force.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "real_space_cutoff = 9.0").unwrap();
        writeln!(file, "[solver]").unwrap();
        writeln!(file, "polarization = \"direct\"").unwrap();
        writeln!(file, "target_epsilon = 1e-4").unwrap();
        writeln!(file, "max_iterations = 40").unwrap();
        writeln!(file, "coefficients = []").unwrap();
        drop(file);

        let config = ForceConfig::load(&path).unwrap();
        assert_eq!(config.real_space_cutoff, 9.0);
        assert_eq!(config.solver.max_iterations, 40);
        assert!(config.cell.is_none());
    }
}
