//! Neck-region descreening constants.
//!
//! The pairwise descreening integral misses the solvent-excluded "neck"
//! between two nearby spheres. The correction is a quartic bump
//! `A (r - B)^2 (ri + rj + 2 rw - r)^2` whose amplitude `A` and onset `B`
//! are tabulated on a 45x45 grid of sphere radii, shipped as CSV data
//! assets and loaded once.

use csv::ReaderBuilder;
use std::sync::OnceLock;
use thiserror::Error;

pub const NUM_NECK_POINTS: usize = 45;
pub const MINIMUM_NECK_RADIUS: f64 = 0.80;
pub const MAXIMUM_NECK_RADIUS: f64 = 3.00;
pub const NECK_RADIUS_SPACING: f64 = 0.05;

/// Water probe radius used for the neck window, in angstroms.
pub const WATER_RADIUS: f64 = 1.4;

const NECK_A_CSV: &str = include_str!("../../../data/neck_a.csv");
const NECK_B_CSV: &str = include_str!("../../../data/neck_b.csv");

#[derive(Debug, Error)]
pub enum NeckTableError {
    #[error("malformed neck table row: {0}")]
    Parse(String),
    #[error("neck table has {rows} rows of {cols} values, expected 45x45")]
    Shape { rows: usize, cols: usize },
}

pub struct NeckTables {
    a: Vec<f64>,
    b: Vec<f64>,
}

static TABLES: OnceLock<Result<NeckTables, NeckTableError>> = OnceLock::new();

fn parse_table(csv_text: &str) -> Result<Vec<f64>, NeckTableError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .from_reader(csv_text.as_bytes());
    let mut values = Vec::with_capacity(NUM_NECK_POINTS * NUM_NECK_POINTS);
    let mut rows = 0;
    let mut cols = 0;
    for record in reader.records() {
        let record = record.map_err(|e| NeckTableError::Parse(e.to_string()))?;
        cols = record.len();
        for field in record.iter() {
            let v: f64 = field
                .trim()
                .parse()
                .map_err(|_| NeckTableError::Parse(field.to_string()))?;
            values.push(v);
        }
        rows += 1;
    }
    if rows != NUM_NECK_POINTS || cols != NUM_NECK_POINTS {
        return Err(NeckTableError::Shape { rows, cols });
    }
    Ok(values)
}

impl NeckTables {
    /// The process-wide tables, parsed on first use.
    pub fn load() -> Result<&'static NeckTables, &'static NeckTableError> {
        TABLES
            .get_or_init(|| {
                Ok(NeckTables {
                    a: parse_table(NECK_A_CSV)?,
                    b: parse_table(NECK_B_CSV)?,
                })
            })
            .as_ref()
    }

    fn index(radius: f64) -> usize {
        let clamped = radius.clamp(MINIMUM_NECK_RADIUS, MAXIMUM_NECK_RADIUS);
        let idx = ((clamped - MINIMUM_NECK_RADIUS) / NECK_RADIUS_SPACING).round() as usize;
        idx.min(NUM_NECK_POINTS - 1)
    }

    /// Amplitude and onset for a descreened/descreening radius pair.
    /// Radii outside the tabulated range clamp to the nearest entry.
    pub fn constants(&self, radius_i: f64, radius_j: f64) -> (f64, f64) {
        let i = Self::index(radius_i);
        let j = Self::index(radius_j);
        (
            self.a[i * NUM_NECK_POINTS + j],
            self.b[i * NUM_NECK_POINTS + j],
        )
    }
}

/// Neck correction value and radial derivative at separation `r`.
pub fn neck_value(
    tables: &NeckTables,
    radius_i: f64,
    radius_j: f64,
    r: f64,
) -> (f64, f64) {
    let (a, onset) = tables.constants(radius_i, radius_j);
    let upper = radius_i + radius_j + 2.0 * WATER_RADIUS;
    if a == 0.0 || r <= onset || r >= upper {
        return (0.0, 0.0);
    }
    let lo = r - onset;
    let hi = upper - r;
    let value = a * lo * lo * hi * hi;
    let deriv = 2.0 * a * lo * hi * (hi - lo);
    (value, deriv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_parse_to_the_expected_shape() {
        let tables = NeckTables::load().expect("bundled tables must parse");
        // Spot-check that the diagonal carries positive amplitudes.
        let (a, b) = tables.constants(1.5, 1.5);
        assert!(a.is_finite() && b.is_finite());
    }

    #[test]
    fn out_of_range_radii_clamp() {
        let tables = NeckTables::load().unwrap();
        assert_eq!(tables.constants(0.1, 1.0), tables.constants(0.80, 1.0));
        assert_eq!(tables.constants(5.0, 1.0), tables.constants(3.00, 1.0));
    }

    #[test]
    fn neck_vanishes_outside_its_window() {
        let tables = NeckTables::load().unwrap();
        let (v, d) = neck_value(tables, 1.5, 1.5, 20.0);
        assert_eq!(v, 0.0);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn neck_is_smooth_and_nonnegative_inside_the_window() {
        let tables = NeckTables::load().unwrap();
        let (a, onset) = tables.constants(1.7, 1.7);
        if a <= 0.0 {
            return;
        }
        let upper = 1.7 + 1.7 + 2.0 * WATER_RADIUS;
        let mid = 0.5 * (onset + upper);
        let (v, d) = neck_value(tables, 1.7, 1.7, mid);
        assert!(v > 0.0);
        // Finite-difference check of the radial derivative.
        let h = 1e-6;
        let (vp, _) = neck_value(tables, 1.7, 1.7, mid + h);
        let (vm, _) = neck_value(tables, 1.7, 1.7, mid - h);
        assert!((d - (vp - vm) / (2.0 * h)).abs() < 1e-6);
    }
}
