//! netCDF databases (`ndb.*`) written by yambo.
//!
//! The reference for a database is a flat list of numbers holding every
//! named variable back to back, `len / nvars` values each. Each variable is
//! flattened in storage order and its leading values are compared against
//! its slice of the reference.

use super::ObservableResult;
use super::extract::ExtractionError;
use crate::numerics::{TOO_LARGE, Tolerance, compare_with_tolerance, format_numeric};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseVariable {
    pub name: String,
    pub values: Vec<f64>,
}

#[cfg(feature = "netcdf")]
pub fn read_variables(path: &Path, names: &[String]) -> Result<Vec<DatabaseVariable>, ExtractionError> {
    let unreadable = |reason: String| ExtractionError::Database {
        path: path.to_path_buf(),
        reason,
    };
    let file = netcdf::open(path).map_err(|source| unreadable(source.to_string()))?;

    names
        .iter()
        .map(|name| {
            let variable = file
                .variable(name)
                .ok_or_else(|| unreadable(format!("variable '{name}' is missing")))?;
            let values = variable
                .get_values::<f64, _>(..)
                .map_err(|source| unreadable(format!("variable '{name}': {source}")))?;
            Ok(DatabaseVariable {
                name: name.clone(),
                values,
            })
        })
        .collect()
}

#[cfg(not(feature = "netcdf"))]
pub fn read_variables(path: &Path, _names: &[String]) -> Result<Vec<DatabaseVariable>, ExtractionError> {
    Err(ExtractionError::Unsupported {
        path: path.to_path_buf(),
        reason: "built without netCDF support; enable the `netcdf` feature".to_string(),
    })
}

/// One result per variable, named `<name>:<variable>`.
pub fn compare_database(
    name: &str,
    step: &str,
    variables: &[DatabaseVariable],
    reference: &[f64],
    tolerance: Tolerance,
) -> Vec<ObservableResult> {
    let chunk = reference.len() / variables.len().max(1);

    variables
        .iter()
        .enumerate()
        .map(|(index, variable)| {
            let expected = &reference[index * chunk..(index + 1) * chunk];
            compare_variable(&format!("{name}:{}", variable.name), step, &variable.values, expected, tolerance)
        })
        .collect()
}

fn compare_variable(
    name: &str,
    step: &str,
    values: &[f64],
    expected: &[f64],
    tolerance: Tolerance,
) -> ObservableResult {
    let failed = |compared: usize, detail: String| ObservableResult {
        name: name.to_string(),
        step: step.to_string(),
        passed: false,
        compared,
        failures: 1,
        max_abs_diff: None,
        max_rel_diff: None,
        tolerance: Some(tolerance),
        detail: Some(detail),
    };

    let all_nan = !values.is_empty() && values.iter().all(|value| value.is_nan());
    if all_nan || values.iter().any(|value| value.abs() >= TOO_LARGE) {
        return failed(0, "NaN or too large value in database".to_string());
    }
    if values.len() < expected.len() {
        return failed(
            0,
            format!("expected at least {} values, got {}", expected.len(), values.len()),
        );
    }

    let mut failures = 0;
    let mut max_abs_diff = 0.0_f64;
    let mut max_rel_diff = 0.0_f64;
    let mut first_failure = None;
    for (position, (expected, actual)) in expected.iter().zip(values).enumerate() {
        let comparison = compare_with_tolerance(*expected, *actual, tolerance);
        max_abs_diff = max_abs_diff.max(comparison.abs_diff);
        max_rel_diff = max_rel_diff.max(comparison.rel_diff);
        if !comparison.passes {
            failures += 1;
            first_failure.get_or_insert_with(|| {
                format!(
                    "value {}: expected {}, got {}",
                    position + 1,
                    format_numeric(*expected),
                    format_numeric(*actual)
                )
            });
        }
    }

    ObservableResult {
        name: name.to_string(),
        step: step.to_string(),
        passed: failures == 0,
        compared: expected.len(),
        failures,
        max_abs_diff: Some(max_abs_diff),
        max_rel_diff: Some(max_rel_diff),
        tolerance: Some(tolerance),
        detail: first_failure,
    }
}
