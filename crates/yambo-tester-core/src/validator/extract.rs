use super::ObservableResult;
use super::database::{compare_database, read_variables};
use crate::catalog::{ExtractionRule, Observable};
use crate::numerics::{
    NumericParseError, Tolerance, ToleranceDefaults, compare_with_tolerance, format_numeric,
    is_sane_value, parse_numeric_rows,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const REFERENCE_DIR: &str = "REFERENCE";
pub const REPORT_COMPLETION_MARKER: &str = "Game Over & Game summary";

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("expected artifact '{}' was not produced", path.display())]
    MissingArtifact { path: PathBuf },
    #[error("reference file '{}' is missing", path.display())]
    MissingReference { path: PathBuf },
    #[error("failed to read '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("malformed numeric data in '{}': {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: NumericParseError,
    },
    #[error("'{}' has no value at row {row}, column {column}", path.display())]
    MissingField {
        path: PathBuf,
        row: usize,
        column: usize,
    },
    #[error("failed to read database '{}': {reason}", path.display())]
    Database { path: PathBuf, reason: String },
    #[error("unsupported artifact '{}': {reason}", path.display())]
    Unsupported { path: PathBuf, reason: String },
}

pub fn evaluate(
    observable: &Observable,
    step: &str,
    run_dir: &Path,
    defaults: &ToleranceDefaults,
) -> Result<Vec<ObservableResult>, ExtractionError> {
    let tolerance = defaults.resolve(observable.abs_tol, observable.rel_tol);
    match &observable.rule {
        ExtractionRule::ReferenceTable {
            job,
            output,
            reference,
        } => {
            let output = job_dir(run_dir, job.as_deref()).join(output);
            let reference = run_dir.join(REFERENCE_DIR).join(reference);
            compare_tables(&observable.name, step, &output, &reference, tolerance)
        }
        ExtractionRule::ReportCompletion { job } => {
            check_report(&observable.name, step, &job_dir(run_dir, job.as_deref())).map(|result| vec![result])
        }
        ExtractionRule::Database {
            output,
            variables,
            reference,
        } => {
            let output = run_dir.join(output);
            if variables.is_empty() {
                return Err(ExtractionError::Unsupported {
                    path: output,
                    reason: "no database variables are named".to_string(),
                });
            }
            let expected = read_table(&run_dir.join(REFERENCE_DIR).join(reference), true)?.concat();
            if !output.is_file() {
                return Err(ExtractionError::MissingArtifact { path: output });
            }
            let values = read_variables(&output, variables)?;
            Ok(compare_database(&observable.name, step, &values, &expected, tolerance))
        }
        ExtractionRule::Scalar {
            file,
            row,
            column,
            expected,
        } => {
            let path = run_dir.join(file);
            let rows = read_table(&path, false)?;
            let actual = rows
                .get(*row)
                .and_then(|values| values.get(*column))
                .copied()
                .ok_or(ExtractionError::MissingField {
                    path: path.clone(),
                    row: *row,
                    column: *column,
                })?;
            Ok(vec![compare_scalar(&observable.name, step, *expected, actual, tolerance)])
        }
    }
}

fn job_dir(run_dir: &Path, job: Option<&str>) -> PathBuf {
    match job {
        Some(job) => run_dir.join(job),
        None => run_dir.to_path_buf(),
    }
}

fn read_table(path: &Path, is_reference: bool) -> Result<Vec<Vec<f64>>, ExtractionError> {
    let content = fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound if is_reference => ExtractionError::MissingReference {
            path: path.to_path_buf(),
        },
        io::ErrorKind::NotFound => ExtractionError::MissingArtifact {
            path: path.to_path_buf(),
        },
        _ => ExtractionError::Read {
            path: path.to_path_buf(),
            source,
        },
    })?;
    parse_numeric_rows(&content).map_err(|source| ExtractionError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn compare_scalar(
    name: &str,
    step: &str,
    expected: f64,
    actual: f64,
    tolerance: Tolerance,
) -> ObservableResult {
    let comparison = compare_with_tolerance(expected, actual, tolerance);
    let sane = is_sane_value(actual);
    let passed = sane && comparison.passes;
    ObservableResult {
        name: name.to_string(),
        step: step.to_string(),
        passed,
        compared: 1,
        failures: usize::from(!passed),
        max_abs_diff: Some(comparison.abs_diff),
        max_rel_diff: Some(comparison.rel_diff),
        tolerance: Some(tolerance),
        detail: (!passed).then(|| {
            format!(
                "expected {}, got {}",
                format_numeric(expected),
                format_numeric(actual)
            )
        }),
    }
}

/// One result per compared column. The first column is the abscissa and
/// is only compared when it is the sole column.
fn compare_tables(
    name: &str,
    step: &str,
    output: &Path,
    reference: &Path,
    tolerance: Tolerance,
) -> Result<Vec<ObservableResult>, ExtractionError> {
    let reference_rows = read_table(reference, true)?;
    let output_rows = read_table(output, false)?;

    let shape_failure = |detail: String| ObservableResult {
        name: name.to_string(),
        step: step.to_string(),
        passed: false,
        compared: 0,
        failures: 1,
        max_abs_diff: None,
        max_rel_diff: None,
        tolerance: Some(tolerance),
        detail: Some(detail),
    };

    if reference_rows.is_empty() {
        return Err(ExtractionError::MissingField {
            path: reference.to_path_buf(),
            row: 0,
            column: 0,
        });
    }
    if output_rows.len() != reference_rows.len() {
        return Ok(vec![shape_failure(format!(
            "row count mismatch: expected {}, got {}",
            reference_rows.len(),
            output_rows.len()
        ))]);
    }

    let column_count = reference_rows[0].len();
    let columns = if column_count == 1 { 0..1 } else { 1..column_count };

    let mut results = Vec::new();
    for column in columns {
        let column_name = format!("{name}#{column}");
        let mut compared = 0;
        let mut failures = 0;
        let mut max_abs_diff = 0.0_f64;
        let mut max_rel_diff = 0.0_f64;
        let mut first_failure = None;

        for (row, (expected_row, actual_row)) in reference_rows.iter().zip(&output_rows).enumerate() {
            let (Some(expected), Some(actual)) = (expected_row.get(column), actual_row.get(column)) else {
                failures += 1;
                first_failure.get_or_insert_with(|| format!("row {}: column {} is missing", row + 1, column));
                continue;
            };
            compared += 1;
            let comparison = compare_with_tolerance(*expected, *actual, tolerance);
            max_abs_diff = max_abs_diff.max(comparison.abs_diff);
            max_rel_diff = max_rel_diff.max(comparison.rel_diff);

            if !is_sane_value(*actual) {
                failures += 1;
                first_failure.get_or_insert_with(|| {
                    format!("row {}: NaN or too large value {}", row + 1, format_numeric(*actual))
                });
            } else if !comparison.passes {
                failures += 1;
                first_failure.get_or_insert_with(|| {
                    format!(
                        "row {}: expected {}, got {} (abs {}, rel {})",
                        row + 1,
                        format_numeric(*expected),
                        format_numeric(*actual),
                        format_numeric(comparison.abs_diff),
                        format_numeric(comparison.rel_diff)
                    )
                });
            }
        }

        results.push(ObservableResult {
            name: column_name,
            step: step.to_string(),
            passed: failures == 0,
            compared,
            failures,
            max_abs_diff: Some(max_abs_diff),
            max_rel_diff: Some(max_rel_diff),
            tolerance: Some(tolerance),
            detail: first_failure,
        });
    }

    Ok(results)
}

fn check_report(name: &str, step: &str, job_dir: &Path) -> Result<ObservableResult, ExtractionError> {
    let missing = || ExtractionError::MissingArtifact {
        path: job_dir.join("r-*"),
    };
    let entries = fs::read_dir(job_dir).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => missing(),
        _ => ExtractionError::Read {
            path: job_dir.to_path_buf(),
            source,
        },
    })?;

    let mut reports = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .is_some_and(|file_name| file_name.to_string_lossy().starts_with("r-"))
        })
        .collect::<Vec<_>>();
    reports.sort();
    let report = reports.into_iter().next().ok_or_else(missing)?;

    let content = fs::read(&report).map_err(|source| ExtractionError::Read {
        path: report.clone(),
        source,
    })?;
    let marker = REPORT_COMPLETION_MARKER.as_bytes();
    let complete = content.windows(marker.len()).any(|window| window == marker);

    Ok(ObservableResult {
        name: name.to_string(),
        step: step.to_string(),
        passed: complete,
        compared: 1,
        failures: usize::from(!complete),
        max_abs_diff: None,
        max_rel_diff: None,
        tolerance: None,
        detail: (!complete).then(|| format!("report '{}' is incomplete", report.display())),
    })
}

#[cfg(test)]
mod tests {
    use super::{ExtractionError, evaluate};
    use crate::catalog::{ExtractionRule, Observable};
    use crate::numerics::ToleranceDefaults;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const DEFAULTS: ToleranceDefaults = ToleranceDefaults {
        relative: 0.1,
        absolute: 1.0e-5,
    };

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent dir should be created");
        }
        fs::write(path, content).expect("file should be written");
    }

    fn table(reference: &str) -> Observable {
        Observable {
            name: reference.to_string(),
            rule: ExtractionRule::ReferenceTable {
                job: Some("02_gw".to_string()),
                output: reference.to_string(),
                reference: reference.to_string(),
            },
            abs_tol: None,
            rel_tol: None,
        }
    }

    #[test]
    fn table_columns_are_compared_after_the_abscissa() {
        let temp = TempDir::new().expect("tempdir should be created");
        write_file(
            &temp.path().join("REFERENCE/o-02_gw.eps"),
            "# E  Im  Re\n1.0 2.0 3.0\n2.0 4.0 5.0\n",
        );
        write_file(
            &temp.path().join("02_gw/o-02_gw.eps"),
            "# E  Im  Re\n1.0 2.1 3.0\n2.0 4.0 9.0\n",
        );

        let results = evaluate(&table("o-02_gw.eps"), "02_gw", temp.path(), &DEFAULTS)
            .expect("tables should be readable");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "o-02_gw.eps#1");
        assert!(results[0].passed);
        assert_eq!(results[1].name, "o-02_gw.eps#2");
        assert!(!results[1].passed);
        assert_eq!(results[1].failures, 1);
        assert!(
            results[1]
                .detail
                .as_deref()
                .is_some_and(|detail| detail.starts_with("row 2"))
        );
    }

    #[test]
    fn nan_and_blown_up_values_fail() {
        let temp = TempDir::new().expect("tempdir should be created");
        write_file(&temp.path().join("REFERENCE/o-qp"), "1 1.0\n2 1.0\n");
        write_file(&temp.path().join("02_gw/o-qp"), "1 NaN\n2 2e99\n");

        let results = evaluate(&table("o-qp"), "02_gw", temp.path(), &DEFAULTS)
            .expect("tables should be readable");
        assert!(!results[0].passed);
        assert_eq!(results[0].failures, 2);
    }

    #[test]
    fn row_count_mismatch_fails_without_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        write_file(&temp.path().join("REFERENCE/o-qp"), "1 1.0\n2 1.0\n");
        write_file(&temp.path().join("02_gw/o-qp"), "1 1.0\n");

        let results = evaluate(&table("o-qp"), "02_gw", temp.path(), &DEFAULTS)
            .expect("tables should be readable");
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
    }

    #[test]
    fn missing_output_is_an_extraction_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        write_file(&temp.path().join("REFERENCE/o-qp"), "1 1.0\n");

        let error = evaluate(&table("o-qp"), "02_gw", temp.path(), &DEFAULTS)
            .expect_err("output was never produced");
        assert!(matches!(error, ExtractionError::MissingArtifact { .. }));
    }

    #[test]
    fn report_completion_requires_the_marker() {
        let temp = TempDir::new().expect("tempdir should be created");
        let observable = Observable {
            name: "r-02_gw".to_string(),
            rule: ExtractionRule::ReportCompletion {
                job: Some("02_gw".to_string()),
            },
            abs_tol: None,
            rel_tol: None,
        };

        let error = evaluate(&observable, "02_gw", temp.path(), &DEFAULTS)
            .expect_err("no report yet");
        assert!(matches!(error, ExtractionError::MissingArtifact { .. }));

        write_file(&temp.path().join("02_gw/r-02_gw_ppa"), "timing\n");
        let results = evaluate(&observable, "02_gw", temp.path(), &DEFAULTS).expect("report exists");
        assert!(!results[0].passed);

        write_file(
            &temp.path().join("02_gw/r-02_gw_ppa"),
            "timing\n [07] Game Over & Game summary\n",
        );
        let results = evaluate(&observable, "02_gw", temp.path(), &DEFAULTS).expect("report exists");
        assert!(results[0].passed);
    }

    #[test]
    fn scalar_observables_use_declared_tolerance() {
        let temp = TempDir::new().expect("tempdir should be created");
        write_file(&temp.path().join("01_init/o-gap"), "# gap\n0 1.26\n");
        let observable = Observable {
            name: "gap".to_string(),
            rule: ExtractionRule::Scalar {
                file: "01_init/o-gap".to_string(),
                row: 0,
                column: 1,
                expected: 1.25,
            },
            abs_tol: Some(0.001),
            rel_tol: Some(0.0),
        };

        let results = evaluate(&observable, "01_init", temp.path(), &DEFAULTS).expect("file exists");
        assert!(!results[0].passed);

        let loose = Observable {
            abs_tol: Some(0.02),
            ..observable
        };
        let results = evaluate(&loose, "01_init", temp.path(), &DEFAULTS).expect("file exists");
        assert!(results[0].passed);
    }

    fn database(variables: &[&str]) -> Observable {
        Observable {
            name: "ndb.QP".to_string(),
            rule: ExtractionRule::Database {
                output: "02_gw/ndb.QP".to_string(),
                variables: variables.iter().map(|variable| variable.to_string()).collect(),
                reference: "ndb.QP".to_string(),
            },
            abs_tol: None,
            rel_tol: None,
        }
    }

    #[test]
    fn database_needs_reference_output_and_variables() {
        let temp = TempDir::new().expect("tempdir should be created");
        let error = evaluate(&database(&[]), "02_gw", temp.path(), &DEFAULTS)
            .expect_err("nothing to compare");
        assert!(matches!(error, ExtractionError::Unsupported { .. }));

        let error = evaluate(&database(&["QP_E"]), "02_gw", temp.path(), &DEFAULTS)
            .expect_err("no reference yet");
        assert!(matches!(error, ExtractionError::MissingReference { .. }));

        write_file(&temp.path().join("REFERENCE/ndb.QP"), "1.0\n2.0\n");
        let error = evaluate(&database(&["QP_E"]), "02_gw", temp.path(), &DEFAULTS)
            .expect_err("database was never produced");
        assert!(matches!(error, ExtractionError::MissingArtifact { .. }));
    }

    #[cfg(not(feature = "netcdf"))]
    #[test]
    fn database_without_netcdf_support_is_an_extraction_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        write_file(&temp.path().join("REFERENCE/ndb.QP"), "1.0\n2.0\n");
        write_file(&temp.path().join("02_gw/ndb.QP"), "not read");

        let error = evaluate(&database(&["QP_E"]), "02_gw", temp.path(), &DEFAULTS)
            .expect_err("netCDF support is not compiled in");
        assert!(matches!(error, ExtractionError::Unsupported { .. }));
    }

    #[cfg(feature = "netcdf")]
    #[test]
    fn database_variables_are_compared_against_reference_slices() {
        let temp = TempDir::new().expect("tempdir should be created");
        write_file(
            &temp.path().join("REFERENCE/ndb.QP"),
            "1.0\n2.0\n3.0\n0.8\n0.9\n0.7\n",
        );
        let path = temp.path().join("02_gw/ndb.QP");
        fs::create_dir_all(temp.path().join("02_gw")).expect("job dir should be created");
        {
            let mut file = netcdf::create(&path).expect("database should be created");
            file.add_dimension("n", 3).expect("dimension should be added");
            let mut energies = file
                .add_variable::<f64>("QP_E", &["n"])
                .expect("variable should be added");
            energies
                .put_values(&[1.0, 2.0, 3.0], ..)
                .expect("values should be written");
            let mut factors = file
                .add_variable::<f32>("QP_Z", &["n"])
                .expect("variable should be added");
            factors
                .put_values(&[0.8_f32, 0.9, 0.5], ..)
                .expect("values should be written");
        }

        let results = evaluate(&database(&["QP_E", "QP_Z"]), "02_gw", temp.path(), &DEFAULTS)
            .expect("database should be readable");
        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert!(!results[1].passed);

        let error = evaluate(&database(&["QP_X"]), "02_gw", temp.path(), &DEFAULTS)
            .expect_err("variable does not exist");
        assert!(matches!(error, ExtractionError::Database { .. }));
    }
}
