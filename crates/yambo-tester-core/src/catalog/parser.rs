use super::{CatalogError, ExtractionRule, Observable, RunStep, TestDefinition};
use crate::domain::{ExecutableRole, ParallelMode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFINITION_FILE_NAME: &str = "tests.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDocument {
    exe: String,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    flags: Option<String>,
    /// Accepted for compatibility with existing suites; carries no behavior.
    #[serde(default)]
    #[allow(dead_code)]
    actions: Option<toml::Value>,
    #[serde(default)]
    reference: BTreeMap<String, ReferenceTarget>,
    #[serde(default)]
    observables: BTreeMap<String, ObservableDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReferenceTarget {
    File(String),
    Database(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ObservableDocument {
    file: String,
    row: usize,
    column: usize,
    expected: f64,
    #[serde(default)]
    abs_tol: Option<f64>,
    #[serde(default)]
    rel_tol: Option<f64>,
}

/// Parses one `tests.toml`. `origin` is only used in error messages.
pub fn parse_definition(
    content: &str,
    name: &str,
    variant: &str,
    source_dir: &Path,
    origin: &Path,
) -> Result<TestDefinition, CatalogError> {
    let table = toml::from_str::<toml::Table>(content).map_err(|source| CatalogError::Parse {
        path: origin.to_path_buf(),
        source: Box::new(source),
    })?;
    let invalid = |message: String| CatalogError::Definition {
        path: origin.to_path_buf(),
        message,
    };

    let mut tarball_sha256 = None;
    let mut modes = ParallelMode::ALL.to_vec();
    let mut steps = Vec::new();

    for (key, value) in table {
        match key.as_str() {
            "sha256" => {
                let digest = value
                    .as_str()
                    .ok_or_else(|| invalid("'sha256' must be a string".to_string()))?;
                tarball_sha256 = Some(digest.trim().to_ascii_lowercase());
            }
            "modes" => {
                let declared = value
                    .try_into::<Vec<ParallelMode>>()
                    .map_err(|error| invalid(format!("'modes' is invalid: {error}")))?;
                if declared.is_empty() {
                    return Err(invalid("'modes' must not be empty".to_string()));
                }
                modes = declared;
            }
            _ if value.is_table() => {
                let document = value
                    .try_into::<StepDocument>()
                    .map_err(|error| invalid(format!("step '{key}' is invalid: {error}")))?;
                steps.push(build_step(key, document).map_err(invalid)?);
            }
            _ => return Err(invalid(format!("unknown top-level key '{key}'"))),
        }
    }

    if steps.is_empty() {
        return Err(invalid("no run steps are defined".to_string()));
    }
    steps.sort_by(|left, right| {
        left.input
            .as_deref()
            .unwrap_or_default()
            .cmp(right.input.as_deref().unwrap_or_default())
            .then_with(|| left.name.cmp(&right.name))
    });

    Ok(TestDefinition {
        id: format!("{name}/{variant}"),
        name: name.to_string(),
        variant: variant.to_string(),
        source_dir: source_dir.to_path_buf(),
        tarball_sha256,
        modes,
        steps,
    })
}

fn build_step(name: String, document: StepDocument) -> Result<RunStep, String> {
    let executable = ExecutableRole::from_name(&document.exe)
        .ok_or_else(|| format!("step '{name}' uses unknown executable '{}'", document.exe))?;
    let job = non_empty(document.output);

    let mut observables = Vec::new();
    for (reference, target) in document.reference {
        let rule = match target {
            ReferenceTarget::Database(mut entries) => {
                if entries.is_empty() {
                    return Err(format!("reference '{reference}' lists no database file"));
                }
                let output = entries.remove(0);
                ExtractionRule::Database {
                    output,
                    variables: entries,
                    reference: reference.clone(),
                }
            }
            ReferenceTarget::File(output) if reference.contains(".ndb") => ExtractionRule::Database {
                output,
                variables: Vec::new(),
                reference: reference.clone(),
            },
            ReferenceTarget::File(_) if reference.starts_with("r-") => ExtractionRule::ReportCompletion {
                job: job.clone(),
            },
            ReferenceTarget::File(output) => ExtractionRule::ReferenceTable {
                job: job.clone(),
                output,
                reference: reference.clone(),
            },
        };
        observables.push(Observable {
            name: reference,
            rule,
            abs_tol: None,
            rel_tol: None,
        });
    }

    for (observable, document) in document.observables {
        for (key, value) in [("abs_tol", document.abs_tol), ("rel_tol", document.rel_tol)] {
            if value.is_some_and(|value| !value.is_finite() || value < 0.0) {
                return Err(format!("observable '{observable}' has a negative {key}"));
            }
        }
        observables.push(Observable {
            name: observable,
            rule: ExtractionRule::Scalar {
                file: document.file,
                row: document.row,
                column: document.column,
                expected: document.expected,
            },
            abs_tol: document.abs_tol,
            rel_tol: document.rel_tol,
        });
    }

    Ok(RunStep {
        name,
        executable,
        input: non_empty(document.input),
        job,
        flags: non_empty(document.flags),
        observables,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
