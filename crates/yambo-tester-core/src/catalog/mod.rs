//! Test definitions, selection and run planning.

mod parser;

pub use parser::{DEFINITION_FILE_NAME, parse_definition};

use crate::domain::{ExecutableRole, ParallelMode, TesterError};
use crate::executables::ExecutableSet;
use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// How an observable value is obtained from a run's artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionRule {
    /// Numeric table `<job>/<output>` compared column by column against
    /// `REFERENCE/<reference>`.
    ReferenceTable {
        job: Option<String>,
        output: String,
        reference: String,
    },
    /// First `r-*` report in the job directory must be complete.
    ReportCompletion { job: Option<String> },
    /// Variables of the netCDF database `<output>` compared against the flat
    /// list in `REFERENCE/<reference>`.
    Database {
        output: String,
        variables: Vec<String>,
        reference: String,
    },
    /// Single value at `row`/`column` (zero based, comments skipped) of a
    /// numeric table relative to the run directory.
    Scalar {
        file: String,
        row: usize,
        column: usize,
        expected: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observable {
    pub name: String,
    pub rule: ExtractionRule,
    pub abs_tol: Option<f64>,
    pub rel_tol: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStep {
    pub name: String,
    pub executable: ExecutableRole,
    pub input: Option<String>,
    pub job: Option<String>,
    pub flags: Option<String>,
    pub observables: Vec<Observable>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestDefinition {
    pub id: String,
    pub name: String,
    pub variant: String,
    pub source_dir: PathBuf,
    pub tarball_sha256: Option<String>,
    pub modes: Vec<ParallelMode>,
    pub steps: Vec<RunStep>,
}

impl TestDefinition {
    pub fn required_roles(&self) -> BTreeSet<ExecutableRole> {
        self.steps.iter().map(|step| step.executable).collect()
    }

    pub fn supports(&self, mode: ParallelMode) -> bool {
        self.modes.contains(&mode)
    }

    pub fn needs_tarball(&self) -> bool {
        self.tarball_sha256.is_some()
    }

    pub fn tarball_name(&self) -> String {
        format!("{}_{}.tar.gz", self.name, self.variant)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("tests directory '{}' is not a directory", path.display())]
    NotADirectory { path: PathBuf },
    #[error("failed to scan '{}': {source}", path.display())]
    Scan {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("failed to read test definition '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse test definition '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
    #[error("invalid test definition '{}': {message}", path.display())]
    Definition { path: PathBuf, message: String },
    #[error("test '{id}' is defined more than once")]
    Duplicate { id: String },
    #[error("unknown test '{pattern}': no definition matches it")]
    UnknownTest { pattern: String },
    #[error("invalid test pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
}

impl From<CatalogError> for TesterError {
    fn from(error: CatalogError) -> Self {
        let message = error.to_string();
        match error {
            CatalogError::NotADirectory { .. } | CatalogError::Scan { .. } | CatalogError::Read { .. } => {
                TesterError::io_system("IO.TEST_CATALOG", message)
            }
            CatalogError::Parse { .. } | CatalogError::Definition { .. } | CatalogError::Duplicate { .. } => {
                TesterError::input_validation("INPUT.TEST_DEFINITION", message)
            }
            CatalogError::UnknownTest { .. } | CatalogError::Pattern { .. } => {
                TesterError::input_validation("INPUT.UNKNOWN_TEST", message)
            }
        }
    }
}

/// Finds every `<tests_dir>/<name>/<variant>/tests.toml`, sorted. Hidden
/// directories are ignored and symlinked ones are followed.
pub fn discover(tests_dir: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    if !tests_dir.is_dir() {
        return Err(CatalogError::NotADirectory {
            path: tests_dir.to_path_buf(),
        });
    }

    let walker = WalkDir::new(tests_dir)
        .max_depth(DEFINITION_DEPTH)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    let mut found = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|source| {
            let path = source.path().unwrap_or(tests_dir).to_path_buf();
            CatalogError::Scan { path, source }
        })?;
        if entry.depth() == DEFINITION_DEPTH
            && entry.file_type().is_file()
            && entry.file_name() == DEFINITION_FILE_NAME
        {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

/// `<name>/<variant>/tests.toml` below the tests directory.
const DEFINITION_DEPTH: usize = 3;

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Loads definitions from `tests.toml` paths laid out as
/// `<name>/<variant>/tests.toml`. The result is ordered by test id.
pub fn load(paths: &[PathBuf]) -> Result<Vec<TestDefinition>, CatalogError> {
    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let source_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let variant = dir_name(source_dir);
        let name = source_dir.parent().map(dir_name).unwrap_or_default();
        if name.is_empty() || variant.is_empty() {
            return Err(CatalogError::Definition {
                path: path.clone(),
                message: "expected the layout <name>/<variant>/tests.toml".to_string(),
            });
        }

        let content = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.clone(),
            source,
        })?;
        let definition = parse_definition(&content, &name, &variant, source_dir, path)?;
        debug!(test = %definition.id, steps = definition.steps.len(), "test definition loaded");
        definitions.push(definition);
    }

    definitions.sort_by(|left, right| left.id.cmp(&right.id));
    if let Some(window) = definitions.windows(2).find(|window| window[0].id == window[1].id) {
        return Err(CatalogError::Duplicate {
            id: window[0].id.clone(),
        });
    }
    Ok(definitions)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Scans `tests_dir` and loads everything found.
pub fn load_suite(tests_dir: &Path) -> Result<Vec<TestDefinition>, CatalogError> {
    load(&discover(tests_dir)?)
}

enum Selector {
    Id(String),
    Name(String),
    Glob(GlobMatcher),
}

impl Selector {
    fn parse(pattern: &str) -> Result<Self, CatalogError> {
        let pattern = pattern.trim();
        if pattern.contains(['*', '?', '[', '{']) {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|source| CatalogError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
            return Ok(Self::Glob(glob.compile_matcher()));
        }
        if pattern.contains('/') {
            Ok(Self::Id(pattern.trim_end_matches('/').to_string()))
        } else {
            Ok(Self::Name(pattern.to_string()))
        }
    }

    fn matches(&self, definition: &TestDefinition) -> bool {
        match self {
            Self::Id(id) => definition.id == *id,
            Self::Name(name) => definition.name == *name,
            Self::Glob(glob) => glob.is_match(&definition.id) || glob.is_match(&definition.name),
        }
    }
}

fn compile(patterns: &[String], catalog: &[TestDefinition]) -> Result<Vec<Selector>, CatalogError> {
    let mut selectors = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let selector = Selector::parse(pattern)?;
        if !catalog.iter().any(|definition| selector.matches(definition)) {
            return Err(CatalogError::UnknownTest {
                pattern: pattern.clone(),
            });
        }
        selectors.push(selector);
    }
    Ok(selectors)
}

/// Applies include/exclude patterns. An empty include list selects the
/// whole catalog. Every pattern has to match at least one definition.
/// Catalog order is preserved.
pub fn select(
    catalog: &[TestDefinition],
    include: &[String],
    exclude: &[String],
) -> Result<Vec<TestDefinition>, CatalogError> {
    let included = compile(include, catalog)?;
    let excluded = compile(exclude, catalog)?;

    let mut seen = HashSet::new();
    Ok(catalog
        .iter()
        .filter(|definition| included.is_empty() || included.iter().any(|selector| selector.matches(definition)))
        .filter(|definition| !excluded.iter().any(|selector| selector.matches(definition)))
        .filter(|definition| seen.insert(definition.id.clone()))
        .cloned()
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Run,
    Skip { reason: String },
}

/// One (test, mode) pair in selection order.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub index: usize,
    pub test: Arc<TestDefinition>,
    pub mode: ParallelMode,
    pub disposition: Disposition,
}

/// Expands the selection over the requested modes, test-major. Runs whose
/// mode is not applicable or whose executables are absent are marked
/// skipped instead of being dropped.
pub fn plan(
    selected: Vec<TestDefinition>,
    modes: &[ParallelMode],
    executables: &ExecutableSet,
) -> Vec<PlannedRun> {
    let mut planned = Vec::with_capacity(selected.len() * modes.len());
    for definition in selected {
        let missing = definition
            .required_roles()
            .into_iter()
            .filter(|role| !executables.is_available(*role))
            .map(|role| role.as_str())
            .collect::<Vec<_>>();
        let test = Arc::new(definition);

        for mode in modes {
            let disposition = if !missing.is_empty() {
                Disposition::Skip {
                    reason: format!("missing executable: {}", missing.join(", ")),
                }
            } else if !test.supports(*mode) {
                Disposition::Skip {
                    reason: format!("mode '{}' is not applicable to this test", mode),
                }
            } else {
                Disposition::Run
            };
            planned.push(PlannedRun {
                index: planned.len(),
                test: Arc::clone(&test),
                mode: *mode,
                disposition,
            });
        }
    }
    planned
}
