use crate::config::EffectiveConfig;
use crate::domain::TesterError;
use crate::executables::{BuildInfo, ExecutableSet};
use crate::scheduler::IndexedOutcome;
use crate::validator::{TestOutcome, Verdict};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl VerdictCounts {
    fn record(&mut self, verdict: Verdict) {
        self.total += 1;
        match verdict {
            Verdict::Pass => self.passed += 1,
            Verdict::Fail => self.failed += 1,
            Verdict::Skipped => self.skipped += 1,
            Verdict::Error => self.errors += 1,
        }
    }
}

/// Invocation facts that are not derived from the outcomes.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    pub session_dir: Option<PathBuf>,
    pub build_info: Option<BuildInfo>,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportBundle {
    pub generated_at_unix_seconds: u64,
    pub passed: bool,
    pub interrupted: bool,
    pub label: String,
    pub session_dir: Option<String>,
    pub counts: VerdictCounts,
    pub config: EffectiveConfig,
    pub executables: BTreeMap<String, Option<String>>,
    pub mpi_launcher: Option<String>,
    pub build_info: Option<BuildInfo>,
    pub outcomes: Vec<TestOutcome>,
}

impl ReportBundle {
    /// 0 when nothing failed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed { 0 } else { 1 }
    }
}

/// Restores plan order and tallies verdicts. `passed` holds when no
/// outcome is FAIL or ERROR.
pub fn aggregate(
    mut outcomes: Vec<IndexedOutcome>,
    config: &EffectiveConfig,
    executables: &ExecutableSet,
    metadata: RunMetadata,
) -> ReportBundle {
    outcomes.sort_by_key(|indexed| indexed.index);

    let mut counts = VerdictCounts::default();
    for indexed in &outcomes {
        counts.record(indexed.outcome.verdict);
    }

    let executable_paths = crate::domain::ExecutableRole::ALL
        .into_iter()
        .map(|role| {
            (
                role.as_str().to_string(),
                executables.path(role).map(normalize_path),
            )
        })
        .collect();

    ReportBundle {
        generated_at_unix_seconds: current_unix_timestamp_seconds(),
        passed: counts.failed == 0 && counts.errors == 0,
        interrupted: metadata.interrupted,
        label: config.label.clone(),
        session_dir: metadata.session_dir.as_deref().map(normalize_path),
        counts,
        config: config.clone(),
        executables: executable_paths,
        mpi_launcher: executables.launcher().map(normalize_path),
        build_info: metadata.build_info,
        outcomes: outcomes.into_iter().map(|indexed| indexed.outcome).collect(),
    }
}

pub fn render_human_summary(bundle: &ReportBundle) -> String {
    let mut lines = Vec::new();
    let status = if bundle.passed { "PASS" } else { "FAIL" };
    lines.push(format!("Test suite status: {}", status));
    if bundle.interrupted {
        lines.push("Run was interrupted before all tests completed".to_string());
    }
    if let Some(version) = bundle
        .build_info
        .as_ref()
        .and_then(|info| info.version.as_deref())
    {
        lines.push(format!("Yambo version: {}", version));
    }
    lines.push(format!(
        "Runs: {} total ({} passed, {} failed, {} skipped, {} errors)",
        bundle.counts.total,
        bundle.counts.passed,
        bundle.counts.failed,
        bundle.counts.skipped,
        bundle.counts.errors
    ));

    for outcome in &bundle.outcomes {
        lines.push(format!(
            "{} [{}]: {}",
            outcome.test, outcome.mode, outcome.verdict
        ));
        if outcome.verdict != Verdict::Pass {
            if let Some(reason) = outcome.first_failure() {
                lines.push(format!("  {}", reason));
            }
        }
    }

    lines.join("\n")
}

#[derive(Debug)]
pub enum ReportError {
    ReportDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    SerializeReport {
        path: PathBuf,
        source: serde_json::Error,
    },
    WriteReport {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Display for ReportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReportDirectory { path, source } => write!(
                f,
                "failed to create report directory '{}': {}",
                path.display(),
                source
            ),
            Self::SerializeReport { path, source } => write!(
                f,
                "failed to serialize report '{}': {}",
                path.display(),
                source
            ),
            Self::WriteReport { path, source } => {
                write!(f, "failed to write report '{}': {}", path.display(), source)
            }
        }
    }
}

impl Error for ReportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ReportDirectory { source, .. } => Some(source),
            Self::SerializeReport { source, .. } => Some(source),
            Self::WriteReport { source, .. } => Some(source),
        }
    }
}

impl From<ReportError> for TesterError {
    fn from(error: ReportError) -> Self {
        let message = error.to_string();
        match error {
            ReportError::ReportDirectory { .. } | ReportError::WriteReport { .. } => {
                TesterError::io_system("IO.REPORT", message)
            }
            ReportError::SerializeReport { .. } => TesterError::internal("SYS.REPORT", message),
        }
    }
}

pub fn write_report(report_path: &Path, bundle: &ReportBundle) -> Result<(), ReportError> {
    if let Some(parent_dir) = report_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent_dir).map_err(|source| ReportError::ReportDirectory {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    let report_json =
        serde_json::to_string_pretty(bundle).map_err(|source| ReportError::SerializeReport {
            path: report_path.to_path_buf(),
            source,
        })?;
    fs::write(report_path, report_json).map_err(|source| ReportError::WriteReport {
        path: report_path.to_path_buf(),
        source,
    })
}

pub fn current_unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
