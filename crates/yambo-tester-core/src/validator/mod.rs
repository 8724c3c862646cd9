//! Turns the artifacts of a finished run into a verdict.

mod database;
mod extract;

pub use crate::numerics::compare_with_tolerance;
pub use extract::{ExtractionError, REFERENCE_DIR, REPORT_COMPLETION_MARKER, evaluate};

use crate::catalog::PlannedRun;
use crate::domain::ParallelMode;
use crate::numerics::{Tolerance, ToleranceDefaults};
use crate::scheduler::{RunInstance, StepExecution};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Skipped,
    Error,
}

impl Verdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
        }
    }

    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservableResult {
    pub name: String,
    pub step: String,
    pub passed: bool,
    pub compared: usize,
    pub failures: usize,
    pub max_abs_diff: Option<f64>,
    pub max_rel_diff: Option<f64>,
    pub tolerance: Option<Tolerance>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub name: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl From<&StepExecution> for StepSummary {
    fn from(execution: &StepExecution) -> Self {
        Self {
            name: execution.step.clone(),
            command: execution.command_line.clone(),
            exit_code: execution.capture.exit_code,
            timed_out: execution.capture.timed_out,
            cancelled: execution.capture.cancelled,
            elapsed_ms: execution.capture.elapsed_ms,
        }
    }
}

/// Verdict of one (test, mode) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestOutcome {
    pub test: String,
    pub mode: ParallelMode,
    pub verdict: Verdict,
    pub detail: Option<String>,
    pub work_dir: Option<String>,
    pub elapsed_ms: u64,
    pub steps: Vec<StepSummary>,
    pub observables: Vec<ObservableResult>,
}

impl TestOutcome {
    pub fn skipped(planned: &PlannedRun, reason: impl Into<String>) -> Self {
        Self {
            test: planned.test.id.clone(),
            mode: planned.mode,
            verdict: Verdict::Skipped,
            detail: Some(reason.into()),
            work_dir: None,
            elapsed_ms: 0,
            steps: Vec::new(),
            observables: Vec::new(),
        }
    }

    /// Execution or environment failure; extraction is bypassed.
    pub fn error(planned: &PlannedRun, detail: impl Into<String>, run: Option<&RunInstance>) -> Self {
        Self {
            test: planned.test.id.clone(),
            mode: planned.mode,
            verdict: Verdict::Error,
            detail: Some(detail.into()),
            work_dir: run.map(|run| run.work_dir.display().to_string()),
            elapsed_ms: run.map_or(0, RunInstance::elapsed_ms),
            steps: run
                .map(|run| run.steps.iter().map(StepSummary::from).collect())
                .unwrap_or_default(),
            observables: Vec::new(),
        }
    }

    pub fn first_failure(&self) -> Option<String> {
        if let Some(observable) = self.observables.iter().find(|observable| !observable.passed) {
            return Some(match &observable.detail {
                Some(detail) => format!("{}: {}", observable.name, detail),
                None => observable.name.clone(),
            });
        }
        self.detail.clone()
    }
}

/// Checks every observable declared by the test against the artifacts in
/// the run's work directory. Any extraction error makes the whole outcome
/// ERROR; otherwise a single failing observable makes it FAIL.
pub fn validate(planned: &PlannedRun, run: &RunInstance, defaults: &ToleranceDefaults) -> TestOutcome {
    let definition = &planned.test;

    if let Some(failed) = run.steps.iter().find(|execution| !execution.capture.succeeded()) {
        return TestOutcome::error(planned, format!("step '{}' did not complete", failed.step), Some(run));
    }
    if run.steps.len() != definition.steps.len() {
        return TestOutcome::error(
            planned,
            format!(
                "{} of {} steps were executed",
                run.steps.len(),
                definition.steps.len()
            ),
            Some(run),
        );
    }

    let mut observables = Vec::new();
    let mut errors = Vec::new();
    for step in &definition.steps {
        for observable in &step.observables {
            match evaluate(observable, &step.name, &run.work_dir, defaults) {
                Ok(results) => observables.extend(results),
                Err(error) => errors.push(format!("{}: {}", observable.name, error)),
            }
        }
    }

    let verdict = if !errors.is_empty() {
        Verdict::Error
    } else if observables.iter().all(|observable| observable.passed) {
        Verdict::Pass
    } else {
        Verdict::Fail
    };
    debug!(
        test = %definition.id,
        mode = %planned.mode,
        verdict = %verdict,
        observables = observables.len(),
        "run validated"
    );

    TestOutcome {
        test: definition.id.clone(),
        mode: planned.mode,
        verdict,
        detail: (!errors.is_empty()).then(|| errors.join("; ")),
        work_dir: Some(run.work_dir.display().to_string()),
        elapsed_ms: run.elapsed_ms(),
        steps: run.steps.iter().map(StepSummary::from).collect(),
        observables,
    }
}
