//! Executes planned runs on a bounded worker pool.
//!
//! Each run owns `<session>/<name>/<variant>@<mode>` for its lifetime.
//! Completions are tagged with their plan index so the caller can restore
//! selection order regardless of which worker finished first.

pub mod process;
pub mod scratch;

use crate::catalog::{Disposition, PlannedRun, RunStep};
use crate::config::EffectiveConfig;
use crate::domain::{ExecutableRole, ParallelMode};
use crate::executables::ExecutableSet;
use crate::fixtures::{FetchContext, FetchError, extract_tarball};
use crate::validator::TestOutcome;
use process::{CancellationToken, CommandSpec, LaunchError, ProcessCapture, ProcessLauncher};
use scratch::{ScratchError, SessionLayout};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub const RUN_LOG_FILE_NAME: &str = "tester.log";
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepExecution {
    pub step: String,
    pub command_line: String,
    pub capture: ProcessCapture,
}

/// One execution of a test under one parallel mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInstance {
    pub test_id: String,
    pub mode: ParallelMode,
    pub work_dir: PathBuf,
    pub steps: Vec<StepExecution>,
}

impl RunInstance {
    pub fn elapsed_ms(&self) -> u64 {
        self.steps
            .iter()
            .map(|execution| execution.capture.elapsed_ms)
            .sum()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("run was cancelled before it started")]
    NotStarted,
    #[error(transparent)]
    Scratch(#[from] ScratchError),
    #[error("database tarball is unavailable: {0}")]
    FixtureUnavailable(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("executable for role '{role}' is not available")]
    MissingExecutable { role: ExecutableRole },
    #[error("mode '{mode}' needs an MPI launcher but none was located")]
    MissingLauncher { mode: ParallelMode },
    #[error("step '{step}' could not be started: {source}")]
    Launch { step: String, source: LaunchError },
    #[error("step '{step}' exited with code {code}: {stderr}")]
    NonZeroExit {
        step: String,
        code: String,
        stderr: String,
    },
    #[error("step '{step}' timed out after {timeout_secs}s: {stderr}")]
    TimedOut {
        step: String,
        timeout_secs: u64,
        stderr: String,
    },
    #[error("step '{step}' was cancelled")]
    Cancelled { step: String },
}

#[derive(Debug)]
pub struct RunFailure {
    /// Present once the run directory exists.
    pub instance: Option<RunInstance>,
    pub error: ExecutionError,
}

impl RunFailure {
    fn new(instance: Option<RunInstance>, error: impl Into<ExecutionError>) -> Self {
        Self {
            instance,
            error: error.into(),
        }
    }
}

pub type RunResult = Result<RunInstance, RunFailure>;

/// Read-only state shared by every worker.
pub struct ScheduleContext<'a> {
    pub config: &'a EffectiveConfig,
    pub executables: &'a ExecutableSet,
    pub layout: &'a SessionLayout,
    /// Cached tarball per test id, or the reason it could not be obtained.
    pub tarballs: &'a BTreeMap<String, Result<PathBuf, String>>,
    pub launcher: &'a dyn ProcessLauncher,
    pub cancel: &'a CancellationToken,
}

impl ScheduleContext<'_> {
    fn fetch_context(&self) -> FetchContext<'_> {
        FetchContext {
            cache_dir: &self.layout.cache_dir,
            download_link: &self.config.download_link,
            verify_checksum: self.config.checksum,
            timeout: self.config.timeout,
            launcher: self.launcher,
            cancel: self.cancel,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedOutcome {
    pub index: usize,
    pub outcome: TestOutcome,
}

/// Command line for one step: `[launcher -np N] exe [-F input] [-J job[,flags] -C job]`.
/// Thread count travels in the child's environment only.
pub fn build_command(
    step: &RunStep,
    mode: ParallelMode,
    config: &EffectiveConfig,
    executables: &ExecutableSet,
    work_dir: &Path,
) -> Result<CommandSpec, ExecutionError> {
    let executable = executables
        .path(step.executable)
        .ok_or(ExecutionError::MissingExecutable {
            role: step.executable,
        })?;

    let mut arguments = Vec::new();
    if let Some(input) = &step.input {
        arguments.extend(["-F".to_string(), input.clone()]);
    }
    if let Some(job) = &step.job {
        let job_value = match &step.flags {
            Some(flags) => format!("{job},{flags}"),
            None => job.clone(),
        };
        arguments.extend(["-J".to_string(), job_value, "-C".to_string(), job.clone()]);
    }

    let spec = if mode.uses_launcher() {
        let launcher = executables
            .launcher()
            .ok_or(ExecutionError::MissingLauncher { mode })?;
        CommandSpec::new(launcher, work_dir)
            .arg("-np")
            .arg(config.nprocs.to_string())
            .arg(executable.display().to_string())
            .args(arguments)
    } else {
        CommandSpec::new(executable, work_dir).args(arguments)
    };

    Ok(if mode.uses_threads() {
        spec.env("OMP_NUM_THREADS", config.threads.to_string())
    } else {
        spec.env_remove("OMP_NUM_THREADS")
    })
}

/// Creates and populates the run directory, then executes the steps in
/// order, stopping at the first one that does not complete successfully.
pub fn execute(planned: &PlannedRun, context: &ScheduleContext<'_>) -> RunResult {
    if context.cancel.is_cancelled() {
        return Err(RunFailure::new(None, ExecutionError::NotStarted));
    }

    let test = &planned.test;
    let work_dir = context.layout.run_directory(test, planned.mode);
    scratch::create_exclusive_directory(&work_dir, context.config.on_collision)
        .map_err(|error| RunFailure::new(None, error))?;

    let mut instance = RunInstance {
        test_id: test.id.clone(),
        mode: planned.mode,
        work_dir: work_dir.clone(),
        steps: Vec::new(),
    };

    if let Err(error) = populate_work_dir(planned, context, &work_dir) {
        return Err(RunFailure::new(Some(instance), error));
    }

    for step in &test.steps {
        let spec = match build_command(step, planned.mode, context.config, context.executables, &work_dir) {
            Ok(spec) => spec,
            Err(error) => return Err(RunFailure::new(Some(instance), error)),
        };
        let command_line = spec.command_line();
        info!(test = %test.id, mode = %planned.mode, step = %step.name, command = %command_line, "launching step");

        let capture = match context.launcher.launch(&spec, context.config.timeout, context.cancel) {
            Ok(capture) => capture,
            Err(source) => {
                append_run_log(&work_dir, &command_line, None, &source.to_string());
                return Err(RunFailure::new(
                    Some(instance),
                    ExecutionError::Launch {
                        step: step.name.clone(),
                        source,
                    },
                ));
            }
        };
        append_run_log(&work_dir, &command_line, Some(&capture), "");

        let failure = step_failure(&step.name, &capture, context.config.timeout);
        instance.steps.push(StepExecution {
            step: step.name.clone(),
            command_line,
            capture,
        });
        if let Some(error) = failure {
            return Err(RunFailure::new(Some(instance), error));
        }
    }

    Ok(instance)
}

fn populate_work_dir(
    planned: &PlannedRun,
    context: &ScheduleContext<'_>,
    work_dir: &Path,
) -> Result<(), ExecutionError> {
    let test = &planned.test;
    scratch::copy_tree(&test.source_dir, work_dir)?;

    if test.needs_tarball() {
        match context.tarballs.get(&test.id) {
            Some(Ok(tarball)) => {
                extract_tarball(tarball, work_dir, &test.variant, &context.fetch_context())?;
            }
            Some(Err(reason)) => return Err(ExecutionError::FixtureUnavailable(reason.clone())),
            None => {
                return Err(ExecutionError::FixtureUnavailable(
                    "tarball was not fetched".to_string(),
                ));
            }
        }
    }

    if scratch::promote_converted_save(work_dir)? {
        info!(test = %test.id, mode = %planned.mode, "using SAVE_converted as SAVE");
    }
    Ok(())
}

fn step_failure(step: &str, capture: &ProcessCapture, timeout: Duration) -> Option<ExecutionError> {
    if capture.cancelled {
        return Some(ExecutionError::Cancelled {
            step: step.to_string(),
        });
    }
    if capture.timed_out {
        return Some(ExecutionError::TimedOut {
            step: step.to_string(),
            timeout_secs: timeout.as_secs(),
            stderr: capture.stderr_tail(STDERR_TAIL_LINES),
        });
    }
    match capture.exit_code {
        Some(0) => None,
        code => Some(ExecutionError::NonZeroExit {
            step: step.to_string(),
            code: code.map_or_else(|| "signal".to_string(), |code| code.to_string()),
            stderr: capture.stderr_tail(STDERR_TAIL_LINES),
        }),
    }
}

fn append_run_log(work_dir: &Path, command_line: &str, capture: Option<&ProcessCapture>, note: &str) {
    let path = work_dir.join(RUN_LOG_FILE_NAME);
    let mut entry = format!("$ {command_line}\n");
    match capture {
        Some(capture) => {
            entry.push_str(&format!(
                "exit: {:?} timed_out: {} cancelled: {} elapsed_ms: {}\n",
                capture.exit_code, capture.timed_out, capture.cancelled, capture.elapsed_ms
            ));
            entry.push_str("--- stdout ---\n");
            entry.push_str(&capture.stdout);
            entry.push_str("\n--- stderr ---\n");
            entry.push_str(&capture.stderr);
            entry.push('\n');
        }
        None => {
            entry.push_str(note);
            entry.push('\n');
        }
    }

    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(entry.as_bytes()));
    if let Err(error) = written {
        warn!(path = %path.display(), %error, "failed to write run log");
    }
}

/// Runs `plan` on `config.workers` threads. Entries are dispatched in plan
/// order; skipped entries never touch the filesystem. `evaluate` turns each
/// finished run into an outcome while the run directory still exists.
/// Results come back in completion order.
pub fn schedule<F>(plan: &[PlannedRun], context: &ScheduleContext<'_>, evaluate: F) -> Vec<IndexedOutcome>
where
    F: Fn(&PlannedRun, &RunResult) -> TestOutcome + Sync,
{
    if plan.is_empty() {
        return Vec::new();
    }
    let workers = context.config.workers.clamp(1, plan.len());
    let next = AtomicUsize::new(0);
    let finished = AtomicUsize::new(0);
    let (result_tx, result_rx) = mpsc::channel::<IndexedOutcome>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let result_tx = result_tx.clone();
            let next = &next;
            let finished = &finished;
            let evaluate = &evaluate;
            scope.spawn(move || {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(planned) = plan.get(index) else {
                        break;
                    };
                    let outcome = run_one(planned, context, evaluate);
                    let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    let progress = format!("{done}/{}", plan.len());
                    info!(
                        progress = %progress,
                        test = %outcome.test,
                        mode = %outcome.mode,
                        verdict = %outcome.verdict,
                        "run finished"
                    );
                    if result_tx.send(IndexedOutcome { index, outcome }).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        result_rx.iter().collect::<Vec<_>>()
    })
}

fn run_one<F>(planned: &PlannedRun, context: &ScheduleContext<'_>, evaluate: &F) -> TestOutcome
where
    F: Fn(&PlannedRun, &RunResult) -> TestOutcome,
{
    if let Disposition::Skip { reason } = &planned.disposition {
        return TestOutcome::skipped(planned, reason.clone());
    }

    let result = execute(planned, context);
    let outcome = evaluate(planned, &result);

    if !context.config.keep_scratch {
        let work_dir = match &result {
            Ok(instance) => Some(&instance.work_dir),
            Err(failure) => failure.instance.as_ref().map(|instance| &instance.work_dir),
        };
        if let Some(work_dir) = work_dir {
            scratch::remove_run_directory(work_dir);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::{ExecutionError, build_command};
    use crate::catalog::parse_definition;
    use crate::config::{ConfigLayer, EffectiveConfig, LayerSource, PartialParameters, resolve_layers};
    use crate::domain::{ExecutableRole, ParallelMode};
    use crate::executables::ExecutableSet;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    fn config() -> EffectiveConfig {
        resolve_layers(vec![ConfigLayer::new(
            LayerSource::CommandLine,
            PartialParameters {
                tests_dir: Some(PathBuf::from("suite")),
                nprocs: Some(4),
                threads: Some(2),
                ..PartialParameters::default()
            },
        )])
        .expect("config should resolve")
    }

    fn executables(launcher: Option<&str>) -> ExecutableSet {
        let mut roles = BTreeMap::new();
        roles.insert(ExecutableRole::Yambo, Some(PathBuf::from("/opt/yambo/bin/yambo")));
        roles.insert(ExecutableRole::Ypp, None);
        ExecutableSet::new(roles, launcher.map(PathBuf::from))
    }

    fn step(content: &str) -> crate::catalog::RunStep {
        parse_definition(
            content,
            "Si_bulk",
            "GW-OPTICS",
            Path::new("suite/Si_bulk/GW-OPTICS"),
            Path::new("suite/Si_bulk/GW-OPTICS/tests.toml"),
        )
        .expect("definition should parse")
        .steps
        .remove(0)
    }

    #[test]
    fn serial_command_has_job_flags_and_no_thread_variable() {
        let step = step("[gw]\nexe = \"yambo\"\ninput = \"02_gw.in\"\noutput = \"02_gw\"\nflags = \"01_init\"\n");
        let spec = build_command(&step, ParallelMode::Serial, &config(), &executables(None), Path::new("/run"))
            .expect("command should build");

        assert_eq!(
            spec.command_line(),
            "/opt/yambo/bin/yambo -F 02_gw.in -J 02_gw,01_init -C 02_gw"
        );
        assert_eq!(spec.cwd, PathBuf::from("/run"));
        assert!(spec.env.is_empty());
        assert_eq!(spec.env_remove, vec!["OMP_NUM_THREADS".to_string()]);
    }

    #[test]
    fn hybrid_command_uses_launcher_and_thread_count() {
        let step = step("[gw]\nexe = \"yambo\"\ninput = \"02_gw.in\"\n");
        let spec = build_command(
            &step,
            ParallelMode::Hybrid,
            &config(),
            &executables(Some("/usr/bin/mpirun")),
            Path::new("/run"),
        )
        .expect("command should build");

        assert_eq!(
            spec.command_line(),
            "/usr/bin/mpirun -np 4 /opt/yambo/bin/yambo -F 02_gw.in"
        );
        assert_eq!(spec.env, vec![("OMP_NUM_THREADS".to_string(), "2".to_string())]);
    }

    #[test]
    fn missing_role_or_launcher_is_an_execution_error() {
        let step_ypp = step("[post]\nexe = \"ypp\"\n");
        let error = build_command(&step_ypp, ParallelMode::Serial, &config(), &executables(None), Path::new("/run"))
            .expect_err("ypp is absent");
        assert!(matches!(error, ExecutionError::MissingExecutable { role: ExecutableRole::Ypp }));

        let step_yambo = step("[gw]\nexe = \"yambo\"\n");
        let error = build_command(&step_yambo, ParallelMode::Mpi, &config(), &executables(None), Path::new("/run"))
            .expect_err("no launcher located");
        assert!(matches!(error, ExecutionError::MissingLauncher { .. }));
    }
}
