//! Top-level drivers for one invocation.

use crate::catalog::{self, Disposition, PlannedRun, TestDefinition};
use crate::config::EffectiveConfig;
use crate::domain::{ExecutableRole, TesterError, TesterResult};
use crate::executables::{self, ExecutableSet};
use crate::fixtures::{FetchContext, ensure_tarball};
use crate::report::{self, ReportBundle, RunMetadata};
use crate::scheduler::process::{CancellationToken, ProcessLauncher, SessionDeadline};
use crate::scheduler::scratch::{self, SessionLayout};
use crate::scheduler::{self, RunResult, ScheduleContext};
use crate::validator::{self, TestOutcome};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::thread;
use tracing::{error, info, warn};

/// Locates executables, loads and selects the suite, runs every planned
/// (test, mode) pair and writes the report. Fatal problems surface as
/// `Err` before any test runs; per-test problems become outcomes.
pub fn run_session(
    config: &EffectiveConfig,
    launcher: &dyn ProcessLauncher,
    cancel: &CancellationToken,
    search_path: &OsStr,
) -> TesterResult<ReportBundle> {
    let executables = executables::locate(config, search_path)?;
    let selected = select_tests(config)?;
    log_load(config);

    let layout = scratch::prepare_session(config, report::current_unix_timestamp_seconds())?;
    let _deadline = SessionDeadline::arm(config.session_timeout, cancel);
    let build_info = executables
        .path(ExecutableRole::Yambo)
        .and_then(|yambo| executables::probe_build_info(yambo, &layout.session_dir, launcher, cancel));
    if let Some(info) = &build_info {
        info!(version = info.version.as_deref().unwrap_or("unknown"), "yambo build detected");
        for mode in &config.modes {
            if (mode.uses_launcher() && !info.mpi) || (mode.uses_threads() && !info.openmp) {
                warn!(mode = %mode, "yambo was not built with support for this mode");
            }
        }
    }

    let plan = catalog::plan(selected, &config.modes, &executables);
    let tarballs = fetch_tarballs(&plan, config, &layout, launcher, cancel);

    let context = ScheduleContext {
        config,
        executables: &executables,
        layout: &layout,
        tarballs: &tarballs,
        launcher,
        cancel,
    };
    let completed = scheduler::schedule(&plan, &context, |planned: &PlannedRun, result: &RunResult| {
        match result {
            Ok(instance) => validator::validate(planned, instance, &config.tolerance),
            Err(failure) => {
                warn!(test = %planned.test.id, mode = %planned.mode, error = %failure.error, "run did not complete");
                TestOutcome::error(planned, failure.error.to_string(), failure.instance.as_ref())
            }
        }
    });

    let bundle = report::aggregate(
        completed,
        config,
        &executables,
        RunMetadata {
            session_dir: Some(layout.session_dir.clone()),
            build_info,
            interrupted: cancel.is_cancelled(),
        },
    );
    report::write_report(&config.report_path, &bundle)?;
    info!(report = %config.report_path.display(), "report written");
    Ok(bundle)
}

fn select_tests(config: &EffectiveConfig) -> TesterResult<Vec<TestDefinition>> {
    let catalog = catalog::load_suite(&config.tests_dir)?;
    let selected = catalog::select(&catalog, &config.include, &config.exclude)?;
    info!(available = catalog.len(), selected = selected.len(), "test catalog loaded");
    if selected.is_empty() {
        warn!("no tests selected");
    }
    Ok(selected)
}

fn log_load(config: &EffectiveConfig) {
    let per_run = config.nprocs.max(1) * config.threads.max(1);
    let peak = config.workers * per_run;
    let available = thread::available_parallelism().map_or(1, usize::from);
    info!(workers = config.workers, cores_per_run = per_run, peak_cores = peak, "parallel load");
    if peak > available {
        warn!(peak_cores = peak, available, "requested load exceeds available cores");
    }
}

/// Fetches each needed tarball once, before any run starts, so concurrent
/// modes of a test never race on the cache.
fn fetch_tarballs(
    plan: &[PlannedRun],
    config: &EffectiveConfig,
    layout: &SessionLayout,
    launcher: &dyn ProcessLauncher,
    cancel: &CancellationToken,
) -> BTreeMap<String, Result<PathBuf, String>> {
    let context = FetchContext {
        cache_dir: &layout.cache_dir,
        download_link: &config.download_link,
        verify_checksum: config.checksum,
        timeout: config.timeout,
        launcher,
        cancel,
    };

    let mut tarballs = BTreeMap::new();
    for planned in plan {
        let test = &planned.test;
        if planned.disposition != Disposition::Run || !test.needs_tarball() || tarballs.contains_key(&test.id) {
            continue;
        }
        let fetched = ensure_tarball(test, &context).map_err(|fetch_error| {
            error!(test = %test.id, error = %fetch_error, "tarball unavailable");
            fetch_error.to_string()
        });
        tarballs.insert(test.id.clone(), fetched);
    }
    tarballs
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub fetched: Vec<PathBuf>,
    pub failed: Vec<(String, String)>,
}

/// Populates the cache for the selected tests without locating
/// executables or running anything.
pub fn download_only(
    config: &EffectiveConfig,
    launcher: &dyn ProcessLauncher,
    cancel: &CancellationToken,
) -> TesterResult<DownloadSummary> {
    let selected = select_tests(config)?;
    scratch::ensure_directory(&config.cache_dir)?;
    let _deadline = SessionDeadline::arm(config.session_timeout, cancel);
    let context = FetchContext {
        cache_dir: &config.cache_dir,
        download_link: &config.download_link,
        verify_checksum: config.checksum,
        timeout: config.timeout,
        launcher,
        cancel,
    };

    let mut summary = DownloadSummary::default();
    for test in selected.iter().filter(|test| test.needs_tarball()) {
        if cancel.is_cancelled() {
            return Err(TesterError::interrupted("download interrupted"));
        }
        match ensure_tarball(test, &context) {
            Ok(path) => summary.fetched.push(path),
            Err(fetch_error) => {
                error!(test = %test.id, error = %fetch_error, "tarball unavailable");
                summary.failed.push((test.id.clone(), fetch_error.to_string()));
            }
        }
    }
    Ok(summary)
}

/// What a run would execute, without creating anything on disk.
pub fn planned_runs(config: &EffectiveConfig, executables: &ExecutableSet) -> TesterResult<Vec<PlannedRun>> {
    Ok(catalog::plan(select_tests(config)?, &config.modes, executables))
}
