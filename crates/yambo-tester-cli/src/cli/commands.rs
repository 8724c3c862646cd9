use super::{Cli, CliError, interrupt};
use std::path::{Path, PathBuf};
use tracing::info;
use yambo_tester_core::catalog::Disposition;
use yambo_tester_core::config::{
    self, CollisionPolicy, EffectiveConfig, PartialParameters, USER_CONFIG_FILE_NAME,
};
use yambo_tester_core::domain::{ErrorCategory, ParallelMode};
use yambo_tester_core::executables;
use yambo_tester_core::report::render_human_summary;
use yambo_tester_core::scheduler::process::{CancellationToken, SystemLauncher};
use yambo_tester_core::session;

/// Flags mirroring the `[parameters]` keys of the configuration file.
#[derive(clap::Args, Default)]
pub(super) struct ParameterArgs {
    /// Prefix of the scratch session directory
    #[arg(long)]
    label: Option<String>,

    /// Directory holding <name>/<variant>/tests.toml definitions
    #[arg(long, value_name = "DIR")]
    tests_dir: Option<PathBuf>,

    /// Root of the scratch session directories
    #[arg(long, value_name = "DIR")]
    scratch_dir: Option<PathBuf>,

    /// Database tarball cache
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory searched for the executables instead of PATH
    #[arg(long, value_name = "DIR")]
    yambo_bin: Option<PathBuf>,

    #[arg(long, value_name = "NAME")]
    yambo: Option<String>,
    #[arg(long, value_name = "NAME")]
    ypp: Option<String>,
    #[arg(long, value_name = "NAME")]
    p2y: Option<String>,
    #[arg(long, value_name = "NAME")]
    a2y: Option<String>,
    #[arg(long, value_name = "NAME")]
    c2y: Option<String>,
    #[arg(long, value_name = "NAME")]
    yambo_ph: Option<String>,
    #[arg(long, value_name = "NAME")]
    ypp_ph: Option<String>,
    #[arg(long, value_name = "NAME")]
    yambo_sc: Option<String>,
    #[arg(long, value_name = "NAME")]
    ypp_sc: Option<String>,
    #[arg(long, value_name = "NAME")]
    yambo_rt: Option<String>,
    #[arg(long, value_name = "NAME")]
    ypp_rt: Option<String>,
    #[arg(long, value_name = "NAME")]
    yambo_nl: Option<String>,
    #[arg(long, value_name = "NAME")]
    ypp_nl: Option<String>,

    /// MPI launcher used by the mpi and hybrid modes
    #[arg(long, value_name = "NAME")]
    mpi_launcher: Option<String>,

    /// MPI ranks per run
    #[arg(long, allow_negative_numbers = true)]
    nprocs: Option<i64>,

    /// OpenMP threads per rank
    #[arg(long, allow_negative_numbers = true)]
    threads: Option<i64>,

    /// Runs executed at the same time
    #[arg(short = 'j', long, allow_negative_numbers = true)]
    workers: Option<i64>,

    /// Parallel modes to run: serial, openmp, mpi, hybrid
    #[arg(long, value_delimiter = ',')]
    modes: Vec<ParallelMode>,

    /// Relative tolerance (0 - 1)
    #[arg(long, allow_negative_numbers = true)]
    tolerance: Option<f64>,

    /// Absolute tolerance
    #[arg(long, allow_negative_numbers = true)]
    abs_tolerance: Option<f64>,

    /// Per-step timeout in seconds
    #[arg(long, allow_negative_numbers = true)]
    timeout_secs: Option<i64>,

    /// Budget for the whole invocation in seconds; 0 means unlimited
    #[arg(long, allow_negative_numbers = true)]
    session_timeout_secs: Option<i64>,

    /// What to do with an existing run directory: fail or clear
    #[arg(long, value_name = "POLICY")]
    on_collision: Option<CollisionPolicy>,

    /// Keep run directories after their outcome is recorded
    #[arg(long, overrides_with = "no_keep_scratch")]
    keep_scratch: bool,

    /// Delete run directories after their outcome is recorded
    #[arg(long, overrides_with = "keep_scratch")]
    no_keep_scratch: bool,

    /// Test identifier, bare name or glob pattern to run (repeatable)
    #[arg(short, long, value_name = "PATTERN")]
    include: Vec<String>,

    /// Test identifier, bare name or glob pattern to leave out (repeatable)
    #[arg(short = 'x', long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Base URL of the database tarballs
    #[arg(long, value_name = "URL")]
    download_link: Option<String>,

    /// Skip SHA-256 verification of downloaded tarballs
    #[arg(long)]
    no_checksum: bool,

    /// JSON report path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Log file path (truncated on every invocation)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

impl ParameterArgs {
    fn to_partial(&self) -> PartialParameters {
        let keep_scratch = if self.no_keep_scratch {
            Some(false)
        } else {
            self.keep_scratch.then_some(true)
        };

        PartialParameters {
            label: self.label.clone(),
            tests_dir: self.tests_dir.clone(),
            scratch_dir: self.scratch_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            yambo_bin: self.yambo_bin.clone(),
            yambo: self.yambo.clone(),
            ypp: self.ypp.clone(),
            p2y: self.p2y.clone(),
            a2y: self.a2y.clone(),
            c2y: self.c2y.clone(),
            yambo_ph: self.yambo_ph.clone(),
            ypp_ph: self.ypp_ph.clone(),
            yambo_sc: self.yambo_sc.clone(),
            ypp_sc: self.ypp_sc.clone(),
            yambo_rt: self.yambo_rt.clone(),
            ypp_rt: self.ypp_rt.clone(),
            yambo_nl: self.yambo_nl.clone(),
            ypp_nl: self.ypp_nl.clone(),
            mpi_launcher: self.mpi_launcher.clone(),
            nprocs: self.nprocs,
            threads: self.threads,
            workers: self.workers,
            modes: non_empty(&self.modes),
            tolerance: self.tolerance,
            abs_tolerance: self.abs_tolerance,
            timeout_secs: self.timeout_secs,
            session_timeout_secs: self.session_timeout_secs,
            on_collision: self.on_collision,
            keep_scratch,
            include: non_empty(&self.include),
            exclude: non_empty(&self.exclude),
            download_link: self.download_link.clone(),
            checksum: self.no_checksum.then_some(false),
            report: self.report.clone(),
            log_file: self.log_file.clone(),
            verbose: self.verbose.then_some(true),
        }
    }
}

fn non_empty<T: Clone>(values: &[T]) -> Option<Vec<T>> {
    (!values.is_empty()).then(|| values.to_vec())
}

pub(super) fn resolve_config(cli: &Cli) -> Result<EffectiveConfig, CliError> {
    let default_user_config = Path::new(USER_CONFIG_FILE_NAME);
    let user_config = match &cli.config {
        Some(path) => Some(path.as_path()),
        None => default_user_config.is_file().then_some(default_user_config),
    };

    config::resolve(
        &cli.parameters.to_partial(),
        user_config,
        cli.package_config.as_deref(),
    )
    .map_err(|error| CliError::Compute(error.into()))
}

pub(super) fn run_init_command() -> Result<i32, CliError> {
    let path = Path::new(USER_CONFIG_FILE_NAME);
    config::write_template(path).map_err(|error| CliError::Compute(error.into()))?;
    println!("Configuration template written to {}", path.display());
    Ok(0)
}

pub(super) fn run_list_command(config: &EffectiveConfig) -> Result<i32, CliError> {
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    let executables = executables::locate(config, &search_path)
        .map_err(|error| CliError::Compute(error.into()))?;
    let plan = session::planned_runs(config, &executables)?;

    for planned in &plan {
        match &planned.disposition {
            Disposition::Run => println!("{} [{}]", planned.test.id, planned.mode),
            Disposition::Skip { reason } => {
                println!("{} [{}] (skipped: {})", planned.test.id, planned.mode, reason)
            }
        }
    }
    println!("{} planned runs", plan.len());
    Ok(0)
}

pub(super) fn run_download_command(config: &EffectiveConfig) -> Result<i32, CliError> {
    let cancel = CancellationToken::new();
    let launcher = SystemLauncher::default();
    interrupt::install(cancel.clone(), launcher.live_groups())?;

    let summary = session::download_only(config, &launcher, &cancel)?;
    for path in &summary.fetched {
        println!("cached {}", path.display());
    }
    for (test, reason) in &summary.failed {
        println!("{}: {}", test, reason);
    }
    println!(
        "Download status: {} ({} cached, {} failed)",
        if summary.failed.is_empty() { "PASS" } else { "FAIL" },
        summary.fetched.len(),
        summary.failed.len()
    );
    Ok(if summary.failed.is_empty() { 0 } else { 1 })
}

pub(super) fn run_suite_command(config: &EffectiveConfig) -> Result<i32, CliError> {
    let cancel = CancellationToken::new();
    let launcher = SystemLauncher::default();
    interrupt::install(cancel.clone(), launcher.live_groups())?;
    let search_path = std::env::var_os("PATH").unwrap_or_default();

    let bundle = session::run_session(config, &launcher, &cancel, &search_path)?;
    println!("{}", render_human_summary(&bundle));
    println!("Report: {}", config.report_path.display());

    if bundle.interrupted {
        info!("run interrupted");
        return Ok(ErrorCategory::Interrupted.exit_code());
    }
    Ok(bundle.exit_code())
}
