#![cfg(unix)]

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use yambo_tester_core::config::{
    ConfigLayer, EffectiveConfig, LayerSource, PartialParameters, resolve_layers,
};
use yambo_tester_core::domain::{ErrorCategory, ParallelMode};
use yambo_tester_core::scheduler::process::{
    CancellationToken, CommandSpec, LaunchError, ProcessCapture, ProcessLauncher, SystemLauncher,
};
use yambo_tester_core::session::run_session;
use yambo_tester_core::validator::Verdict;

/// Stand-in for yambo: sources the `-F` input as a shell fragment with
/// `$job` set to the `-C` directory.
const FAKE_YAMBO: &str = r#"#!/bin/sh
input=""
job="."
while [ $# -gt 0 ]; do
  case "$1" in
    -F) input="$2"; shift 2 ;;
    -J) shift 2 ;;
    -C) job="$2"; shift 2 ;;
    *) shift ;;
  esac
done
[ -n "$input" ] || exit 0
mkdir -p "$job"
. "./$input"
"#;

const REFERENCE_TABLE: &str = "# E  re  im\n1.0 2.0 3.0\n2.0 4.0 5.0\n";

struct Suite {
    temp: TempDir,
}

impl Suite {
    fn new() -> Self {
        let suite = Self {
            temp: TempDir::new().expect("tempdir should be created"),
        };
        fs::create_dir_all(suite.bin_dir()).expect("bin dir should be created");
        fs::create_dir_all(suite.tests_dir()).expect("tests dir should be created");
        suite
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn bin_dir(&self) -> PathBuf {
        self.root().join("bin")
    }

    fn tests_dir(&self) -> PathBuf {
        self.root().join("suite")
    }

    fn scratch_dir(&self) -> PathBuf {
        self.root().join("scratch")
    }

    fn report_path(&self) -> PathBuf {
        self.root().join("report.json")
    }

    fn install_executable(&self, name: &str, script: &str) {
        let path = self.bin_dir().join(name);
        fs::write(&path, script).expect("script should be written");
        let mut permissions = fs::metadata(&path)
            .expect("script metadata should be readable")
            .permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).expect("script should be executable");
    }

    /// One-step test whose step runs `body` and whose reference is
    /// `REFERENCE_TABLE`.
    fn add_test(&self, name: &str, exe: &str, body: &str) {
        let dir = self.tests_dir().join(name).join("GW");
        fs::create_dir_all(dir.join("REFERENCE")).expect("definition dir should be created");
        fs::write(
            dir.join("tests.toml"),
            format!(
                "[01_gw]\nexe = \"{exe}\"\ninput = \"01_gw.in\"\noutput = \"01_gw\"\n\n\
                 [01_gw.reference]\n\"o-01_gw.eps\" = \"o-01_gw.eps\"\n"
            ),
        )
        .expect("definition should be written");
        fs::write(dir.join("REFERENCE/o-01_gw.eps"), REFERENCE_TABLE)
            .expect("reference should be written");
        fs::write(dir.join("01_gw.in"), body).expect("input should be written");
    }

    fn config(&self, adjust: impl FnOnce(&mut PartialParameters)) -> EffectiveConfig {
        let mut parameters = PartialParameters {
            tests_dir: Some(self.tests_dir()),
            scratch_dir: Some(self.scratch_dir()),
            cache_dir: Some(self.root().join("cache")),
            yambo_bin: Some(self.bin_dir()),
            report: Some(self.report_path()),
            ..PartialParameters::default()
        };
        adjust(&mut parameters);
        resolve_layers(vec![ConfigLayer::new(LayerSource::CommandLine, parameters)])
            .expect("config should resolve")
    }
}

fn writes_table(table: &str) -> String {
    format!("printf '{}' > \"$job/o-01_gw.eps\"\n", table.replace('\n', "\\n"))
}

fn passing_body() -> String {
    writes_table(REFERENCE_TABLE)
}

fn run(config: &EffectiveConfig) -> yambo_tester_core::report::ReportBundle {
    run_session(
        config,
        &SystemLauncher::default(),
        &CancellationToken::new(),
        OsStr::new(""),
    )
    .expect("session should complete")
}

#[test]
fn report_keeps_selection_order_when_runs_finish_out_of_order() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("A_slow", "yambo", &format!("sleep 1\n{}", passing_body()));
    suite.add_test("B_fast", "yambo", &passing_body());
    suite.add_test("C_medium", "yambo", &format!("sleep 0.5\n{}", passing_body()));

    let config = suite.config(|parameters| parameters.workers = Some(3));
    let bundle = run(&config);

    let order = bundle
        .outcomes
        .iter()
        .map(|outcome| outcome.test.as_str())
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["A_slow/GW", "B_fast/GW", "C_medium/GW"]);
    assert!(
        bundle.outcomes.iter().all(|outcome| outcome.verdict == Verdict::Pass),
        "every run should pass: {:?}",
        bundle.outcomes
    );
    assert_eq!(bundle.exit_code(), 0);
    assert!(suite.report_path().is_file(), "report should be written");
}

#[test]
fn crashing_step_is_an_error_and_other_tests_still_run() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("Broken", "yambo", "echo 'segmentation fault' >&2\nexit 3\n");
    suite.add_test("Healthy", "yambo", &passing_body());

    let bundle = run(&suite.config(|_| {}));

    let broken = &bundle.outcomes[0];
    assert_eq!(broken.verdict, Verdict::Error);
    assert!(broken.observables.is_empty(), "validator should not run");
    assert_eq!(broken.steps[0].exit_code, Some(3));
    assert!(
        broken
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("segmentation fault"))
    );
    assert_eq!(bundle.outcomes[1].verdict, Verdict::Pass);
    assert_eq!(bundle.counts.errors, 1);
    assert_eq!(bundle.exit_code(), 1);
}

#[test]
fn drifted_output_fails_while_small_noise_passes() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("Drifted", "yambo", &writes_table("1.0 2.0 3.0\n2.0 6.0 5.0\n"));
    suite.add_test("Noisy", "yambo", &writes_table("1.0 2.01 3.0\n2.0 4.0 5.02\n"));

    let bundle = run(&suite.config(|_| {}));

    assert_eq!(bundle.outcomes[0].verdict, Verdict::Fail);
    assert!(
        bundle.outcomes[0]
            .first_failure()
            .is_some_and(|failure| failure.starts_with("o-01_gw.eps#1"))
    );
    assert_eq!(bundle.outcomes[1].verdict, Verdict::Pass);
    assert_eq!(bundle.counts.failed, 1);
}

#[test]
fn missing_project_executable_skips_only_its_tests() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("Realtime", "yambo_rt", &passing_body());
    suite.add_test("Static", "yambo", &passing_body());

    let bundle = run(&suite.config(|_| {}));

    assert_eq!(bundle.outcomes[0].verdict, Verdict::Skipped);
    assert!(
        bundle.outcomes[0]
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("yambo_rt"))
    );
    assert_eq!(bundle.outcomes[1].verdict, Verdict::Pass);
    assert_eq!(bundle.exit_code(), 0, "skips do not fail the suite");
}

#[test]
fn missing_core_executable_stops_before_any_run() {
    let suite = Suite::new();
    suite.add_test("Static", "yambo", &passing_body());

    let error = run_session(
        &suite.config(|_| {}),
        &SystemLauncher::default(),
        &CancellationToken::new(),
        OsStr::new(""),
    )
    .expect_err("missing core executable should be fatal");

    assert_eq!(error.category(), ErrorCategory::EnvironmentError);
    assert_eq!(error.exit_code(), 4);
    assert!(!suite.scratch_dir().exists(), "no scratch should be created");
    assert!(!suite.report_path().exists());
}

#[test]
fn unknown_test_name_stops_before_any_run() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("Static", "yambo", &passing_body());

    let error = run_session(
        &suite.config(|parameters| parameters.include = Some(vec!["NoSuchSystem".to_string()])),
        &SystemLauncher::default(),
        &CancellationToken::new(),
        OsStr::new(""),
    )
    .expect_err("unknown test should be fatal");

    assert_eq!(error.category(), ErrorCategory::InputValidationError);
    assert!(error.message().contains("NoSuchSystem"));
    assert!(!suite.scratch_dir().exists(), "no run should start");
}

#[test]
fn thread_count_reaches_openmp_runs_only() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test(
        "Threads",
        "yambo",
        &format!("echo \"${{OMP_NUM_THREADS:-unset}}\" > threads.txt\n{}", passing_body()),
    );

    let bundle = run(&suite.config(|parameters| {
        parameters.modes = Some(vec![ParallelMode::Serial, ParallelMode::OpenMp]);
        parameters.threads = Some(3);
    }));

    let threads_seen = bundle
        .outcomes
        .iter()
        .map(|outcome| {
            let work_dir = outcome.work_dir.as_deref().expect("work dir should be kept");
            fs::read_to_string(Path::new(work_dir).join("threads.txt"))
                .expect("marker should be written")
                .trim()
                .to_string()
        })
        .collect::<Vec<_>>();
    assert_eq!(threads_seen, vec!["unset".to_string(), "3".to_string()]);
}

#[test]
fn hung_step_is_killed_at_the_timeout() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("Hung", "yambo", "sleep 30\n");

    let started = Instant::now();
    let bundle = run(&suite.config(|parameters| parameters.timeout_secs = Some(1)));

    assert!(started.elapsed() < Duration::from_secs(20));
    let outcome = &bundle.outcomes[0];
    assert_eq!(outcome.verdict, Verdict::Error);
    assert!(outcome.steps[0].timed_out);
    assert!(
        outcome
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("timed out"))
    );
}

#[test]
fn session_budget_cancels_running_tests_and_marks_the_report() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("Hung", "yambo", "sleep 30\n");
    suite.add_test("Queued", "yambo", &passing_body());

    let started = Instant::now();
    let bundle = run(&suite.config(|parameters| parameters.session_timeout_secs = Some(1)));

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(bundle.interrupted);
    assert!(
        bundle
            .outcomes
            .iter()
            .all(|outcome| outcome.verdict == Verdict::Error),
        "cancelled runs should be errors: {:?}",
        bundle.outcomes
    );
    assert_eq!(bundle.exit_code(), 1);
}

#[test]
fn discarded_scratch_removes_run_directories() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("Static", "yambo", &passing_body());

    let bundle = run(&suite.config(|parameters| parameters.keep_scratch = Some(false)));

    assert_eq!(bundle.outcomes[0].verdict, Verdict::Pass);
    let session_dir = PathBuf::from(bundle.session_dir.expect("session dir should be reported"));
    assert!(!session_dir.join("Static/GW@serial").exists());
}

/// Real launcher, except that `wget` never finishes on its own.
struct StalledDownloads(SystemLauncher);

impl ProcessLauncher for StalledDownloads {
    fn launch(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessCapture, LaunchError> {
        if spec.program != Path::new("wget") {
            return self.0.launch(spec, timeout, cancel);
        }
        let started = Instant::now();
        while !cancel.is_cancelled() && started.elapsed() < timeout {
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(ProcessCapture {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: !cancel.is_cancelled(),
            cancelled: cancel.is_cancelled(),
            elapsed_ms: 0,
        })
    }
}

#[test]
fn session_budget_also_bounds_tarball_downloads() {
    let suite = Suite::new();
    suite.install_executable("yambo", FAKE_YAMBO);
    suite.add_test("Remote", "yambo", &passing_body());
    let definition = suite.tests_dir().join("Remote/GW/tests.toml");
    let content = fs::read_to_string(&definition).expect("definition should be readable");
    fs::write(&definition, format!("sha256 = \"{}\"\n{content}", "0".repeat(64)))
        .expect("definition should be rewritten");

    let config = suite.config(|parameters| parameters.session_timeout_secs = Some(1));
    let started = Instant::now();
    let bundle = run_session(
        &config,
        &StalledDownloads(SystemLauncher::default()),
        &CancellationToken::new(),
        OsStr::new(""),
    )
    .expect("session should complete");

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(bundle.interrupted);
    assert_eq!(bundle.outcomes[0].verdict, Verdict::Error);
}
