//! External process launching with timeout and cancellation.
//!
//! Every child is started in its own process group so that terminating a run
//! also reaches the processes it spawned (MPI ranks, shell pipelines).

use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::error;

/// Shared flag flipped once by an interrupt or a session deadline.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancels a token once a wall-clock budget is spent. Dropping the guard
/// disarms it.
#[derive(Debug)]
pub struct SessionDeadline {
    disarm: Option<mpsc::Sender<()>>,
    watcher: Option<thread::JoinHandle<()>>,
}

impl SessionDeadline {
    /// `None` means no budget; the guard then does nothing.
    pub fn arm(budget: Option<Duration>, cancel: &CancellationToken) -> Self {
        let Some(budget) = budget else {
            return Self {
                disarm: None,
                watcher: None,
            };
        };
        let (disarm, disarmed) = mpsc::channel::<()>();
        let cancel = cancel.clone();
        let watcher = thread::spawn(move || {
            if disarmed.recv_timeout(budget) == Err(mpsc::RecvTimeoutError::Timeout) {
                error!(timeout_secs = budget.as_secs(), "session timeout reached; cancelling runs");
                cancel.cancel();
            }
        });
        Self {
            disarm: Some(disarm),
            watcher: Some(watcher),
        }
    }
}

impl Drop for SessionDeadline {
    fn drop(&mut self) {
        drop(self.disarm.take());
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

/// Process groups of children that are still running. Shared with signal
/// handlers so an immediate exit can take the groups down first.
#[derive(Debug, Clone, Default)]
pub struct LiveGroups {
    groups: Arc<Mutex<BTreeSet<u32>>>,
}

impl LiveGroups {
    fn insert(&self, group: u32) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group);
    }

    fn remove(&self, group: u32) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group);
    }

    pub fn len(&self) -> usize {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends SIGKILL to every registered group.
    pub fn terminate_all(&self) {
        let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        for group in groups.iter() {
            kill_group(*group);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            env_remove: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Shell-like rendering used in logs and reports.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessCapture {
    pub exit_code: Option<i32>,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl ProcessCapture {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }

    /// Last non-empty stderr lines, for diagnostics.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let kept = self
            .stderr
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("program '{}' was not found", program.display())]
    NotFound { program: PathBuf },
    #[error("failed to start '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        source: io::Error,
    },
    #[error("failed while waiting for '{}': {source}", program.display())]
    Wait {
        program: PathBuf,
        source: io::Error,
    },
}

/// Seam between scheduling and the operating system.
pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessCapture, LaunchError>;
}

#[derive(Debug, Clone)]
pub struct SystemLauncher {
    poll_interval: Duration,
    live: LiveGroups,
}

impl Default for SystemLauncher {
    fn default() -> Self {
        Self::with_poll_interval(Duration::from_millis(50))
    }
}

impl SystemLauncher {
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            live: LiveGroups::default(),
        }
    }

    /// Handle on the groups this launcher (and its clones) started.
    pub fn live_groups(&self) -> LiveGroups {
        self.live.clone()
    }
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl ProcessLauncher for SystemLauncher {
    fn launch(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessCapture, LaunchError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for key in &spec.env_remove {
            command.env_remove(key);
        }
        command.envs(spec.env.iter().map(|(key, value)| (key, value)));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let started_at = Instant::now();
        let mut child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                LaunchError::NotFound {
                    program: spec.program.clone(),
                }
            } else {
                LaunchError::Spawn {
                    program: spec.program.clone(),
                    source,
                }
            }
        })?;
        let group = child.id();
        self.live.insert(group);

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let outcome = wait_for_exit(&mut child, timeout, cancel, self.poll_interval);
        // Anything left in the group after the leader is gone would keep the
        // pipes open.
        kill_group(group);
        self.live.remove(group);

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        let elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = outcome.map_err(|source| LaunchError::Wait {
            program: spec.program.clone(),
            source,
        })?;

        let (exit_code, timed_out, cancelled) = match outcome {
            WaitOutcome::Exited(status) => (status.code(), false, false),
            WaitOutcome::TimedOut => (None, true, false),
            WaitOutcome::Cancelled => (None, false, true),
        };

        Ok(ProcessCapture {
            exit_code,
            stdout,
            stderr,
            timed_out,
            cancelled,
            elapsed_ms,
        })
    }
}

fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> io::Result<WaitOutcome> {
    let started_at = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(WaitOutcome::Exited(status)),
            Ok(None) => {}
            Err(error) => {
                terminate_and_reap(child);
                return Err(error);
            }
        }

        if cancel.is_cancelled() {
            terminate_and_reap(child);
            return Ok(WaitOutcome::Cancelled);
        }

        if started_at.elapsed() >= timeout {
            terminate_and_reap(child);
            return Ok(WaitOutcome::TimedOut);
        }

        thread::sleep(poll_interval);
    }
}

fn terminate_and_reap(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

/// Children lead their own group, so the group id is the child's pid.
#[cfg(unix)]
fn kill_group(group: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Ok(pid) = i32::try_from(group) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_group: u32) {}

fn spawn_reader<R>(mut stream: R) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::{
        CancellationToken, CommandSpec, LaunchError, ProcessLauncher, SessionDeadline,
        SystemLauncher,
    };
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn sh(script: &str, cwd: &Path) -> CommandSpec {
        CommandSpec::new("sh", cwd).arg("-c").arg(script)
    }

    #[test]
    fn captures_exit_code_and_streams() {
        let temp = TempDir::new().expect("tempdir should be created");
        let capture = SystemLauncher::default()
            .launch(
                &sh("echo out; echo err >&2; exit 3", temp.path()),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .expect("sh should launch");

        assert_eq!(capture.exit_code, Some(3));
        assert_eq!(capture.stdout.trim(), "out");
        assert_eq!(capture.stderr_tail(5), "err");
        assert!(!capture.succeeded());
    }

    #[test]
    fn environment_overrides_are_applied_without_touching_the_parent() {
        let temp = TempDir::new().expect("tempdir should be created");
        let spec = sh("echo \"${OMP_NUM_THREADS:-unset}\"", temp.path()).env("OMP_NUM_THREADS", "4");
        let capture = SystemLauncher::default()
            .launch(&spec, Duration::from_secs(10), &CancellationToken::new())
            .expect("sh should launch");
        assert_eq!(capture.stdout.trim(), "4");

        let spec = sh("echo \"${OMP_NUM_THREADS:-unset}\"", temp.path())
            .env_remove("OMP_NUM_THREADS");
        let capture = SystemLauncher::default()
            .launch(&spec, Duration::from_secs(10), &CancellationToken::new())
            .expect("sh should launch");
        assert_eq!(capture.stdout.trim(), "unset");
    }

    /// Starts a background `sleep` whose pid lands in `bg.pid`, then waits.
    const BACKGROUND_SLEEP: &str = "sleep 30 & echo $! > bg.pid; wait";

    fn background_pid(dir: &Path) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(content) = fs::read_to_string(dir.join("bg.pid")) {
                if let Ok(pid) = content.trim().parse() {
                    return pid;
                }
            }
            assert!(Instant::now() < deadline, "background pid was never written");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn is_running(pid: i32) -> bool {
        if kill(Pid::from_raw(pid), None).is_err() {
            return false;
        }
        // An unreaped zombie still answers signal 0.
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => !Path::new("/proc/self").exists(),
        }
    }

    fn assert_gone(pid: i32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) {
            assert!(Instant::now() < deadline, "process {pid} outlived its group");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn cancel_once_started(dir: &Path, cancel: &CancellationToken) -> thread::JoinHandle<i32> {
        let dir = dir.to_path_buf();
        let trigger = cancel.clone();
        thread::spawn(move || {
            let pid = background_pid(&dir);
            trigger.cancel();
            pid
        })
    }

    #[test]
    fn timeout_kills_the_whole_process_group() {
        let temp = TempDir::new().expect("tempdir should be created");
        let started = Instant::now();
        let capture = SystemLauncher::with_poll_interval(Duration::from_millis(10))
            .launch(
                &sh(BACKGROUND_SLEEP, temp.path()),
                Duration::from_millis(500),
                &CancellationToken::new(),
            )
            .expect("sh should launch");

        assert!(capture.timed_out);
        assert_eq!(capture.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_gone(background_pid(temp.path()));
    }

    #[test]
    fn cancellation_kills_the_whole_process_group() {
        let temp = TempDir::new().expect("tempdir should be created");
        let cancel = CancellationToken::new();
        let canceller = cancel_once_started(temp.path(), &cancel);

        let capture = SystemLauncher::with_poll_interval(Duration::from_millis(10))
            .launch(&sh(BACKGROUND_SLEEP, temp.path()), Duration::from_secs(60), &cancel)
            .expect("sh should launch");
        let pid = canceller.join().expect("canceller should finish");

        assert!(capture.cancelled);
        assert!(!capture.succeeded());
        assert_gone(pid);
    }

    #[test]
    fn live_groups_track_running_children_and_can_be_killed() {
        let temp = TempDir::new().expect("tempdir should be created");
        let launcher = SystemLauncher::with_poll_interval(Duration::from_millis(10));
        let live = launcher.live_groups();
        assert!(live.is_empty());

        let dir = temp.path().to_path_buf();
        let killer_live = live.clone();
        let killer = thread::spawn(move || {
            let pid = background_pid(&dir);
            let deadline = Instant::now() + Duration::from_secs(5);
            while killer_live.is_empty() {
                assert!(Instant::now() < deadline, "running group was never registered");
                thread::sleep(Duration::from_millis(10));
            }
            assert_eq!(killer_live.len(), 1);
            killer_live.terminate_all();
            pid
        });

        let capture = launcher
            .launch(
                &sh(BACKGROUND_SLEEP, temp.path()),
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .expect("sh should launch");
        let pid = killer.join().expect("killer should finish");

        assert_eq!(capture.exit_code, None, "leader should die from the signal");
        assert!(!capture.timed_out);
        assert!(live.is_empty(), "finished groups are unregistered");
        assert_gone(pid);
    }

    #[test]
    fn session_deadline_cancels_only_when_the_budget_runs_out() {
        let cancel = CancellationToken::new();
        let deadline = SessionDeadline::arm(Some(Duration::from_millis(50)), &cancel);
        thread::sleep(Duration::from_millis(300));
        assert!(cancel.is_cancelled());
        drop(deadline);

        let cancel = CancellationToken::new();
        drop(SessionDeadline::arm(Some(Duration::from_secs(60)), &cancel));
        drop(SessionDeadline::arm(None, &cancel));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn missing_program_is_reported_as_not_found() {
        let temp = TempDir::new().expect("tempdir should be created");
        let error = SystemLauncher::default()
            .launch(
                &CommandSpec::new("/nonexistent/yambo", temp.path()),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .expect_err("missing program should fail");
        assert!(matches!(error, LaunchError::NotFound { .. }));
    }
}
