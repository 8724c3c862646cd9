use anyhow::Context;
use std::thread;
use tracing::warn;
use yambo_tester_core::domain::ErrorCategory;
use yambo_tester_core::scheduler::process::{CancellationToken, LiveGroups};

/// The first SIGINT or SIGTERM cancels the token so running steps are
/// killed and the partial report is still written. A second one kills
/// every live process group and exits immediately.
///
/// Handlers are registered before this returns, so a signal that arrives
/// while the suite is starting is never handled by the default action.
pub(super) fn install(cancel: CancellationToken, live: LiveGroups) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the signal runtime")?;
    let mut signals = {
        let _entered = runtime.enter();
        Signals::register().context("failed to register signal handlers")?
    };

    thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                let Some(name) = signals.next().await else {
                    return;
                };
                warn!(signal = name, "termination requested, stopping running tests");
                cancel.cancel();

                if let Some(name) = signals.next().await {
                    warn!(signal = name, "second termination request, killing running tests");
                    live.terminate_all();
                    std::process::exit(ErrorCategory::Interrupted.exit_code());
                }
            });
        })
        .context("failed to spawn the interrupt listener")?;
    Ok(())
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::select! {
            received = self.interrupt.recv() => received.map(|()| "SIGINT"),
            received = self.terminate.recv() => received.map(|()| "SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|()| "ctrl-c")
    }
}
