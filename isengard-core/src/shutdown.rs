//! Termination signals and ordered teardown
//!
//! A [`ShutdownCoordinator`] is returned by [`Agent::start`](crate::agent::Agent::start)
//! while the pipeline runs (armed). Calling [`ShutdownCoordinator::shutdown`]
//! consumes it, so teardown happens at most once:
//!
//! ```text
//!   cancel watcher + tails ──► join (grace, abort stragglers)
//!        │
//!        ▼
//!   drop last bus handle ──► dispatch loops drain and exit
//!        │
//!        ▼
//!   join dispatch loops (grace, abort stragglers)
//!        │
//!        ▼
//!   close every sink (errors logged, remaining sinks still closed)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::LineBus;
use crate::connectors::Sink;
use crate::dispatch::DispatchStats;
use crate::tail::{TailLauncher, TailRegistry};

/// Waits for a termination signal.
///
/// Returns `Ok(())` when any signal is received, or `Err` if signal registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// What teardown did.
#[derive(Debug, Default, Clone)]
pub struct ShutdownReport {
    /// Tails that were following when shutdown began
    pub tails_stopped: usize,
    /// Sinks whose `close` succeeded
    pub sinks_closed: usize,
    /// Sinks whose `close` failed or timed out, with the reason
    pub close_failures: Vec<(String, String)>,
    /// Tasks aborted after the grace period
    pub aborted_tasks: usize,
    /// Final counters of each dispatch loop that exited on its own
    pub dispatch: Vec<(String, DispatchStats)>,
}

impl ShutdownReport {
    /// No task had to be aborted and every sink closed cleanly.
    pub fn is_clean(&self) -> bool {
        self.aborted_tasks == 0 && self.close_failures.is_empty()
    }
}

/// One sink and its dispatch loop.
pub(crate) struct Dispatcher<S> {
    pub sink: Arc<S>,
    pub task: JoinHandle<DispatchStats>,
}

/// Live handles of a running pipeline.
pub struct ShutdownCoordinator<S: Sink> {
    cancel: CancellationToken,
    registry: TailRegistry,
    launcher: TailLauncher,
    bus: LineBus,
    watcher: JoinHandle<()>,
    dispatchers: Vec<Dispatcher<S>>,
    grace: Duration,
}

impl<S: Sink> std::fmt::Debug for ShutdownCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("tails", &self.registry.live())
            .field("sinks", &self.dispatchers.len())
            .field("grace", &self.grace)
            .finish()
    }
}

impl<S: Sink> ShutdownCoordinator<S> {
    pub(crate) fn new(
        cancel: CancellationToken,
        launcher: TailLauncher,
        bus: LineBus,
        watcher: JoinHandle<()>,
        dispatchers: Vec<Dispatcher<S>>,
        grace: Duration,
    ) -> Self {
        Self {
            cancel,
            registry: launcher.registry().clone(),
            launcher,
            bus,
            watcher,
            dispatchers,
            grace,
        }
    }

    /// Registry of running tails.
    pub fn registry(&self) -> &TailRegistry {
        &self.registry
    }

    /// Number of tails currently following.
    pub fn live_tails(&self) -> usize {
        self.registry.live()
    }

    /// Whether the watch loop has exited, e.g. after its event stream closed.
    pub fn watcher_finished(&self) -> bool {
        self.watcher.is_finished()
    }

    /// Wait for `signal`, then tear down.
    pub async fn run<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = std::io::Result<()>>,
    {
        if let Err(e) = signal.await {
            tracing::error!(error = %e, "Failed to listen for termination signals, shutting down");
        } else {
            tracing::info!("Termination signal received, shutting down");
        }
        self.shutdown().await
    }

    /// Stop every producer, drain every sink, then close every sink.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            cancel,
            registry,
            launcher,
            bus,
            watcher,
            dispatchers,
            grace,
        } = self;
        let mut report = ShutdownReport::default();

        // 1. Producers: the watch loop and every tail.
        cancel.cancel();
        let (handles, stopped) = registry.stop_all_counted();
        report.tails_stopped = stopped;
        let mut producers = vec![watcher];
        for handle in handles {
            producers.extend(handle.into_tasks());
        }
        let (_, aborted) = join_with_grace(producers, grace, "producer").await;
        report.aborted_tasks += aborted;
        tracing::debug!(tails = report.tails_stopped, aborted, "Producers stopped");

        // 2. Last bus handles go away; subscriber channels close.
        drop(launcher);
        drop(bus);

        // 3. Dispatch loops drain what is buffered and exit.
        let (sinks, tasks): (Vec<_>, Vec<_>) =
            dispatchers.into_iter().map(|d| (d.sink, d.task)).unzip();
        let (stats, aborted) = join_with_grace(tasks, grace, "dispatch").await;
        report.aborted_tasks += aborted;
        for (sink, stats) in sinks.iter().zip(stats) {
            if let Some(stats) = stats {
                report.dispatch.push((sink.name().to_string(), stats));
            }
        }

        // 4. Close every sink exactly once.
        for sink in &sinks {
            match tokio::time::timeout(grace, sink.close()).await {
                Ok(Ok(())) => {
                    report.sinks_closed += 1;
                    tracing::debug!(sink = %sink.name(), "Sink closed");
                }
                Ok(Err(e)) => {
                    tracing::error!(sink = %sink.name(), error = %e, "Failed closing sink");
                    report.close_failures.push((sink.name().to_string(), e.to_string()));
                }
                Err(_) => {
                    tracing::error!(sink = %sink.name(), grace = ?grace, "Closing sink timed out");
                    report
                        .close_failures
                        .push((sink.name().to_string(), format!("close timed out after {:?}", grace)));
                }
            }
        }

        tracing::info!(
            tails_stopped = report.tails_stopped,
            sinks_closed = report.sinks_closed,
            close_failures = report.close_failures.len(),
            aborted_tasks = report.aborted_tasks,
            "Shutdown complete"
        );
        report
    }
}

/// Await every task until a shared deadline, then abort the rest.
///
/// Returns each task's output (`None` if it panicked or was aborted) and the
/// number of tasks aborted.
async fn join_with_grace<T>(
    mut tasks: Vec<JoinHandle<T>>,
    grace: Duration,
    what: &str,
) -> (Vec<Option<T>>, usize) {
    let deadline = Instant::now() + grace;
    let mut results = Vec::with_capacity(tasks.len());
    let mut aborted = 0;

    for task in tasks.iter_mut() {
        match tokio::time::timeout_at(deadline, &mut *task).await {
            Ok(Ok(value)) => results.push(Some(value)),
            Ok(Err(e)) => {
                if e.is_panic() {
                    tracing::error!(kind = what, error = %e, "Task panicked");
                }
                results.push(None);
            }
            Err(_) => {
                task.abort();
                aborted += 1;
                results.push(None);
            }
        }
    }

    if aborted > 0 {
        tracing::warn!(kind = what, aborted, grace = ?grace, "Tasks did not finish within grace period, aborted");
    }
    (results, aborted)
}
