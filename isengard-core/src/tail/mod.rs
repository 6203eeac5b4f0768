//! Tail sources and the tasks that drive them
//!
//! Each followed file gets two tasks:
//!
//! - a follower running [`TailSource::follow`], which owns the descriptor;
//! - a forwarder, which applies the optional [`LinePattern`] and publishes
//!   every line onto the [`LineBus`].
//!
//! The two are joined by a single-slot channel, so a stalled bus stalls the
//! follower too. Stopping a [`TailHandle`] cancels the follower; the forwarder
//! then drains what is left in the channel and exits.

pub mod discovery;
pub mod registry;
pub mod source;
pub mod watcher;

pub use discovery::{initial_tails, list_files, TailLauncher};
pub use registry::TailRegistry;
pub use source::TailSource;
pub use watcher::{DirectoryWatcher, WatchEvents};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::LineBus;
use crate::pattern::LinePattern;
use crate::types::LogLine;

/// Lifecycle of a tail. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Following,
    Stopped,
}

/// Owner of one running tail.
#[derive(Debug)]
pub struct TailHandle {
    path: Arc<Path>,
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
    follower: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl TailHandle {
    /// Spawn the follower and forwarder tasks for an opened source.
    pub fn spawn(
        source: TailSource,
        bus: LineBus,
        pattern: Option<Arc<LinePattern>>,
        cancel: CancellationToken,
    ) -> Self {
        let path = Arc::clone(source.path());
        let stopped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(1);

        let follower = {
            let cancel = cancel.clone();
            let stopped = Arc::clone(&stopped);
            tokio::spawn(async move {
                source.follow(tx, cancel).await;
                stopped.store(true, Ordering::SeqCst);
            })
        };
        let forwarder = tokio::spawn(forward(rx, bus, pattern));

        Self {
            path,
            cancel,
            stopped,
            follower,
            forwarder,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> TailState {
        if self.stopped.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            TailState::Stopped
        } else {
            TailState::Following
        }
    }

    /// Request the tail to stop. Returns true only for the call that made the
    /// transition.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Both tasks have exited.
    pub fn is_finished(&self) -> bool {
        self.follower.is_finished() && self.forwarder.is_finished()
    }

    /// Wait for both tasks to exit.
    pub async fn join(self) {
        for task in self.into_tasks() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Tail task panicked");
                }
            }
        }
    }

    pub(crate) fn into_tasks(self) -> [JoinHandle<()>; 2] {
        [self.follower, self.forwarder]
    }
}

async fn forward(
    mut rx: mpsc::Receiver<LogLine>,
    bus: LineBus,
    pattern: Option<Arc<LinePattern>>,
) {
    while let Some(line) = rx.recv().await {
        if let Some(error) = &line.read_error {
            tracing::error!(path = %line.source.display(), error = %error, "Tail ended with read error");
            continue;
        }

        let line = match &pattern {
            Some(pattern) => match pattern.apply(line) {
                Some(line) => line,
                None => {
                    tracing::trace!("Line did not match pattern, dropped");
                    continue;
                }
            },
            None => line,
        };

        bus.publish(Arc::new(line)).await;
    }
}
