//! Directory watcher
//!
//! Adapts a `notify` watcher into two channels, one of created paths and one
//! of watcher errors, and runs the loop that starts a tail from byte zero for
//! every new file. A file renamed into the directory counts as created.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::TailLauncher;
use crate::error::Result;
use crate::types::StartAt;

/// Event streams produced by a [`DirectoryWatcher`].
#[derive(Debug)]
pub struct WatchEvents {
    pub created: mpsc::UnboundedReceiver<PathBuf>,
    pub errors: mpsc::UnboundedReceiver<notify::Error>,
}

/// Keeps the OS watch registered while alive.
pub struct DirectoryWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl DirectoryWatcher {
    /// Watch `dir` non-recursively for file creation.
    pub fn watch(dir: &Path) -> Result<(Self, WatchEvents)> {
        let (created_tx, created) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in created_paths(event) {
                    let _ = created_tx.send(path);
                }
            }
            Err(e) => {
                let _ = errors_tx.send(e);
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        tracing::info!(directory = %dir.display(), "Watching directory for new files");

        Ok((
            Self {
                dir: dir.to_path_buf(),
                _watcher: watcher,
            },
            WatchEvents { created, errors },
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run the watch loop; the OS watch is released when it returns.
    pub async fn run(self, events: WatchEvents, launcher: TailLauncher, cancel: CancellationToken) {
        watch_loop(events, launcher, cancel).await;
        drop(self);
    }
}

/// Paths that became new entries of the watched directory.
///
/// Renames report `[from, to]` for `Both`; only the destination is new.
fn created_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().last().into_iter().collect()
        }
        _ => Vec::new(),
    }
}

/// Start a tail for every created file until `cancel` fires or the event
/// stream closes.
pub async fn watch_loop(mut events: WatchEvents, launcher: TailLauncher, cancel: CancellationToken) {
    let mut errors_open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Watch loop cancelled");
                break;
            }
            created = events.created.recv() => match created {
                Some(path) => on_created(&path, &launcher).await,
                None => {
                    tracing::error!("Watcher event stream closed, no longer picking up new files");
                    break;
                }
            },
            error = events.errors.recv(), if errors_open => match error {
                Some(e) => tracing::warn!(error = %e, "Watcher error"),
                None => errors_open = false,
            },
        }
    }
}

async fn on_created(path: &Path, launcher: &TailLauncher) {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            tracing::debug!(path = %path.display(), "Ignoring created non-regular entry");
            return;
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Created entry vanished");
            return;
        }
    }
    if !launcher.accepts(path) {
        tracing::debug!(path = %path.display(), "Created file does not match file_pattern");
        return;
    }

    match launcher.launch(path, StartAt::Beginning).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!(path = %path.display(), "File already tailed"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to tail new file"),
    }
}
