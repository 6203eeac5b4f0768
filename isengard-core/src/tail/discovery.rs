//! Startup discovery and tail creation
//!
//! [`TailLauncher`] bundles everything needed to start a tail (bus, pattern,
//! registry, file filter) so that discovery and the directory watcher create
//! tails the same way.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{TailHandle, TailRegistry, TailSource};
use crate::bus::LineBus;
use crate::error::Result;
use crate::pattern::LinePattern;
use crate::types::StartAt;

/// Starts tails and records them in the registry.
#[derive(Debug, Clone)]
pub struct TailLauncher {
    registry: TailRegistry,
    bus: LineBus,
    pattern: Option<Arc<LinePattern>>,
    filter: Option<glob::Pattern>,
    poll: Duration,
    missing_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl TailLauncher {
    pub fn new(registry: TailRegistry, bus: LineBus, poll: Duration, cancel: CancellationToken) -> Self {
        Self {
            registry,
            bus,
            pattern: None,
            filter: None,
            poll,
            missing_timeout: None,
            cancel,
        }
    }

    pub fn with_missing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.missing_timeout = timeout;
        self
    }

    pub fn with_pattern(mut self, pattern: Option<LinePattern>) -> Self {
        self.pattern = pattern.map(Arc::new);
        self
    }

    pub fn with_filter(mut self, filter: Option<glob::Pattern>) -> Self {
        self.filter = filter;
        self
    }

    pub fn registry(&self) -> &TailRegistry {
        &self.registry
    }

    /// Whether the file name passes the configured glob.
    pub fn accepts(&self, path: &Path) -> bool {
        name_matches(self.filter.as_ref(), path)
    }

    /// Open `path` and start following it.
    ///
    /// Returns `Ok(false)` when the path already has a following tail or the
    /// registry is closed. Open failures are returned to the caller.
    pub async fn launch(&self, path: &Path, start: StartAt) -> Result<bool> {
        if self.registry.is_closed() || self.registry.contains(path) {
            return Ok(false);
        }

        let source = TailSource::open(path, start, self.poll)
            .await?
            .with_missing_timeout(self.missing_timeout);
        let registered = self.registry.register_with(path, || {
            TailHandle::spawn(
                source,
                self.bus.clone(),
                self.pattern.clone(),
                self.cancel.child_token(),
            )
        });

        if registered {
            tracing::info!(path = %path.display(), start = ?start, "Tailing file");
        }
        Ok(registered)
    }
}

/// Regular files in `dir` whose names pass `filter`, sorted. Symlinks are
/// followed; directories are skipped.
pub async fn list_files(dir: &Path, filter: Option<&glob::Pattern>) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                tracing::debug!(path = %path.display(), "Skipping non-regular entry");
                continue;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not stat entry, skipping");
                continue;
            }
        }
        if !name_matches(filter, &path) {
            tracing::debug!(path = %path.display(), "File does not match file_pattern, skipping");
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}

/// Start a tail for every regular file in `dir`.
///
/// `preexisting` is the listing taken before the directory watch was
/// registered. Those files start at end of file; anything else appeared
/// while the agent was starting and is read from byte zero, like a file the
/// watcher reports. Per-file failures are logged and skipped. Returns the
/// number of tails started.
pub async fn initial_tails(
    dir: &Path,
    launcher: &TailLauncher,
    preexisting: &HashSet<PathBuf>,
) -> Result<usize> {
    let paths = list_files(dir, launcher.filter.as_ref()).await?;

    let mut started = 0;
    for path in paths {
        let start = if preexisting.contains(&path) {
            StartAt::End
        } else {
            tracing::debug!(path = %path.display(), "File appeared during startup");
            StartAt::Beginning
        };
        match launcher.launch(&path, start).await {
            Ok(true) => started += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to tail file, skipping"),
        }
    }

    tracing::info!(directory = %dir.display(), tails = started, "Initial discovery complete");
    Ok(started)
}

fn name_matches(filter: Option<&glob::Pattern>, path: &Path) -> bool {
    match (filter, path.file_name()) {
        (None, _) => true,
        (Some(filter), Some(name)) => filter.matches(&name.to_string_lossy()),
        (Some(_), None) => false,
    }
}
