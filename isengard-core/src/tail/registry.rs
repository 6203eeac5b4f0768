//! Registry of live tails, keyed by path
//!
//! Guarantees at most one following tail per path. Once [`TailRegistry::stop_all`]
//! has run, the registry is closed and refuses new tails, so a late watcher
//! event cannot start a tail after shutdown began.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{TailHandle, TailState};

#[derive(Debug, Default)]
struct Inner {
    tails: HashMap<PathBuf, TailHandle>,
    closed: bool,
}

/// Shared set of running tails.
#[derive(Debug, Clone, Default)]
pub struct TailRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl TailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A following tail exists for `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.lock()
            .tails
            .get(path)
            .is_some_and(|h| h.state() == TailState::Following)
    }

    /// Register the tail built by `spawn`, unless `path` already has a
    /// following tail or the registry is closed.
    ///
    /// `spawn` runs under the registry lock and only when the slot is free.
    /// Returns whether a tail was registered.
    pub fn register_with<F>(&self, path: &Path, spawn: F) -> bool
    where
        F: FnOnce() -> TailHandle,
    {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        if inner
            .tails
            .get(path)
            .is_some_and(|h| h.state() == TailState::Following)
        {
            return false;
        }

        // A stopped tail for the same path is replaced.
        inner.tails.insert(path.to_path_buf(), spawn());
        true
    }

    /// Number of tails still following.
    pub fn live(&self) -> usize {
        self.lock()
            .tails
            .values()
            .filter(|h| h.state() == TailState::Following)
            .count()
    }

    /// Paths with a following tail, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .lock()
            .tails
            .iter()
            .filter(|(_, h)| h.state() == TailState::Following)
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the registry, stop every tail and hand the handles back for
    /// joining.
    pub fn stop_all(&self) -> Vec<TailHandle> {
        self.stop_all_counted().0
    }

    /// Like [`stop_all`](Self::stop_all), also returning how many tails were
    /// still following and were stopped by this call.
    pub fn stop_all_counted(&self) -> (Vec<TailHandle>, usize) {
        let mut inner = self.lock();
        inner.closed = true;
        let handles: Vec<TailHandle> = inner.tails.drain().map(|(_, h)| h).collect();
        drop(inner);

        let stopped = handles.iter().filter(|h| h.stop()).count();
        tracing::debug!(tails = handles.len(), stopped, "Stopped all tails");
        (handles, stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusBuilder;
    use crate::tail::TailSource;
    use crate::types::StartAt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn handle_for(path: &Path) -> TailHandle {
        let source = TailSource::open(path, StartAt::End, Duration::from_millis(20))
            .await
            .unwrap();
        TailHandle::spawn(source, BusBuilder::new().build(), None, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_one_tail_per_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "").unwrap();
        let registry = TailRegistry::new();

        let first = handle_for(&path).await;
        assert!(registry.register_with(&path, || first));

        let second = handle_for(&path).await;
        let mut spawned = false;
        assert!(!registry.register_with(&path, || {
            spawned = true;
            second
        }));
        assert!(!spawned);
        assert_eq!(registry.live(), 1);
        assert!(registry.contains(&path));
    }

    #[tokio::test]
    async fn test_stopped_tail_can_be_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "").unwrap();
        let registry = TailRegistry::new();

        let first = handle_for(&path).await;
        first.stop();
        assert!(registry.register_with(&path, || first));
        assert_eq!(registry.live(), 0);

        let second = handle_for(&path).await;
        assert!(registry.register_with(&path, || second));
        assert_eq!(registry.live(), 1);
    }

    #[tokio::test]
    async fn test_stop_all_closes_registry() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        std::fs::write(&a, "").unwrap();
        std::fs::write(&b, "").unwrap();
        let registry = TailRegistry::new();

        let ha = handle_for(&a).await;
        let hb = handle_for(&b).await;
        registry.register_with(&a, || ha);
        registry.register_with(&b, || hb);
        assert_eq!(registry.paths(), vec![a.clone(), b.clone()]);

        let (handles, stopped) = registry.stop_all_counted();
        assert_eq!(handles.len(), 2);
        assert_eq!(stopped, 2);
        assert!(handles.iter().all(|h| h.state() == TailState::Stopped));
        assert!(registry.is_closed());
        assert_eq!(registry.live(), 0);

        let late = handle_for(&a).await;
        assert!(!registry.register_with(&a, || late));

        for h in handles {
            h.join().await;
        }
    }

    #[tokio::test]
    async fn test_stop_all_counts_only_following_tails() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        std::fs::write(&a, "").unwrap();
        std::fs::write(&b, "").unwrap();
        let registry = TailRegistry::new();

        let ended = handle_for(&a).await;
        ended.stop();
        registry.register_with(&a, || ended);
        let following = handle_for(&b).await;
        registry.register_with(&b, || following);

        let (handles, stopped) = registry.stop_all_counted();
        assert_eq!(handles.len(), 2);
        assert_eq!(stopped, 1);

        for h in handles {
            h.join().await;
        }
    }
}
