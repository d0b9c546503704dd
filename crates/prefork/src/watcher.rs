//! Polling file watcher driving rolling restarts.
//!
//! Workers report the source files they loaded via the `files` verb; the
//! set only grows within a run. Every ~500ms the watcher scans the list in
//! order: an mtime change alone is noise, only a content-hash change counts.
//! A changed file moves to the front of the scan list (recently-changed
//! files tend to change again). Each tick reports at most one change; the
//! restart is pool-wide anyway.
//!
//! Polling (rather than OS notification) keeps the watcher portable across
//! filesystems and containers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::pool::PoolHandle;

/// Poll cadence for the watch loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

type ContentDigest = [u8; 32];

#[derive(Debug, Default)]
struct TrackedFile {
    mtime: Option<SystemTime>,
    digest: Option<ContentDigest>,
}

#[derive(Default)]
struct FileSetInner {
    /// Scan order; changed files move to the front.
    order: Vec<PathBuf>,
    entries: HashMap<PathBuf, TrackedFile>,
}

/// The set of watched source files, shared between the control plane
/// (which merges worker reports) and the watch loop.
#[derive(Default)]
pub struct FileSet {
    inner: StdMutex<FileSetInner>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union-merge new paths, snapshotting their current mtime and content
    /// so pre-existing state never reads as a change.
    pub fn merge(&self, paths: Vec<PathBuf>) {
        let mut inner = self.inner.lock().expect("file set lock poisoned");
        for path in paths {
            if inner.entries.contains_key(&path) {
                continue;
            }
            let tracked = probe(&path);
            inner.order.push(path.clone());
            inner.entries.insert(path, tracked);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("file set lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scan for at most one content change. The changed path is moved to
    /// the front of the scan order and returned. Unreadable files are
    /// logged and skipped.
    pub fn poll_once(&self) -> Option<PathBuf> {
        let mut inner = self.inner.lock().expect("file set lock poisoned");
        let order = inner.order.clone();

        for (idx, path) in order.iter().enumerate() {
            let Some(entry) = inner.entries.get_mut(path) else {
                continue;
            };

            let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Cannot stat watched file");
                    continue;
                }
            };
            if entry.mtime == Some(mtime) {
                continue;
            }
            entry.mtime = Some(mtime);

            let digest = match hash_file(path) {
                Ok(digest) => digest,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot read watched file");
                    continue;
                }
            };
            if entry.digest == Some(digest) {
                // Touched, not changed.
                continue;
            }
            entry.digest = Some(digest);

            inner.order.remove(idx);
            inner.order.insert(0, path.clone());
            return Some(path.clone());
        }

        None
    }
}

fn probe(path: &Path) -> TrackedFile {
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    let digest = hash_file(path).ok();
    TrackedFile { mtime, digest }
}

fn hash_file(path: &Path) -> std::io::Result<ContentDigest> {
    let contents = std::fs::read(path)?;
    Ok(Sha256::digest(&contents).into())
}

/// Poll the file set until shutdown; each detected change triggers a
/// pool-wide rolling restart.
pub async fn watch_loop(files: Arc<FileSet>, pool: PoolHandle, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(path) = files.poll_once() {
                    tracing::info!(path = %path.display(), "Watched file changed, restarting workers");
                    pool.reload().await;
                }
            }
        }
    }
    tracing::debug!("File watcher exiting");
}
