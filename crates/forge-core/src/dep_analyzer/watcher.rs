//! File-watcher integration: turns raw filesystem events into a debounced
//! stream of [`FileEvent`]s filtered to known source files. Watcher failure
//! is non-fatal -- callers that can't get a watcher fall back to a full
//! directory scan.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::error::{BuildError, BuildResult, ErrorKind};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

/// Wraps a `notify` watcher plus a debounce window. Construction can fail
/// (e.g. inotify instance limits); callers treat that as a signal to use
/// full-scan analysis instead, per the degrade-gracefully contract.
pub struct FileWatcher {
    _inner: RecommendedWatcher,
    raw_events: Receiver<NotifyEvent>,
    debounce: Duration,
    known_files: HashSet<PathBuf>,
}

impl FileWatcher {
    pub fn new(root: &Path, known_files: HashSet<PathBuf>) -> BuildResult<Self> {
        Self::with_debounce(root, known_files, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(root: &Path, known_files: HashSet<PathBuf>, debounce: Duration) -> BuildResult<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| BuildError::new(ErrorKind::System, "WATCHER_INIT_FAILED", e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| BuildError::new(ErrorKind::System, "WATCHER_INIT_FAILED", e.to_string()))?;

        Ok(Self {
            _inner: watcher,
            raw_events: rx,
            debounce,
            known_files,
        })
    }

    /// Blocks for up to one debounce window collecting raw events, then
    /// returns the deduplicated, filtered batch. Returns an empty vec (not
    /// an error) if nothing arrived -- callers poll this in a loop.
    pub fn poll_batch(&mut self) -> Vec<FileEvent> {
        let mut batch: std::collections::HashMap<PathBuf, FileChangeKind> = std::collections::HashMap::new();

        let first = match self.raw_events.recv_timeout(self.debounce) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Vec::new(),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("file watcher channel disconnected");
                return Vec::new();
            }
        };
        self.apply(first, &mut batch);

        let deadline = std::time::Instant::now() + self.debounce;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.raw_events.recv_timeout(remaining) {
                Ok(event) => self.apply(event, &mut batch),
                Err(_) => break,
            }
        }

        batch
            .into_iter()
            .filter(|(path, _)| self.known_files.is_empty() || self.known_files.contains(path))
            .map(|(path, kind)| FileEvent { path, kind })
            .collect()
    }

    fn apply(&self, event: NotifyEvent, batch: &mut std::collections::HashMap<PathBuf, FileChangeKind>) {
        let kind = match event.kind {
            EventKind::Create(_) => FileChangeKind::Created,
            EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileChangeKind::Renamed,
            EventKind::Modify(_) => FileChangeKind::Modified,
            EventKind::Remove(_) => FileChangeKind::Deleted,
            _ => return,
        };
        for path in event.paths {
            batch.insert(path, kind);
        }
    }

    pub fn track(&mut self, path: PathBuf) {
        self.known_files.insert(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_over_nonexistent_root_fails_gracefully() {
        let result = FileWatcher::new(Path::new("/nonexistent/forge/root"), HashSet::new());
        assert!(result.is_err());
    }

    #[test]
    fn poll_batch_times_out_with_no_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FileWatcher::with_debounce(dir.path(), HashSet::new(), Duration::from_millis(20)).unwrap();
        assert!(watcher.poll_batch().is_empty());
    }
}
