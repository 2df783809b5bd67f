//! Live reload: watch the worker's source tree and ask the supervisor for a
//! restart once edits settle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Directory names whose churn never warrants a restart.
const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules"];

pub struct ReloadWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<PathBuf>,
    debounce: Duration,
}

impl ReloadWatcher {
    pub fn start(paths: &[PathBuf], debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) if is_edit(&event.kind) => {
                    for path in event.paths {
                        if !is_ignored(&path) {
                            let _ = tx.send(path);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Reload watcher error: {e}"),
            }
        })
        .context("Failed to create file watcher")?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", path.display()))?;
            debug!("Watching {} for live reload", path.display());
        }
        Ok(Self {
            _watcher: watcher,
            rx,
            debounce,
        })
    }

    /// Wait for the next burst of edits and return the paths touched in it.
    /// `None` once the watcher has shut down.
    pub async fn next(&mut self) -> Option<Vec<PathBuf>> {
        let first = self.rx.recv().await?;
        tokio::time::sleep(self.debounce).await;
        let mut changed = vec![first];
        while let Ok(path) = self.rx.try_recv() {
            if !changed.contains(&path) {
                changed.push(path);
            }
        }
        Some(changed)
    }

    /// Forget edits seen so far, e.g. the ones Auto-Repair just made.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

fn is_edit(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|c| {
        let c = c.as_os_str().to_string_lossy();
        IGNORED_DIRS.contains(&c.as_ref())
    })
}
