//! Process-wide registry of temporary paths to delete at teardown.
//!
//! Every temp directory or file this crate creates is registered here. The
//! registry is drained by [`run_shutdown_hooks`], which the embedding program
//! calls at exit (or scopes with [`shutdown_guard`]). A path can also be
//! reclaimed early through its [`ReaperHandle`], which removes it from the
//! registry so it is not visited twice.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static REGISTRY: LazyLock<Mutex<Vec<Entry>>> = LazyLock::new(|| Mutex::new(Vec::new()));

struct Entry {
    id: u64,
    path: PathBuf,
}

fn registry() -> MutexGuard<'static, Vec<Entry>> {
    // A panic while holding the lock cannot leave the list half-updated
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one registered path
#[derive(Debug)]
pub struct ReaperHandle {
    id: u64,
    path: PathBuf,
}

impl ReaperHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path is still waiting for teardown
    pub fn is_registered(&self) -> bool {
        registry().iter().any(|entry| entry.id == self.id)
    }

    /// Deregister the path and delete it now.
    pub fn reclaim(&self) {
        registry().retain(|entry| entry.id != self.id);
        delete_tree(&self.path);
    }
}

/// Register `path` (file or directory) for recursive deletion at teardown.
pub fn delete_recursively(path: impl Into<PathBuf>) -> ReaperHandle {
    let path = path.into();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

    tracing::debug!(path = %path.display(), "Registered path for teardown");
    registry().push(Entry {
        id,
        path: path.clone(),
    });

    ReaperHandle { id, path }
}

/// Paths currently awaiting teardown
pub fn pending() -> Vec<PathBuf> {
    registry().iter().map(|entry| entry.path.clone()).collect()
}

/// Delete every registered path and empty the registry.
pub fn run_shutdown_hooks() {
    let entries = std::mem::take(&mut *registry());
    if !entries.is_empty() {
        tracing::debug!(count = entries.len(), "Reclaiming temporary paths");
    }
    for entry in entries {
        delete_tree(&entry.path);
    }
}

/// Runs [`run_shutdown_hooks`] when dropped
#[must_use = "the hooks run when the guard is dropped"]
#[derive(Debug)]
pub struct ShutdownGuard(());

pub fn shutdown_guard() -> ShutdownGuard {
    ShutdownGuard(())
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        run_shutdown_hooks();
    }
}

/// Post-order delete of `root`. Individual failures are logged and skipped.
pub fn delete_tree(root: &Path) {
    let Ok(meta) = std::fs::symlink_metadata(root) else {
        return;
    };

    let result = if meta.is_dir() {
        match std::fs::read_dir(root) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(entry) => delete_tree(&entry.path()),
                        Err(e) => {
                            tracing::debug!(error = %e, "Skipping unreadable entry during cleanup")
                        }
                    }
                }
            }
            Err(e) => tracing::debug!(path = %root.display(), error = %e, "Failed to list"),
        }
        std::fs::remove_dir(root)
    } else {
        std::fs::remove_file(root)
    };

    if let Err(e) = result {
        tracing::debug!(path = %root.display(), error = %e, "Failed to delete");
    }
}
