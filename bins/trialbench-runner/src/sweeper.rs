/// Cleanup Sweeper - guarantees every workspace it tracks is reclaimed
///
/// A `WorkspaceGuard` owns one workspace and deletes its directory and
/// private configuration root exactly once: on explicit `release`, or on drop
/// if the owning task returns early, panics or is cancelled.
///
/// Deletion failures never propagate. They are logged and kept as leak
/// warnings for the final run report.

use crate::materializer::Workspace;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct Sweeper {
    reclaimed: AtomicUsize,
    leaks: Mutex<Vec<String>>,
}

impl Sweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a workspace; it is reclaimed when the guard goes away
    pub fn track(self: &Arc<Self>, workspace: Workspace) -> WorkspaceGuard {
        WorkspaceGuard {
            workspace,
            sweeper: Arc::clone(self),
            released: false,
        }
    }

    /// Recursively delete the workspace and its configuration root
    pub fn reclaim(&self, workspace: &Workspace) {
        for path in [&workspace.root, &workspace.config_root] {
            if let Err(e) = remove_tree(path) {
                warn!(
                    task_id = %workspace.task_id,
                    variant_id = %workspace.variant_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to reclaim workspace, leaking it"
                );
                if let Ok(mut leaks) = self.leaks.lock() {
                    leaks.push(format!("{} ({})", path.display(), e));
                }
            }
        }
        self.reclaimed.fetch_add(1, Ordering::SeqCst);
        debug!(
            task_id = %workspace.task_id,
            variant_id = %workspace.variant_id,
            "Workspace reclaimed"
        );
    }

    /// Number of workspaces released so far, leaked or not
    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::SeqCst)
    }

    /// Paths that could not be deleted
    pub fn leaks(&self) -> Vec<String> {
        self.leaks.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Scoped ownership of one workspace
#[derive(Debug)]
pub struct WorkspaceGuard {
    workspace: Workspace,
    sweeper: Arc<Sweeper>,
    released: bool,
}

impl WorkspaceGuard {
    /// Reclaim now. Blocking; call from a blocking-friendly context.
    pub fn release(mut self) {
        self.released = true;
        self.sweeper.reclaim(&self.workspace);
    }
}

impl Deref for WorkspaceGuard {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        &self.workspace
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.sweeper.reclaim(&self.workspace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace(base: &Path, name: &str) -> Workspace {
        let root = base.join(name);
        Workspace {
            task_id: "000001".to_string(),
            variant_id: "A".to_string(),
            report_dir: root.join("build/test-results/test"),
            config_root: base.join(format!("{}.home", name)),
            root,
        }
    }

    fn populate(ws: &Workspace) {
        fs::create_dir_all(ws.root.join("src/main/java")).unwrap();
        fs::write(ws.root.join("src/main/java/Main.java"), "class Main {}").unwrap();
        fs::create_dir_all(ws.config_root.join("caches")).unwrap();
    }

    #[test]
    fn test_release_removes_both_roots() {
        let scratch = tempfile::tempdir().unwrap();
        let sweeper = Arc::new(Sweeper::new());
        let ws = workspace(scratch.path(), "000001_A_1-deadbeef");
        populate(&ws);

        sweeper.track(ws.clone()).release();

        assert!(!ws.root.exists());
        assert!(!ws.config_root.exists());
        assert_eq!(sweeper.reclaimed(), 1);
        assert!(sweeper.leaks().is_empty());
    }

    #[test]
    fn test_drop_reclaims_exactly_once() {
        let scratch = tempfile::tempdir().unwrap();
        let sweeper = Arc::new(Sweeper::new());
        let ws = workspace(scratch.path(), "000001_A_2-deadbeef");
        populate(&ws);

        {
            let _guard = sweeper.track(ws.clone());
        }

        assert!(!ws.root.exists());
        assert_eq!(sweeper.reclaimed(), 1);
    }

    #[test]
    fn test_reclaim_survives_panic() {
        let scratch = tempfile::tempdir().unwrap();
        let sweeper = Arc::new(Sweeper::new());
        let ws = workspace(scratch.path(), "000001_A_3-deadbeef");
        populate(&ws);

        let guard = sweeper.track(ws.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _owned = guard;
            panic!("runner crashed");
        }));

        assert!(result.is_err());
        assert!(!ws.root.exists());
        assert!(!ws.config_root.exists());
    }

    #[test]
    fn test_missing_directories_are_not_leaks() {
        let sweeper = Arc::new(Sweeper::new());
        let ws = workspace(&PathBuf::from("/nonexistent/trialbench"), "000001_A_4-deadbeef");
        sweeper.track(ws).release();
        assert!(sweeper.leaks().is_empty());
        assert_eq!(sweeper.reclaimed(), 1);
    }
}
