//! Bounded worktree pool backing parallel stage execution (§4.E.3.f, §5).
//!
//! `maxParallel` fixes the pool size up front: slots are integer indices
//! `0..maxParallel`, each mapping to `<repo>/.kanban-worktrees/<index>`. The
//! scheduler checks out a free index before spawning a session and returns it
//! when the session exits, so at most `maxParallel` worktrees ever exist on
//! disk at once.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::git;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("worktree pool exhausted (capacity {0})")]
    PoolExhausted(usize),
    #[error("index {0} is not currently checked out")]
    NotCheckedOut(u32),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// A checked-out worktree slot. Dropping this does not release the slot —
/// call `WorktreePool::release` explicitly once the session has exited, since
/// release also removes the git worktree and that can fail.
#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub index: u32,
    pub path: PathBuf,
    pub branch: String,
}

/// Bounded pool of git worktrees for one repo, keyed by integer index.
pub struct WorktreePool {
    workspace_root: PathBuf,
    capacity: usize,
    free_indices: Mutex<VecDeque<u32>>,
}

impl WorktreePool {
    pub fn new(workspace_root: PathBuf, capacity: usize) -> Self {
        let free_indices = (0..capacity as u32).collect();
        Self {
            workspace_root,
            capacity,
            free_indices: Mutex::new(free_indices),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of indices currently free (not reliable as a liveness check
    /// under contention; callers should not busy-loop on this).
    pub fn available(&self) -> usize {
        self.free_indices.lock().unwrap().len()
    }

    /// Claim a free index and materialize a worktree at it for `branch`,
    /// created from `base_branch`. Returns `PoolExhausted` if no index is
    /// free; callers should treat that as "try again later", not an error.
    pub fn acquire(&self, branch: &str, base_branch: &str) -> Result<WorktreeHandle> {
        let index = {
            let mut free = self.free_indices.lock().unwrap();
            free.pop_front().ok_or(WorktreeError::PoolExhausted(self.capacity))?
        };

        let path = git::pool_worktree_path(&self.workspace_root, index);

        if path.exists() {
            // Stale worktree from a prior crash/shutdown; remove it before
            // re-creating so `git worktree add` doesn't refuse the path.
            let _ = git::remove_worktree_force(&self.workspace_root, &path);
        }

        match git::create_worktree(&self.workspace_root, &path, branch, base_branch) {
            Ok(()) => Ok(WorktreeHandle {
                index,
                path,
                branch: branch.to_string(),
            }),
            Err(e) => {
                self.free_indices.lock().unwrap().push_back(index);
                Err(e.into())
            }
        }
    }

    /// Remove the worktree at `handle` and return its index to the free pool.
    /// Always returns the index to the pool, even on git failure, since a
    /// leaked index would permanently shrink capacity.
    pub fn release(&self, handle: &WorktreeHandle) -> Result<()> {
        let result = git::remove_worktree_force(&self.workspace_root, &handle.path);
        self.free_indices.lock().unwrap().push_back(handle.index);
        result.map_err(WorktreeError::from)
    }

    /// Remove every worktree still checked out, for graceful shutdown drain.
    /// Best-effort: logs failures via the returned vec rather than aborting
    /// partway through.
    pub fn release_all(&self) -> Vec<(u32, WorktreeError)> {
        let mut failures = Vec::new();
        for index in 0..self.capacity as u32 {
            let path = git::pool_worktree_path(&self.workspace_root, index);
            if path.exists() {
                if let Err(e) = git::remove_worktree_force(&self.workspace_root, &path) {
                    failures.push((index, e.into()));
                }
            }
        }
        let mut free = self.free_indices.lock().unwrap();
        free.clear();
        free.extend(0..self.capacity as u32);
        failures
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        Command::new("git").args(["init"]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    #[test]
    fn acquire_and_release_returns_index_to_pool() {
        let dir = setup_test_repo();
        let pool = WorktreePool::new(dir.path().to_path_buf(), 2);
        assert_eq!(pool.available(), 2);

        let handle = pool.acquire("stage/a", "main").unwrap();
        assert_eq!(pool.available(), 1);
        assert!(handle.path.exists());

        pool.release(&handle).unwrap();
        assert_eq!(pool.available(), 2);
        assert!(!handle.path.exists());
    }

    #[test]
    fn pool_exhausted_when_capacity_reached() {
        let dir = setup_test_repo();
        let pool = WorktreePool::new(dir.path().to_path_buf(), 1);
        let _handle = pool.acquire("stage/a", "main").unwrap();
        let err = pool.acquire("stage/b", "main").unwrap_err();
        assert!(matches!(err, WorktreeError::PoolExhausted(1)));
    }

    #[test]
    fn acquire_reuses_stale_path_after_crash() {
        let dir = setup_test_repo();
        let pool = WorktreePool::new(dir.path().to_path_buf(), 1);
        let handle = pool.acquire("stage/a", "main").unwrap();
        // Simulate a crash: the index is never released, but we try to
        // reacquire index 0's path directly on a fresh pool instance.
        drop(handle);
        let pool2 = WorktreePool::new(dir.path().to_path_buf(), 1);
        let handle2 = pool2.acquire("stage/b", "main").unwrap();
        assert!(handle2.path.exists());
    }

    #[test]
    fn release_all_clears_every_slot() {
        let dir = setup_test_repo();
        let pool = WorktreePool::new(dir.path().to_path_buf(), 2);
        let h1 = pool.acquire("stage/a", "main").unwrap();
        let h2 = pool.acquire("stage/b", "main").unwrap();
        let failures = pool.release_all();
        assert!(failures.is_empty());
        assert!(!h1.path.exists());
        assert!(!h2.path.exists());
        assert_eq!(pool.available(), 2);
    }
}
