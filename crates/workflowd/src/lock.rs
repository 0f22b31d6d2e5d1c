//! Per-stage file lock registry (§4.E.3.e).
//!
//! One stage file may only have one worker session touching it at a time.
//! The registry is purely in-memory and scoped to a single daemon process —
//! it exists to stop the orchestrator loop from double-spawning a session for
//! a stage whose prior session hasn't exited yet, not to arbitrate between
//! multiple daemons.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use workflow_core::frontmatter::{self, FrontmatterError};
use workflow_core::Id;

#[derive(Debug, Error)]
pub enum StatusIoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frontmatter error: {0}")]
    Frontmatter(#[from] FrontmatterError),
}

pub type StatusResult<T> = std::result::Result<T, StatusIoError>;

/// Read just the `status` field out of a work-item file's frontmatter,
/// without touching the rest of the document. Returns `Ok(None)` if the
/// frontmatter has no `status` key at all.
pub fn read_status(path: &Path) -> StatusResult<Option<String>> {
    let raw = std::fs::read_to_string(path)?;
    let (yaml, _body) = frontmatter::split(&raw)?;
    let value: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(FrontmatterError::from)?;
    Ok(value
        .get("status")
        .and_then(serde_yaml::Value::as_str)
        .map(str::to_string))
}

/// Write a new `status` back into a work-item file's frontmatter, preserving
/// every other key and the body untouched.
pub fn write_status(path: &Path, status: &str) -> StatusResult<()> {
    let raw = std::fs::read_to_string(path)?;
    let (yaml, body) = frontmatter::split(&raw)?;
    let mut mapping: serde_yaml::Mapping =
        serde_yaml::from_str(yaml).map_err(FrontmatterError::from)?;
    mapping.insert(
        serde_yaml::Value::String("status".to_string()),
        serde_yaml::Value::String(status.to_string()),
    );
    let rendered = frontmatter::render(&mapping, body)?;
    std::fs::write(path, rendered)?;
    Ok(())
}

#[derive(Default)]
struct Inner {
    locked: HashSet<PathBuf>,
}

#[derive(Clone, Default)]
pub struct LockRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().locked.contains(path)
    }

    /// Try to acquire the lock for `path`. Returns `None` if already locked.
    pub fn try_acquire(&self, path: &Path) -> Option<LockGuard> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locked.contains(path) {
            return None;
        }
        inner.locked.insert(path.to_path_buf());
        Some(LockGuard {
            registry: self.inner.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn locked_count(&self) -> usize {
        self.inner.lock().unwrap().locked.len()
    }
}

/// RAII guard: releases the lock on drop, on every path (success, early
/// return, panic-unwind) so a stage can never get stuck locked because a
/// caller forgot to release explicitly.
pub struct LockGuard {
    registry: Arc<Mutex<Inner>>,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.lock().unwrap().locked.remove(&self.path);
    }
}

/// Convenience wrapper keyed by stage id rather than raw path, matching how
/// the orchestrator loop and cron jobs reason about stages.
pub fn stage_lock_path(repo_root: &Path, stage_id: &Id) -> PathBuf {
    repo_root.join(".kanban-locks").join(stage_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_blocks_second_caller() {
        let registry = LockRegistry::new();
        let path = PathBuf::from("/repo/STAGE-1-1-1.md");
        let guard = registry.try_acquire(&path).unwrap();
        assert!(registry.is_locked(&path));
        assert!(registry.try_acquire(&path).is_none());
        drop(guard);
        assert!(!registry.is_locked(&path));
    }

    #[test]
    fn releases_on_drop_even_after_panic_unwind() {
        let registry = LockRegistry::new();
        let path = PathBuf::from("/repo/STAGE-2-2-2.md");
        let result = std::panic::catch_unwind({
            let registry = registry.clone();
            let path = path.clone();
            move || {
                let _guard = registry.try_acquire(&path).unwrap();
                panic!("boom");
            }
        });
        assert!(result.is_err());
        assert!(!registry.is_locked(&path));
    }

    #[test]
    fn locked_count_tracks_concurrent_guards() {
        let registry = LockRegistry::new();
        let g1 = registry.try_acquire(Path::new("a")).unwrap();
        let g2 = registry.try_acquire(Path::new("b")).unwrap();
        assert_eq!(registry.locked_count(), 2);
        drop(g1);
        assert_eq!(registry.locked_count(), 1);
        drop(g2);
    }

    #[test]
    fn stage_lock_path_is_namespaced_under_repo_root() {
        let id = Id::from_raw("STAGE-1-1-1");
        let path = stage_lock_path(Path::new("/repo"), &id);
        assert_eq!(path, PathBuf::from("/repo/.kanban-locks/STAGE-1-1-1"));
    }

    #[test]
    fn read_status_extracts_just_the_status_field() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("STAGE-A.md");
        std::fs::write(
            &path,
            "---\nid: STAGE-A\nstatus: Design\nworktree_branch: run/a\n---\nbody\n",
        )
        .unwrap();
        assert_eq!(read_status(&path).unwrap(), Some("Design".to_string()));
    }

    #[test]
    fn write_status_preserves_other_keys_and_body() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("STAGE-A.md");
        std::fs::write(
            &path,
            "---\nid: STAGE-A\nstatus: Not Started\nworktree_branch: run/a\n---\nbody text\n",
        )
        .unwrap();
        write_status(&path, "Design").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("status: Design"));
        assert!(contents.contains("worktree_branch: run/a"));
        assert!(contents.ends_with("body text\n"));
    }
}
