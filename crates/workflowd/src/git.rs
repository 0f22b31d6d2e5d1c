//! Native git plumbing backing the worktree pool (§4.E.3.f, §5).
//!
//! Only the primitives the pool actually needs survive here: detecting the
//! default branch, creating/removing worktrees, listing them, and checking tree
//! cleanliness. The orchestrator never merges a stage's branch back itself —
//! that is the code host's job once a PR merges — so the teacher's
//! merge/squash/merge-to-target flow has no counterpart here.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Detect the default branch for a repository: the remote's HEAD if tracked,
/// else `main` or `master` if either exists locally, else `main`.
pub fn detect_default_branch(workspace_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(workspace_root)
        .output()?;

    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{candidate}")])
            .current_dir(workspace_root)
            .output()?;
        if check.status.success() {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

pub fn repo_name(workspace_root: &Path) -> String {
    workspace_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Check if a branch exists locally.
pub fn branch_exists(workspace_root: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(workspace_root)
        .output()?;
    Ok(output.status.success())
}

/// Create a new branch from base without checking it out.
pub fn create_branch(workspace_root: &Path, branch: &str, base: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["branch", branch, base])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git branch {branch} {base}: {stderr}"
        )));
    }
    Ok(())
}

/// Create a git worktree at `worktree_path` for `branch`, creating the branch
/// from `base_branch` if it doesn't exist yet.
pub fn create_worktree(
    workspace_root: &Path,
    worktree_path: &Path,
    branch: &str,
    base_branch: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("create parent dir: {e}")))?;
    }

    if !branch_exists(workspace_root, branch)? {
        create_branch(workspace_root, branch, base_branch)?;
    }

    let output = Command::new("git")
        .args([
            "worktree",
            "add",
            worktree_path.to_string_lossy().as_ref(),
            branch,
        ])
        .current_dir(workspace_root)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git worktree add: {stderr}")));
    }
    Ok(())
}

pub fn remove_worktree(workspace_root: &Path, worktree_path: &Path) -> Result<()> {
    let output = Command::new("git")
        .args([
            "worktree",
            "remove",
            worktree_path.to_string_lossy().as_ref(),
        ])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git worktree remove: {stderr}"
        )));
    }
    Ok(())
}

pub fn remove_worktree_force(workspace_root: &Path, worktree_path: &Path) -> Result<()> {
    let output = Command::new("git")
        .args([
            "worktree",
            "remove",
            "--force",
            worktree_path.to_string_lossy().as_ref(),
        ])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git worktree remove --force: {stderr}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub commit: String,
}

pub fn list_worktrees(workspace_root: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = Command::new("git")
        .args(["worktree", "list", "--porcelain"])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git worktree list: {stderr}"
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut worktrees = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_commit: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(commit)) = (current_path.take(), current_commit.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    commit,
                    branch: current_branch.take(),
                });
            }
            current_path = Some(path.to_string());
        } else if let Some(commit) = line.strip_prefix("HEAD ") {
            current_commit = Some(commit.to_string());
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        }
    }

    if let (Some(path), Some(commit)) = (current_path, current_commit) {
        worktrees.push(WorktreeInfo {
            path,
            commit,
            branch: current_branch,
        });
    }

    Ok(worktrees)
}

pub fn is_working_tree_clean(workspace_root: &Path) -> Result<bool> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git status: {stderr}")));
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().is_empty())
}

pub fn checkout_branch(workspace_root: &Path, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["checkout", branch])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git checkout {branch}: {stderr}"
        )));
    }
    Ok(())
}

/// Resolve the `index`-th worktree path in the pool, e.g.
/// `<repo>/.kanban-worktrees/3`.
pub fn pool_worktree_path(workspace_root: &Path, index: u32) -> PathBuf {
    workspace_root.join(".kanban-worktrees").join(index.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn repo_name_uses_dir_basename() {
        assert_eq!(repo_name(Path::new("/home/user/my-project")), "my-project");
    }

    #[test]
    fn pool_worktree_path_is_indexed_under_workspace() {
        let path = pool_worktree_path(Path::new("/repo"), 2);
        assert_eq!(path, PathBuf::from("/repo/.kanban-worktrees/2"));
    }

    #[test]
    fn is_working_tree_clean_detects_untracked_files() {
        let dir = setup_test_repo();
        assert!(is_working_tree_clean(dir.path()).unwrap());
        std::fs::write(dir.path().join("untracked.txt"), "data").unwrap();
        assert!(!is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn create_and_remove_worktree() {
        let dir = setup_test_repo();
        let base_branch = detect_default_branch(dir.path()).unwrap();
        let worktree_path = dir.path().parent().unwrap().join("wt-0");

        create_worktree(dir.path(), &worktree_path, "run/stage-a", &base_branch).unwrap();
        assert!(worktree_path.exists());
        assert!(branch_exists(dir.path(), "run/stage-a").unwrap());

        remove_worktree(dir.path(), &worktree_path).unwrap();
        assert!(!worktree_path.exists());
    }

    #[test]
    fn list_worktrees_includes_main_checkout() {
        let dir = setup_test_repo();
        let worktrees = list_worktrees(dir.path()).unwrap();
        assert_eq!(worktrees.len(), 1);
    }

    #[test]
    fn checkout_branch_switches_head() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "feature", "HEAD").unwrap();
        checkout_branch(dir.path(), "feature").unwrap();

        let output = Command::new("git")
            .args(["branch", "--show-current"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "feature");
    }
}
