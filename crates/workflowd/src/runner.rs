//! Session executor (spec Section 6 wire interface): spawns the worker CLI as
//! a subprocess in a worktree, streams its output to a log file, and enforces
//! the per-session timeout. One `Runner` tracks every child it has spawned so
//! `kill_all` can terminate them on shutdown (spec Section 5 drain sequence).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use workflow_core::Id;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session binary not found: {0}")]
    BinaryNotFound(String),
    #[error("session timed out after {0} seconds")]
    Timeout(u32),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything needed to spawn one worker session (spec Section 6: `spawn`
/// request shape).
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub stage_id: Id,
    pub stage_file_path: PathBuf,
    pub skill_name: String,
    pub worktree_path: PathBuf,
    pub worktree_index: usize,
    pub model: String,
    /// Forwarded verbatim into the child's environment (spec Section 6: only
    /// `WORKFLOW_`-prefixed vars plus any `MOCK_<SERVICE>` passes).
    pub workflow_env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Runner-wide configuration, sourced from `DaemonConfig` (workflow-core).
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub binary: String,
    pub timeout_sec: u32,
    pub log_dir: PathBuf,
}

/// Executes worker sessions as subprocesses and tracks live children so they
/// can be killed together on shutdown.
pub struct Runner {
    config: RunnerConfig,
    children: Arc<Mutex<HashMap<Id, u32>>>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config, children: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// `<log_dir>/<stage-id>/session-<unix-ts>.log`, mirroring the teacher's
    /// run-scoped log-directory convention.
    pub fn log_path(log_dir: &Path, stage_id: &Id) -> PathBuf {
        log_dir.join(stage_id.as_str()).join("session.log")
    }

    /// `spawn(request, logger) -> {exitCode, durationMs}` (spec Section 6).
    /// `logger` is a sink for a human-readable line per lifecycle event;
    /// stdout/stderr of the child always goes to the session log file.
    pub async fn spawn(
        &self,
        request: &SessionRequest,
        logger: impl Fn(&str) + Send + Sync,
    ) -> Result<SessionOutcome> {
        let log_path = Self::log_path(&self.config.log_dir, &request.stage_id);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::fs::File::create(&log_path)?;
        let log_file_err = log_file.try_clone()?;

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--skill")
            .arg(&request.skill_name)
            .arg("--stage-file")
            .arg(&request.stage_file_path)
            .arg("--model")
            .arg(&request.model)
            .current_dir(&request.worktree_path)
            .env_clear()
            .envs(std::env::vars().filter(|(k, _)| k == "PATH" || k == "HOME"))
            .envs(&request.workflow_env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));

        debug!(
            stage_id = %request.stage_id,
            worktree_index = request.worktree_index,
            model = %request.model,
            "spawning worker session"
        );
        logger(&format!("spawning session for {}", request.stage_id));

        let start = Utc::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SessionError::BinaryNotFound(self.config.binary.clone())
            } else {
                SessionError::Io(e)
            }
        })?;

        if let Some(pid) = child.id() {
            self.children.lock().await.insert(request.stage_id.clone(), pid);
        }

        let outcome = self.wait_for_exit(&mut child, request, start).await;
        self.children.lock().await.remove(&request.stage_id);
        outcome
    }

    async fn wait_for_exit(
        &self,
        child: &mut Child,
        request: &SessionRequest,
        start: chrono::DateTime<Utc>,
    ) -> Result<SessionOutcome> {
        let status = if self.config.timeout_sec > 0 {
            let duration = Duration::from_secs(self.config.timeout_sec as u64);
            match timeout(duration, child.wait()).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(stage_id = %request.stage_id, "session timed out, killing");
                    let _ = child.start_kill();
                    return Err(SessionError::Timeout(self.config.timeout_sec));
                }
            }
        } else {
            child.wait().await?
        };

        let duration_ms = (Utc::now() - start).num_milliseconds().max(0) as u64;
        let exit_code = status.code().unwrap_or(-1);
        info!(
            stage_id = %request.stage_id,
            exit_code = exit_code,
            duration_ms = duration_ms,
            "session exited"
        );

        Ok(SessionOutcome { exit_code, duration_ms })
    }

    /// `killAll(signal)` (spec Section 6): send SIGTERM (or SIGKILL when
    /// `force`) to every tracked child. Best-effort — individual failures are
    /// logged, never propagated, matching the shutdown drain's "each released
    /// lock/worktree failure is logged but never aborts the sequence".
    pub async fn kill_all(&self, force: bool) {
        let pids: Vec<u32> = self.children.lock().await.values().copied().collect();
        for pid in pids {
            let signal = if force { "SIGKILL" } else { "SIGTERM" };
            if let Err(e) = send_signal(pid, force) {
                warn!(pid, signal, error = %e, "failed to signal session process");
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.children.lock().await.len()
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> std::io::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    signal::kill(Pid::from_raw(pid as i32), signal).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _force: bool) -> std::io::Result<()> {
    Ok(())
}
