//! The orchestrator loop: a bounded-parallelism scheduler that discovers
//! ready stages, acquires per-file locks, allocates worktrees, spawns
//! skill-specific worker sessions, and runs the exit gate on status
//! transitions. Cron jobs (`crate::cron`) share the same lock registry,
//! worktree pool, runner and code host.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use workflow_core::config::MockMode;
use workflow_core::events::{
    EventPayload, ExitGatePayload, ResolverFiredPayload, SessionFinishedPayload,
    SessionSpawnedPayload, SkippedLockedPayload, StageOnboardedPayload, WorktreeAllocatedPayload,
    WorktreeReleasedPayload,
};
use workflow_core::pipeline::PipelineModel;
use workflow_core::types::{Repo, Stage, StageStatus};
use workflow_core::Id;

use crate::codehost::CodeHost;
use crate::discovery::{self, DiscoveryError};
use crate::exit_gate::{self, WorkerInfo};
use crate::lock::{self, LockGuard, LockRegistry};
use crate::resolver::ResolverRegistry;
use crate::runner::{Runner, SessionError, SessionOutcome, SessionRequest};
use crate::storage::{Store, StoreError};
use crate::worktree::{WorktreeHandle, WorktreePool};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("repo {0:?} is not registered; run a sync first")]
    RepoNotRegistered(PathBuf),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrator configuration, resolved from `workflow_core::DaemonConfig`
/// plus the loaded pipeline.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub repo_path: PathBuf,
    pub max_parallel: usize,
    pub idle_seconds: u64,
    pub model: String,
    pub base_branch: String,
    pub drain_timeout_ms: u64,
    pub graceful_kill_timeout_ms: u64,
    pub once: bool,
    /// Forwarded verbatim into every spawned session's environment.
    pub workflow_env: HashMap<String, String>,
    /// Selects which `MOCK_<SERVICE>=true` vars `try_spawn`/`try_spawn_sidecar`
    /// add on top of `workflow_env` (spec Section 6).
    pub mock_mode: MockMode,
    pub mock_services: Vec<String>,
}

/// One outstanding worker session, tracked from spawn through exit.
struct ActiveWorker {
    stage_file_path: PathBuf,
    status_before: StageStatus,
}

struct Inner {
    config: OrchestratorConfig,
    store: Arc<Store>,
    pipeline: PipelineModel,
    locks: LockRegistry,
    worktrees: Arc<WorktreePool>,
    runner: Arc<Runner>,
    code_host: Arc<dyn CodeHost>,
    resolvers: ResolverRegistry,
    running: AtomicBool,
    active: Mutex<HashMap<Id, ActiveWorker>>,
    worker_exited: Notify,
    idle_cancel: Notify,
    isolation_valid: AtomicBool,
}

/// The orchestrator loop. Cheap to clone (an `Arc` around shared state), so
/// the main loop and the cron jobs can each hold a handle to the same lock
/// registry, worktree pool, runner and code host.
#[derive(Clone)]
pub struct Orchestrator(Arc<Inner>);

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<Store>,
        pipeline: PipelineModel,
        worktrees: Arc<WorktreePool>,
        runner: Arc<Runner>,
        code_host: Arc<dyn CodeHost>,
        resolvers: ResolverRegistry,
    ) -> Self {
        Self(Arc::new(Inner {
            config,
            store,
            pipeline,
            locks: LockRegistry::new(),
            worktrees,
            runner,
            code_host,
            resolvers,
            running: AtomicBool::new(true),
            active: Mutex::new(HashMap::new()),
            worker_exited: Notify::new(),
            idle_cancel: Notify::new(),
            isolation_valid: AtomicBool::new(true),
        }))
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.0.locks
    }

    pub fn store(&self) -> &Store {
        &self.0.store
    }

    pub(crate) fn worktrees(&self) -> &Arc<WorktreePool> {
        &self.0.worktrees
    }

    pub(crate) fn runner(&self) -> &Arc<Runner> {
        &self.0.runner
    }

    pub(crate) fn code_host(&self) -> &Arc<dyn CodeHost> {
        &self.0.code_host
    }

    pub(crate) fn config(&self) -> &OrchestratorConfig {
        &self.0.config
    }

    /// `workflow_env` plus any `MOCK_<SERVICE>=true` vars `mock_mode` calls
    /// for (spec Section 6). Shared by the main loop's `try_spawn` and
    /// `crate::cron`'s sidecar spawns so both inject mocks identically.
    pub(crate) fn session_env(&self) -> HashMap<String, String> {
        let mut env = self.0.config.workflow_env.clone();
        for (key, value) in
            workflow_core::config::mock_env_vars_for(self.0.config.mock_mode, &self.0.config.mock_services)
        {
            env.insert(key, value);
        }
        env
    }

    /// Shared with `crate::cron`: both the main loop and cron jobs resolve
    /// the daemon's single configured repo the same way.
    pub(crate) async fn find_repo(&self) -> Result<Repo> {
        let path = self.0.config.repo_path.to_string_lossy().to_string();
        self.0
            .store
            .find_repo_by_path(&path)
            .await?
            .ok_or_else(|| OrchestratorError::RepoNotRegistered(self.0.config.repo_path.clone()))
    }

    pub async fn active_count(&self) -> usize {
        self.0.active.lock().await.len()
    }

    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    /// Idempotent: cancels the pending idle sleep and wakes the worker-exit
    /// waiter so a suspended loop observes `running=false` promptly.
    pub fn stop(&self) {
        self.0.running.store(false, Ordering::SeqCst);
        self.0.idle_cancel.notify_waiters();
        self.0.worker_exited.notify_waiters();
    }

    /// Probe git worktree isolation once per run. A failure here makes every
    /// subsequent spawn attempt a no-op rather than re-probing each tick.
    fn validate_isolation(&self) {
        let ok = crate::git::detect_default_branch(&self.0.config.repo_path).is_ok();
        self.0.isolation_valid.store(ok, Ordering::SeqCst);
        if !ok {
            warn!(repo = %self.0.config.repo_path.display(), "git worktree isolation unavailable");
        }
    }

    /// Runs until `stop()` is called, or (in `once` mode) until no work
    /// remains and no workers are active.
    pub async fn run(&self) -> Result<()> {
        self.validate_isolation();

        loop {
            if !self.is_running() {
                break;
            }

            if let Err(e) = self.run_resolvers().await {
                warn!(error = %e, "resolver pass failed");
            }

            let active_count = self.active_count().await;
            if active_count >= self.0.config.max_parallel {
                self.wait_for_worker_exit().await;
                continue;
            }

            let repo = self.find_repo().await?;
            let available = self.0.config.max_parallel - active_count;
            let discovered = discovery::discover(&self.0.store, &repo.id, available).await?;

            let mut spawned_any = false;
            for ready in discovered.ready {
                if !self.is_running() || self.active_count().await >= self.0.config.max_parallel {
                    break;
                }
                match self.try_spawn(&ready.stage).await {
                    Ok(true) => spawned_any = true,
                    Ok(false) => {}
                    Err(e) => warn!(stage_id = %ready.stage.id, error = %e, "spawn attempt failed"),
                }
            }

            let active_after = self.active_count().await;

            if !spawned_any && active_after == 0 {
                if self.0.config.once {
                    break;
                }
                self.cancellable_sleep(Duration::from_secs(self.0.config.idle_seconds)).await;
                continue;
            }

            if self.0.config.once {
                self.wait_for_all_active().await;
                break;
            }

            if !spawned_any && active_after > 0 {
                self.wait_for_worker_exit().await;
            }
        }

        Ok(())
    }

    async fn wait_for_worker_exit(&self) {
        if !self.is_running() {
            return;
        }
        self.0.worker_exited.notified().await;
    }

    async fn wait_for_all_active(&self) {
        while self.active_count().await > 0 {
            self.0.worker_exited.notified().await;
        }
    }

    /// `stop()` cancels this immediately via `idle_cancel`.
    async fn cancellable_sleep(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.0.idle_cancel.notified() => {}
        }
    }

    /// Attempt to spawn one ready stage. Returns `Ok(true)` if a session was
    /// spawned, `Ok(false)` if the stage was skipped this tick (locked, a
    /// resolver phase, isolation invalid, or the worktree pool is exhausted)
    /// — none of which are errors.
    async fn try_spawn(&self, stage: &Stage) -> Result<bool> {
        let path = PathBuf::from(&stage.file_path);

        let Some(lock_guard) = self.0.locks.try_acquire(&path) else {
            let payload = EventPayload::SkippedLocked(SkippedLockedPayload {
                stage_id: stage.id.clone(),
                actor: "orchestrator".to_string(),
            });
            debug!(stage_id = %stage.id, event = ?payload.event_type(), "skipped, stage file already locked");
            return Ok(false);
        };

        let mut status = lock::read_status(&path)
            .ok()
            .flatten()
            .unwrap_or_else(|| stage.status.as_str().to_string());

        if status == "Not Started" {
            let entry_status = self.0.pipeline.entry_phase().status.clone();
            if let Err(e) = lock::write_status(&path, &entry_status) {
                warn!(stage_id = %stage.id, error = %e, "failed to onboard stage");
                return Ok(false);
            }
            let payload = EventPayload::StageOnboarded(StageOnboardedPayload {
                stage_id: stage.id.clone(),
                entry_status: entry_status.clone(),
            });
            info!(stage_id = %stage.id, entry_status = %entry_status, event = ?payload.event_type(), "onboarded stage");
            status = entry_status;
        }

        if self.0.pipeline.is_resolver_status(&status) {
            return Ok(false);
        }

        let Some(skill) = self.0.pipeline.skill_for_status(&status).map(str::to_string) else {
            warn!(stage_id = %stage.id, status = %status, "status maps to no skill or resolver, skipping");
            return Ok(false);
        };

        if !self.0.isolation_valid.load(Ordering::SeqCst) {
            warn!(stage_id = %stage.id, "worktree isolation unavailable, skipping");
            return Ok(false);
        }

        let worktree = match self.0.worktrees.acquire(&stage.worktree_branch, &self.0.config.base_branch) {
            Ok(h) => h,
            Err(e) => {
                debug!(stage_id = %stage.id, error = %e, "worktree pool exhausted this tick");
                return Ok(false);
            }
        };
        let alloc_payload = EventPayload::WorktreeAllocated(WorktreeAllocatedPayload {
            stage_id: stage.id.clone(),
            worktree_index: worktree.index,
            path: worktree.path.to_string_lossy().to_string(),
        });
        debug!(stage_id = %stage.id, worktree_index = worktree.index, event = ?alloc_payload.event_type(), "allocated worktree");

        self.0.store.update_session_active(&stage.id, true).await?;

        let request = SessionRequest {
            stage_id: stage.id.clone(),
            stage_file_path: path.clone(),
            skill_name: skill.clone(),
            worktree_path: worktree.path.clone(),
            worktree_index: worktree.index as usize,
            model: self.0.config.model.clone(),
            workflow_env: self.session_env(),
        };

        self.0.active.lock().await.insert(
            stage.id.clone(),
            ActiveWorker {
                stage_file_path: path.clone(),
                status_before: StageStatus::new(status),
            },
        );

        let spawned_payload = EventPayload::SessionSpawned(SessionSpawnedPayload {
            stage_id: stage.id.clone(),
            skill: skill.clone(),
            worktree_index: worktree.index,
        });
        info!(stage_id = %stage.id, skill = %skill, event = ?spawned_payload.event_type(), "spawning worker session");

        let this = self.clone();
        let stage_id = stage.id.clone();
        tokio::spawn(async move {
            let outcome = this.0.runner.spawn(&request, |line| debug!(stage_id = %stage_id, "{line}")).await;
            this.finish_worker(stage_id, worktree, lock_guard, outcome).await;
        });

        Ok(true)
    }

    /// Worker-exit handling: classify the outcome, run the exit gate on
    /// transitions, then release every resource the worker held.
    async fn finish_worker(
        &self,
        stage_id: Id,
        worktree: WorktreeHandle,
        _lock_guard: LockGuard,
        outcome: std::result::Result<SessionOutcome, SessionError>,
    ) {
        let worker = self.0.active.lock().await.remove(&stage_id);
        let (stage_file_path, status_before) = match worker {
            Some(w) => (w.stage_file_path, w.status_before),
            None => (PathBuf::new(), StageStatus::new("")),
        };

        match outcome {
            Ok(session_outcome) => {
                let status_after = lock::read_status(&stage_file_path)
                    .ok()
                    .flatten()
                    .map(StageStatus::new)
                    .unwrap_or_else(|| status_before.clone());

                let finished_payload = EventPayload::SessionFinished(SessionFinishedPayload {
                    stage_id: stage_id.clone(),
                    exit_code: session_outcome.exit_code,
                    duration_ms: session_outcome.duration_ms,
                    status_before: status_before.as_str().to_string(),
                    status_after: status_after.as_str().to_string(),
                });
                info!(
                    stage_id = %stage_id,
                    exit_code = session_outcome.exit_code,
                    event = ?finished_payload.event_type(),
                    "session finished"
                );

                if status_after != status_before {
                    let worker_info = WorkerInfo { stage_id: stage_id.clone() };
                    match exit_gate::run(&self.0.store, &self.0.config.repo_path, &worker_info, status_after).await
                    {
                        Ok(result) => {
                            let gate_payload = EventPayload::ExitGate(ExitGatePayload {
                                stage_id: stage_id.clone(),
                                status_changed: result.status_changed,
                                ticket_completed: result.ticket_completed,
                                epic_completed: result.epic_completed,
                            });
                            info!(
                                stage_id = %stage_id,
                                ticket_completed = result.ticket_completed,
                                epic_completed = result.epic_completed,
                                event = ?gate_payload.event_type(),
                                "exit gate ran"
                            );
                        }
                        Err(e) => warn!(stage_id = %stage_id, error = %e, "exit gate failed"),
                    }
                } else if session_outcome.exit_code != 0 {
                    warn!(stage_id = %stage_id, exit_code = session_outcome.exit_code, "session crashed with no status change");
                } else {
                    debug!(stage_id = %stage_id, "session exited with no status change, treating as a no-op");
                }
            }
            Err(e) => {
                warn!(stage_id = %stage_id, error = %e, "session error, treating as a crash");
            }
        }

        if let Err(e) = self.0.worktrees.release(&worktree) {
            warn!(stage_id = %stage_id, worktree_index = worktree.index, error = %e, "failed to release worktree");
        } else {
            let released_payload = EventPayload::WorktreeReleased(WorktreeReleasedPayload {
                stage_id: stage_id.clone(),
                worktree_index: worktree.index,
            });
            debug!(stage_id = %stage_id, event = ?released_payload.event_type(), "released worktree");
        }

        if let Err(e) = self.0.store.update_session_active(&stage_id, false).await {
            warn!(stage_id = %stage_id, error = %e, "failed to clear session_active");
        }

        self.0.worker_exited.notify_waiters();
    }

    /// Run every registered resolver over every stage whose status maps to a
    /// resolver phase. A non-null return writes the frontmatter (under the
    /// same per-stage lock a worker spawn would take) and runs the exit
    /// gate, without spawning a session.
    pub async fn run_resolvers(&self) -> Result<()> {
        let repo = match self.find_repo().await {
            Ok(repo) => repo,
            Err(OrchestratorError::RepoNotRegistered(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let stages = self.0.store.list_stages_by_repo(&repo.id).await?;

        for stage in stages {
            if !self.0.pipeline.is_resolver_status(stage.status.as_str()) {
                continue;
            }
            let Some(phase) = self.0.pipeline.phase_for_status(stage.status.as_str()) else {
                continue;
            };
            let Some(resolver_name) = phase.resolver.clone() else {
                continue;
            };
            let Some(resolver) = self.0.resolvers.find(&resolver_name) else {
                continue;
            };

            let path = PathBuf::from(&stage.file_path);
            let Some(_guard) = self.0.locks.try_acquire(&path) else {
                continue;
            };

            let new_status = match resolver.resolve(&stage, self.0.code_host.as_ref()).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(stage_id = %stage.id, resolver = %resolver_name, error = %e, "resolver errored, treating as a no-op");
                    None
                }
            };

            let payload = EventPayload::ResolverFired(ResolverFiredPayload {
                stage_id: stage.id.clone(),
                resolver: resolver_name.clone(),
                new_status: new_status.as_ref().map(|s| s.as_str().to_string()),
            });

            let Some(new_status) = new_status else {
                debug!(stage_id = %stage.id, resolver = %resolver_name, event = ?payload.event_type(), "resolver made no transition");
                continue;
            };

            if let Err(e) = lock::write_status(&path, new_status.as_str()) {
                warn!(stage_id = %stage.id, error = %e, "resolver write-back failed");
                continue;
            }
            info!(stage_id = %stage.id, resolver = %resolver_name, new_status = %new_status, event = ?payload.event_type(), "resolver fired");

            let worker_info = WorkerInfo { stage_id: stage.id.clone() };
            if let Err(e) = exit_gate::run(&self.0.store, &self.0.config.repo_path, &worker_info, new_status).await
            {
                warn!(stage_id = %stage.id, error = %e, "exit gate failed after resolver write");
            }
        }

        Ok(())
    }

    /// Graceful shutdown drain: wait up to `drain_timeout_ms` for active
    /// workers to exit on their own; past that, send TERM, wait up to
    /// `graceful_kill_timeout_ms`, then KILL. Finally release every
    /// lock/worktree any still-active worker was holding.
    pub async fn shutdown(&self) {
        self.stop();

        let deadline = Instant::now() + Duration::from_millis(self.0.config.drain_timeout_ms);
        while self.active_count().await > 0 && Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                () = self.0.worker_exited.notified() => {}
                () = tokio::time::sleep(remaining) => break,
            }
        }

        if self.active_count().await > 0 {
            warn!(active = self.active_count().await, "drain timeout exceeded, sending TERM");
            self.0.runner.kill_all(false).await;

            let deadline = Instant::now() + Duration::from_millis(self.0.config.graceful_kill_timeout_ms);
            while self.active_count().await > 0 && Instant::now() < deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    () = self.0.worker_exited.notified() => {}
                    () = tokio::time::sleep(remaining) => break,
                }
            }

            if self.active_count().await > 0 {
                warn!("graceful kill timeout exceeded, sending KILL");
                self.0.runner.kill_all(true).await;
            }
        }

        let failures = self.0.worktrees.release_all();
        for (index, e) in failures {
            warn!(worktree_index = index, error = %e, "failed to release worktree during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codehost::NullCodeHost;
    use crate::resolver::ResolverRegistry;
    use crate::runner::RunnerConfig;
    use crate::sync::SyncEngine;
    use std::process::Command;
    use tempfile::TempDir;

    fn write_file(dir: &std::path::Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn init_git_repo(dir: &std::path::Path) {
        Command::new("git").args(["init"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["config", "user.email", "t@t.com"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["config", "user.name", "T"]).current_dir(dir).output().unwrap();
        std::fs::write(dir.join("README.md"), "# t").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        Command::new("git").args(["commit", "-m", "init"]).current_dir(dir).output().unwrap();
    }

    fn sample_pipeline() -> PipelineModel {
        let yaml = r#"
workflow:
  entry_phase: Design
  phases:
    - name: Design
      status: Design
      skill: phase-design
      transitions_to: [Done]
"#;
        let cfg = workflow_core::pipeline::PipelineConfig::from_yaml(yaml).unwrap();
        PipelineModel::from_config(&cfg).unwrap()
    }

    async fn build_orchestrator(dir: &std::path::Path, once: bool) -> Orchestrator {
        build_orchestrator_with_mock(dir, once, MockMode::None, Vec::new()).await
    }

    async fn build_orchestrator_with_mock(
        dir: &std::path::Path,
        once: bool,
        mock_mode: MockMode,
        mock_services: Vec<String>,
    ) -> Orchestrator {
        let store = Arc::new(Store::in_memory().await.unwrap());
        store.migrate_embedded().await.unwrap();
        let worktrees = Arc::new(WorktreePool::new(dir.to_path_buf(), 2));
        let runner = Arc::new(Runner::new(RunnerConfig {
            binary: "true".to_string(),
            timeout_sec: 5,
            log_dir: dir.join(".kanban-logs"),
        }));
        Orchestrator::new(
            OrchestratorConfig {
                repo_path: dir.to_path_buf(),
                max_parallel: 2,
                idle_seconds: 0,
                model: "sonnet".to_string(),
                base_branch: "main".to_string(),
                drain_timeout_ms: 200,
                graceful_kill_timeout_ms: 100,
                once,
                workflow_env: HashMap::new(),
                mock_mode,
                mock_services,
            },
            store,
            sample_pipeline(),
            worktrees,
            runner,
            Arc::new(NullCodeHost),
            ResolverRegistry::with_defaults(),
        )
    }

    #[tokio::test]
    async fn once_mode_exits_with_no_ready_work() {
        let dir = TempDir::new().unwrap();
        init_git_repo(dir.path());
        let orch = build_orchestrator(dir.path(), true).await;
        SyncEngine::new(orch.store()).sync_repo(dir.path()).await.unwrap();
        orch.run().await.unwrap();
        assert_eq!(orch.active_count().await, 0);
    }

    #[tokio::test]
    async fn onboards_and_spawns_a_ready_stage() {
        let dir = TempDir::new().unwrap();
        init_git_repo(dir.path());
        write_file(
            dir.path(),
            "epics/e1/EPIC-1.md",
            "---\nid: EPIC-1\ntitle: Epic\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/TICKET-1.md",
            "---\nid: TICKET-1\nepic: EPIC-1\ntitle: Ticket\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-A.md",
            "---\nid: STAGE-A\nticket: TICKET-1\nepic: EPIC-1\ntitle: A\nstatus: \"Not Started\"\nworktree_branch: run/stage-a\n---\nbody\n",
        );

        let orch = build_orchestrator(dir.path(), true).await;
        SyncEngine::new(orch.store()).sync_repo(dir.path()).await.unwrap();
        orch.run().await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("epics/e1/TICKET-1/STAGE-A.md")).unwrap();
        assert!(written.contains("status: Design"));
        assert_eq!(orch.active_count().await, 0);
        assert!(!orch.locks().is_locked(&dir.path().join("epics/e1/TICKET-1/STAGE-A.md")));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_breaks_the_loop() {
        let dir = TempDir::new().unwrap();
        init_git_repo(dir.path());
        let orch = build_orchestrator(dir.path(), false).await;
        orch.stop();
        orch.stop();
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn session_env_injects_mock_vars_for_selective_mode() {
        let dir = TempDir::new().unwrap();
        let orch = build_orchestrator_with_mock(
            dir.path(),
            true,
            MockMode::Selective,
            vec!["CODE_HOST".to_string()],
        )
        .await;
        let env = orch.session_env();
        assert_eq!(env.get("MOCK_CODE_HOST"), Some(&"true".to_string()));
        assert!(!env.contains_key("MOCK_JIRA"));
    }

    #[tokio::test]
    async fn session_env_injects_every_known_service_for_full_mode() {
        let dir = TempDir::new().unwrap();
        let orch = build_orchestrator_with_mock(dir.path(), true, MockMode::Full, Vec::new()).await;
        let env = orch.session_env();
        assert_eq!(env.get("MOCK_CODE_HOST"), Some(&"true".to_string()));
        assert_eq!(env.get("MOCK_JIRA"), Some(&"true".to_string()));
    }
}
