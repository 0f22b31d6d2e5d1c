//! Cron subsystem: periodic jobs that run alongside the main orchestrator
//! loop and share its lock registry, worktree pool, runner and code host.
//!
//! `mr-comment-poll` watches merged-but-not-yet-exited PRs and nudges
//! stalled review threads. `mr-chain-manager` watches parent-branch merges
//! and rebases dependent child stages once it's safe to do so. Both jobs
//! are independently scheduled and independently disable-able; a disabled
//! job logs once at startup and never runs again.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use workflow_core::events::{
    CronJobDisabledPayload, EventPayload, ExitGatePayload, SessionFinishedPayload,
    SessionSpawnedPayload, SkippedConflictPayload, SkippedLockedPayload, WorktreeAllocatedPayload,
    WorktreeReleasedPayload,
};
use workflow_core::pipeline::CronJobConfig;
use workflow_core::types::{MrCommentTracking, ParentBranchTracking, Stage, StageStatus};
use workflow_core::Id;

use crate::exit_gate::{self, WorkerInfo};
use crate::lock::LockGuard;
use crate::runner::{SessionRequest, SessionOutcome};
use crate::scheduler::{Orchestrator, OrchestratorError};
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("code host error: {0}")]
    CodeHost(#[from] crate::codehost::CodeHostError),
    #[error("repo lookup failed: {0}")]
    Repo(#[from] OrchestratorError),
}

pub type Result<T> = std::result::Result<T, CronError>;

struct Inner {
    orchestrator: Orchestrator,
    mr_comment_poll: Option<CronJobConfig>,
    mr_chain_manager: Option<CronJobConfig>,
    running: std::sync::atomic::AtomicBool,
    cancel: Notify,
    active: Mutex<HashSet<Id>>,
    worker_exited: Notify,
}

/// Runs the two cron jobs as independent periodic tasks, sharing every
/// resource (store, locks, worktree pool, runner, code host) the main
/// orchestrator loop uses.
#[derive(Clone)]
pub struct CronRunner(Arc<Inner>);

impl CronRunner {
    pub fn new(
        orchestrator: Orchestrator,
        mr_comment_poll: Option<CronJobConfig>,
        mr_chain_manager: Option<CronJobConfig>,
    ) -> Self {
        Self(Arc::new(Inner {
            orchestrator,
            mr_comment_poll,
            mr_chain_manager,
            running: std::sync::atomic::AtomicBool::new(true),
            cancel: Notify::new(),
            active: Mutex::new(HashSet::new()),
            worker_exited: Notify::new(),
        }))
    }

    fn is_running(&self) -> bool {
        self.0.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Idempotent. Stops both job loops before the next tick; does not
    /// interrupt a session currently in flight.
    pub fn stop(&self) {
        self.0.running.store(false, std::sync::atomic::Ordering::SeqCst);
        self.0.cancel.notify_waiters();
    }

    pub async fn active_count(&self) -> usize {
        self.0.active.lock().await.len()
    }

    /// Wait for every in-flight cron-spawned session to exit. Called during
    /// shutdown, after `stop()`, before the main loop's own worker drain.
    pub async fn wait_for_drain(&self) {
        while self.active_count().await > 0 {
            self.0.worker_exited.notified().await;
        }
    }

    /// Runs both job loops concurrently until `stop()` is called.
    pub async fn run(&self) {
        let poll = self.clone().run_mr_comment_poll();
        let chain = self.clone().run_mr_chain_manager();
        tokio::join!(poll, chain);
    }

    async fn cancellable_sleep(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.0.cancel.notified() => {}
        }
    }

    async fn run_mr_comment_poll(self) {
        let Some(job) = self.0.mr_comment_poll else {
            return;
        };
        if !job.enabled {
            let payload = EventPayload::CronJobDisabled(CronJobDisabledPayload {
                job: "mr-comment-poll".to_string(),
            });
            info!(job = "mr-comment-poll", event = ?payload.event_type(), "cron job disabled, skipping");
            return;
        }
        while self.is_running() {
            if let Err(e) = self.tick_mr_comment_poll().await {
                warn!(job = "mr-comment-poll", error = %e, "tick failed");
            }
            self.cancellable_sleep(Duration::from_secs(job.interval_seconds)).await;
        }
    }

    async fn run_mr_chain_manager(self) {
        let Some(job) = self.0.mr_chain_manager else {
            return;
        };
        if !job.enabled {
            let payload = EventPayload::CronJobDisabled(CronJobDisabledPayload {
                job: "mr-chain-manager".to_string(),
            });
            info!(job = "mr-chain-manager", event = ?payload.event_type(), "cron job disabled, skipping");
            return;
        }
        while self.is_running() {
            if let Err(e) = self.tick_mr_chain_manager().await {
                warn!(job = "mr-chain-manager", error = %e, "tick failed");
            }
            self.cancellable_sleep(Duration::from_secs(job.interval_seconds)).await;
        }
    }

    async fn tick_mr_comment_poll(&self) -> Result<()> {
        let repo = self.0.orchestrator.find_repo().await?;
        let store = self.0.orchestrator.store();
        let stages = store.list_stages_by_status_idle(&repo.id, "PR Created").await?;
        for stage in stages {
            if !self.is_running() {
                break;
            }
            if let Err(e) = self.poll_one_pr(&stage, &repo.id).await {
                warn!(stage_id = %stage.id, error = %e, "mr-comment-poll failed for stage");
            }
        }
        Ok(())
    }

    async fn poll_one_pr(&self, stage: &Stage, repo_id: &Id) -> Result<()> {
        let Some(pr_url) = stage.pr_url.as_deref() else {
            return Ok(());
        };
        let code_host = self.0.orchestrator.code_host();
        let Some(status) = code_host.get_pr_status(pr_url).await? else {
            return Ok(());
        };

        let tracking = self.0.orchestrator.store().find_mr_comment_tracking(&stage.id).await?;
        let previous_count = tracking.map(|t| t.last_known_unresolved_count).unwrap_or(0);

        if status.merged {
            let worker_info = WorkerInfo { stage_id: stage.id.clone() };
            match exit_gate::run(
                self.0.orchestrator.store(),
                &self.0.orchestrator.config().repo_path,
                &worker_info,
                StageStatus::new("Done"),
            )
            .await
            {
                Ok(result) => {
                    let payload = EventPayload::ExitGate(ExitGatePayload {
                        stage_id: stage.id.clone(),
                        status_changed: result.status_changed,
                        ticket_completed: result.ticket_completed,
                        epic_completed: result.epic_completed,
                    });
                    info!(stage_id = %stage.id, event = ?payload.event_type(), "mr-comment-poll detected merge");
                }
                Err(e) => warn!(stage_id = %stage.id, error = %e, "exit gate failed after detected PR merge"),
            }
        } else if i64::from(status.unresolved_thread_count) > previous_count {
            self.try_spawn_sidecar(stage, "review-cycle").await?;
        }

        self.0
            .orchestrator
            .store()
            .upsert_mr_comment_tracking(&MrCommentTracking {
                stage_id: stage.id.clone(),
                last_poll_timestamp: Some(Utc::now()),
                last_known_unresolved_count: i64::from(status.unresolved_thread_count),
                repo_id: repo_id.clone(),
            })
            .await?;

        Ok(())
    }

    async fn tick_mr_chain_manager(&self) -> Result<()> {
        let repo = self.0.orchestrator.find_repo().await?;
        let rows = self
            .0
            .orchestrator
            .store()
            .list_unmerged_parent_branch_tracking(&repo.id)
            .await?;
        for row in rows {
            if !self.is_running() {
                break;
            }
            if let Err(e) = self.check_parent_branch(&row).await {
                warn!(child_stage_id = %row.child_stage_id, error = %e, "mr-chain-manager failed for row");
            }
        }
        Ok(())
    }

    async fn check_parent_branch(&self, row: &ParentBranchTracking) -> Result<()> {
        let code_host = self.0.orchestrator.code_host();
        let Some(status) = code_host.get_pr_status(&row.parent_pr_url).await? else {
            return Ok(());
        };
        let head = code_host.get_branch_head(&row.parent_branch).await?;

        if !status.merged {
            if head != row.last_known_head {
                let mut updated = row.clone();
                updated.last_known_head = head;
                updated.last_checked = Some(Utc::now());
                self.0.orchestrator.store().upsert_parent_branch_tracking(&updated).await?;
            }
            return Ok(());
        }

        let mut updated = row.clone();
        updated.is_merged = true;
        updated.last_known_head = head;
        updated.last_checked = Some(Utc::now());
        self.0.orchestrator.store().upsert_parent_branch_tracking(&updated).await?;

        let Some(child) = self.0.orchestrator.store().find_stage(&row.child_stage_id).await? else {
            return Ok(());
        };

        if child.rebase_conflict {
            let payload = EventPayload::SkippedConflict(SkippedConflictPayload {
                stage_id: child.id.clone(),
                reason: "rebase_conflict".to_string(),
            });
            debug!(stage_id = %child.id, event = ?payload.event_type(), "skipped rebase, conflict flag set");
            return Ok(());
        }

        let path = PathBuf::from(&child.file_path);
        if self.0.orchestrator.locks().is_locked(&path) {
            let payload = EventPayload::SkippedLocked(SkippedLockedPayload {
                stage_id: child.id.clone(),
                actor: "mr-chain-manager".to_string(),
            });
            debug!(stage_id = %child.id, event = ?payload.event_type(), "skipped rebase, stage file locked");
            return Ok(());
        }

        self.try_spawn_sidecar(&child, "rebase").await?;
        Ok(())
    }

    /// Spawn a sidecar session (`review-cycle` or `rebase`) outside the main
    /// loop's own scheduling, under the same lock/worktree/runner, using the
    /// same worker-exit bookkeeping shape as the main loop's `try_spawn`.
    async fn try_spawn_sidecar(&self, stage: &Stage, skill: &str) -> Result<()> {
        let path = PathBuf::from(&stage.file_path);
        let orchestrator = self.0.orchestrator.clone();

        let Some(lock_guard) = orchestrator.locks().try_acquire(&path) else {
            let payload = EventPayload::SkippedLocked(SkippedLockedPayload {
                stage_id: stage.id.clone(),
                actor: skill.to_string(),
            });
            debug!(stage_id = %stage.id, skill, event = ?payload.event_type(), "skipped sidecar spawn, stage locked");
            return Ok(());
        };

        let worktree = match orchestrator.worktrees().acquire(&stage.worktree_branch, &orchestrator.config().base_branch) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(stage_id = %stage.id, skill, error = %e, "worktree pool exhausted for sidecar spawn");
                return Ok(());
            }
        };
        let alloc_payload = EventPayload::WorktreeAllocated(WorktreeAllocatedPayload {
            stage_id: stage.id.clone(),
            worktree_index: worktree.index,
            path: worktree.path.to_string_lossy().to_string(),
        });
        debug!(stage_id = %stage.id, event = ?alloc_payload.event_type(), "allocated worktree for sidecar");

        orchestrator.store().update_session_active(&stage.id, true).await?;
        self.0.active.lock().await.insert(stage.id.clone());

        let request = SessionRequest {
            stage_id: stage.id.clone(),
            stage_file_path: path.clone(),
            skill_name: skill.to_string(),
            worktree_path: worktree.path.clone(),
            worktree_index: worktree.index as usize,
            model: orchestrator.config().model.clone(),
            workflow_env: orchestrator.session_env(),
        };

        let spawned_payload = EventPayload::SessionSpawned(SessionSpawnedPayload {
            stage_id: stage.id.clone(),
            skill: skill.to_string(),
            worktree_index: worktree.index,
        });
        info!(stage_id = %stage.id, skill, event = ?spawned_payload.event_type(), "spawning sidecar session");

        let this = self.clone();
        let status_before = stage.status.clone();
        let stage_id = stage.id.clone();
        let stage_file_path = path.clone();
        tokio::spawn(async move {
            let outcome = orchestrator
                .runner()
                .spawn(&request, |line| debug!(stage_id = %stage_id, "{line}"))
                .await;
            this.finish_sidecar(stage_id, stage_file_path, worktree, lock_guard, status_before, outcome).await;
        });

        Ok(())
    }

    async fn finish_sidecar(
        &self,
        stage_id: Id,
        stage_file_path: PathBuf,
        worktree: crate::worktree::WorktreeHandle,
        _lock_guard: LockGuard,
        status_before: StageStatus,
        outcome: std::result::Result<SessionOutcome, crate::runner::SessionError>,
    ) {
        let orchestrator = &self.0.orchestrator;

        match outcome {
            Ok(session_outcome) => {
                // The sidecar skill rewrites the stage file's frontmatter on disk;
                // nothing re-syncs the store between spawn and here, so the store
                // row would still show the pre-session status. Read from disk,
                // matching `scheduler::finish_worker`.
                let status_after = crate::lock::read_status(&stage_file_path)
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
                info!(stage_id = %stage_id, exit_code = session_outcome.exit_code, event = ?finished_payload.event_type(), "sidecar session finished");

                if status_after != status_before {
                    let worker_info = WorkerInfo { stage_id: stage_id.clone() };
                    match exit_gate::run(orchestrator.store(), &orchestrator.config().repo_path, &worker_info, status_after).await
                    {
                        Ok(result) => {
                            let gate_payload = EventPayload::ExitGate(ExitGatePayload {
                                stage_id: stage_id.clone(),
                                status_changed: result.status_changed,
                                ticket_completed: result.ticket_completed,
                                epic_completed: result.epic_completed,
                            });
                            info!(stage_id = %stage_id, event = ?gate_payload.event_type(), "exit gate ran after sidecar session");
                        }
                        Err(e) => warn!(stage_id = %stage_id, error = %e, "exit gate failed after sidecar session"),
                    }
                }
            }
            Err(e) => warn!(stage_id = %stage_id, error = %e, "sidecar session error"),
        }

        if let Err(e) = orchestrator.worktrees().release(&worktree) {
            warn!(stage_id = %stage_id, error = %e, "failed to release sidecar worktree");
        } else {
            let released_payload = EventPayload::WorktreeReleased(WorktreeReleasedPayload {
                stage_id: stage_id.clone(),
                worktree_index: worktree.index,
            });
            debug!(stage_id = %stage_id, event = ?released_payload.event_type(), "released sidecar worktree");
        }

        if let Err(e) = orchestrator.store().update_session_active(&stage_id, false).await {
            warn!(stage_id = %stage_id, error = %e, "failed to clear session_active for sidecar");
        }

        self.0.active.lock().await.remove(&stage_id);
        self.0.worker_exited.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codehost::NullCodeHost;
    use crate::resolver::ResolverRegistry;
    use crate::runner::{Runner, RunnerConfig};
    use crate::scheduler::OrchestratorConfig;
    use crate::storage::Store;
    use crate::sync::SyncEngine;
    use crate::worktree::{WorktreeHandle, WorktreePool};
    use std::collections::HashMap;
    use std::process::Command;
    use tempfile::TempDir;
    use workflow_core::config::MockMode;
    use workflow_core::pipeline::PipelineModel;

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
    - name: PR Created
      resolver: pr-status
      status: "PR Created"
      transitions_to: [Done, "Addressing Comments"]
"#;
        let cfg = workflow_core::pipeline::PipelineConfig::from_yaml(yaml).unwrap();
        PipelineModel::from_config(&cfg).unwrap()
    }

    async fn build_cron_runner(dir: &std::path::Path) -> CronRunner {
        let store = Arc::new(Store::in_memory().await.unwrap());
        store.migrate_embedded().await.unwrap();
        let worktrees = Arc::new(WorktreePool::new(dir.to_path_buf(), 2));
        let runner = Arc::new(Runner::new(RunnerConfig {
            binary: "true".to_string(),
            timeout_sec: 5,
            log_dir: dir.join(".kanban-logs"),
        }));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                repo_path: dir.to_path_buf(),
                max_parallel: 2,
                idle_seconds: 0,
                model: "sonnet".to_string(),
                base_branch: "main".to_string(),
                drain_timeout_ms: 200,
                graceful_kill_timeout_ms: 100,
                once: true,
                workflow_env: HashMap::new(),
                mock_mode: MockMode::None,
                mock_services: Vec::new(),
            },
            store,
            sample_pipeline(),
            worktrees,
            runner,
            Arc::new(NullCodeHost),
            ResolverRegistry::with_defaults(),
        );
        CronRunner::new(orchestrator, None, None)
    }

    /// Regression test: the sidecar skill (`review-cycle`/`rebase`) rewrites
    /// the stage file's frontmatter on disk, not the store, and nothing
    /// re-syncs between spawn and `finish_sidecar`. If `finish_sidecar` read
    /// `status_after` from the store (the pre-session row) it would never
    /// see the transition and the exit gate would never fire.
    #[tokio::test]
    async fn finish_sidecar_reads_status_from_disk_and_fires_exit_gate() {
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
            "---\nid: STAGE-A\nticket: TICKET-1\nepic: EPIC-1\ntitle: A\nstatus: \"PR Created\"\nworktree_branch: run/stage-a\n---\nbody\n",
        );

        let cron = build_cron_runner(dir.path()).await;
        let orchestrator = cron.0.orchestrator.clone();
        orchestrator.store().upsert_by_path(&dir.path().to_string_lossy(), "repo").await.unwrap();
        SyncEngine::new(orchestrator.store()).sync_repo(dir.path()).await.unwrap();

        let stage_file_path = dir.path().join("epics/e1/TICKET-1/STAGE-A.md");
        // Simulate the sidecar skill's own write: the stage file changes on
        // disk, the store row is untouched until the exit gate re-syncs.
        crate::lock::write_status(&stage_file_path, "Done").unwrap();

        let worktree = WorktreeHandle {
            index: 0,
            path: dir.path().join(".kanban-worktrees/0"),
            branch: "run/stage-a".to_string(),
        };
        let lock_guard = orchestrator.locks().try_acquire(&stage_file_path).unwrap();

        cron.finish_sidecar(
            Id::from_raw("STAGE-A"),
            stage_file_path,
            worktree,
            lock_guard,
            StageStatus::new("PR Created"),
            Ok(SessionOutcome { exit_code: 0, duration_ms: 10 }),
        )
        .await;

        let stage = orchestrator.store().find_stage(&Id::from_raw("STAGE-A")).await.unwrap().unwrap();
        assert_eq!(stage.status.as_str(), "Done");
    }
}
