//! workflowd — the autonomous work-item orchestrator daemon.
//!
//! Library components for the daemon process: the embedded SQLite store, the
//! sync engine that reconciles it against the on-disk epic/ticket/stage tree,
//! the pipeline-driven orchestrator loop, and the cron subsystem that polls
//! PR state and manages parent-branch rebases alongside it.

pub mod codehost;
pub mod cron;
pub mod discovery;
pub mod exit_gate;
pub mod git;
pub mod lock;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod worktree;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use workflow_core::config::DaemonConfig;
use workflow_core::pipeline::{PipelineConfig, PipelineConfigError, PipelineModel};

use crate::codehost::CodeHost;
use crate::cron::CronRunner;
use crate::resolver::ResolverRegistry;
use crate::runner::{Runner, RunnerConfig};
use crate::scheduler::{Orchestrator, OrchestratorConfig, OrchestratorError};
use crate::storage::{Store, StoreError};
use crate::sync::{SyncEngine, SyncError};
use crate::worktree::WorktreePool;

const PIPELINE_FILE: &str = ".kanban-workflow.yaml";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to read pipeline config {0:?}: {1}")]
    PipelineRead(PathBuf, std::io::Error),
    #[error("invalid pipeline config: {0}")]
    Pipeline(#[from] PipelineConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("initial sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Bundles everything a running daemon process needs: the orchestrator loop
/// and the cron subsystem, sharing one store, lock registry, worktree pool,
/// runner and code host. Cheap to clone — both halves are `Arc`-backed.
#[derive(Clone)]
pub struct Daemon {
    orchestrator: Orchestrator,
    cron: CronRunner,
}

impl Daemon {
    /// Wires up the store, pipeline model, worktree pool, session runner and
    /// code host from `config`, runs one synchronous sync to bootstrap the
    /// store from whatever is on disk, and returns a daemon ready to `run()`.
    pub async fn new(mut config: DaemonConfig) -> Result<Self, DaemonError> {
        let workspace_root = config.repo_path.clone();
        config.resolve_paths(&workspace_root);

        let pipeline_path = config.repo_path.join(PIPELINE_FILE);
        let raw = std::fs::read_to_string(&pipeline_path)
            .map_err(|e| DaemonError::PipelineRead(pipeline_path.clone(), e))?;
        let pipeline_config = PipelineConfig::from_yaml(&raw)?;
        let pipeline = PipelineModel::from_config(&pipeline_config)?;

        let max_parallel = pipeline_config
            .workflow
            .defaults
            .get("WORKFLOW_MAX_PARALLEL")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.max_parallel)
            .max(1);

        let store = Arc::new(Store::new(&config.db_path).await?);
        store.migrate_embedded().await?;

        let repo_name = crate::git::repo_name(&config.repo_path);
        store
            .upsert_by_path(&config.repo_path.to_string_lossy(), &repo_name)
            .await?;
        SyncEngine::new(&store).sync_repo(&config.repo_path).await?;

        let worktrees = Arc::new(WorktreePool::new(config.repo_path.clone(), max_parallel as usize));
        let runner = Arc::new(Runner::new(RunnerConfig {
            binary: config.session_binary.clone(),
            timeout_sec: config.session_timeout_sec,
            log_dir: config.log_dir.clone(),
        }));
        let code_host: Arc<dyn CodeHost> = Arc::from(codehost::for_platform(&config.code_host_platform));
        let resolvers = ResolverRegistry::with_defaults();

        let orchestrator_config = OrchestratorConfig {
            repo_path: config.repo_path.clone(),
            max_parallel: max_parallel as usize,
            idle_seconds: config.idle_seconds as u64,
            model: config.model.clone(),
            base_branch: config.base_branch.clone(),
            drain_timeout_ms: config.drain_timeout_ms,
            graceful_kill_timeout_ms: config.graceful_kill_timeout_ms,
            once: config.once,
            workflow_env: config.workflow_env.clone().into_iter().collect(),
            mock_mode: config.mock_mode,
            mock_services: config.mock_services.clone(),
        };
        let orchestrator = Orchestrator::new(
            orchestrator_config,
            store,
            pipeline,
            worktrees,
            runner,
            code_host,
            resolvers,
        );

        let cron = CronRunner::new(
            orchestrator.clone(),
            pipeline_config.cron.mr_comment_poll,
            pipeline_config.cron.mr_chain_manager,
        );

        Ok(Self { orchestrator, cron })
    }

    /// Runs the orchestrator loop and the cron subsystem concurrently until
    /// `shutdown()` is called (or, in `once` mode, until the loop drains
    /// naturally). Cron halts before the orchestrator's own worker drain,
    /// matching the stop-order spec Section 4.E.6 requires.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let cron = self.cron.clone();
        let cron_task = tokio::spawn(async move { cron.run().await });

        let result = self.orchestrator.run().await;

        self.cron.stop();
        self.cron.wait_for_drain().await;
        self.orchestrator.shutdown().await;
        let _ = cron_task.await;

        result.map_err(DaemonError::from)
    }

    /// Signals both the orchestrator loop and the cron jobs to stop at their
    /// next suspension point. Does not itself wait for the drain — callers
    /// that spawned `run()` should await its completion afterwards.
    pub fn shutdown(&self) {
        self.orchestrator.stop();
        self.cron.stop();
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn cron(&self) -> &CronRunner {
        &self.cron
    }
}
