//! workflowctl — thin CLI wrapper around the orchestrator's core library.
//!
//! Every subcommand but `run` is a direct, one-shot call into `workflow-core`/
//! `workflowd` against the same SQLite store the daemon uses; there is no
//! network control plane to talk to. `run` spawns the `workflowd` binary for
//! the long-lived loop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use clap::{Parser, Subcommand};
use serde_json::json;

use workflow_core::config::DaemonConfig;
use workflow_core::graph::find_cycles;
use workflow_core::pipeline::{PipelineConfig, PipelineModel};
use workflow_core::types::EntityKind;
use workflow_core::Id;
use workflowd::discovery;
use workflowd::storage::Store;
use workflowd::sync::SyncEngine;

const PIPELINE_FILE: &str = ".kanban-workflow.yaml";

/// Usage/config errors exit `2`; validation or run-time failures exit `1`.
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "workflowctl", about = "Control surface for the work-item orchestrator", version)]
struct Cli {
    /// Repo this command operates on.
    #[arg(long, global = true, default_value = ".")]
    repo_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a repo with the store (idempotent, matched by path).
    RegisterRepo {
        #[arg(long)]
        name: Option<String>,
    },
    /// Reconcile the store against the on-disk epic/ticket/stage tree.
    Sync,
    /// Print the kanban board: stages grouped by column.
    Board,
    /// Print the next ready-to-work stages, ranked by priority.
    Next {
        #[arg(long, default_value_t = 10)]
        slots: usize,
    },
    /// Print ready/blocked/in-progress/to-convert counts.
    Summary,
    /// Validate the repo's pipeline config and dependency graph.
    Validate,
    /// Print the dependency graph and any detected cycles.
    Graph,
    /// Run the long-lived orchestrator loop (spawns the `workflowd` binary).
    Run {
        #[arg(long)]
        once: bool,
    },
    /// Pull ticket/epic metadata from Jira (out of core scope; thin no-op).
    JiraImport,
    /// Enrich stage frontmatter from external sources (out of core scope; thin no-op).
    Enrich,
}

fn load_daemon_config(repo_path: &Path) -> eyre::Result<DaemonConfig> {
    let mut config = DaemonConfig::default();
    config.repo_path = repo_path.to_path_buf();
    let config_path = repo_path.join(".kanban-orchestrator/config");
    if config_path.exists() {
        config.load_file(&config_path)?;
    }
    config.apply_env(std::env::vars());
    config.resolve_paths(repo_path);
    Ok(config)
}

async fn open_store(config: &DaemonConfig) -> eyre::Result<Store> {
    let store = Store::new(&config.db_path).await?;
    store.migrate_embedded().await?;
    Ok(store)
}

fn print_json(value: serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let exit_code = runtime.block_on(dispatch(cli))?;
    std::process::exit(exit_code)
}

async fn dispatch(cli: Cli) -> eyre::Result<i32> {
    match cli.command {
        Command::RegisterRepo { name } => register_repo(&cli.repo_path, name).await,
        Command::Sync => sync(&cli.repo_path).await,
        Command::Board => board(&cli.repo_path).await,
        Command::Next { slots } => next(&cli.repo_path, slots).await,
        Command::Summary => summary(&cli.repo_path).await,
        Command::Validate => validate(&cli.repo_path).await,
        Command::Graph => graph(&cli.repo_path).await,
        Command::Run { once } => run(&cli.repo_path, once),
        Command::JiraImport => out_of_scope("jira-import"),
        Command::Enrich => out_of_scope("enrich"),
    }
}

fn out_of_scope(name: &str) -> eyre::Result<i32> {
    print_json(json!({
        "command": name,
        "status": "out_of_core_scope",
        "message": format!("`{name}` is a thin wrapper left to an external integration; the core orchestrator does not implement it."),
    }));
    Ok(0)
}

async fn register_repo(repo_path: &Path, name: Option<String>) -> eyre::Result<i32> {
    let config = load_daemon_config(repo_path)?;
    let store = open_store(&config).await?;
    let repo_name = name.unwrap_or_else(|| workflowd::git::repo_name(repo_path));
    let repo = store.upsert_by_path(&repo_path.to_string_lossy(), &repo_name).await?;
    print_json(json!({ "id": repo.id.as_str(), "path": repo.path, "name": repo.name }));
    Ok(0)
}

async fn sync(repo_path: &Path) -> eyre::Result<i32> {
    let config = load_daemon_config(repo_path)?;
    let store = open_store(&config).await?;
    store
        .upsert_by_path(&repo_path.to_string_lossy(), &workflowd::git::repo_name(repo_path))
        .await?;
    let report = SyncEngine::new(&store).sync_repo(repo_path).await?;
    let had_errors = !report.errors.is_empty();
    print_json(json!({
        "epics": report.epics,
        "tickets": report.tickets,
        "stages": report.stages,
        "errors": report.errors.iter().map(|e| json!({ "file": e.file, "message": e.message })).collect::<Vec<_>>(),
    }));
    Ok(if had_errors { EXIT_FAILURE } else { 0 })
}

async fn find_repo_id(store: &Store, repo_path: &Path) -> eyre::Result<Id> {
    store
        .find_repo_by_path(&repo_path.to_string_lossy())
        .await?
        .map(|r| r.id)
        .ok_or_else(|| eyre::eyre!("repo {repo_path:?} is not registered; run `sync` first"))
}

async fn board(repo_path: &Path) -> eyre::Result<i32> {
    let config = load_daemon_config(repo_path)?;
    let store = open_store(&config).await?;
    let repo_id = find_repo_id(&store, repo_path).await?;
    let stages = store.list_stages_by_repo(&repo_id).await?;

    let mut columns: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
    for stage in stages {
        columns.entry(stage.kanban_column.as_str().to_string()).or_default().push(json!({
            "id": stage.id.as_str(),
            "title": stage.title,
            "status": stage.status.as_str(),
        }));
    }
    print_json(json!({ "columns": columns }));
    Ok(0)
}

async fn next(repo_path: &Path, slots: usize) -> eyre::Result<i32> {
    let config = load_daemon_config(repo_path)?;
    let store = open_store(&config).await?;
    let repo_id = find_repo_id(&store, repo_path).await?;
    let result = discovery::discover(&store, &repo_id, slots).await?;
    print_json(json!({
        "ready": result.ready.iter().map(|r| json!({
            "id": r.stage.id.as_str(),
            "title": r.stage.title,
            "status": r.stage.status.as_str(),
            "score": r.score,
            "needs_human": r.needs_human,
        })).collect::<Vec<_>>(),
    }));
    Ok(0)
}

async fn summary(repo_path: &Path) -> eyre::Result<i32> {
    let config = load_daemon_config(repo_path)?;
    let store = open_store(&config).await?;
    let repo_id = find_repo_id(&store, repo_path).await?;
    let result = discovery::discover(&store, &repo_id, usize::MAX).await?;
    print_json(json!({
        "ready_count": result.ready.len(),
        "blocked_count": result.blocked_count,
        "in_progress_count": result.in_progress_count,
        "to_convert_count": result.to_convert_count,
    }));
    Ok(0)
}

async fn graph(repo_path: &Path) -> eyre::Result<i32> {
    let config = load_daemon_config(repo_path)?;
    let store = open_store(&config).await?;
    let repo_id = find_repo_id(&store, repo_path).await?;
    let deps = store.list_dependencies_by_repo(&repo_id).await?;

    let mut adjacency: std::collections::HashMap<Id, Vec<Id>> = std::collections::HashMap::new();
    let mut edges = Vec::new();
    for dep in &deps {
        adjacency.entry(dep.from_id.clone()).or_default().push(dep.to_id.clone());
        edges.push(json!({
            "from": dep.from_id.as_str(),
            "to": dep.to_id.as_str(),
            "resolved": dep.resolved,
            "cross_repo": dep.target_repo_name,
        }));
    }
    let cycles = find_cycles(&adjacency);
    print_json(json!({
        "edges": edges,
        "cycles": cycles.iter().map(|c| c.members.iter().map(Id::as_str).collect::<Vec<_>>()).collect::<Vec<_>>(),
    }));
    Ok(if cycles.is_empty() { 0 } else { EXIT_FAILURE })
}

async fn validate(repo_path: &Path) -> eyre::Result<i32> {
    let config = load_daemon_config(repo_path)?;
    let store = open_store(&config).await?;
    store
        .upsert_by_path(&repo_path.to_string_lossy(), &workflowd::git::repo_name(repo_path))
        .await?;

    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    let report = SyncEngine::new(&store).sync_repo(repo_path).await?;
    errors.extend(report.errors.iter().map(|e| format!("{}: {}", e.file.display(), e.message)));

    let pipeline_path = repo_path.join(PIPELINE_FILE);
    let pipeline_valid = match std::fs::read_to_string(&pipeline_path) {
        Ok(raw) => match PipelineConfig::from_yaml(&raw) {
            Ok(pipeline_config) => match PipelineModel::from_config(&pipeline_config) {
                Ok(_) => true,
                Err(e) => {
                    errors.push(format!("pipeline config invalid: {e}"));
                    false
                }
            },
            Err(e) => {
                errors.push(format!("pipeline config invalid: {e}"));
                false
            }
        },
        Err(e) => {
            warnings.push(format!("no pipeline config at {pipeline_path:?}: {e}"));
            false
        }
    };

    let repo_id = find_repo_id(&store, repo_path).await?;
    let deps = store.list_dependencies_by_repo(&repo_id).await?;
    let mut adjacency: std::collections::HashMap<Id, Vec<Id>> = std::collections::HashMap::new();
    for dep in &deps {
        if matches!(dep.from_type, EntityKind::Epic) && !matches!(dep.to_type, EntityKind::Epic) {
            errors.push(format!("{} (epic) depends on a {} — invalid dependency type", dep.from_id, dep.to_type));
        }
        adjacency.entry(dep.from_id.clone()).or_default().push(dep.to_id.clone());
    }
    for cycle in find_cycles(&adjacency) {
        errors.push(format!(
            "dependency cycle: {}",
            cycle.members.iter().map(Id::as_str).collect::<Vec<_>>().join(" -> ")
        ));
    }

    let valid = errors.is_empty();
    print_json(json!({
        "valid": valid,
        "errors": errors,
        "warnings": warnings,
        "pipeline_valid": pipeline_valid,
    }));
    Ok(if valid { 0 } else { EXIT_FAILURE })
}

fn run(repo_path: &Path, once: bool) -> eyre::Result<i32> {
    let mut cmd = ProcessCommand::new("workflowd");
    cmd.arg("--repo-path").arg(repo_path);
    if once {
        cmd.arg("--once");
    }
    let status = cmd.status().map_err(|e| eyre::eyre!("failed to spawn workflowd: {e}"))?;
    Ok(status.code().unwrap_or(EXIT_CONFIG_ERROR))
}
