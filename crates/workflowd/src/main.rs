//! workflowd — the autonomous work-item orchestrator daemon.
//!
//! Loads `.kanban-orchestrator/config`, wires up the store/pipeline/worktree
//! pool/session runner, and runs the orchestrator loop plus cron subsystem
//! until interrupted.

use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};
use workflow_core::config::DaemonConfig;
use workflowd::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "workflowd", about = "Autonomous work-item orchestrator daemon")]
struct Args {
    /// Path to the repo this daemon manages.
    #[arg(long, default_value = ".")]
    repo_path: PathBuf,

    /// Path to a `key=value` config file; defaults to `<repo>/.kanban-orchestrator/config`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Process exactly the currently-ready work and exit instead of looping.
    #[arg(long)]
    once: bool,

    #[arg(long)]
    verbose: bool,
}

fn load_config(args: &Args) -> eyre::Result<DaemonConfig> {
    let mut config = DaemonConfig::default();
    config.repo_path = args.repo_path.clone();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.repo_path.join(".kanban-orchestrator/config"));
    if config_path.exists() {
        config.load_file(&config_path)?;
    }

    config.apply_env(std::env::vars());
    config.once = config.once || args.once;
    config.verbose = config.verbose || args.verbose;
    Ok(config)
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" })),
        )
        .init();

    let config = load_config(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let daemon = match Daemon::new(config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(2);
            }
        };

        let run_daemon = daemon.clone();
        let handle = tokio::spawn(async move { run_daemon.run().await });

        tokio::select! {
            result = handle => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("daemon error: {e}");
                        std::process::exit(1);
                    }
                    Err(e) => error!("daemon task panicked: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, draining");
                daemon.shutdown();
                if let Err(e) = handle.await {
                    error!("daemon task panicked during shutdown: {e}");
                }
            }
        }
    });

    Ok(())
}
