use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gyre::Engine;
use gyre::cli::{Cli, Command};
use gyre::config::GyreConfig;
use gyre::llm::{CompletionRequest, CompletionResponse, LlmError, LlmGateway, StreamEvent};
use gyre::paths::ProjectPaths;

/// Gateway stub for store-only commands; the daemon uses the real one.
struct OfflineGateway;

#[async_trait]
impl LlmGateway for OfflineGateway {
    async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, LlmError> {
        Err(LlmError::Api {
            status: 503,
            message: "no gateway in offline mode; run `gyre daemon`".to_string(),
        })
    }

    async fn stream(
        &self,
        _request: CompletionRequest,
        _sink: mpsc::Sender<StreamEvent>,
    ) -> std::result::Result<CompletionResponse, LlmError> {
        Err(LlmError::Api {
            status: 503,
            message: "no gateway in offline mode; run `gyre daemon`".to_string(),
        })
    }
}

fn init_logging(config: &GyreConfig, paths: &ProjectPaths) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.as_deref().unwrap_or("info")))
        .context("invalid log filter")?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file())
        .context("cannot open log file")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log_file)
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GyreConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let repo_root = std::env::current_dir().context("resolving repository root")?;
    let paths = ProjectPaths::for_repo(&repo_root).context("resolving project paths")?;
    paths.ensure().context("creating project directories")?;
    init_logging(&config, &paths)?;

    match &cli.command {
        Command::Daemon => {
            let engine = Engine::new(&config, &repo_root).context("assembling engine")?;
            info!(project = %paths.root.display(), "daemon starting");

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });

            engine.manager.run(shutdown_rx).await.context("engine run")?;
            info!("daemon stopped");
            Ok(())
        }
        command => {
            let gateway: Arc<dyn LlmGateway> = Arc::new(OfflineGateway);
            let engine =
                Engine::with_gateway(&config, &repo_root, paths, gateway).context("assembling engine")?;
            let request = command.to_request().expect("non-daemon command maps to a request");
            let response = engine.manager.handle(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
    }
}
