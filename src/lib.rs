pub mod cache;
pub mod config;
pub mod handlers;
pub mod jobs;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod resources;
pub mod server;

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn};

use config::EngineConfig;
use server::{Dispatcher, Outbound};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "ai-engine",
    version,
    about = "Local job engine for AI workloads over line-delimited JSON-RPC"
)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level when neither AI_ENGINE_LOG nor RUST_LOG is set
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Model storage directory
    #[arg(long, global = true)]
    pub model_dir: Option<PathBuf>,

    /// Worker pool size
    #[arg(long, global = true)]
    pub max_workers: Option<usize>,

    /// Resource budget in bytes
    #[arg(long, global = true)]
    pub max_budget_bytes: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve requests on stdin/stdout (default)
    Serve,
    /// Print the resolved resource catalog as JSON
    Catalog,
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl Cli {
    /// Resolve configuration: file and environment, then flags on top.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::load(self.config.as_deref())?;
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.model_dir {
            config.model_dir = dir.clone();
        }
        if let Some(n) = self.max_workers {
            config.max_workers = n;
        }
        if let Some(bytes) = self.max_budget_bytes {
            config.max_budget_bytes = bytes;
        }
        config.validate()?;
        Ok(config)
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "ai-engine", &mut io::stdout());
            Ok(())
        }
        Some(Commands::Catalog) => {
            let config = cli.engine_config()?;
            let catalog: Vec<_> = config
                .catalog()
                .into_iter()
                .map(|d| {
                    serde_json::json!({
                        "id": d.id,
                        "name": d.name,
                        "type": d.category,
                        "size": d.size_bytes,
                        "cost": d.cost_bytes,
                        "defaultOptions": d.default_options,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
            Ok(())
        }
        Some(Commands::Serve) | None => {
            let config = cli.engine_config()?;
            serve(config).await
        }
    }
}

async fn serve(config: EngineConfig) -> Result<()> {
    let _logging = logging::init(&config.log_level, config.log_dir.as_deref())?;

    let (tx, rx) = crossbeam_channel::unbounded::<Outbound>();
    let writer = server::spawn_writer(rx, io::stdout()).context("starting output writer")?;
    let dispatcher = Arc::new(Dispatcher::from_config(&config, tx.clone())?);

    info!(
        workers = config.max_workers,
        budget = config.max_budget_bytes,
        cache_dir = %config.cache_dir.display(),
        model_dir = %config.model_dir.display(),
        "Engine started"
    );

    let reaper = config.idle_unload().map(|idle| {
        let resources = dispatcher.resources().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle.min(Duration::from_secs(60)));
            loop {
                ticker.tick().await;
                let resources = resources.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || resources.unload_idle(idle)).await {
                    warn!(error = %e, "Idle unload task failed");
                }
            }
        })
    });

    // The stdin loop runs on a plain thread: a blocking read cannot be
    // cancelled, and a blocking-pool task would hold up runtime shutdown.
    let (done_tx, done_rx) = oneshot::channel();
    {
        let dispatcher = dispatcher.clone();
        thread::Builder::new()
            .name("ai-engine-reader".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                let result = dispatcher.serve(BufReader::new(stdin.lock()));
                let _ = done_tx.send(result);
            })
            .context("starting input reader")?;
    }

    tokio::select! {
        result = done_rx => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Input stream failed"),
            Err(_) => warn!("Input reader stopped unexpectedly"),
        },
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    let shutdown = dispatcher.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown())
        .await
        .context("shutdown task failed")?;

    let _ = tx.send(Outbound::Close);
    if writer.join().is_err() {
        warn!("Output writer panicked");
    }
    Ok(())
}
