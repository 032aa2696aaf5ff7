use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use faaslet::config::WorkerConfig;
use faaslet::logger::{self, LogTarget};
use faaslet::secret::StaticSecrets;
use faaslet::supervisor::Supervisor;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "faaslet",
    about = "Supervisor for serverless plugin workers",
    version = "0.3.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fork the workers described in a manifest and babysit them
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON file holding an array of worker configurations. Every entry
    /// must carry an `env` map; resolving secrets into it is the job of
    /// whatever external store integration produced the manifest.
    #[arg(long, default_value = "workers.json")]
    manifest: PathBuf,

    /// Worker executable; defaults to `faaslet-worker` next to this binary
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to daily-rolling files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let _guard = logger::init(&args.log_level, LogTarget::Stdout, args.log_dir.as_deref())?;

    let raw = std::fs::read_to_string(&args.manifest)
        .with_context(|| format!("could not read manifest {}", args.manifest.display()))?;
    let configs: Vec<WorkerConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid manifest {}", args.manifest.display()))?;
    if configs.is_empty() {
        bail!("manifest {} lists no workers", args.manifest.display());
    }

    for config in &configs {
        if config.env.is_none() {
            bail!(
                "manifest entry `{}` has no env map; resolve secrets into the manifest first",
                config
                    .id
                    .as_deref()
                    .unwrap_or(config.url_prefix.as_str())
            );
        }
    }

    let script = match args.worker_bin {
        Some(path) => path,
        None => default_worker_bin()?,
    };

    // the CLI never recycles workers itself, so the secrets seam stays a
    // stub here; embedders with a real store pass it to Supervisor::new
    let supervisor = Supervisor::new(Arc::new(StaticSecrets::default()));
    for config in configs {
        match supervisor.create_worker(&script, config).await {
            Ok(handle) => info!(worker = %handle.id(), url = %handle.url(), "worker up"),
            Err(e) => error!(error = %e, "worker failed to start"),
        }
    }
    if supervisor.list_workers().is_empty() {
        bail!("no worker came up");
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    supervisor.terminate_all().await;
    Ok(())
}

fn default_worker_bin() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    Ok(exe.with_file_name("faaslet-worker"))
}
