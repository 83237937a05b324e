//! convhost runner
//!
//! Migrates one VM per invocation: validates the request, sets up the work
//! area and logging, resolves the platform providers and drives the
//! migration controller to a terminal state. Exits non-zero on failure; the
//! state file under the work directory records the outcome either way.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use convhost_common::{MigrationRequest, RunnerConfig};
use convhost_migrate::{MigrationController, RunContext};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "convhost-runner",
    about = "Migrate a virtual machine through this conversion host"
)]
#[command(version)]
struct Args {
    /// Migration request (JSON)
    request: PathBuf,

    /// Configuration file path; defaults apply when it does not exist
    #[arg(short, long, default_value = "/etc/convhost/runner.toml")]
    config: PathBuf,

    /// Log level (trace / debug / info / warn / error); RUST_LOG wins
    #[arg(long, env = "CONVHOST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Root of per-VM work directories
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Root of per-VM log directories
    #[arg(long)]
    log_root: Option<PathBuf>,

    /// Seconds between sync rounds until cutover
    #[arg(long)]
    sync_interval: Option<u64>,
}

fn load_config(args: &Args) -> Result<RunnerConfig> {
    let mut config = if args.config.exists() {
        RunnerConfig::load(&args.config)
            .with_context(|| format!("load config {}", args.config.display()))?
    } else {
        RunnerConfig::default()
    };

    // CLI takes precedence
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(root) = &args.work_root {
        config.paths.work_root = root.clone();
    }
    if let Some(root) = &args.log_root {
        config.paths.log_root = root.clone();
    }
    if let Some(secs) = args.sync_interval {
        config.sync.interval_secs = secs;
    }
    Ok(config)
}

fn init_logging(level: &str, log_file: &Path) -> Result<()> {
    if let Some(dir) = log_file.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let request = MigrationRequest::load(&args.request)
        .with_context(|| format!("read request {}", args.request.display()))?;
    let config = load_config(&args)?;

    let ctx = RunContext::new(&config.paths, &request.vm_name, chrono::Utc::now())
        .establish()
        .context("create work directory")?;
    init_logging(&config.logging.level, &ctx.log_file())?;

    info!(
        "convhost runner {} starting for VM {} ({})",
        env!("CARGO_PKG_VERSION"),
        request.vm_name,
        request.vm_uuid
    );
    info!("Work directory: {}", ctx.work_dir().display());

    let mut controller = MigrationController::resolve_and_prepare(
        request,
        config,
        ctx,
        convhost_provider::resolve,
    )
    .context("prepare migration")?;

    let vm_id = controller.run().await.context("migration failed")?;
    info!("Destination VM id: {vm_id}");
    Ok(())
}
