//! Power Mode - coordinator process entry point
//!
//! Starts the session's single coordinator: loads configuration, selects a
//! store backend, bootstraps the objective from a session manifest, and runs
//! until the objective reaches a terminal state or the session hard cap
//! elapses.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use power_mode::{
    BackendMode, Boundaries, Coordinator, FileStore, GuardrailConfig, GuardrailEngine, LogFormat,
    Objective, PowerModeConfig, RemoteStore, SessionId, StoreBackend,
};
use serde::Deserialize;
use tracing::{error, info, warn};

/// Declares the goal a coordinator session exists to pursue. Read once at
/// startup; everything else is negotiated over the store at runtime.
#[derive(Debug, Deserialize)]
struct SessionManifest {
    description: String,
    success_criteria: Vec<String>,
    phases: Vec<String>,
    #[serde(default)]
    boundaries: Boundaries,
    #[serde(default)]
    guardrails: GuardrailConfig,
}

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the session manifest (objective, phases, success criteria).
    #[arg(long)]
    manifest: PathBuf,

    /// Path to a saved `PowerModeConfig`; falls back to `development()` if
    /// omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Project directory the file-mode store roots its `.popkit` state
    /// under; ignored when the remote backend is selected.
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PowerModeConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PowerModeConfig::development(),
    };

    init_tracing(&config)?;

    info!(
        backend_mode = ?config.backend_mode,
        max_runtime_minutes = config.max_runtime_minutes.into_inner(),
        "starting power-mode coordinator"
    );

    let manifest_bytes = std::fs::read(&args.manifest)
        .with_context(|| format!("reading session manifest {}", args.manifest.display()))?;
    let manifest: SessionManifest =
        serde_json::from_slice(&manifest_bytes).context("parsing session manifest")?;

    let store = build_store(&config, &args.project_dir).await?;

    let session_id = SessionId::generate();
    let objective = Objective::create(
        session_id,
        manifest.description,
        manifest.success_criteria,
        manifest.phases,
        manifest.boundaries,
    )
    .context("building objective from session manifest")?;

    let guardrails = GuardrailEngine::new(manifest.guardrails);
    let coordinator = Arc::new(Coordinator::new(
        session_id,
        config.clone(),
        store,
        objective,
        guardrails,
    ));

    let hard_cap = config.max_runtime_minutes.as_duration();
    match tokio::time::timeout(hard_cap, Arc::clone(&coordinator).run()).await {
        Ok(Ok(())) => {
            info!(%session_id, "coordinator finished");
        }
        Ok(Err(e)) => {
            error!(%session_id, error = %e, "coordinator exited with error");
            return Err(e.into());
        }
        Err(_) => {
            warn!(%session_id, "session hard cap elapsed, failing session");
            coordinator
                .fail_session("session hard cap exceeded")
                .await?;
        }
    }

    Ok(())
}

fn init_tracing(config: &PowerModeConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    let format = std::env::var("POWER_MODE_LOG_FORMAT")
        .ok()
        .map(|v| {
            if v.eq_ignore_ascii_case("json") {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            }
        })
        .unwrap_or(config.log_format);

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
    Ok(())
}

async fn build_store(
    config: &PowerModeConfig,
    project_dir: &std::path::Path,
) -> Result<Arc<dyn StoreBackend>> {
    match config.backend_mode {
        BackendMode::Remote => {
            let remote = RemoteStore::connect_from_env()
                .await
                .context("connecting to remote store")?;
            Ok(Arc::new(remote))
        }
        BackendMode::File => Ok(Arc::new(FileStore::new(
            project_dir,
            config.file_lock_timeout_seconds,
            config.max_messages_per_channel,
        ))),
        BackendMode::Auto => {
            if let Ok(remote) = RemoteStore::connect_from_env().await {
                if remote.ping(std::time::Duration::from_secs(2)).await.is_ok() {
                    info!("auto backend: remote store reachable, using it");
                    return Ok(Arc::new(remote));
                }
            }
            info!("auto backend: remote store unavailable, falling back to file");
            Ok(Arc::new(FileStore::new(
                project_dir,
                config.file_lock_timeout_seconds,
                config.max_messages_per_channel,
            )))
        }
    }
}
