//! manager — the Manager daemon: relay session, physics, state publication.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use conductor::{Conductor, ConductorConfig};
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `manager.toml` structure; every field optional so a partial file layers
/// under environment and CLI overrides.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    transport: TransportFileConfig,
    identity: IdentityFileConfig,
    logging: LoggingFileConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    signaling_urls: Vec<String>,
    channel_id: String,
    ctrl_label: String,
    state_label: String,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            signaling_urls: Vec::new(),
            channel_id: "sora".to_string(),
            ctrl_label: "#ctrl".to_string(),
            state_label: "#state".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct IdentityFileConfig {
    room: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LoggingFileConfig {
    level: String,
    log_dir: PathBuf,
}

impl Default for LoggingFileConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
        } else {
            Ok(FileConfig::default())
        }
    }
}

#[derive(Parser)]
#[command(name = "manager", about = "Teleop Manager daemon")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long, default_value = "manager.toml")]
    config: PathBuf,

    /// Path to a .env file; searched if not given (see resolve_dotenv).
    #[arg(long)]
    dotenv: Option<PathBuf>,

    /// Room / channel id override.
    #[arg(long)]
    room: Option<String>,

    /// Opaque pre-shared password, threaded into connect metadata.
    #[arg(long)]
    password: Option<String>,

    /// Start with the estop latched.
    #[arg(long)]
    estop: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append NDJSON state records to this path.
    #[arg(long)]
    state_log: Option<PathBuf>,
}

fn resolve_dotenv(explicit: Option<&Path>, config_path: &Path) -> Option<PathBuf> {
    if let Some(p) = explicit {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }
    let cwd_env = std::env::current_dir().ok()?.join(".env");
    if cwd_env.exists() {
        return Some(cwd_env);
    }
    if let Some(parent) = config_path.parent() {
        let candidate = parent.join(".env");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(".env");
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn init_logging(log_dir: &Path, level: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "manager.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("manager={level},conductor={level},transport={level}")));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(dotenv_path) = resolve_dotenv(args.dotenv.as_deref(), &args.config) {
        if let Err(e) = dotenvy::from_path(&dotenv_path) {
            warn!(path = %dotenv_path.display(), error = %e, "failed to load .env file");
        } else {
            info!(path = %dotenv_path.display(), "loaded .env file");
        }
    }

    let file_config = match FileConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            std::process::exit(1);
        }
    };

    let log_level = args.log_level.clone();
    let _log_guard = init_logging(&file_config.logging.log_dir, &log_level)?;

    let signaling_urls = env_list("VITE_SORA_SIGNALING_URLS").unwrap_or(file_config.transport.signaling_urls);
    let signaling_url = match signaling_urls.first() {
        Some(url) => url.clone(),
        None => {
            error!("fatal configuration error: no signaling URLs configured");
            std::process::exit(1);
        }
    };

    let channel_id = std::env::var("VITE_SORA_CHANNEL_ID")
        .ok()
        .or(args.room.clone())
        .unwrap_or(file_config.transport.channel_id);

    let ctrl_label = normalise_label(
        std::env::var("VITE_CTRL_LABEL")
            .ok()
            .unwrap_or(file_config.transport.ctrl_label),
    );
    let state_label = normalise_label(
        std::env::var("SORA_STATE_LABEL")
            .or_else(|_| std::env::var("VITE_STATE_LABEL"))
            .ok()
            .unwrap_or(file_config.transport.state_label),
    );

    let password = args.password.clone().or(file_config.identity.password);
    let metadata = match build_metadata(password.as_deref()) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "fatal configuration error: invalid metadata");
            std::process::exit(1);
        }
    };

    info!(channel_id = %channel_id, ctrl_label = %ctrl_label, state_label = %state_label, "starting manager");

    let conductor = Conductor::new(ConductorConfig {
        signaling_url,
        channel_id,
        ctrl_label,
        state_label,
        metadata,
        state_log_path: args.state_log.clone(),
    })
    .await
    .context("failed to assemble conductor")?;

    if args.estop {
        warn!("starting with estop latched");
        conductor.trigger_estop();
    }

    conductor.start();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    conductor.stop().await;
    Ok(())
}

fn normalise_label(label: String) -> String {
    if label.starts_with('#') {
        label
    } else {
        format!("#{label}")
    }
}

fn build_metadata(password: Option<&str>) -> Result<Option<serde_json::Value>> {
    let mut base = match std::env::var("SORA_METADATA") {
        Ok(raw) => serde_json::from_str::<serde_json::Value>(&raw)
            .with_context(|| "SORA_METADATA is not valid JSON")?,
        Err(_) => serde_json::json!({}),
    };

    if !base.is_object() {
        bail!("SORA_METADATA must decode to a JSON object");
    }

    if let Some(password) = password {
        base.as_object_mut()
            .unwrap()
            .insert("password".to_string(), serde_json::Value::String(password.to_string()));
    }

    if base.as_object().unwrap().is_empty() {
        Ok(None)
    } else {
        Ok(Some(base))
    }
}
