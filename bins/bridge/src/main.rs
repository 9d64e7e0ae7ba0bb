//! bridge — the vehicle-side ctrl receiver, converter, and velocity sink.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bridge_control::{CommandSubscriber, Converter, ConverterConfig, LoggingVelocitySink, RosCmdVelSink, VelocitySink};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transport::mqtt::{MqttCtrlTransport, MqttConfig};
use transport::webrtc::{WebRtcConfig, WebRtcCtrlTransport};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportKind {
    Webrtc,
    Mqtt,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    transport: TransportFileConfig,
    mqtt: MqttFileConfig,
    converter: ConverterFileConfig,
    logging: LoggingFileConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    signaling_urls: Vec<String>,
    channel_id: String,
    ctrl_label: String,
    /// Manager state-channel label. Empty means the Bridge only runs the
    /// direct ctrl path and never subscribes to relayed state.
    state_label: String,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            signaling_urls: Vec::new(),
            channel_id: "sora".to_string(),
            ctrl_label: "#ctrl".to_string(),
            state_label: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MqttFileConfig {
    host: String,
    port: u16,
    ctrl_topic: String,
    state_topic: String,
    username: Option<String>,
    password: Option<String>,
    keepalive_sec: u64,
}

impl Default for MqttFileConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            ctrl_topic: "aframe/ctrl".to_string(),
            state_topic: String::new(),
            username: None,
            password: None,
            keepalive_sec: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConverterFileConfig {
    max_linear_speed: f64,
    max_angular_speed: f64,
    brake_threshold: f64,
    command_timeout_sec: f64,
}

impl Default for ConverterFileConfig {
    fn default() -> Self {
        Self {
            max_linear_speed: 0.3,
            max_angular_speed: -0.3,
            brake_threshold: 0.1,
            command_timeout_sec: 0.5,
        }
    }
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
#[command(name = "bridge", about = "Teleop vehicle-side Bridge daemon")]
struct Args {
    #[arg(long, default_value = "bridge.toml")]
    config: PathBuf,

    #[arg(long)]
    dotenv: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "webrtc")]
    transport: TransportKind,

    #[arg(long)]
    room: Option<String>,

    #[arg(long = "state-label")]
    state_label: Option<String>,

    #[arg(long = "mqtt-host")]
    mqtt_host: Option<String>,
    #[arg(long = "mqtt-port")]
    mqtt_port: Option<u16>,
    #[arg(long = "mqtt-ctrl-topic")]
    mqtt_ctrl_topic: Option<String>,
    #[arg(long = "mqtt-state-topic")]
    mqtt_state_topic: Option<String>,
    #[arg(long = "mqtt-username")]
    mqtt_username: Option<String>,
    #[arg(long = "mqtt-password")]
    mqtt_password: Option<String>,
    #[arg(long = "mqtt-keepalive")]
    mqtt_keepalive: Option<u64>,

    #[arg(long)]
    publish_cmd_vel: bool,
    #[arg(long, default_value = "/cmd_vel")]
    cmd_vel_topic: String,

    #[arg(long)]
    max_linear_speed: Option<f64>,
    #[arg(long)]
    max_angular_speed: Option<f64>,
    #[arg(long)]
    brake_threshold: Option<f64>,
    #[arg(long)]
    command_timeout: Option<f64>,

    #[arg(long, default_value = "info")]
    log_level: String,
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

fn init_logging(log_dir: &Path, level: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "bridge.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bridge={level},bridge_control={level},transport={level}")));

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

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
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

    let _log_guard = init_logging(&file_config.logging.log_dir, &args.log_level)?;

    let converter = Converter::new(ConverterConfig {
        max_linear_speed: args.max_linear_speed.unwrap_or(file_config.converter.max_linear_speed),
        max_angular_speed: args.max_angular_speed.unwrap_or(file_config.converter.max_angular_speed),
        brake_threshold: args.brake_threshold.unwrap_or(file_config.converter.brake_threshold),
    });
    let command_timeout_sec = args.command_timeout.unwrap_or(file_config.converter.command_timeout_sec);

    let sink: Arc<dyn VelocitySink> = if args.publish_cmd_vel {
        Arc::new(RosCmdVelSink::new(args.cmd_vel_topic.clone()))
    } else {
        Arc::new(LoggingVelocitySink::new())
    };
    sink.start();

    let estop_active = Arc::new(AtomicBool::new(false));
    let subscriber = Arc::new(CommandSubscriber::new(
        converter,
        sink.clone(),
        estop_active,
        command_timeout_sec,
    ));

    let watchdog_subscriber = subscriber.clone();
    let watchdog_task = tokio::spawn(watchdog_subscriber.run_watchdog());

    let subscriber_for_ctrl = subscriber.clone();
    let ctrl_callback: transport::CtrlCallback = Arc::new(move |payload| {
        subscriber_for_ctrl.process_ctrl_payload(&payload, now_ms());
    });
    let subscriber_for_state = subscriber.clone();
    let state_callback: transport::StateCallback = Arc::new(move |payload| {
        subscriber_for_state.process_state_payload(&payload, now_ms());
    });

    match args.transport {
        TransportKind::Webrtc => {
            let signaling_url = match file_config.transport.signaling_urls.first() {
                Some(url) => url.clone(),
                None => {
                    error!("fatal configuration error: no signaling URLs configured for webrtc transport");
                    std::process::exit(1);
                }
            };
            let channel_id = args.room.clone().unwrap_or(file_config.transport.channel_id);
            let state_label = args.state_label.clone().unwrap_or(file_config.transport.state_label);
            let mut webrtc = WebRtcCtrlTransport::new(WebRtcConfig {
                signaling_url,
                channel_id,
                ctrl_label: file_config.transport.ctrl_label,
                state_label,
                metadata: None,
                connect_timeout: Duration::from_secs(10),
            });
            webrtc.on_ctrl(ctrl_callback);
            webrtc.on_state(state_callback);
            if let Err(e) = webrtc.connect().await {
                error!(error = %e, "fatal: webrtc ctrl transport failed to connect");
                std::process::exit(1);
            }
            info!("bridge running (webrtc transport)");
            wait_for_shutdown().await;
            webrtc.close().await;
        }
        TransportKind::Mqtt => {
            let host = args.mqtt_host.clone().unwrap_or(file_config.mqtt.host);
            let port = args.mqtt_port.unwrap_or(file_config.mqtt.port);
            if host.is_empty() {
                error!("fatal configuration error: no broker host configured for mqtt transport");
                std::process::exit(1);
            }
            let mut mqtt = MqttCtrlTransport::new(MqttConfig {
                broker_host: host,
                broker_port: port,
                client_id: "bridge".to_string(),
                ctrl_topic: args.mqtt_ctrl_topic.clone().unwrap_or(file_config.mqtt.ctrl_topic),
                state_topic: args.mqtt_state_topic.clone().unwrap_or(file_config.mqtt.state_topic),
                username: args.mqtt_username.clone().or(file_config.mqtt.username),
                password: args.mqtt_password.clone().or(file_config.mqtt.password),
                keepalive: Duration::from_secs(args.mqtt_keepalive.unwrap_or(file_config.mqtt.keepalive_sec)),
                connect_timeout: Duration::from_secs(10),
                reconnect_min_delay: Duration::from_secs(1),
                reconnect_max_delay: Duration::from_secs(30),
            });
            mqtt.on_ctrl(ctrl_callback);
            mqtt.on_state(state_callback);
            if let Err(e) = mqtt.connect().await {
                error!(error = %e, "fatal: mqtt ctrl transport failed to connect");
                std::process::exit(1);
            }
            info!("bridge running (mqtt transport)");
            wait_for_shutdown().await;
            mqtt.close().await;
        }
    }

    subscriber.shutdown_watchdog();
    let _ = watchdog_task.await;
    sink.stop();
    Ok(())
}

async fn wait_for_shutdown() {
    let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}
