//! Conductor (C9): assembles C1-C8 into a single running Manager session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use manager_control::{ControlState, EstopState, HeartbeatState, StatsTracker};
use payload::StatePayloadBuilder;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use transport::connection::{ConnectionConfig, ConnectionManager, WsSender};
use transport::dc_manager::DataChannelManager;
use vehicle::VehicleModel;

use crate::handler::{HandlerDeps, MessageHandler};
use crate::loops;

#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub signaling_url: String,
    pub channel_id: String,
    pub ctrl_label: String,
    pub state_label: String,
    pub metadata: Option<serde_json::Value>,
    /// Optional path to append NDJSON state records to (see C16).
    pub state_log_path: Option<PathBuf>,
}

/// Best-effort NDJSON state-log appender. Failures are logged and
/// otherwise swallowed; persistence is a convenience, not a guarantee.
pub struct StateLogSink {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl StateLogSink {
    pub async fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub async fn write(&self, state_json: &[u8], now_mono: f64) {
        use tokio::io::AsyncWriteExt;
        let record = serde_json::json!({
            "logged_at_mono": now_mono,
            "state": serde_json::from_slice::<serde_json::Value>(state_json).ok(),
        });
        let Ok(mut line) = serde_json::to_vec(&record) else {
            return;
        };
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if let Err(e) = guard.write_all(&line).await {
            warn!(error = %e, "failed to append state log line");
        }
    }
}

/// Owns every shared component for one Manager session and the task
/// handles driving its four fixed-rate loops plus the relay connection.
pub struct Conductor {
    config: ConductorConfig,
    epoch: Instant,
    vehicle: Arc<Mutex<VehicleModel>>,
    control_state: Arc<ControlState>,
    heartbeat_state: Arc<HeartbeatState>,
    estop_state: Arc<EstopState>,
    stats: Arc<StatsTracker>,
    dc_manager: Arc<DataChannelManager<WsSender>>,
    connection: Arc<ConnectionManager>,
    builder: Arc<Mutex<StatePayloadBuilder>>,
    state_log: Option<Arc<StateLogSink>>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Conductor {
    pub async fn new(config: ConductorConfig) -> anyhow::Result<Arc<Self>> {
        let vehicle = Arc::new(Mutex::new(VehicleModel::new()));
        let control_state = Arc::new(ControlState::new());
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let estop_state = Arc::new(EstopState::new());
        let stats = Arc::new(StatsTracker::new());
        let dc_manager = Arc::new(DataChannelManager::<WsSender>::new(&[
            config.ctrl_label.as_str(),
            config.state_label.as_str(),
        ]));

        let handler = MessageHandler::new(HandlerDeps {
            vehicle: vehicle.clone(),
            control_state: control_state.clone(),
            heartbeat_state: heartbeat_state.clone(),
            estop_state: estop_state.clone(),
            stats: stats.clone(),
        });
        let epoch = Instant::now();
        let handler = Arc::new(handler);
        let handler_for_callback = handler.clone();
        let message_callback: transport::CtrlCallback = Arc::new(move |payload| {
            let now_mono = manager_control::monotonic_seconds(epoch);
            let now_wall_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            handler_for_callback.handle(payload, now_mono, now_wall_ms);
        });

        let connection = Arc::new(ConnectionManager::new(
            ConnectionConfig {
                signaling_url: config.signaling_url.clone(),
                channel_id: config.channel_id.clone(),
                ctrl_label: config.ctrl_label.clone(),
                state_label: config.state_label.clone(),
                metadata: config.metadata.clone(),
            },
            dc_manager.clone(),
            message_callback,
        ));

        let state_log = match &config.state_log_path {
            Some(path) => match StateLogSink::open(path).await {
                Ok(sink) => Some(Arc::new(sink)),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "could not open state log, continuing without it");
                    None
                }
            },
            None => None,
        };

        Ok(Arc::new(Self {
            config,
            epoch,
            vehicle,
            control_state,
            heartbeat_state,
            estop_state,
            stats,
            dc_manager,
            connection,
            builder: Arc::new(Mutex::new(StatePayloadBuilder::new())),
            state_log,
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the connection's reconnect loop and the four fixed-rate loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = Vec::new();

        let connection = self.connection.clone();
        tasks.push(tokio::spawn(async move {
            connection.run().await;
        }));

        tasks.push(tokio::spawn(loops::physics_loop(
            self.epoch,
            self.vehicle.clone(),
            self.control_state.clone(),
            self.stop.clone(),
        )));

        tasks.push(tokio::spawn(loops::state_loop(
            self.epoch,
            self.vehicle.clone(),
            self.control_state.clone(),
            self.heartbeat_state.clone(),
            self.estop_state.clone(),
            self.stats.clone(),
            self.builder.clone(),
            self.connection.clone(),
            self.config.state_label.clone(),
            self.state_log.clone(),
            self.stop.clone(),
        )));

        tasks.push(tokio::spawn(loops::heartbeat_loop(
            self.vehicle.clone(),
            self.connection.clone(),
            self.config.state_label.clone(),
            self.stop.clone(),
        )));

        tasks.push(tokio::spawn(loops::stats_loop(
            self.stats.clone(),
            self.stop.clone(),
        )));

        *self.tasks.lock().unwrap() = tasks;
    }

    /// Signal every loop and the connection to stop, then wait for them
    /// to finish (bounded by each loop's own select-on-stop behaviour).
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.shutdown();
        self.stop.notify_waiters();

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "loop task panicked");
            }
        }
    }

    /// Immediately latch the estop and zero the vehicle. Used by signal
    /// handlers and the `estop` inbound frame alike.
    pub fn trigger_estop(&self) {
        self.vehicle.lock().unwrap().estop();
        self.estop_state.trigger();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Block until externally cancelled (ctrl-c or shutdown signal);
    /// callers await this after `start()`.
    pub async fn wait_forever(&self) {
        std::future::pending::<()>().await;
    }
}
