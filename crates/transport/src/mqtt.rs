//! MQTT ctrl transport (C13, MQTT variant).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{is_ctrl_frame, is_state_frame, CtrlCallback, StateCallback, TransportError};

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub ctrl_topic: String,
    /// Topic carrying the Manager's relayed `state` payloads. Only
    /// subscribed when non-empty.
    pub state_topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "aframe-bridge".to_string(),
            ctrl_topic: "aframe/ctrl".to_string(),
            state_topic: String::new(),
            username: None,
            password: None,
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

pub struct MqttCtrlTransport {
    config: MqttConfig,
    ctrl_callback: Option<CtrlCallback>,
    state_callback: Option<StateCallback>,
    closed: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl MqttCtrlTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            ctrl_callback: None,
            state_callback: None,
            closed: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
            task: None,
        }
    }

    pub fn on_ctrl(&mut self, callback: CtrlCallback) {
        self.ctrl_callback = Some(callback);
    }

    /// Register a callback for relayed Manager `state` payloads arriving on
    /// `config.state_topic`. Only meaningful when that topic is non-empty.
    pub fn on_state(&mut self, callback: StateCallback) {
        self.state_callback = Some(callback);
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        info!(
            host = %self.config.broker_host,
            port = self.config.broker_port,
            topic = %self.config.ctrl_topic,
            "connecting to MQTT broker"
        );

        let mut options = MqttOptions::new(
            &self.config.client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        options.set_keep_alive(self.config.keepalive);
        if let (Some(u), Some(p)) = (&self.config.username, &self.config.password) {
            options.set_credentials(u, p);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        client
            .subscribe(&self.config.ctrl_topic, QoS::AtLeastOnce)
            .await
            .map_err(TransportError::Mqtt)?;
        if !self.config.state_topic.is_empty() {
            client
                .subscribe(&self.config.state_topic, QoS::AtLeastOnce)
                .await
                .map_err(TransportError::Mqtt)?;
        }

        let connected_once = Arc::new(tokio::sync::Notify::new());
        let connected_flag = self.connected.clone();
        let ctrl_callback = self.ctrl_callback.clone();
        let state_callback = self.state_callback.clone();
        let state_topic = self.config.state_topic.clone();
        let closed = self.closed.clone();
        let stop = self.stop.clone();
        let min_delay = self.config.reconnect_min_delay;
        let max_delay = self.config.reconnect_max_delay;
        let connected_once_inner = connected_once.clone();

        let task = tokio::spawn(async move {
            let mut backoff = min_delay;
            loop {
                tokio::select! {
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                connected_flag.store(true, Ordering::SeqCst);
                                connected_once_inner.notify_waiters();
                                backoff = min_delay;
                            }
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                if !state_topic.is_empty() && publish.topic == state_topic {
                                    handle_state_publish(&publish.payload, state_callback.as_ref());
                                } else {
                                    handle_publish(&publish.payload, ctrl_callback.as_ref());
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "MQTT connection error; backing off");
                                connected_flag.store(false, Ordering::SeqCst);
                                tokio::time::sleep(backoff).await;
                                backoff = (backoff * 2).min(max_delay);
                            }
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
            closed.store(true, Ordering::SeqCst);
        });

        self.task = Some(task);

        tokio::time::timeout(self.config.connect_timeout, connected_once.notified())
            .await
            .map_err(|_| TransportError::Timeout)?;

        Ok(())
    }

    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn handle_publish(payload: &[u8], callback: Option<&CtrlCallback>) {
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!("MQTT ctrl message not utf-8; dropping");
        return;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) else {
        warn!("MQTT ctrl invalid JSON; dropping: {text}");
        return;
    };
    if !is_ctrl_frame(&parsed) {
        debug!("ignoring non-ctrl MQTT payload");
        return;
    }
    if let Some(cb) = callback {
        cb(parsed);
    }
}

fn handle_state_publish(payload: &[u8], callback: Option<&StateCallback>) {
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!("MQTT state message not utf-8; dropping");
        return;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) else {
        warn!("MQTT state invalid JSON; dropping: {text}");
        return;
    };
    if !is_state_frame(&parsed) {
        debug!("ignoring non-state MQTT payload");
        return;
    }
    if let Some(cb) = callback {
        cb(parsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = MqttConfig::default();
        assert_eq!(cfg.broker_port, 1883);
        assert_eq!(cfg.ctrl_topic, "aframe/ctrl");
        assert_eq!(cfg.reconnect_min_delay, Duration::from_secs(1));
        assert_eq!(cfg.reconnect_max_delay, Duration::from_secs(30));
    }
}
