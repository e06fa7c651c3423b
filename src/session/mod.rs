//! # Telemetry/Control Session
//!
//! One session per consumer (a console, a monitor, a one-shot command). It
//! owns a single broker connection, turns inbound classification events into
//! counters and a log, drives the conveyor on/off toggle, and answers
//! address-discovery requests.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connected ──disconnect()──► Closed
//!       │
//!       └── connect() error: session consumed, nothing left running
//! ```
//!
//! Operations that need a live connection only exist on
//! `MqttSession<Connected>`. Every task a session starts (connection
//! driver, event router, toggle timers) runs under one cancellation token
//! and one task tracker; `disconnect()` cancels and awaits all of them, and
//! dropping a session cancels them as well.
//!
//! ## State Sharing
//!
//! The event router is the only writer of counters and log. Everything the
//! session knows is published as a [`SessionSnapshot`] through a watch
//! channel; consumers read it with [`MqttSession::subscribe`].

pub mod actuator;
pub mod camera;
pub mod discovery;
pub mod error;
pub mod telemetry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::mqtt::message_manager::{topic_matches, MQTTMessage};
use crate::mqtt::mqtt_handler::{
    BrokerEvent, Connection, ConnectionState, Connector, MQTTStatus, TransportError,
    TransportHandle,
};
use crate::persistence::{KeyValueStore, CAMERA_URL_KEY};

use actuator::{ActuatorState, ToggleMode, COMMAND_REFRESH};
use discovery::{DiscoveryDispatcher, DiscoverySettings, PendingRequest};
use error::SessionError;
use telemetry::{ClassificationEncoding, ColorCounters, LogEntry, Telemetry};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub receive_topic: String,
    pub send_topic: String,
    pub encoding: ClassificationEncoding,
    pub toggle_mode: ToggleMode,
    pub discovery: DiscoverySettings,
    pub connect_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            receive_topic: "dados/camera".to_string(),
            send_topic: "dados/app".to_string(),
            encoding: ClassificationEncoding::default(),
            toggle_mode: ToggleMode::default(),
            discovery: DiscoverySettings::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub status: MQTTStatus,
    pub actuator: ActuatorState,
    pub telemetry: Telemetry,
    pub camera_url: Option<String>,
    pub discovery_in_flight: usize,
}

impl SessionSnapshot {
    pub fn connected(&self) -> bool {
        self.status.connection_state == ConnectionState::Connected
    }

    /// Text for the on/off control: the next action, or the wait notice.
    pub fn actuator_label(&self) -> &'static str {
        self.actuator.label()
    }

    pub fn counters(&self) -> ColorCounters {
        self.telemetry.counters
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.telemetry.log
    }
}

/// State reachable from the session's background tasks.
struct SessionShared {
    settings: SessionSettings,
    state: watch::Sender<SessionSnapshot>,
    discovery: DiscoveryDispatcher,
    store: Option<Arc<KeyValueStore>>,
    toggle_seq: AtomicU64,
}

impl SessionShared {
    async fn route(&self, message: MQTTMessage) {
        let MQTTMessage { topic, content, .. } = message;
        self.state.send_modify(|s| {
            s.status.messages_received += 1;
            s.status.touch();
        });

        if topic_matches(&self.settings.discovery.response_topic, &topic) {
            self.discovery.dispatch(&content).await;
        }

        if let Some(ack_topic) = self.settings.toggle_mode.ack_topic() {
            if topic_matches(ack_topic, &topic) {
                self.apply_device_report(&content);
            }
        }

        if topic_matches(&self.settings.receive_topic, &topic) {
            let mut class = None;
            self.state.send_modify(|s| {
                class = s.telemetry.record(&content, self.settings.encoding);
            });
            match class {
                Some(class) => debug!("Classified {:?} as {}", content, class),
                None => debug!("Unclassified message {:?}", content),
            }

            if let Some(url) = camera::extract_camera_url(&content) {
                self.adopt_camera_url(url).await;
            }
        }
    }

    fn apply_device_report(&self, payload: &str) {
        let Some(reported) = ActuatorState::from_report(payload) else {
            debug!("Ignoring actuator report {:?}", payload);
            return;
        };
        self.state.send_if_modified(|s| {
            if s.actuator == reported {
                return false;
            }
            info!("Device reports actuator {:?}", reported);
            s.actuator = reported;
            true
        });
    }

    async fn adopt_camera_url(&self, url: String) {
        let changed = self.state.send_if_modified(|s| {
            if s.camera_url.as_deref() == Some(url.as_str()) {
                return false;
            }
            s.camera_url = Some(url.clone());
            true
        });
        if !changed {
            return;
        }

        info!("Camera URL configured: {}", url);
        if let Some(store) = &self.store {
            if let Err(e) = store.set(CAMERA_URL_KEY, url).await {
                warn!("Failed to persist camera URL: {}", e);
            }
        }
    }

    async fn connection_lost(&self, reason: String) {
        error!("Session lost its broker connection: {}", reason);
        self.state.send_modify(|s| {
            s.status.connection_state = ConnectionState::Failed;
            s.status.record_error(reason);
        });
        self.discovery.abandon_all().await;
        self.sync_discovery().await;
    }

    async fn sync_discovery(&self) {
        let in_flight = self.discovery.in_flight().await;
        self.state.send_modify(|s| s.discovery_in_flight = in_flight);
    }

    fn record_error(&self, message: String) {
        self.state.send_modify(|s| s.status.record_error(message));
    }
}

async fn route_events(
    shared: Arc<SessionShared>,
    mut events: mpsc::Receiver<BrokerEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(BrokerEvent::Message(message)) => shared.route(message).await,
                Some(BrokerEvent::Connected) => debug!("Ignoring repeated broker handshake"),
                Some(BrokerEvent::SubscriptionRefused(reason)) => {
                    warn!("Subscription refused: {}", reason);
                    shared.record_error(reason);
                }
                Some(BrokerEvent::ConnectionLost(reason))
                | Some(BrokerEvent::ConnectFailed(reason)) => {
                    shared.connection_lost(reason).await;
                    break;
                }
                None => {
                    shared.connection_lost("connection driver stopped".to_string()).await;
                    break;
                }
            },
        }
    }
    debug!("Session event router stopped");
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionLifecycle {
    Disconnected,
    Connected,
    Closed,
}

#[machine]
pub struct MqttSession<S: SessionLifecycle> {
    shared: Arc<SessionShared>,
    connector: Arc<dyn Connector>,
    transport: Option<TransportHandle>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    teardown: DropGuard,
}

impl<S: SessionLifecycle> MqttSession<S> {
    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.borrow().clone()
    }

    /// Sets the camera URL by hand, e.g. `10.0.0.7:5000`. Returns the
    /// normalized URL, or `None` for blank input.
    pub async fn configure_camera(&self, input: &str) -> Option<String> {
        let url = camera::format_input_url(input);
        if url.is_empty() {
            return None;
        }
        self.shared.adopt_camera_url(url.clone()).await;
        Some(url)
    }

    /// Drops the known camera URL, in memory and in the store, so the next
    /// start runs auto-discovery again.
    pub async fn forget_camera(&self) {
        self.shared.state.send_modify(|s| s.camera_url = None);
        if let Some(store) = &self.shared.store {
            if let Err(e) = store.remove(CAMERA_URL_KEY).await {
                warn!("Failed to remove persisted camera URL: {}", e);
                self.shared.record_error(e.to_string());
            }
        }
        info!("Camera URL cleared");
    }

    async fn stop_tasks(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl MqttSession<Disconnected> {
    /// Counters and log always start empty; the camera URL is restored from
    /// the store when one is given.
    pub async fn create(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        store: Option<Arc<KeyValueStore>>,
    ) -> Self {
        let mut snapshot = SessionSnapshot::default();
        if let Some(store) = &store {
            snapshot.camera_url = store.get(CAMERA_URL_KEY).await;
        }
        let (state, _) = watch::channel(snapshot);

        let shared = Arc::new(SessionShared {
            discovery: DiscoveryDispatcher::new(settings.discovery.clone()),
            settings,
            state,
            store,
            toggle_seq: AtomicU64::new(0),
        });

        let cancel = CancellationToken::new();
        let teardown = cancel.clone().drop_guard();

        Self::new(shared, connector, None, cancel, TaskTracker::new(), teardown)
    }

    /// Connects and subscribes. A failure is reported once and not retried.
    pub async fn connect(mut self) -> Result<MqttSession<Connected>, SessionError> {
        info!(
            "Connecting session (receive: {}, send: {})",
            self.shared.settings.receive_topic, self.shared.settings.send_topic
        );
        self.shared
            .state
            .send_modify(|s| s.status.connection_state = ConnectionState::Connecting);

        let Connection {
            handle,
            mut events,
            task,
        } = self.connector.open(self.cancel.child_token());
        self.tasks.spawn(async move {
            if let Err(e) = task.await {
                error!("MQTT driver task failed: {}", e);
            }
        });

        let timeout = self.shared.settings.connect_timeout;
        let handshake = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Some(BrokerEvent::Connected) => return Ok(()),
                    Some(BrokerEvent::ConnectFailed(reason))
                    | Some(BrokerEvent::ConnectionLost(reason)) => {
                        return Err(SessionError::ConnectionFailed(reason))
                    }
                    Some(BrokerEvent::Message(message)) => {
                        debug!("Dropping message before handshake: {}", message)
                    }
                    Some(BrokerEvent::SubscriptionRefused(reason)) => {
                        debug!("Ignoring SUBACK before handshake: {}", reason)
                    }
                    None => {
                        return Err(SessionError::ConnectionFailed(
                            "connection driver stopped".to_string(),
                        ))
                    }
                }
            }
        })
        .await
        .unwrap_or(Err(SessionError::ConnectTimeout(timeout)));

        let subscribed = match handshake {
            Ok(()) => self.subscribe_topics(&handle).await,
            Err(e) => Err(e),
        };

        if let Err(e) = subscribed {
            error!("Session connection failed: {}", e);
            self.shared.state.send_modify(|s| {
                s.status.connection_state = ConnectionState::Failed;
                s.status.record_error(e.to_string());
            });
            self.stop_tasks().await;
            return Err(e);
        }

        self.shared.state.send_modify(|s| {
            s.status.connection_state = ConnectionState::Connected;
            s.status.touch();
        });
        self.tasks.spawn(route_events(
            self.shared.clone(),
            events,
            self.cancel.clone(),
        ));
        self.transport = Some(handle);

        info!("Session connected");
        Ok(self.transition())
    }

    async fn subscribe_topics(&self, handle: &TransportHandle) -> Result<(), SessionError> {
        handle
            .subscribe(self.shared.settings.receive_topic.clone())
            .await?;
        if let Some(ack_topic) = self.shared.settings.toggle_mode.ack_topic() {
            handle.subscribe(ack_topic.to_string()).await?;
        }
        Ok(())
    }
}

impl MqttSession<Connected> {
    fn transport(&self) -> Result<&TransportHandle, SessionError> {
        self.transport
            .as_ref()
            .ok_or(SessionError::Transport(TransportError::Closed))
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), SessionError> {
        match self.transport()?.publish(topic, payload).await {
            Ok(()) => {
                self.shared.state.send_modify(|s| {
                    s.status.messages_sent += 1;
                    s.status.touch();
                });
                Ok(())
            }
            Err(e) => {
                error!("Publish to {} failed: {}", topic, e);
                self.shared.record_error(format!("publish to {} failed: {}", topic, e));
                Err(e.into())
            }
        }
    }

    /// Sends the on/off command and enters the matching pending state.
    /// Rejected while a previous toggle is pending; a failed publish restores
    /// the previous state.
    pub async fn toggle_actuator(&self) -> Result<ActuatorState, SessionError> {
        let mut claimed = None;
        self.shared.state.send_if_modified(|s| match s.actuator.begin_toggle() {
            Some((pending, command)) => {
                s.actuator = pending;
                claimed = Some((pending, command));
                true
            }
            None => false,
        });
        let (pending, command) = claimed.ok_or(SessionError::TogglePending)?;
        let seq = self.shared.toggle_seq.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Actuator toggle: sending {:?}, now {:?}", command, pending);

        if let Err(e) = self.publish(&self.shared.settings.send_topic, command).await {
            self.shared.state.send_modify(|s| {
                if s.actuator == pending {
                    s.actuator = pending.revert();
                }
            });
            return Err(e);
        }

        let toggle_mode = &self.shared.settings.toggle_mode;
        let delay = toggle_mode.settle_after();
        let settle: fn(ActuatorState) -> ActuatorState = match toggle_mode {
            ToggleMode::Debounce(_) => ActuatorState::confirm,
            ToggleMode::Acknowledged { .. } => ActuatorState::revert,
        };

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if shared.toggle_seq.load(Ordering::SeqCst) != seq {
                        return;
                    }
                    shared.state.send_if_modified(|s| {
                        if s.actuator != pending {
                            return false;
                        }
                        s.actuator = settle(pending);
                        debug!("Actuator settled at {:?}", s.actuator);
                        true
                    });
                }
            }
        });

        Ok(pending)
    }

    /// Asks the camera server to re-announce itself.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.publish(&self.shared.settings.send_topic, COMMAND_REFRESH)
            .await
    }

    /// Free-text command to the device. Blank input is not sent.
    pub async fn send(&self, payload: &str) -> Result<bool, SessionError> {
        if payload.trim().is_empty() {
            debug!("Not sending blank message");
            return Ok(false);
        }
        self.publish(&self.shared.settings.send_topic, payload)
            .await?;
        Ok(true)
    }

    /// Publishes a discovery request and waits for the correlated answer.
    /// The response subscription is released on every outcome.
    pub async fn request_remote_value(&self) -> Result<String, SessionError> {
        let transport = self.transport()?;
        let settings = self.shared.discovery.settings();

        let PendingRequest { id, response } = self.shared.discovery.begin(transport).await?;
        self.shared.sync_discovery().await;
        info!("Discovery request {} sent to {}", id, settings.request_topic);

        let outcome = async {
            self.publish(&settings.request_topic, &settings.request_payload(&id))
                .await?;
            match tokio::time::timeout(settings.timeout, response).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(SessionError::DiscoveryCancelled),
                Err(_) => Err(SessionError::DiscoveryTimeout(settings.timeout)),
            }
        }
        .await;

        self.shared.discovery.finish(transport, &id).await;
        self.shared.sync_discovery().await;

        match &outcome {
            Ok(value) => {
                info!("Discovery request {} resolved: {}", id, value);
                if let Some(url) = camera::extract_camera_url(value) {
                    self.shared.adopt_camera_url(url).await;
                }
            }
            Err(e) => {
                warn!("Discovery request {} failed: {}", id, e);
                self.shared.record_error(e.to_string());
            }
        }
        outcome
    }

    /// Stops every task the session started and releases the connection.
    pub async fn disconnect(mut self) -> MqttSession<Closed> {
        info!("Disconnecting session");
        self.stop_tasks().await;
        self.shared.discovery.abandon_all().await;
        self.shared.sync_discovery().await;
        self.shared
            .state
            .send_modify(|s| s.status.connection_state = ConnectionState::Closed);
        self.transport = None;
        self.transition()
    }
}

impl MqttSession<Closed> {
    pub fn final_snapshot(&self) -> SessionSnapshot {
        self.snapshot()
    }
}
