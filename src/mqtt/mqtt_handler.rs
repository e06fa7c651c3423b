use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Packet, QoS};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::MQTTMessage;

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl MQTTStatus {
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }

    pub fn touch(&mut self) {
        self.last_activity = Some(chrono::Local::now());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("MQTT client rejected request: {0}")]
    Client(#[from] ClientError),

    #[error("Connection driver is no longer running")]
    Closed,

    #[error("Broker refused operation: {0}")]
    Rejected(String),
}

/// Requests executed by the connection driver on behalf of a session.
#[derive(Debug)]
pub enum TransportCommand {
    Publish {
        topic: String,
        payload: String,
        response_tx: oneshot::Sender<Result<(), TransportError>>,
    },
    Subscribe {
        topic: String,
        response_tx: oneshot::Sender<Result<(), TransportError>>,
    },
    Unsubscribe {
        topic: String,
        response_tx: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// What the driver reports back to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected,
    Message(MQTTMessage),
    ConnectFailed(String),
    ConnectionLost(String),
    /// The broker answered a SUBACK with a failure code. The connection
    /// stays up but nothing arrives on the refused filter.
    SubscriptionRefused(String),
}

/// Cloneable sending side of a connection.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    tx: mpsc::Sender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(tx: mpsc::Sender<TransportCommand>) -> Self {
        Self { tx }
    }

    async fn request<F>(&self, build: F) -> Result<(), TransportError>
    where
        F: FnOnce(oneshot::Sender<Result<(), TransportError>>) -> TransportCommand,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        response_rx.await.map_err(|_| TransportError::Closed)?
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), TransportError> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|response_tx| TransportCommand::Publish {
            topic,
            payload,
            response_tx,
        })
        .await
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), TransportError> {
        let topic = topic.into();
        self.request(|response_tx| TransportCommand::Subscribe { topic, response_tx })
            .await
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), TransportError> {
        let topic = topic.into();
        self.request(|response_tx| TransportCommand::Unsubscribe { topic, response_tx })
            .await
    }
}

/// An open broker connection: the command side, the event side, and the
/// driver task that owns the client.
pub struct Connection {
    pub handle: TransportHandle,
    pub events: mpsc::Receiver<BrokerEvent>,
    pub task: JoinHandle<()>,
}

/// Factory for broker connections, injected into each session.
pub trait Connector: Send + Sync {
    fn open(&self, cancel: CancellationToken) -> Connection;
}

/// Production connector backed by rumqttc.
#[derive(Clone, Debug)]
pub struct RumqttConnector {
    config: MqttConfig,
}

impl RumqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }
}

impl Connector for RumqttConnector {
    fn open(&self, cancel: CancellationToken) -> Connection {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let handler = MqttHandler::new(&self.config, command_rx, event_tx);
        info!("Opening MQTT connection to {}", self.config.endpoint);
        let task = tokio::spawn(handler.run(cancel));

        Connection {
            handle: TransportHandle::new(command_tx),
            events: event_rx,
            task,
        }
    }
}

/// Drives a single rumqttc event loop. Owns the client exclusively.
pub struct MqttHandler {
    state: ConnectionState,
    received: usize,
    sent: usize,
    client: AsyncClient,
    eventloop: EventLoop,
    commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<BrokerEvent>,
    qos: QoS,
}

impl MqttHandler {
    pub fn new(
        config: &MqttConfig,
        commands: mpsc::Receiver<TransportCommand>,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Self {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), config.channel_capacity);

        Self {
            state: ConnectionState::Connecting,
            received: 0,
            sent: 0,
            client,
            eventloop,
            commands,
            events,
            qos: QoS::AtLeastOnce,
        }
    }

    /// Runs until cancelled, the session drops its event receiver, or the
    /// connection fails. Failures are terminal: there is no reconnect.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("MQTT connection shutdown requested");
                    self.shutdown().await;
                    break;
                }

                Some(command) = self.commands.recv() => {
                    self.execute(command);
                }

                event = self.eventloop.poll() => {
                    if !self.handle_event(event).await {
                        break;
                    }
                }
            }
        }

        debug!(
            "MQTT driver stopped: state={:?} received={} sent={}",
            self.state, self.received, self.sent
        );
    }

    // try_* calls only enqueue into the event loop's request channel, so the
    // driver never awaits on itself.
    fn execute(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Publish {
                topic,
                payload,
                response_tx,
            } => {
                debug!("Publishing to {}: {}", topic, payload);
                let result = self
                    .client
                    .try_publish(topic, self.qos, false, payload.into_bytes())
                    .map_err(TransportError::from);
                if result.is_ok() {
                    self.sent += 1;
                }
                respond(response_tx, result);
            }
            TransportCommand::Subscribe { topic, response_tx } => {
                info!("Subscribing to {}", topic);
                let result = self
                    .client
                    .try_subscribe(topic, self.qos)
                    .map_err(TransportError::from);
                respond(response_tx, result);
            }
            TransportCommand::Unsubscribe { topic, response_tx } => {
                info!("Unsubscribing from {}", topic);
                let result = self
                    .client
                    .try_unsubscribe(topic)
                    .map_err(TransportError::from);
                respond(response_tx, result);
            }
        }
    }

    /// Returns false when the driver should stop.
    async fn handle_event(
        &mut self,
        event: Result<Event, rumqttc::ConnectionError>,
    ) -> bool {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                self.state = ConnectionState::Connected;
                self.emit(BrokerEvent::Connected).await
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.received += 1;
                let message = MQTTMessage::from_payload(publish.topic, &publish.payload);
                debug!("Received {}", message);
                self.emit(BrokerEvent::Message(message)).await
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, rumqttc::SubscribeReasonCode::Failure));
                if !refused {
                    return true;
                }
                warn!("Broker refused subscription (pkid {})", ack.pkid);
                self.emit(BrokerEvent::SubscriptionRefused(format!(
                    "broker refused subscription (pkid {})",
                    ack.pkid
                )))
                .await
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the MQTT connection");
                self.state = ConnectionState::Failed;
                self.emit(BrokerEvent::ConnectionLost("broker sent disconnect".to_string()))
                    .await;
                false
            }
            Ok(_) => true,
            Err(e) => {
                let reason = e.to_string();
                let event = if self.state == ConnectionState::Connected {
                    error!("MQTT connection lost: {}", reason);
                    BrokerEvent::ConnectionLost(reason)
                } else {
                    error!("MQTT connection failed: {}", reason);
                    BrokerEvent::ConnectFailed(reason)
                };
                self.state = ConnectionState::Failed;
                self.emit(event).await;
                false
            }
        }
    }

    async fn emit(&mut self, event: BrokerEvent) -> bool {
        if self.events.send(event).await.is_err() {
            debug!("Session dropped its event receiver, stopping MQTT driver");
            return false;
        }
        true
    }

    async fn shutdown(&mut self) {
        if self.state == ConnectionState::Connected {
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to queue MQTT disconnect: {}", e);
            } else {
                // One more poll flushes the DISCONNECT packet.
                let _ = tokio::time::timeout(DISCONNECT_FLUSH, self.eventloop.poll()).await;
            }
        }
        self.state = ConnectionState::Closed;
    }
}

fn respond(
    response_tx: oneshot::Sender<Result<(), TransportError>>,
    result: Result<(), TransportError>,
) {
    if response_tx.send(result).is_err() {
        warn!("Transport caller went away before the response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::BrokerEndpoint;
    use rumqttc::{
        ConnAck, ConnectReturnCode, ConnectionError, Publish, SubAck, SubscribeReasonCode,
    };

    #[tokio::test]
    async fn handle_reports_closed_when_driver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = TransportHandle::new(tx);
        let result = handle.publish("dados/app", "1").await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn handle_round_trips_command_response() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = TransportHandle::new(tx);

        let driver = tokio::spawn(async move {
            match rx.recv().await {
                Some(TransportCommand::Subscribe { topic, response_tx }) => {
                    assert_eq!(topic, "dados/camera");
                    let _ = response_tx.send(Err(TransportError::Rejected("denied".into())));
                }
                other => panic!("unexpected command: {:?}", other),
            }
        });

        let result = handle.subscribe("dados/camera").await;
        assert!(matches!(result, Err(TransportError::Rejected(reason)) if reason == "denied"));
        driver.await.unwrap();
    }

    fn local_config(url: &str) -> MqttConfig {
        MqttConfig {
            endpoint: BrokerEndpoint::parse(url).unwrap(),
            credentials: None,
            client_id_prefix: "esteira-test".to_string(),
            keep_alive: Duration::from_secs(30),
            channel_capacity: 10,
        }
    }

    fn handler_for_test() -> (MqttHandler, mpsc::Receiver<BrokerEvent>) {
        let (_command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let handler = MqttHandler::new(&local_config("mqtt://localhost:1883"), command_rx, event_tx);
        (handler, event_rx)
    }

    fn connack() -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
    }

    fn reset_socket() -> ConnectionError {
        ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
    }

    #[tokio::test]
    async fn connack_reports_connected() {
        let (mut handler, mut events) = handler_for_test();

        assert!(handler.handle_event(connack()).await);
        assert_eq!(events.try_recv().unwrap(), BrokerEvent::Connected);
        assert_eq!(handler.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn incoming_publish_becomes_a_lossy_message() {
        let (mut handler, mut events) = handler_for_test();
        handler.handle_event(connack()).await;
        events.try_recv().unwrap();

        let publish = Publish::new("dados/camera", QoS::AtLeastOnce, vec![b'4', 0xff]);
        assert!(handler.handle_event(Ok(Event::Incoming(Packet::Publish(publish)))).await);

        match events.try_recv().unwrap() {
            BrokerEvent::Message(message) => {
                assert_eq!(message.topic, "dados/camera");
                assert_eq!(message.content, "4\u{FFFD}");
            }
            other => panic!("expected a message, got {:?}", other),
        }
        assert_eq!(handler.received, 1);
    }

    #[tokio::test]
    async fn error_before_connack_is_a_failed_connect() {
        let (mut handler, mut events) = handler_for_test();

        assert!(!handler.handle_event(Err(reset_socket())).await);
        assert!(matches!(
            events.try_recv().unwrap(),
            BrokerEvent::ConnectFailed(reason) if reason.contains("connection reset")
        ));
        assert_eq!(handler.state, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn error_after_connack_is_a_lost_connection() {
        let (mut handler, mut events) = handler_for_test();
        handler.handle_event(connack()).await;
        events.try_recv().unwrap();

        assert!(!handler.handle_event(Err(reset_socket())).await);
        assert!(matches!(
            events.try_recv().unwrap(),
            BrokerEvent::ConnectionLost(reason) if reason.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn refused_suback_reaches_the_session() {
        let (mut handler, mut events) = handler_for_test();
        handler.handle_event(connack()).await;
        events.try_recv().unwrap();

        let granted = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert!(handler.handle_event(Ok(Event::Incoming(Packet::SubAck(granted)))).await);
        assert!(events.try_recv().is_err());

        let refused = SubAck::new(2, vec![SubscribeReasonCode::Failure]);
        assert!(handler.handle_event(Ok(Event::Incoming(Packet::SubAck(refused)))).await);
        assert!(matches!(
            events.try_recv().unwrap(),
            BrokerEvent::SubscriptionRefused(reason) if reason.contains("pkid 2")
        ));
    }

    #[tokio::test]
    async fn broker_disconnect_stops_the_driver() {
        let (mut handler, mut events) = handler_for_test();
        handler.handle_event(connack()).await;
        events.try_recv().unwrap();

        assert!(!handler.handle_event(Ok(Event::Incoming(Packet::Disconnect))).await);
        assert!(matches!(
            events.try_recv().unwrap(),
            BrokerEvent::ConnectionLost(_)
        ));
    }

    #[tokio::test]
    async fn driver_stops_when_session_is_gone() {
        let (mut handler, events) = handler_for_test();
        drop(events);
        assert!(!handler.handle_event(connack()).await);
    }

    #[tokio::test]
    async fn spawned_driver_reports_unreachable_broker() {
        let (_command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        // Nothing listens on port 1.
        let handler = MqttHandler::new(&local_config("mqtt://127.0.0.1:1"), command_rx, event_tx);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler.run(cancel.clone()));

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv()).await;
        match event {
            Ok(Some(BrokerEvent::ConnectFailed(_))) => {}
            Ok(other) => panic!("expected a failed connect, got {:?}", other),
            Err(_) => cancel.cancel(),
        }
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_driver_shuts_down() {
        let (_command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _events) = mpsc::channel(EVENT_BUFFER);
        let handler = MqttHandler::new(&local_config("mqtt://127.0.0.1:1"), command_rx, event_tx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::spawn(handler.run(cancel)).await.unwrap();
    }
}
