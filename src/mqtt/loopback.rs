//! In-process broker used by tests in place of a real connection.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::message_manager::{topic_matches, MQTTMessage};
use super::mqtt_handler::{
    BrokerEvent, Connection, Connector, TransportCommand, TransportError, TransportHandle,
};

type Responder = Box<dyn Fn(&str, &str) -> Option<(String, String)> + Send>;

#[derive(Default)]
struct BrokerInner {
    subscriptions: Vec<String>,
    published: Vec<(String, String)>,
    events: Option<mpsc::Sender<BrokerEvent>>,
    refuse_with: Option<String>,
    silent: bool,
    fail_publish: bool,
    refused_filters: Vec<String>,
    responders: Vec<Responder>,
    connections_opened: usize,
}

#[derive(Clone, Default)]
pub struct LoopbackBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(&self, reason: &str) {
        self.inner.lock().unwrap().refuse_with = Some(reason.to_string());
    }

    /// Never answers the connect handshake.
    pub fn stay_silent(&self) {
        self.inner.lock().unwrap().silent = true;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_publish = fail;
    }

    /// Accepts the SUBSCRIBE for `filter` but answers with a failure SUBACK.
    pub fn refuse_subscription(&self, filter: &str) {
        self.inner
            .lock()
            .unwrap()
            .refused_filters
            .push(filter.to_string());
    }

    /// Emulates a device: called for every publish, may answer with a
    /// `(topic, payload)` that is routed back to subscribers.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &str) -> Option<(String, String)> + Send + 'static,
    {
        self.inner.lock().unwrap().responders.push(Box::new(responder));
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().unwrap().subscriptions.clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.lock().unwrap().connections_opened
    }

    /// Delivers a device message. Returns false when nobody is subscribed.
    pub async fn inject(&self, topic: &str, payload: &str) -> bool {
        let sender = {
            let inner = self.inner.lock().unwrap();
            let subscribed = inner
                .subscriptions
                .iter()
                .any(|filter| topic_matches(filter, topic));
            match (&inner.events, subscribed) {
                (Some(events), true) => events.clone(),
                _ => return false,
            }
        };
        sender
            .send(BrokerEvent::Message(MQTTMessage::from_topic(topic, payload)))
            .await
            .is_ok()
    }

    pub async fn drop_connection(&self, reason: &str) {
        let sender = self.inner.lock().unwrap().events.clone();
        if let Some(events) = sender {
            let _ = events
                .send(BrokerEvent::ConnectionLost(reason.to_string()))
                .await;
        }
    }

    async fn execute(&self, command: TransportCommand) {
        match command {
            TransportCommand::Publish {
                topic,
                payload,
                response_tx,
            } => {
                let replies = {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.fail_publish {
                        let _ = response_tx
                            .send(Err(TransportError::Rejected("publish refused".into())));
                        return;
                    }
                    inner.published.push((topic.clone(), payload.clone()));
                    inner
                        .responders
                        .iter()
                        .filter_map(|responder| responder(&topic, &payload))
                        .collect::<Vec<_>>()
                };
                let _ = response_tx.send(Ok(()));
                for (reply_topic, reply_payload) in replies {
                    self.inject(&reply_topic, &reply_payload).await;
                }
            }
            TransportCommand::Subscribe { topic, response_tx } => {
                let refused = {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.refused_filters.contains(&topic) {
                        inner.events.clone()
                    } else {
                        if !inner.subscriptions.contains(&topic) {
                            inner.subscriptions.push(topic.clone());
                        }
                        None
                    }
                };
                let _ = response_tx.send(Ok(()));
                if let Some(events) = refused {
                    let _ = events
                        .send(BrokerEvent::SubscriptionRefused(format!(
                            "broker refused subscription to {}",
                            topic
                        )))
                        .await;
                }
            }
            TransportCommand::Unsubscribe { topic, response_tx } => {
                self.inner
                    .lock()
                    .unwrap()
                    .subscriptions
                    .retain(|existing| existing != &topic);
                let _ = response_tx.send(Ok(()));
            }
        }
    }
}

impl Connector for LoopbackBroker {
    fn open(&self, cancel: CancellationToken) -> Connection {
        let (command_tx, mut command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(256);

        let (refuse_with, silent) = {
            let mut inner = self.inner.lock().unwrap();
            inner.connections_opened += 1;
            inner.subscriptions.clear();
            inner.events = Some(event_tx.clone());
            (inner.refuse_with.clone(), inner.silent)
        };

        let broker = self.clone();
        let task = tokio::spawn(async move {
            if let Some(reason) = refuse_with {
                let _ = event_tx.send(BrokerEvent::ConnectFailed(reason)).await;
                return;
            }
            if !silent {
                let _ = event_tx.send(BrokerEvent::Connected).await;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = command_rx.recv() => match command {
                        Some(command) => broker.execute(command).await,
                        None => break,
                    },
                }
            }
            broker.inner.lock().unwrap().events = None;
        });

        Connection {
            handle: TransportHandle::new(command_tx),
            events: event_rx,
            task,
        }
    }
}
