//! Request/response over pub/sub for learning the camera server address.
//!
//! Every request carries a fresh id (`request_ip:<id>`); the device answers
//! with `{"request_id": "<id>", "value": "<address>"}` on the response topic.
//! Responses are routed to the matching request only, so several requests
//! may be outstanding at once. The response topic stays subscribed exactly
//! while at least one request is outstanding.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::mqtt::mqtt_handler::{TransportError, TransportHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub request_topic: String,
    pub response_topic: String,
    pub request_token: String,
    pub timeout: Duration,
    /// Accept plain-text answers from firmware that does not echo the id.
    /// Only used when exactly one request is outstanding.
    pub accept_uncorrelated: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            request_topic: "dados/solicitar_ip".to_string(),
            response_topic: "dados/enviar_ip".to_string(),
            request_token: "request_ip".to_string(),
            timeout: Duration::from_secs(15),
            accept_uncorrelated: false,
        }
    }
}

impl DiscoverySettings {
    pub fn request_payload(&self, request_id: &str) -> String {
        format!("{}:{}", self.request_token, request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryResponse {
    Correlated { request_id: String, value: String },
    Plain(String),
}

#[derive(Deserialize)]
struct CorrelatedPayload {
    request_id: String,
    value: String,
}

impl DiscoveryResponse {
    pub fn parse(payload: &str) -> Self {
        match serde_json::from_str::<CorrelatedPayload>(payload) {
            Ok(parsed) => Self::Correlated {
                request_id: parsed.request_id,
                value: parsed.value,
            },
            Err(_) => Self::Plain(payload.trim().to_string()),
        }
    }
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub response: oneshot::Receiver<String>,
}

/// `pending` is only ever locked briefly and never across a broker round
/// trip, so the event router can always dispatch. `subscribed` serializes
/// subscribe/unsubscribe of the response topic.
pub struct DiscoveryDispatcher {
    settings: DiscoverySettings,
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
    subscribed: Mutex<bool>,
}

impl DiscoveryDispatcher {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self {
            settings,
            pending: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(false),
        }
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Registers a new request, subscribing to the response topic first if
    /// it is not subscribed yet. The request is registered before the
    /// subscription gate is released, so a concurrent `finish` cannot
    /// unsubscribe underneath it.
    pub async fn begin(&self, transport: &TransportHandle) -> Result<PendingRequest, TransportError> {
        let mut subscribed = self.subscribed.lock().await;
        if !*subscribed {
            transport.subscribe(self.settings.response_topic.clone()).await?;
            *subscribed = true;
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        let outstanding = {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
            pending.len()
        };
        debug!("Discovery request {} registered ({} outstanding)", id, outstanding);

        Ok(PendingRequest { id, response: rx })
    }

    /// Removes a request whatever its outcome; unsubscribes once none remain.
    pub async fn finish(&self, transport: &TransportHandle, request_id: &str) {
        let remaining = {
            let mut pending = self.pending.lock().await;
            pending.remove(request_id);
            pending.len()
        };
        if remaining > 0 {
            return;
        }

        let mut subscribed = self.subscribed.lock().await;
        // A request may have been registered while we waited for the gate.
        let idle = self.pending.lock().await.is_empty();
        if !*subscribed || !idle {
            return;
        }
        match transport
            .unsubscribe(self.settings.response_topic.clone())
            .await
        {
            Ok(()) => *subscribed = false,
            Err(e) => warn!("Failed to unsubscribe discovery response topic: {}", e),
        }
    }

    /// Routes a response. Returns the request id it resolved, if any.
    pub async fn dispatch(&self, payload: &str) -> Option<String> {
        let mut pending = self.pending.lock().await;
        let (request_id, value) = match DiscoveryResponse::parse(payload) {
            DiscoveryResponse::Correlated { request_id, value } => {
                if !pending.contains_key(&request_id) {
                    debug!("Dropping discovery response for unknown request {}", request_id);
                    return None;
                }
                (request_id, value)
            }
            DiscoveryResponse::Plain(value) => {
                if !self.settings.accept_uncorrelated || pending.len() != 1 {
                    debug!(
                        "Ignoring uncorrelated discovery response ({} outstanding)",
                        pending.len()
                    );
                    return None;
                }
                let request_id = pending.keys().next().cloned()?;
                (request_id, value)
            }
        };

        // Removing the sender guarantees at most one delivery per request.
        let tx = pending.remove(&request_id)?;
        if tx.send(value).is_err() {
            debug!("Discovery request {} already gave up", request_id);
            return None;
        }
        info!("Discovery request {} answered", request_id);
        Some(request_id)
    }

    /// Drops every outstanding request; waiting callers see a cancellation.
    pub async fn abandon_all(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            warn!("Abandoning {} discovery request(s)", pending.len());
            pending.clear();
        }
    }
}
