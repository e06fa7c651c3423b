//! # MQTT Transport Module
//!
//! Owns everything that talks to the broker. A session never touches the
//! rumqttc client directly; it gets a [`mqtt_handler::Connection`] from an
//! injected [`mqtt_handler::Connector`] and works through the command and
//! event channels.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker endpoint parsing, credentials, MqttOptions
//! ├── message_manager.rs  - Message representation and topic filter matching
//! └── mqtt_handler.rs     - Connection driver task and the Connector seam
//! ```
//!
//! ## Data Flow
//!
//! ```text
//!  MqttSession ──TransportCommand──► MqttHandler ──► rumqttc EventLoop ──► Broker
//!       ▲                                 │
//!       └────────── BrokerEvent ──────────┘
//! ```
//!
//! The handler runs in its own tokio task and is stopped through the
//! session's cancellation token. Connection failures are reported once and
//! end the driver; reconnecting means creating a new session.

pub mod config;
#[cfg(test)]
pub mod loopback;
pub mod message_manager;
pub mod mqtt_handler;
