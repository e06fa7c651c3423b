//! # Terminal Front End
//!
//! Operator-facing side of the session. Nothing here talks to the broker
//! directly: every action goes through `MqttSession<Connected>`, and every
//! display reads a `SessionSnapshot`.
//!
//! - [`console`]: interactive command loop plus the passive monitor.
//! - [`dashboard`]: plain-text rendering of snapshots, shared by both.
//!
//! Ctrl-C ends either loop; the caller then disconnects the session.

pub mod console;
pub mod dashboard;
