use chrono::{DateTime, Local};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MQTTMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(40).collect();
        write!(
            f,
            "{} - {}: {}",
            self.timestamp.format("%d/%m/%Y %H:%M:%S"),
            self.topic,
            preview
        )
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, content: impl Into<String>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            content: content.into(),
            timestamp: Local::now(),
        }
    }

    /// Payloads are decoded lossily; the devices only ever send UTF-8 text.
    pub fn from_payload(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::from_topic(topic, String::from_utf8_lossy(payload).into_owned())
    }
}

/// MQTT topic filter matching with `+` (single level) and `#` (multi level).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
