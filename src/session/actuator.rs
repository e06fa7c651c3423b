//! Conveyor on/off control.
//!
//! ```text
//! Off ──toggle──► PendingOn ──confirm──► On
//!  ▲                                      │
//!  └──confirm── PendingOff ◄──toggle──────┘
//! ```
//!
//! "Confirm" is either the debounce timer expiring or, in acknowledged mode,
//! the device reporting its new state. The label always names the next
//! action the operator can take.

use std::time::Duration;

pub const LABEL_TURN_ON: &str = "Ligar";
pub const LABEL_TURN_OFF: &str = "Desligar";
pub const LABEL_WAIT: &str = "Aguarde...";

pub const COMMAND_ON: &str = "1";
pub const COMMAND_OFF: &str = "0";
pub const COMMAND_REFRESH: &str = "Refresh";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActuatorState {
    #[default]
    Off,
    PendingOn,
    On,
    PendingOff,
}

impl ActuatorState {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::PendingOn | Self::PendingOff)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Off => LABEL_TURN_ON,
            Self::On => LABEL_TURN_OFF,
            Self::PendingOn | Self::PendingOff => LABEL_WAIT,
        }
    }

    /// Starts a toggle. Returns the pending state and the payload to publish,
    /// or `None` while a previous toggle is still pending.
    pub fn begin_toggle(self) -> Option<(ActuatorState, &'static str)> {
        match self {
            Self::Off => Some((Self::PendingOn, COMMAND_ON)),
            Self::On => Some((Self::PendingOff, COMMAND_OFF)),
            Self::PendingOn | Self::PendingOff => None,
        }
    }

    pub fn confirm(self) -> ActuatorState {
        match self {
            Self::PendingOn => Self::On,
            Self::PendingOff => Self::Off,
            settled => settled,
        }
    }

    pub fn revert(self) -> ActuatorState {
        match self {
            Self::PendingOn => Self::Off,
            Self::PendingOff => Self::On,
            settled => settled,
        }
    }

    /// State reported by the device on its status topic.
    pub fn from_report(payload: &str) -> Option<ActuatorState> {
        match payload.trim() {
            COMMAND_ON => Some(Self::On),
            COMMAND_OFF => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleMode {
    /// Assume the device switched after a fixed delay.
    Debounce(Duration),
    /// Wait for the device to report on `topic`; revert after `timeout`.
    Acknowledged { topic: String, timeout: Duration },
}

impl Default for ToggleMode {
    fn default() -> Self {
        Self::Debounce(Duration::from_millis(500))
    }
}

impl ToggleMode {
    pub fn ack_topic(&self) -> Option<&str> {
        match self {
            Self::Debounce(_) => None,
            Self::Acknowledged { topic, .. } => Some(topic),
        }
    }

    /// Time after which a pending toggle settles one way or the other.
    pub fn settle_after(&self) -> Duration {
        match self {
            Self::Debounce(delay) => *delay,
            Self::Acknowledged { timeout, .. } => *timeout,
        }
    }
}
