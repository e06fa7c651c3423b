//! Color classification counters and the inbound message log.
//!
//! The sorting rig reports one event per detected object. Two encodings are
//! in use by different firmware builds: tagged strings (`Cor:Vermelho`) and
//! bare numeric codes (`4`). Which ones are accepted is configurable.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Red,
    Green,
    Blue,
    Undefined,
}

impl Classification {
    fn from_tag(payload: &str) -> Option<Self> {
        match payload {
            "Cor:Vermelho" => Some(Self::Red),
            "Cor:Verde" => Some(Self::Green),
            "Cor:Azul" => Some(Self::Blue),
            "Cor:CorNDef" => Some(Self::Undefined),
            _ => None,
        }
    }

    /// Codes are compared by numeric value, so `4`, `4.0` and `4e0` are all
    /// red. Fractional values, NaN and infinities match nothing.
    fn from_code(payload: &str) -> Option<Self> {
        let code = payload.trim().parse::<f64>().ok()?;
        if code.fract() != 0.0 {
            return None;
        }
        match code as i64 {
            4 => Some(Self::Red),
            2 => Some(Self::Green),
            3 => Some(Self::Blue),
            5 => Some(Self::Undefined),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Red => "vermelho",
            Self::Green => "verde",
            Self::Blue => "azul",
            Self::Undefined => "indefinido",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationEncoding {
    Tagged,
    Numeric,
    #[default]
    Both,
}

impl ClassificationEncoding {
    pub fn classify(self, payload: &str) -> Option<Classification> {
        match self {
            Self::Tagged => Classification::from_tag(payload),
            Self::Numeric => Classification::from_code(payload),
            Self::Both => {
                Classification::from_tag(payload).or_else(|| Classification::from_code(payload))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorCounters {
    pub red: u64,
    pub green: u64,
    pub blue: u64,
    pub undefined: u64,
}

impl ColorCounters {
    pub fn increment(&mut self, class: Classification) {
        let counter = match class {
            Classification::Red => &mut self.red,
            Classification::Green => &mut self.green,
            Classification::Blue => &mut self.blue,
            Classification::Undefined => &mut self.undefined,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.red + self.green + self.blue + self.undefined
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub time: DateTime<Local>,
    pub value: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.time.format("%d/%m/%Y %H:%M:%S"), self.value)
    }
}

/// Per-session telemetry. Grows for the lifetime of the session; replayed
/// messages are counted again (no deduplication).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub counters: ColorCounters,
    pub log: Vec<LogEntry>,
    pub last_message: Option<String>,
}

impl Telemetry {
    pub fn record(
        &mut self,
        payload: &str,
        encoding: ClassificationEncoding,
    ) -> Option<Classification> {
        self.log.push(LogEntry {
            time: Local::now(),
            value: payload.to_string(),
        });
        self.last_message = Some(payload.to_string());

        let class = encoding.classify(payload);
        if let Some(class) = class {
            self.counters.increment(class);
        }
        class
    }
}
