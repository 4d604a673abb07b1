use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Unknown,
    Initial,
    Periodic,
    SettingsChanged,
    ContentChanged,
    ScreenOn,
    Manual,
}

impl Reason {
    pub const ALL: [Reason; 7] = [
        Reason::Unknown,
        Reason::Initial,
        Reason::Periodic,
        Reason::SettingsChanged,
        Reason::ContentChanged,
        Reason::ScreenOn,
        Reason::Manual,
    ];

    /// Numeric code used by the extension protocol.
    pub fn code(self) -> u8 {
        match self {
            Reason::Unknown => 0,
            Reason::Initial => 1,
            Reason::Periodic => 2,
            Reason::SettingsChanged => 3,
            Reason::ContentChanged => 4,
            Reason::ScreenOn => 5,
            Reason::Manual => 6,
        }
    }

    /// Unknown codes map to `Unknown` rather than failing.
    pub fn from_code(code: u8) -> Self {
        Self::ALL
            .into_iter()
            .find(|r| r.code() == code)
            .unwrap_or(Reason::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Unknown => "unknown",
            Reason::Initial => "initial",
            Reason::Periodic => "periodic",
            Reason::SettingsChanged => "settings_changed",
            Reason::ContentChanged => "content_changed",
            Reason::ScreenOn => "screen_on",
            Reason::Manual => "manual",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reason {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| HostError::Config(format!("unknown update reason '{s}'")))
    }
}

/// The verbs a host can send to an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Initialize,
    Refresh,
}

/// One verb + argument pair executed against a connected extension.
///
/// Operations are plain values; re-running one is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Initialize { reconnect: bool },
    Refresh { reason: Reason },
}

impl Operation {
    pub fn initialize(reconnect: bool) -> Self {
        Operation::Initialize { reconnect }
    }

    pub fn refresh(reason: Reason) -> Self {
        Operation::Refresh { reason }
    }

    pub fn verb(&self) -> Verb {
        match self {
            Operation::Initialize { .. } => Verb::Initialize,
            Operation::Refresh { .. } => Verb::Refresh,
        }
    }

    pub fn reason(&self) -> Option<Reason> {
        match self {
            Operation::Refresh { reason } => Some(*reason),
            Operation::Initialize { .. } => None,
        }
    }
}

/// Builds the operation for a verb. `Initialize` treats an `Initial` reason as
/// a fresh connect and anything else as a reconnect.
pub fn build_operation(verb: Verb, reason: Reason) -> Operation {
    match verb {
        Verb::Initialize => Operation::initialize(reason != Reason::Initial),
        Verb::Refresh => Operation::refresh(reason),
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Initialize { reconnect } => write!(f, "initialize(reconnect={reconnect})"),
            Operation::Refresh { reason } => write!(f, "refresh({reason})"),
        }
    }
}
