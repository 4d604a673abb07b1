use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    /// The extension could not be bound: unresolvable, disabled or refused.
    #[error("cannot connect to extension '{identity}': {reason}")]
    Connect { identity: String, reason: String },

    /// A bound session's call failed at the IPC layer.
    #[error("transport failure talking to '{identity}': {reason}")]
    Transport { identity: String, reason: String },

    /// The extension declares a protocol version the host does not speak.
    #[error("extension '{identity}' uses unsupported protocol version {version}")]
    Protocol { identity: String, version: i32 },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invalid extension identity '{0}'")]
    InvalidIdentity(String),

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("untrusted host service: {0}")]
    Untrusted(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HostError {
    pub fn connect(identity: impl ToString, reason: impl Into<String>) -> Self {
        Self::Connect {
            identity: identity.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transport(identity: impl ToString, reason: impl Into<String>) -> Self {
        Self::Transport {
            identity: identity.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable name, used as a structured log field.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Transport { .. } => "transport",
            Self::Protocol { .. } => "protocol",
            Self::Persistence(_) => "persistence",
            Self::InvalidIdentity(_) => "invalid-identity",
            Self::Ipc(_) => "ipc",
            Self::Untrusted(_) => "untrusted",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Errors a session absorbs by queueing and waiting for the next connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Transport { .. })
    }
}

impl From<rkyv::rancor::Error> for HostError {
    fn from(e: rkyv::rancor::Error) -> Self {
        HostError::Ipc(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
