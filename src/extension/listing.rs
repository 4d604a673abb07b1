use serde::{Deserialize, Serialize};

use super::ExtensionIdentity;

/// Range of extension protocol versions the supervisor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRange {
    pub min: i32,
    pub max: i32,
}

impl ProtocolRange {
    pub const CURRENT: ProtocolRange = ProtocolRange { min: 1, max: 2 };

    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// Zero and negative versions are never supported.
    pub fn supports(&self, version: i32) -> bool {
        version > 0 && version >= self.min && version <= self.max
    }
}

impl Default for ProtocolRange {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Registry metadata for one installed extension.
///
/// Replaced wholesale whenever the registry reports a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionListing {
    pub identity: ExtensionIdentity,
    pub protocol_version: i32,
    /// Derived from `protocol_version` against the host's [`ProtocolRange`].
    pub compatible: bool,
    pub world_readable: bool,
    pub title: String,
    pub description: Option<String>,
    /// Settings entry point, relative to the extension's package.
    pub settings: Option<String>,
}

impl ExtensionListing {
    pub fn new(identity: ExtensionIdentity, protocol_version: i32) -> Self {
        let title = identity.component().to_string();
        Self {
            identity,
            protocol_version,
            compatible: false,
            world_readable: false,
            title,
            description: None,
            settings: None,
        }
    }

    /// Placeholder for an identity the registry no longer knows about.
    pub fn unresolved(identity: ExtensionIdentity) -> Self {
        Self::new(identity, 0)
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn world_readable(mut self, world_readable: bool) -> Self {
        self.world_readable = world_readable;
        self
    }

    pub fn settings(mut self, settings: impl Into<String>) -> Self {
        self.settings = Some(settings.into());
        self
    }

    /// Recomputes `compatible` for the given range.
    pub fn with_range(mut self, range: ProtocolRange) -> Self {
        self.compatible = range.supports(self.protocol_version);
        self
    }
}
