//! Value types shared by the supervisor, the status cache and the IPC layer.

mod identity;
mod listing;
mod operation;
mod payload;

pub use identity::ExtensionIdentity;
pub use listing::{ExtensionListing, ProtocolRange};
pub use operation::{build_operation, Operation, Reason, Verb};
pub use payload::{
    ClickAction, StatusPayload, MAX_ACCESSIBILITY_TEXT_LENGTH, MAX_BODY_LENGTH, MAX_STATUS_LENGTH,
    MAX_TITLE_LENGTH, PAYLOAD_SCHEMA_VERSION,
};

/// What the status cache holds for one active identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionRecord {
    pub identity: ExtensionIdentity,
    pub listing: ExtensionListing,
    pub latest: StatusPayload,
}

impl ExtensionRecord {
    pub fn new(listing: ExtensionListing, latest: StatusPayload) -> Self {
        Self {
            identity: listing.identity.clone(),
            listing,
            latest,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.latest.visible
    }
}
