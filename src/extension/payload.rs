//! The status an extension publishes, and its persisted record form.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Maximum length of [`StatusPayload::status`], enforced by [`StatusPayload::clean`].
pub const MAX_STATUS_LENGTH: usize = 32;
/// Maximum length of [`StatusPayload::title`].
pub const MAX_TITLE_LENGTH: usize = 100;
/// Maximum length of [`StatusPayload::body`].
pub const MAX_BODY_LENGTH: usize = 1000;
/// Maximum length of [`StatusPayload::accessibility_text`].
pub const MAX_ACCESSIBILITY_TEXT_LENGTH: usize =
    32 + MAX_STATUS_LENGTH + MAX_TITLE_LENGTH + MAX_BODY_LENGTH;

/// Schema tag written with every persisted record.
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

/// Opaque action descriptor invoked when a consumer clicks the status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClickAction(String);

impl ClickAction {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_uri(&self) -> &str {
        &self.0
    }
}

/// Data published by one extension.
///
/// When `visible` is false every other field must be treated as unset.
/// Equality is structural and decides whether a publish is a real change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusPayload {
    pub visible: bool,
    /// Icon resource id inside the extension's package; 0 means none.
    pub icon: i32,
    pub icon_uri: Option<String>,
    pub status: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub click_action: Option<ClickAction>,
    pub accessibility_text: Option<String>,
}

impl StatusPayload {
    /// An invisible payload; also what a `null` publish becomes.
    pub fn hidden() -> Self {
        Self::default()
    }

    pub fn visible(status: impl Into<String>) -> Self {
        Self {
            visible: true,
            status: Some(status.into()),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_icon_uri(mut self, uri: impl Into<String>) -> Self {
        self.icon_uri = Some(uri.into());
        self
    }

    pub fn with_click_action(mut self, action: ClickAction) -> Self {
        self.click_action = Some(action);
        self
    }

    pub fn with_accessibility_text(mut self, text: impl Into<String>) -> Self {
        self.accessibility_text = Some(text.into());
        self
    }

    /// Returns the payload only when consumers should show it.
    pub fn when_visible(&self) -> Option<&StatusPayload> {
        self.visible.then_some(self)
    }

    /// Truncates every text field to its maximum length, keeping a prefix.
    pub fn clean(&mut self) {
        truncate_field(&mut self.status, MAX_STATUS_LENGTH);
        truncate_field(&mut self.title, MAX_TITLE_LENGTH);
        truncate_field(&mut self.body, MAX_BODY_LENGTH);
        truncate_field(&mut self.accessibility_text, MAX_ACCESSIBILITY_TEXT_LENGTH);
    }

    pub fn cleaned(mut self) -> Self {
        self.clean();
        self
    }

    /// Flat key/value record stored by the payload store.
    pub fn to_record(&self) -> Result<serde_json::Value> {
        let record = PersistedPayload {
            schema: PAYLOAD_SCHEMA_VERSION,
            payload: self.clone(),
        };
        Ok(serde_json::to_value(record)?)
    }

    /// Reads a record written by any schema version; unknown keys are ignored
    /// and missing keys take their defaults.
    pub fn from_record(value: &serde_json::Value) -> Result<Self> {
        let record: PersistedPayload = serde_json::from_value(value.clone())?;
        if record.schema > PAYLOAD_SCHEMA_VERSION {
            tracing::debug!(
                schema = record.schema,
                "Reading payload record written by a newer schema"
            );
        }
        Ok(record.payload)
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedPayload {
    #[serde(default)]
    schema: u32,
    #[serde(flatten)]
    payload: StatusPayload,
}

fn truncate_field(field: &mut Option<String>, max_chars: usize) {
    if let Some(text) = field {
        if let Some((idx, _)) = text.char_indices().nth(max_chars) {
            text.truncate(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_truncates_to_prefix() {
        let long = "x".repeat(50) + "tail";
        let mut payload = StatusPayload::visible(long.clone())
            .with_title("t".repeat(150))
            .with_body("b".repeat(1500))
            .with_accessibility_text("a".repeat(5000));
        payload.clean();

        let status = payload.status.as_deref().unwrap();
        assert_eq!(status.chars().count(), MAX_STATUS_LENGTH);
        assert!(long.starts_with(status));
        assert_eq!(payload.title.unwrap().len(), MAX_TITLE_LENGTH);
        assert_eq!(payload.body.unwrap().len(), MAX_BODY_LENGTH);
        assert_eq!(
            payload.accessibility_text.unwrap().len(),
            MAX_ACCESSIBILITY_TEXT_LENGTH
        );
    }

    #[test]
    fn clean_respects_char_boundaries() {
        let text = "é".repeat(40);
        let mut payload = StatusPayload::visible(text.clone());
        payload.clean();
        let status = payload.status.unwrap();
        assert_eq!(status.chars().count(), MAX_STATUS_LENGTH);
        assert!(text.starts_with(&status));
    }

    #[test]
    fn clean_leaves_short_fields_alone() {
        let payload = StatusPayload::visible("72°").with_title("Sunny");
        assert_eq!(payload.clone().cleaned(), payload);
    }

    #[test]
    fn equality_includes_click_action() {
        let a = StatusPayload::visible("3 new").with_click_action(ClickAction::new("app://inbox"));
        let b = StatusPayload::visible("3 new").with_click_action(ClickAction::new("app://other"));
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn record_layout_is_flat_and_tagged() {
        let payload = StatusPayload::visible("3 new")
            .with_icon_uri("file:///icon.png")
            .with_click_action(ClickAction::new("app://inbox"));
        let record = payload.to_record().unwrap();
        assert_eq!(record["schema"], PAYLOAD_SCHEMA_VERSION);
        assert_eq!(record["visible"], true);
        assert_eq!(record["iconUri"], "file:///icon.png");
        assert_eq!(record["clickAction"], "app://inbox");
        assert_eq!(StatusPayload::from_record(&record).unwrap(), payload);
    }

    #[test]
    fn record_tolerates_missing_and_unknown_keys() {
        let value = serde_json::json!({ "visible": true, "status": "hi", "futureField": 7 });
        let payload = StatusPayload::from_record(&value).unwrap();
        assert!(payload.visible);
        assert_eq!(payload.status.as_deref(), Some("hi"));
        assert!(payload.body.is_none());
    }

    #[test]
    fn hidden_payload_is_not_shown() {
        assert!(StatusPayload::hidden().when_visible().is_none());
        assert!(StatusPayload::visible("x").when_visible().is_some());
    }
}
