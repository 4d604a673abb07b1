//! The seams between a session and the extension it talks to.
//!
//! An [`ExtensionBinder`] turns an identity into a live [`ExtensionLink`]
//! (host to extension). The extension talks back through the
//! [`HostCallback`] it was bound with; everything it sends is funnelled into
//! one shared callback worker, which checks the session is still live.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::Result;
use crate::extension::{ExtensionIdentity, Operation, StatusPayload};

/// Generation number of a session; never reused within a host process.
pub type SessionId = u64;

#[async_trait]
pub trait ExtensionBinder: Send + Sync {
    /// Checks the identity can be bound at all: installed, allowed and
    /// speaking a supported protocol version.
    fn resolve(&self, identity: &ExtensionIdentity) -> Result<()>;

    /// Establishes a connection. Fails with `HostError::Connect` when the
    /// extension cannot be started or refuses the binding.
    async fn bind(
        &self,
        identity: &ExtensionIdentity,
        callback: HostCallback,
    ) -> Result<Box<dyn ExtensionLink>>;
}

#[async_trait]
pub trait ExtensionLink: Send {
    /// Delivers one operation. Errors are transport failures.
    async fn call(&mut self, op: &Operation) -> Result<()>;

    /// Tears the connection down. Never fails.
    async fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Publish(Option<StatusPayload>),
    WatchContent(Vec<String>),
    ScreenOn(bool),
    Lost,
}

#[derive(Debug, Clone)]
pub struct CallbackMessage {
    pub identity: ExtensionIdentity,
    pub session: SessionId,
    /// Connection generation within the session.
    pub link: u64,
    pub event: CallbackEvent,
}

/// The only surface an extension can use to influence the host.
#[derive(Debug, Clone)]
pub struct HostCallback {
    identity: ExtensionIdentity,
    session: SessionId,
    link: u64,
    tx: mpsc::Sender<CallbackMessage>,
}

impl HostCallback {
    pub fn new(
        identity: ExtensionIdentity,
        session: SessionId,
        link: u64,
        tx: mpsc::Sender<CallbackMessage>,
    ) -> Self {
        Self {
            identity,
            session,
            link,
            tx,
        }
    }

    pub fn identity(&self) -> &ExtensionIdentity {
        &self.identity
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    async fn send(&self, event: CallbackEvent) {
        let message = CallbackMessage {
            identity: self.identity.clone(),
            session: self.session,
            link: self.link,
            event,
        };
        if self.tx.send(message).await.is_err() {
            trace!(identity = %self.identity, "Callback worker gone, dropping message");
        }
    }

    /// `None` clears the extension's status.
    pub async fn publish_status(&self, payload: Option<StatusPayload>) {
        self.send(CallbackEvent::Publish(payload)).await;
    }

    /// Replaces the extension's content triggers.
    pub async fn register_content_triggers(&self, uris: Vec<String>) {
        self.send(CallbackEvent::WatchContent(uris)).await;
    }

    pub async fn set_screen_on_trigger(&self, enabled: bool) {
        self.send(CallbackEvent::ScreenOn(enabled)).await;
    }

    /// Reported by the transport when the extension goes away.
    pub async fn connection_lost(&self) {
        self.send(CallbackEvent::Lost).await;
    }
}
