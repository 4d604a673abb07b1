//! Status host - background process supervising extension processes
//!
//! The host:
//! - keeps one session per active extension and drives its lifecycle
//! - queues operations while an extension is not connected
//! - turns screen-on and content-change events into refreshes
//! - serves status to clients over a local socket
//!
//! # Architecture
//!
//! Communication with clients uses zero-copy rkyv serialization over local
//! sockets; extensions are child processes speaking JSON lines on stdio.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              statushub run                │
//! ├──────────────────────────────────────────┤
//! │  Supervisor   │  IPC Server  │ Triggers  │
//! │  (sessions)   │  (socket)    │ (refresh) │
//! ├──────────────────────────────────────────┤
//! │ weather │ mail │ calendar │ ...          │
//! └──────────────────────────────────────────┘
//! ```

pub mod binder;
pub mod client;
pub mod deferred;
pub mod host;
pub mod link;
pub mod multiplexer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod triggers;

#[cfg(test)]
mod testing;

pub use binder::{ExtensionMessage, ProcessBinder};
pub use client::HostClient;
pub use host::HostRuntime;
pub use link::{ExtensionBinder, ExtensionLink, HostCallback};
pub use multiplexer::{BindState, MultiplexerClient, MultiplexerEvent, SocketConnector};
pub use protocol::{ExtensionInfo, Request, Response, SessionInfo, StatusInfo};
pub use server::HostServer;
pub use session::SessionState;
pub use supervisor::ExtensionSupervisor;
pub use triggers::{ContentWatcher, FsContentWatcher, RelayScreenEvents, ScreenEvents};
