pub mod clienv;
pub mod daemon;
pub mod error;
pub mod extension;
pub mod manager;
pub mod notifier;
pub mod registry;
pub mod store;
pub mod user_config;

pub use error::{HostError, Result};
pub use extension::{ExtensionIdentity, ExtensionListing, Operation, Reason, StatusPayload};
pub use manager::ExtensionManager;
pub use notifier::ChangeEvent;
pub use registry::{ManifestRegistry, PluginRegistry, StaticRegistry};
pub use store::{JsonFileStore, MemoryStore, PayloadStore};
pub use user_config::HostConfig;
