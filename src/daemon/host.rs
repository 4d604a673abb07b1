//! The assembled host: status cache, supervisor, triggers and the view that
//! multiplexer clients get of them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::binder::ProcessBinder;
use super::protocol::{ExtensionInfo, SessionInfo};
use super::supervisor::ExtensionSupervisor;
use super::triggers::{FsContentWatcher, PeriodicRefresh, RelayScreenEvents};
use crate::clienv;
use crate::extension::{ExtensionIdentity, Operation, Reason, StatusPayload};
use crate::manager::ExtensionManager;
use crate::registry::{ManifestRegistry, PluginRegistry};
use crate::store::JsonFileStore;
use crate::user_config::HostConfig;

/// Identifies one subscribed multiplexer connection.
pub type ClientId = u64;

pub struct HostRuntime {
    config: HostConfig,
    manager: ExtensionManager,
    supervisor: ExtensionSupervisor,
    registry: Arc<dyn PluginRegistry>,
    screen: Arc<RelayScreenEvents>,
    interests: Mutex<HashMap<ClientId, BTreeSet<ExtensionIdentity>>>,
    next_client: AtomicU64,
    periodic: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl HostRuntime {
    /// Builds the production host: manifest registry, JSON cache file,
    /// process binder and filesystem content watcher.
    pub fn from_config(config: HostConfig) -> Self {
        let registry = Arc::new(ManifestRegistry::new(clienv::plugins_dir()));
        let store = Arc::new(JsonFileStore::open(clienv::cache_path()));
        let manager = ExtensionManager::init(&config, registry.clone(), store);

        let binder = Arc::new(ProcessBinder::new(registry.clone(), &config));
        let screen = Arc::new(RelayScreenEvents::new());
        let watcher = Arc::new(FsContentWatcher::new());
        let supervisor = ExtensionSupervisor::new(
            config.supervisor.clone(),
            manager.clone(),
            binder,
            screen.clone(),
            watcher,
        );

        Self::from_parts(config, manager, supervisor, registry, screen)
    }

    pub fn from_parts(
        config: HostConfig,
        manager: ExtensionManager,
        supervisor: ExtensionSupervisor,
        registry: Arc<dyn PluginRegistry>,
        screen: Arc<RelayScreenEvents>,
    ) -> Self {
        Self {
            config,
            manager,
            supervisor,
            registry,
            screen,
            interests: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            periodic: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Merges the configured list ahead of whatever was active last run,
    /// starts the supervisor and the periodic trigger.
    pub fn start(&self) {
        self.manager.cleanup_extensions();

        let mut active = self.config.active_extensions.clone();
        for identity in self.manager.active_identities() {
            if !active.contains(&identity) {
                active.push(identity);
            }
        }
        self.manager.set_active_extensions(active);

        self.supervisor.start();
        let periodic = PeriodicRefresh::new(self.supervisor.clone(), &self.config.triggers);
        let task = tokio::spawn(async move { periodic.run().await });
        *self.periodic.lock().expect("host lock poisoned") = Some(task);

        info!(
            active = self.manager.active_identities().len(),
            "Host started"
        );
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.periodic.lock().expect("host lock poisoned").take() {
            task.abort();
        }
        self.supervisor.shutdown().await;
        self.manager.shutdown();
        info!("Host stopped");
    }

    pub fn manager(&self) -> &ExtensionManager {
        &self.manager
    }

    pub fn supervisor(&self) -> &ExtensionSupervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Whether a client may see `identity`'s payload.
    pub fn is_readable(&self, identity: &ExtensionIdentity, trusted: bool) -> bool {
        if trusted || self.config.force_world_readable {
            return true;
        }
        self.manager
            .record(identity)
            .map(|r| r.listing.world_readable)
            .or_else(|| self.registry.find(identity).map(|l| l.world_readable))
            .unwrap_or(false)
    }

    /// `None` when not active; a hidden payload when the client may not read it.
    pub fn status_for(&self, identity: &ExtensionIdentity, trusted: bool) -> Option<StatusPayload> {
        let status = self.manager.status(identity)?;
        if self.is_readable(identity, trusted) {
            Some(status)
        } else {
            debug!(%identity, "Hiding payload from untrusted client");
            Some(StatusPayload::hidden())
        }
    }

    pub fn list_extensions(&self, world_readable_only: bool) -> Vec<ExtensionInfo> {
        let active: HashSet<ExtensionIdentity> =
            self.manager.active_identities().into_iter().collect();
        self.manager
            .available_extensions()
            .iter()
            .filter(|l| !world_readable_only || l.world_readable || self.config.force_world_readable)
            .map(|l| ExtensionInfo::new(l, active.contains(&l.identity)))
            .collect()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.supervisor
            .sessions_snapshot()
            .into_iter()
            .map(|s| SessionInfo {
                identity: s.identity.to_string(),
                state: s.state.to_string(),
                pending: s.pending as u64,
            })
            .collect()
    }

    /// Collapsed `refresh(MANUAL)`. Only active identities are refreshed;
    /// returns whether anything was dispatched.
    pub fn request_update(&self, identities: Option<Vec<ExtensionIdentity>>) -> bool {
        let active = self.manager.active_identities();
        let targets: Vec<ExtensionIdentity> = match identities {
            Some(wanted) => wanted.into_iter().filter(|i| active.contains(i)).collect(),
            None => active,
        };
        let op = Operation::refresh(Reason::Manual);
        let mut dispatched = false;
        for identity in &targets {
            dispatched |= self.supervisor.dispatch_collapsed(identity, op);
        }
        dispatched
    }

    /// Uncollapsed refresh for one identity, or every active one.
    pub fn update_extensions(&self, identity: Option<ExtensionIdentity>, reason: Reason) -> bool {
        let op = Operation::refresh(reason);
        match identity {
            Some(identity) => self.supervisor.dispatch(&identity, op),
            None => {
                self.supervisor.dispatch_all(op);
                true
            }
        }
    }

    /// Re-reads the registry, drops what is gone or incompatible, and tells
    /// a replaced package's extensions that their settings may have changed.
    pub fn packages_changed(&self, package: Option<&str>) -> bool {
        match self.registry.refresh() {
            Ok(changed) => debug!(changed, "Registry refreshed"),
            Err(e) => warn!(error = e.slug(), "Registry refresh failed: {}", e),
        }
        let changed = self.manager.cleanup_extensions();

        if let Some(package) = package {
            let op = Operation::refresh(Reason::SettingsChanged);
            for identity in self.manager.active_identities() {
                if identity.package() == package {
                    self.supervisor.dispatch(&identity, op);
                }
            }
        }
        changed
    }

    pub fn screen_on(&self) -> bool {
        self.screen.fire()
    }

    pub fn register_client(&self) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        self.interests
            .lock()
            .expect("interest lock poisoned")
            .insert(id, BTreeSet::new());
        id
    }

    /// Replaces a client's interest set and returns the identities it did
    /// not have before.
    pub fn set_interest(
        &self,
        client: ClientId,
        identities: impl IntoIterator<Item = ExtensionIdentity>,
    ) -> Vec<ExtensionIdentity> {
        let wanted: BTreeSet<ExtensionIdentity> = identities.into_iter().collect();
        let added = {
            let mut interests = self.interests.lock().expect("interest lock poisoned");
            let previous = interests.insert(client, wanted.clone()).unwrap_or_default();
            wanted.difference(&previous).cloned().collect()
        };
        self.apply_interests();
        added
    }

    pub fn interest(&self, client: ClientId) -> BTreeSet<ExtensionIdentity> {
        self.interests
            .lock()
            .expect("interest lock poisoned")
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_client(&self, client: ClientId) {
        let removed = self
            .interests
            .lock()
            .expect("interest lock poisoned")
            .remove(&client);
        if removed.is_some_and(|set| !set.is_empty()) {
            self.apply_interests();
        }
    }

    /// Active set = configured list, then the sorted union of client interests.
    fn apply_interests(&self) {
        let union: BTreeSet<ExtensionIdentity> = self
            .interests
            .lock()
            .expect("interest lock poisoned")
            .values()
            .flatten()
            .cloned()
            .collect();
        let mut active = self.config.active_extensions.clone();
        active.extend(union);
        if self.manager.set_active_extensions(active) {
            debug!("Active set follows client interests");
        }
    }
}
