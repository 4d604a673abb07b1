//! The status cache: the active extension set and the last payload each active
//! extension published.
//!
//! One [`ExtensionManager`] exists per host process. It is constructed with
//! [`ExtensionManager::init`] and torn down with [`ExtensionManager::shutdown`];
//! clones share the same cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::extension::{
    ExtensionIdentity, ExtensionListing, ExtensionRecord, ProtocolRange, StatusPayload,
};
use crate::notifier::{ChangeEvent, ChangeListener, ListenerId, Notifier, DEFAULT_NOTIFY_CAPACITY};
use crate::registry::PluginRegistry;
use crate::store::PayloadStore;
use crate::user_config::HostConfig;

#[derive(Default)]
struct CacheState {
    /// Ordered, duplicate-free.
    active: Vec<ExtensionIdentity>,
    /// Exactly one record per identity in `active`, and none outside it.
    records: HashMap<ExtensionIdentity, ExtensionRecord>,
}

struct ManagerInner {
    registry: Arc<dyn PluginRegistry>,
    store: Arc<dyn PayloadStore>,
    range: ProtocolRange,
    state: Mutex<CacheState>,
    notifier: Notifier,
}

#[derive(Clone)]
pub struct ExtensionManager {
    inner: Arc<ManagerInner>,
}

impl ExtensionManager {
    /// Restores the persisted active set (or the configured default) and starts
    /// the notifier. Must be called inside a tokio runtime.
    pub fn init(
        config: &HostConfig,
        registry: Arc<dyn PluginRegistry>,
        store: Arc<dyn PayloadStore>,
    ) -> Self {
        let range = config.supervisor.protocol_range();
        let active = match store.load_active() {
            Ok(Some(active)) => active,
            Ok(None) => config.active_extensions.clone(),
            Err(e) => {
                warn!(error = e.slug(), "Failed to load active set, using configured list: {}", e);
                config.active_extensions.clone()
            }
        };

        let manager = Self {
            inner: Arc::new(ManagerInner {
                registry,
                store,
                range,
                state: Mutex::new(CacheState::default()),
                notifier: Notifier::start(DEFAULT_NOTIFY_CAPACITY),
            }),
        };

        let active = dedup_ordered(active);
        {
            let mut state = manager.lock();
            for identity in &active {
                let record = manager.restore_record(identity);
                state.records.insert(identity.clone(), record);
            }
            state.active = active;
        }

        info!(active = manager.active_identities().len(), "Status cache initialized");
        manager
    }

    pub fn shutdown(&self) {
        self.inner.notifier.shutdown();
        if let Err(e) = self.inner.store.sync() {
            warn!(error = e.slug(), "Failed to flush status cache: {}", e);
        }
        debug!("Status cache shut down");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.inner.state.lock().expect("status cache lock poisoned")
    }

    pub fn protocol_range(&self) -> ProtocolRange {
        self.inner.range
    }

    fn listing_for(&self, identity: &ExtensionIdentity) -> ExtensionListing {
        self.inner
            .registry
            .find(identity)
            .unwrap_or_else(|| ExtensionListing::unresolved(identity.clone()))
            .with_range(self.inner.range)
    }

    /// Builds a record for a newly-active identity from persisted state.
    fn restore_record(&self, identity: &ExtensionIdentity) -> ExtensionRecord {
        let latest = match self.inner.store.load_payload(identity) {
            Ok(Some(payload)) => payload,
            Ok(None) => StatusPayload::hidden(),
            Err(e) => {
                warn!(%identity, error = e.slug(), "Degrading persisted payload: {}", e);
                StatusPayload::hidden()
            }
        };
        ExtensionRecord::new(self.listing_for(identity), latest)
    }

    /// Replaces the active set. Returns false, without notifying, when the
    /// ordered set is unchanged.
    pub fn set_active_extensions(&self, identities: Vec<ExtensionIdentity>) -> bool {
        let identities = dedup_ordered(identities);
        let mut state = self.lock();
        if state.active == identities {
            trace!("Active set unchanged");
            return false;
        }

        let keep: HashSet<&ExtensionIdentity> = identities.iter().collect();
        let removed: Vec<ExtensionIdentity> = state
            .active
            .iter()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        for identity in &removed {
            state.records.remove(identity);
            if let Err(e) = self.inner.store.remove_payload(identity) {
                warn!(%identity, error = e.slug(), "Failed to erase persisted payload: {}", e);
            }
        }

        for identity in &identities {
            if !state.records.contains_key(identity) {
                let record = self.restore_record(identity);
                state.records.insert(identity.clone(), record);
            }
        }
        state.active = identities;

        if let Err(e) = self.inner.store.save_active(&state.active) {
            warn!(error = e.slug(), "Failed to persist active set: {}", e);
        }
        info!(
            active = state.active.len(),
            removed = removed.len(),
            "Active extension set changed"
        );
        self.inner.notifier.notify(ChangeEvent::SetChanged);
        true
    }

    /// Stores a payload published by an extension. A `None` payload hides the
    /// extension. Returns whether anything changed.
    pub fn publish(&self, identity: &ExtensionIdentity, payload: Option<StatusPayload>) -> bool {
        let payload = payload.unwrap_or_else(StatusPayload::hidden).cleaned();

        let mut state = self.lock();
        let Some(record) = state.records.get_mut(identity) else {
            trace!(%identity, "Ignoring publish from inactive extension");
            return false;
        };
        if record.latest == payload {
            trace!(%identity, "Ignoring unchanged publish");
            return false;
        }

        // The store only touches memory here; its writer flushes to disk.
        if let Err(e) = self.inner.store.save_payload(identity, &payload) {
            warn!(%identity, error = e.slug(), "Failed to persist payload: {}", e);
        }
        record.latest = payload;
        debug!(%identity, visible = record.latest.visible, "Status updated");
        // Queued under the lock so per-identity events keep publish order.
        self.inner
            .notifier
            .notify(ChangeEvent::StatusChanged(identity.clone()));
        true
    }

    /// Drops active identities the registry no longer lists or whose protocol
    /// version is unsupported. Also refreshes the listings of the rest.
    pub fn cleanup_extensions(&self) -> bool {
        let available: HashMap<ExtensionIdentity, ExtensionListing> = self
            .available_extensions()
            .into_iter()
            .map(|l| (l.identity.clone(), l))
            .collect();

        let current = self.active_identities();
        let retained: Vec<ExtensionIdentity> = current
            .iter()
            .filter(|id| match available.get(id) {
                Some(listing) if listing.compatible => true,
                Some(listing) => {
                    info!(identity = %id, version = listing.protocol_version, "Dropping incompatible extension");
                    false
                }
                None => {
                    info!(identity = %id, "Dropping extension no longer installed");
                    false
                }
            })
            .cloned()
            .collect();

        if retained.len() != current.len() {
            self.set_active_extensions(retained);
            true
        } else {
            self.refresh_listings()
        }
    }

    /// Replaces each record's listing from the registry; notifies a set change
    /// when any listing differs.
    pub fn refresh_listings(&self) -> bool {
        let mut state = self.lock();
        let mut changed = false;
        let identities = state.active.clone();
        for identity in identities {
            let listing = self.listing_for(&identity);
            if let Some(record) = state.records.get_mut(&identity) {
                if record.listing != listing {
                    record.listing = listing;
                    changed = true;
                }
            }
        }
        if changed {
            self.inner.notifier.notify(ChangeEvent::SetChanged);
        }
        changed
    }

    /// Every installed extension, with `compatible` derived for this host.
    pub fn available_extensions(&self) -> Vec<ExtensionListing> {
        self.inner
            .registry
            .available_extensions()
            .into_iter()
            .map(|l| l.with_range(self.inner.range))
            .collect()
    }

    pub fn active_identities(&self) -> Vec<ExtensionIdentity> {
        self.lock().active.clone()
    }

    pub fn is_active(&self, identity: &ExtensionIdentity) -> bool {
        self.lock().records.contains_key(identity)
    }

    /// Records in active-set order.
    pub fn active_records(&self) -> Vec<ExtensionRecord> {
        let state = self.lock();
        state
            .active
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }

    pub fn visible_records(&self) -> Vec<ExtensionRecord> {
        self.active_records()
            .into_iter()
            .filter(ExtensionRecord::is_visible)
            .collect()
    }

    pub fn record(&self, identity: &ExtensionIdentity) -> Option<ExtensionRecord> {
        self.lock().records.get(identity).cloned()
    }

    /// Latest payload of an active identity; `None` if it is not active.
    pub fn status(&self, identity: &ExtensionIdentity) -> Option<StatusPayload> {
        self.lock().records.get(identity).map(|r| r.latest.clone())
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.inner.notifier.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.notifier.remove_listener(id)
    }

    pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<ChangeEvent>) {
        self.inner.notifier.subscribe()
    }
}

fn dedup_ordered(identities: Vec<ExtensionIdentity>) -> Vec<ExtensionIdentity> {
    let mut seen = HashSet::new();
    identities
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
