//! In-process fakes for supervisor, host and server tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::link::{ExtensionBinder, ExtensionLink, HostCallback};
use super::supervisor::ExtensionSupervisor;
use super::triggers::{ContentWatcher, RelayScreenEvents, TriggerSink, TriggerSubscription};
use crate::error::{HostError, Result};
use crate::extension::{ExtensionIdentity, ExtensionListing, Operation};
use crate::manager::ExtensionManager;
use crate::registry::StaticRegistry;
use crate::store::MemoryStore;
use crate::user_config::{HostConfig, SupervisorConfig};

pub fn id(name: &str) -> ExtensionIdentity {
    ExtensionIdentity::new("pkg", name)
}

/// Polls `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct BinderState {
    known: HashSet<ExtensionIdentity>,
    incompatible: HashSet<ExtensionIdentity>,
    refused: HashSet<ExtensionIdentity>,
    calls: HashMap<ExtensionIdentity, Vec<Operation>>,
    fail_next: HashMap<ExtensionIdentity, Operation>,
    callbacks: HashMap<ExtensionIdentity, HostCallback>,
    binds: HashMap<ExtensionIdentity, usize>,
}

/// Binder whose links record successful calls.
pub struct FakeBinder {
    state: Arc<Mutex<BinderState>>,
    closes: Arc<AtomicUsize>,
    hold: watch::Sender<bool>,
}

impl FakeBinder {
    pub fn new(known: impl IntoIterator<Item = ExtensionIdentity>) -> Self {
        let state = BinderState {
            known: known.into_iter().collect(),
            ..BinderState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            closes: Arc::new(AtomicUsize::new(0)),
            hold: watch::channel(false).0,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BinderState> {
        self.state.lock().expect("fake binder lock poisoned")
    }

    /// While held, binds stay pending.
    pub fn hold_binds(&self, hold: bool) {
        self.hold.send_replace(hold);
    }

    pub fn fail_next_call(&self, identity: &ExtensionIdentity, op: Operation) {
        self.state().fail_next.insert(identity.clone(), op);
    }

    pub fn refuse(&self, identity: &ExtensionIdentity) {
        self.state().refused.insert(identity.clone());
    }

    pub fn incompatible(&self, identity: &ExtensionIdentity) {
        self.state().incompatible.insert(identity.clone());
    }

    pub fn calls_for(&self, identity: &ExtensionIdentity) -> Vec<Operation> {
        self.state().calls.get(identity).cloned().unwrap_or_default()
    }

    /// Callback handed to the most recent bind of `identity`.
    pub fn callback(&self, identity: &ExtensionIdentity) -> Option<HostCallback> {
        self.state().callbacks.get(identity).cloned()
    }

    pub fn bind_count(&self, identity: &ExtensionIdentity) -> usize {
        self.state().binds.get(identity).copied().unwrap_or(0)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtensionBinder for FakeBinder {
    fn resolve(&self, identity: &ExtensionIdentity) -> Result<()> {
        let state = self.state();
        if state.incompatible.contains(identity) {
            return Err(HostError::Protocol {
                identity: identity.to_string(),
                version: 99,
            });
        }
        if !state.known.contains(identity) {
            return Err(HostError::connect(identity, "not installed"));
        }
        Ok(())
    }

    async fn bind(
        &self,
        identity: &ExtensionIdentity,
        callback: HostCallback,
    ) -> Result<Box<dyn ExtensionLink>> {
        let mut held = self.hold.subscribe();
        let _ = held.wait_for(|hold| !*hold).await;

        let mut state = self.state();
        if state.refused.contains(identity) {
            return Err(HostError::connect(identity, "refused"));
        }
        *state.binds.entry(identity.clone()).or_default() += 1;
        state.callbacks.insert(identity.clone(), callback);
        Ok(Box::new(FakeLink {
            identity: identity.clone(),
            state: self.state.clone(),
            closes: self.closes.clone(),
        }))
    }
}

struct FakeLink {
    identity: ExtensionIdentity,
    state: Arc<Mutex<BinderState>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ExtensionLink for FakeLink {
    async fn call(&mut self, op: &Operation) -> Result<()> {
        let mut state = self.state.lock().expect("fake binder lock poisoned");
        if state.fail_next.get(&self.identity) == Some(op) {
            state.fail_next.remove(&self.identity);
            return Err(HostError::transport(&self.identity, "broken pipe"));
        }
        state
            .calls
            .entry(self.identity.clone())
            .or_default()
            .push(*op);
        Ok(())
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Content watcher fired by hand.
#[derive(Default)]
pub struct FakeWatcher {
    sinks: Arc<Mutex<HashMap<String, TriggerSink>>>,
}

impl FakeWatcher {
    pub fn is_watching(&self, uri: &str) -> bool {
        self.sinks
            .lock()
            .expect("fake watcher lock poisoned")
            .contains_key(uri)
    }

    pub fn fire(&self, uri: &str) -> bool {
        let sink = self
            .sinks
            .lock()
            .expect("fake watcher lock poisoned")
            .get(uri)
            .cloned();
        match sink {
            Some(sink) => {
                sink();
                true
            }
            None => false,
        }
    }
}

impl ContentWatcher for FakeWatcher {
    fn watch(&self, uri: &str, sink: TriggerSink) -> Result<TriggerSubscription> {
        self.sinks
            .lock()
            .expect("fake watcher lock poisoned")
            .insert(uri.to_string(), sink);
        let sinks = self.sinks.clone();
        let key = uri.to_string();
        Ok(TriggerSubscription::new(uri, move || {
            sinks
                .lock()
                .expect("fake watcher lock poisoned")
                .remove(&key);
        }))
    }
}

pub struct Harness {
    pub manager: ExtensionManager,
    pub supervisor: ExtensionSupervisor,
    pub registry: Arc<StaticRegistry>,
    pub store: Arc<MemoryStore>,
    pub binder: Arc<FakeBinder>,
    pub screen: Arc<RelayScreenEvents>,
    pub watcher: Arc<FakeWatcher>,
}

/// Wires a manager and supervisor over fakes. Each name becomes an installed
/// extension `pkg/<name>` speaking protocol 1.
pub fn harness(names: &[&str]) -> Harness {
    harness_with(names, HostConfig::default())
}

pub fn harness_with(names: &[&str], config: HostConfig) -> Harness {
    let identities: Vec<ExtensionIdentity> = names.iter().map(|n| id(n)).collect();
    let registry = Arc::new(StaticRegistry::new(
        identities
            .iter()
            .map(|i| ExtensionListing::new(i.clone(), 1).title(i.component()))
            .collect(),
    ));
    let store = Arc::new(MemoryStore::new());
    let manager = ExtensionManager::init(&config, registry.clone(), store.clone());

    let binder = Arc::new(FakeBinder::new(identities));
    let screen = Arc::new(RelayScreenEvents::new());
    let watcher = Arc::new(FakeWatcher::default());
    let supervisor_config = SupervisorConfig {
        collapse_window_ms: 30,
        ..config.supervisor.clone()
    };
    let supervisor = ExtensionSupervisor::new(
        supervisor_config,
        manager.clone(),
        binder.clone(),
        screen.clone(),
        watcher.clone(),
    );

    Harness {
        manager,
        supervisor,
        registry,
        store,
        binder,
        screen,
        watcher,
    }
}
