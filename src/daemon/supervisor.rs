//! Creates and destroys sessions as the active set changes and routes
//! dispatches to them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::link::{CallbackEvent, CallbackMessage, ExtensionBinder};
use super::session::{SessionCommand, SessionHandle, SessionParams, SessionState};
use super::triggers::{ContentWatcher, ScreenEvents, TriggerSink};
use crate::error::HostError;
use crate::extension::{ExtensionIdentity, Operation, Reason};
use crate::manager::ExtensionManager;
use crate::notifier::{ChangeEvent, ChangeListener, ListenerId};
use crate::user_config::SupervisorConfig;

const CALLBACK_QUEUE_CAPACITY: usize = 1024;
const SESSION_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub identity: ExtensionIdentity,
    pub state: SessionState,
    pub pending: usize,
}

#[derive(Default)]
struct ScreenOnState {
    union: BTreeSet<ExtensionIdentity>,
    registered: bool,
}

struct SupervisorInner {
    manager: ExtensionManager,
    binder: Arc<dyn ExtensionBinder>,
    screen: Arc<dyn ScreenEvents>,
    watcher: Arc<dyn ContentWatcher>,
    config: SupervisorConfig,
    sessions: Mutex<HashMap<ExtensionIdentity, SessionHandle>>,
    screen_on: Mutex<ScreenOnState>,
    next_session: AtomicU64,
    callbacks: mpsc::Sender<CallbackMessage>,
    callback_worker: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<ListenerId>>,
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.callback_worker.lock() {
            if let Some(worker) = worker.take() {
                worker.abort();
            }
        }
    }
}

#[derive(Clone)]
pub struct ExtensionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ExtensionSupervisor {
    /// Creates the supervisor and its shared callback worker. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: SupervisorConfig,
        manager: ExtensionManager,
        binder: Arc<dyn ExtensionBinder>,
        screen: Arc<dyn ScreenEvents>,
        watcher: Arc<dyn ContentWatcher>,
    ) -> Self {
        let (callbacks, rx) = mpsc::channel(CALLBACK_QUEUE_CAPACITY);
        let inner = Arc::new(SupervisorInner {
            manager,
            binder,
            screen,
            watcher,
            config,
            sessions: Mutex::new(HashMap::new()),
            screen_on: Mutex::new(ScreenOnState::default()),
            next_session: AtomicU64::new(1),
            callbacks,
            callback_worker: Mutex::new(None),
            listener: Mutex::new(None),
        });

        let worker = tokio::spawn(run_callbacks(Arc::downgrade(&inner), rx));
        *inner
            .callback_worker
            .lock()
            .expect("supervisor lock poisoned") = Some(worker);

        Self { inner }
    }

    fn from_weak(weak: &Weak<SupervisorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Reconciles against the current active set and keeps following it.
    pub fn start(&self) {
        self.reconcile(&self.inner.manager.active_identities());
        let listener = Arc::new(ReconcileOnChange(Arc::downgrade(&self.inner)));
        let id = self.inner.manager.add_listener(listener);
        *self.inner.listener.lock().expect("supervisor lock poisoned") = Some(id);
    }

    /// Destroys sessions for identities outside `active` and creates fresh
    /// ones for identities without a session. Idempotent.
    pub fn reconcile(&self, active: &[ExtensionIdentity]) {
        let wanted: HashSet<&ExtensionIdentity> = active.iter().collect();
        let mut incompatible = false;
        let mut removed = Vec::new();

        {
            let mut sessions = self.sessions();
            sessions.retain(|identity, handle| {
                if wanted.contains(identity) && handle.is_live() {
                    return true;
                }
                handle.destroy();
                removed.push(identity.clone());
                false
            });

            for identity in active {
                if sessions.contains_key(identity) {
                    continue;
                }
                match self.inner.binder.resolve(identity) {
                    Ok(()) => {
                        let handle = self.spawn_session(identity, false);
                        sessions.insert(identity.clone(), handle);
                    }
                    Err(e @ HostError::Protocol { .. }) => {
                        warn!(%identity, error = e.slug(), "{}", e);
                        incompatible = true;
                    }
                    Err(e) => {
                        debug!(%identity, error = e.slug(), "Not binding extension: {}", e);
                    }
                }
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Destroyed sessions for inactive extensions");
            let mut screen_on = self.screen_on();
            for identity in &removed {
                screen_on.union.remove(identity);
            }
            self.sync_screen_listener(&mut screen_on);
        }
        if incompatible {
            self.inner.manager.cleanup_extensions();
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<ExtensionIdentity, SessionHandle>> {
        self.inner.sessions.lock().expect("session table lock poisoned")
    }

    fn screen_on(&self) -> std::sync::MutexGuard<'_, ScreenOnState> {
        self.inner.screen_on.lock().expect("screen-on lock poisoned")
    }

    fn spawn_session(&self, identity: &ExtensionIdentity, reconnect: bool) -> SessionHandle {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        trace!(%identity, session = id, reconnect, "Creating session");
        SessionHandle::spawn(SessionParams {
            id,
            identity: identity.clone(),
            binder: self.inner.binder.clone(),
            callbacks: self.inner.callbacks.clone(),
            deferred_capacity: self.inner.config.max_deferred_ops,
            collapse_window: self.inner.config.collapse_window(),
            reconnect,
        })
    }

    /// Routes an operation to the identity's session, creating one (as a
    /// reconnect) if needed. Returns false when the operation was dropped.
    pub fn dispatch(&self, identity: &ExtensionIdentity, op: Operation) -> bool {
        self.route(identity, op, false)
    }

    /// Like [`dispatch`](Self::dispatch), but repeated requests for the same
    /// reason within the collapse window run once.
    pub fn dispatch_collapsed(&self, identity: &ExtensionIdentity, op: Operation) -> bool {
        self.route(identity, op, true)
    }

    pub fn dispatch_all(&self, op: Operation) {
        for identity in self.inner.manager.active_identities() {
            self.dispatch(&identity, op);
        }
    }

    pub fn dispatch_all_collapsed(&self, op: Operation) {
        for identity in self.inner.manager.active_identities() {
            self.dispatch_collapsed(&identity, op);
        }
    }

    fn route(&self, identity: &ExtensionIdentity, op: Operation, collapse: bool) -> bool {
        let mut incompatible = false;
        let routed = {
            let mut sessions = self.sessions();
            if let Some(handle) = sessions.get(identity).filter(|h| h.is_live()) {
                handle.execute(op, collapse)
            } else {
                match self.inner.binder.resolve(identity) {
                    Ok(()) => {
                        let handle = self.spawn_session(identity, true);
                        let queued = handle.execute(op, collapse);
                        sessions.insert(identity.clone(), handle);
                        queued
                    }
                    Err(e) => {
                        warn!(%identity, %op, error = e.slug(), "Dropping operation: {}", e);
                        incompatible = matches!(e, HostError::Protocol { .. });
                        false
                    }
                }
            }
        };
        if incompatible {
            self.inner.manager.cleanup_extensions();
        }
        routed
    }

    /// Handles a platform screen-on event.
    pub fn on_screen_on(&self) {
        let targets: Vec<ExtensionIdentity> = self.screen_on().union.iter().cloned().collect();
        debug!(count = targets.len(), "Screen on");
        for identity in targets {
            self.dispatch(&identity, Operation::refresh(Reason::ScreenOn));
        }
    }

    pub fn screen_on_identities(&self) -> Vec<ExtensionIdentity> {
        self.screen_on().union.iter().cloned().collect()
    }

    fn set_screen_on(&self, identity: &ExtensionIdentity, enabled: bool) {
        let mut screen_on = self.screen_on();
        let changed = if enabled {
            screen_on.union.insert(identity.clone())
        } else {
            screen_on.union.remove(identity)
        };
        if changed {
            debug!(%identity, enabled, "Screen-on trigger changed");
            self.sync_screen_listener(&mut screen_on);
        }
    }

    /// Keeps exactly one platform listener while the union is non-empty.
    fn sync_screen_listener(&self, screen_on: &mut ScreenOnState) {
        if !screen_on.union.is_empty() && !screen_on.registered {
            let weak = Arc::downgrade(&self.inner);
            let sink: TriggerSink = Arc::new(move || {
                if let Some(supervisor) = ExtensionSupervisor::from_weak(&weak) {
                    supervisor.on_screen_on();
                }
            });
            self.inner.screen.register(sink);
            screen_on.registered = true;
        } else if screen_on.union.is_empty() && screen_on.registered {
            self.inner.screen.unregister();
            screen_on.registered = false;
        }
    }

    fn watch_content(&self, identity: &ExtensionIdentity, session: u64, uris: Vec<String>) {
        let mut subscriptions = Vec::with_capacity(uris.len());
        for uri in uris {
            let weak = Arc::downgrade(&self.inner);
            let owner = identity.clone();
            let sink: TriggerSink = Arc::new(move || {
                if let Some(supervisor) = ExtensionSupervisor::from_weak(&weak) {
                    supervisor.dispatch_collapsed(&owner, Operation::refresh(Reason::ContentChanged));
                }
            });
            match self.inner.watcher.watch(&uri, sink) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => warn!(%identity, %uri, error = e.slug(), "Cannot watch content: {}", e),
            }
        }

        let sessions = self.sessions();
        if let Some(handle) = sessions.get(identity).filter(|h| h.id() == session) {
            handle.send(SessionCommand::SetContentTriggers(subscriptions));
        }
    }

    /// Applies one extension-to-host message if its session is still live.
    fn handle_callback(&self, message: CallbackMessage) {
        let CallbackMessage {
            identity,
            session,
            link,
            event,
        } = message;

        let live = self
            .sessions()
            .get(&identity)
            .is_some_and(|h| h.id() == session && h.is_live());
        if !live {
            trace!(%identity, session, "Dropping callback from stale session");
            return;
        }

        match event {
            CallbackEvent::Publish(payload) => {
                self.inner.manager.publish(&identity, payload);
            }
            CallbackEvent::WatchContent(uris) => self.watch_content(&identity, session, uris),
            CallbackEvent::ScreenOn(enabled) => self.set_screen_on(&identity, enabled),
            CallbackEvent::Lost => {
                if let Some(handle) = self.sessions().get(&identity) {
                    handle.send(SessionCommand::LinkLost { link_gen: link });
                }
            }
        }
    }

    pub fn session_state(&self, identity: &ExtensionIdentity) -> Option<SessionState> {
        self.sessions().get(identity).map(SessionHandle::state)
    }

    pub fn sessions_snapshot(&self) -> Vec<SessionSnapshot> {
        let mut list: Vec<_> = self
            .sessions()
            .values()
            .map(|h| SessionSnapshot {
                identity: h.identity().clone(),
                state: h.state(),
                pending: h.pending(),
            })
            .collect();
        list.sort_by(|a, b| a.identity.cmp(&b.identity));
        list
    }

    /// Destroys every session and stops following the cache.
    pub async fn shutdown(&self) {
        if let Some(id) = self
            .inner
            .listener
            .lock()
            .expect("supervisor lock poisoned")
            .take()
        {
            self.inner.manager.remove_listener(id);
        }

        let handles: Vec<SessionHandle> = self.sessions().drain().map(|(_, h)| h).collect();
        info!(count = handles.len(), "Stopping extension sessions");
        for handle in handles {
            handle.shutdown(SESSION_SHUTDOWN_GRACE).await;
        }

        let mut screen_on = self.screen_on();
        screen_on.union.clear();
        self.sync_screen_listener(&mut screen_on);
    }
}

async fn run_callbacks(weak: Weak<SupervisorInner>, mut rx: mpsc::Receiver<CallbackMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(supervisor) = ExtensionSupervisor::from_weak(&weak) else {
            break;
        };
        supervisor.handle_callback(message);
    }
    trace!("Callback worker finished");
}

struct ReconcileOnChange(Weak<SupervisorInner>);

impl ChangeListener for ReconcileOnChange {
    fn on_change(&self, event: &ChangeEvent) {
        if *event != ChangeEvent::SetChanged {
            return;
        }
        if let Some(supervisor) = ExtensionSupervisor::from_weak(&self.0) {
            let active = supervisor.inner.manager.active_identities();
            supervisor.reconcile(&active);
        }
    }
}
