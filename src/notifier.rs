//! Change fan-out for the status cache.
//!
//! Events go through one bounded channel into a single delivery task, so every
//! listener sees the same order and never two events at once. Events queued
//! together are coalesced; if the channel fills up, the backlog collapses into
//! one [`ChangeEvent::SetChanged`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::extension::ExtensionIdentity;

pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    /// The active set or listings changed; consumers should relist everything.
    SetChanged,
    /// One identity published a new payload.
    StatusChanged(ExtensionIdentity),
}

impl ChangeEvent {
    /// `None` for a set change.
    pub fn identity(&self) -> Option<&ExtensionIdentity> {
        match self {
            ChangeEvent::SetChanged => None,
            ChangeEvent::StatusChanged(id) => Some(id),
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEvent::SetChanged => f.write_str("set-changed"),
            ChangeEvent::StatusChanged(id) => write!(f, "status-changed({id})"),
        }
    }
}

/// Receives cache changes on the delivery task. Must not block.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ChannelListener(mpsc::UnboundedSender<ChangeEvent>);

impl ChangeListener for ChannelListener {
    fn on_change(&self, event: &ChangeEvent) {
        let _ = self.0.send(event.clone());
    }
}

type ListenerList = Arc<RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>>;

pub struct Notifier {
    tx: mpsc::Sender<ChangeEvent>,
    overflow: Arc<AtomicBool>,
    listeners: ListenerList,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    /// Starts the delivery task on the current tokio runtime.
    pub fn start(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let overflow = Arc::new(AtomicBool::new(false));
        let listeners: ListenerList = Arc::new(RwLock::new(Vec::new()));

        let task = tokio::spawn(deliver(rx, overflow.clone(), listeners.clone()));

        Self {
            tx,
            overflow,
            listeners,
            next_id: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
        }
    }

    /// Queues an event without waiting.
    pub fn notify(&self, event: ChangeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(%event, "Notification queue full, coalescing into set change");
                self.overflow.store(true, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Notifier stopped, dropping event");
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().expect("listener lock poisoned");
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Registers a listener that forwards events into a channel.
    pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_listener(Arc::new(ChannelListener(tx)));
        (id, rx)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("listener lock poisoned").len()
    }

    /// Stops delivery; queued events are discarded.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().expect("notifier lock poisoned").take() {
            task.abort();
        }
        self.listeners.write().expect("listener lock poisoned").clear();
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn deliver(
    mut rx: mpsc::Receiver<ChangeEvent>,
    overflow: Arc<AtomicBool>,
    listeners: ListenerList,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
        }
        if overflow.swap(false, Ordering::SeqCst) {
            batch.push(ChangeEvent::SetChanged);
        }

        let batch = coalesce(batch);
        let snapshot: Vec<_> = listeners
            .read()
            .expect("listener lock poisoned")
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for event in &batch {
            trace!(%event, listeners = snapshot.len(), "Delivering change");
            for listener in &snapshot {
                listener.on_change(event);
            }
        }
    }
    trace!("Notifier delivery task finished");
}

/// Keeps only the last occurrence of each event in the batch.
fn coalesce(batch: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut out: Vec<ChangeEvent> = Vec::with_capacity(batch.len());
    for event in batch.into_iter().rev() {
        if !out.contains(&event) {
            out.push(event);
        }
    }
    out.reverse();
    out
}
