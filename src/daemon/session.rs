//! One live or pending connection to a single extension.
//!
//! Each session is an actor: a dedicated task owns the link, the deferred
//! queue and the content-trigger subscriptions, so queue order needs no lock.
//! A [`SessionHandle`] is the only way in.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::deferred::{Deferred, DeferredQueue};
use super::link::{CallbackMessage, ExtensionBinder, ExtensionLink, HostCallback, SessionId};
use super::triggers::TriggerSubscription;
use crate::error::Result;
use crate::extension::{ExtensionIdentity, Operation, Reason};

const COMMAND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    /// Terminal.
    Destroyed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum SessionCommand {
    Execute {
        op: Operation,
        collapse: bool,
    },
    Bound {
        link_gen: u64,
        reconnect: bool,
        result: Result<Box<dyn ExtensionLink>>,
    },
    LinkLost {
        link_gen: u64,
    },
    SetContentTriggers(Vec<TriggerSubscription>),
}

pub struct SessionParams {
    pub id: SessionId,
    pub identity: ExtensionIdentity,
    pub binder: Arc<dyn ExtensionBinder>,
    pub callbacks: mpsc::Sender<CallbackMessage>,
    pub deferred_capacity: usize,
    pub collapse_window: Duration,
    /// False for a fresh connect, which also queues `refresh(INITIAL)`.
    pub reconnect: bool,
}

pub struct SessionHandle {
    id: SessionId,
    identity: ExtensionIdentity,
    tx: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    pending: Arc<AtomicUsize>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Starts the session worker, which connects right away.
    pub fn spawn(params: SessionParams) -> Self {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (state_tx, state) = watch::channel(SessionState::Disconnected);
        let (cancel, cancel_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = SessionWorker {
            id: params.id,
            identity: params.identity.clone(),
            binder: params.binder,
            callbacks: params.callbacks,
            state: state_tx,
            pending: pending.clone(),
            commands,
            self_tx: tx.downgrade(),
            cancel: cancel_rx,
            cancelled: false,
            link: None,
            link_gen: 0,
            deferred: DeferredQueue::new(params.deferred_capacity),
            collapse_window: params.collapse_window,
            collapsing: Vec::new(),
            triggers: Vec::new(),
        };
        let task = tokio::spawn(worker.run(params.reconnect));

        Self {
            id: params.id,
            identity: params.identity,
            tx,
            state,
            pending,
            cancel,
            task,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &ExtensionIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() != SessionState::Destroyed && !*self.cancel.borrow()
    }

    /// Operations waiting in the deferred queue.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Queues an operation without waiting. With `collapse`, a later request
    /// for the same reason inside the collapse window replaces this one.
    pub fn execute(&self, op: Operation, collapse: bool) -> bool {
        self.send(SessionCommand::Execute { op, collapse })
    }

    pub(crate) fn send(&self, command: SessionCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(identity = %self.identity, "Session backlog full, dropping command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(identity = %self.identity, "Session gone, dropping command");
                false
            }
        }
    }

    /// Cancels pending work and tears the connection down.
    pub fn destroy(&self) {
        let _ = self.cancel.send(true);
    }

    /// Destroys the session and waits for the worker to finish.
    pub async fn shutdown(self, grace: Duration) {
        self.destroy();
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(identity = %self.identity, "Session did not stop in time, aborting");
            task.abort();
        }
    }
}

enum CallOutcome {
    Done,
    Failed,
    Cancelled,
}

struct SessionWorker {
    id: SessionId,
    identity: ExtensionIdentity,
    binder: Arc<dyn ExtensionBinder>,
    callbacks: mpsc::Sender<CallbackMessage>,
    state: watch::Sender<SessionState>,
    pending: Arc<AtomicUsize>,
    commands: mpsc::Receiver<SessionCommand>,
    self_tx: mpsc::WeakSender<SessionCommand>,
    cancel: watch::Receiver<bool>,
    cancelled: bool,
    link: Option<Box<dyn ExtensionLink>>,
    link_gen: u64,
    deferred: DeferredQueue,
    collapse_window: Duration,
    /// At most one entry per reason, each with its own deadline.
    collapsing: Vec<(Operation, Instant)>,
    triggers: Vec<TriggerSubscription>,
}

impl SessionWorker {
    async fn run(mut self, reconnect: bool) {
        debug!(identity = %self.identity, session = self.id, reconnect, "Session started");
        self.connect(reconnect);

        while !self.cancelled {
            let deadline = self.collapsing.iter().map(|(_, at)| *at).min();
            tokio::select! {
                biased;
                _ = self.cancel.changed() => self.cancelled = true,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_collapsed().await;
                }
            }
        }

        self.teardown().await;
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn sync_pending(&self) {
        self.pending.store(self.deferred.len(), Ordering::SeqCst);
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Execute { op, collapse } => match op.reason() {
                Some(reason) if collapse => {
                    self.collapsing.retain(|(pending, _)| pending.reason() != Some(reason));
                    self.collapsing
                        .push((op, Instant::now() + self.collapse_window));
                }
                _ => self.execute(op, false).await,
            },
            SessionCommand::Bound {
                link_gen,
                reconnect,
                result,
            } => {
                if link_gen != self.link_gen || self.current_state() != SessionState::Connecting {
                    if let Ok(mut stale) = result {
                        stale.close().await;
                    }
                    return;
                }
                match result {
                    Ok(link) => self.on_bound(link, reconnect).await,
                    Err(e) => {
                        warn!(identity = %self.identity, error = e.slug(), "Connect failed: {}", e);
                        self.set_state(SessionState::Disconnected);
                    }
                }
            }
            SessionCommand::LinkLost { link_gen } => {
                if link_gen == self.link_gen && self.link.is_some() {
                    info!(identity = %self.identity, "Extension connection lost");
                    self.disconnect();
                }
            }
            SessionCommand::SetContentTriggers(triggers) => {
                if self.current_state() == SessionState::Ready {
                    debug!(identity = %self.identity, count = triggers.len(), "Content triggers replaced");
                    self.triggers = triggers;
                }
            }
        }
    }

    /// Starts binding in the background; the result comes back as `Bound`.
    fn connect(&mut self, reconnect: bool) {
        self.link_gen += 1;
        self.set_state(SessionState::Connecting);

        let link_gen = self.link_gen;
        let identity = self.identity.clone();
        let binder = self.binder.clone();
        let callback = HostCallback::new(
            identity.clone(),
            self.id,
            link_gen,
            self.callbacks.clone(),
        );
        let tx = self.self_tx.clone();

        tokio::spawn(async move {
            let result = binder.bind(&identity, callback).await;
            let command = SessionCommand::Bound {
                link_gen,
                reconnect,
                result,
            };
            let returned = match tx.upgrade() {
                Some(tx) => tx.send(command).await.err().map(|e| e.0),
                None => Some(command),
            };
            if let Some(SessionCommand::Bound {
                result: Ok(mut link),
                ..
            }) = returned
            {
                link.close().await;
            }
        });
    }

    async fn on_bound(&mut self, link: Box<dyn ExtensionLink>, reconnect: bool) {
        info!(identity = %self.identity, reconnect, "Extension connected");
        self.link = Some(link);
        self.set_state(SessionState::Ready);

        match self.call(Operation::initialize(reconnect)).await {
            CallOutcome::Done => {}
            CallOutcome::Failed => return self.disconnect(),
            CallOutcome::Cancelled => return,
        }

        if !reconnect {
            let initial = Operation::refresh(Reason::Initial);
            match self.call(initial).await {
                CallOutcome::Done => {}
                CallOutcome::Failed => {
                    self.deferred.push_front(Deferred {
                        op: initial,
                        collapsible: false,
                    });
                    self.sync_pending();
                    return self.disconnect();
                }
                CallOutcome::Cancelled => return,
            }
        }

        self.drain().await;
    }

    /// Runs the deferred queue in FIFO order, skipping repeated collapsible
    /// reasons.
    async fn drain(&mut self) {
        let mut collapsed: HashSet<Reason> = HashSet::new();
        while let Some(entry) = self.deferred.pop_front() {
            self.sync_pending();
            if entry.collapsible {
                if let Some(reason) = entry.op.reason() {
                    if !collapsed.insert(reason) {
                        trace!(identity = %self.identity, op = %entry.op, "Skipping collapsed operation");
                        continue;
                    }
                }
            }
            match self.call(entry.op).await {
                CallOutcome::Done => {}
                CallOutcome::Failed => {
                    self.deferred.push_front(entry);
                    self.sync_pending();
                    return self.disconnect();
                }
                CallOutcome::Cancelled => return,
            }
        }
    }

    async fn execute(&mut self, op: Operation, collapsible: bool) {
        match self.current_state() {
            SessionState::Ready => match self.call(op).await {
                CallOutcome::Done | CallOutcome::Cancelled => {}
                CallOutcome::Failed => {
                    self.defer(op, collapsible);
                    self.disconnect();
                }
            },
            SessionState::Connecting => self.defer(op, collapsible),
            SessionState::Disconnected => {
                self.defer(op, collapsible);
                self.connect(true);
            }
            SessionState::Destroyed => {}
        }
    }

    fn defer(&mut self, op: Operation, collapsible: bool) {
        trace!(identity = %self.identity, %op, "Deferring operation");
        self.deferred.push(Deferred { op, collapsible });
        self.sync_pending();
    }

    async fn fire_collapsed(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.collapsing)
            .into_iter()
            .partition(|(_, at)| *at <= now);
        self.collapsing = waiting;
        for (op, _) in due {
            self.execute(op, true).await;
            if self.cancelled {
                return;
            }
        }
    }

    async fn call(&mut self, op: Operation) -> CallOutcome {
        let Some(link) = self.link.as_mut() else {
            return CallOutcome::Failed;
        };
        trace!(identity = %self.identity, %op, "Executing operation");
        tokio::select! {
            biased;
            _ = self.cancel.changed() => {
                self.cancelled = true;
                CallOutcome::Cancelled
            }
            result = link.call(&op) => match result {
                Ok(()) => CallOutcome::Done,
                Err(e) => {
                    warn!(identity = %self.identity, %op, error = e.slug(), "Operation failed: {}", e);
                    CallOutcome::Failed
                }
            }
        }
    }

    /// Drops triggers and the link; the deferred queue survives.
    fn disconnect(&mut self) {
        self.triggers.clear();
        if let Some(mut link) = self.link.take() {
            tokio::spawn(async move { link.close().await });
        }
        self.set_state(SessionState::Disconnected);
    }

    async fn teardown(&mut self) {
        self.collapsing.clear();
        self.deferred.clear();
        self.sync_pending();
        self.triggers.clear();
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.set_state(SessionState::Destroyed);
        debug!(identity = %self.identity, session = self.id, "Session destroyed");
    }
}
