//! Consumer side of the host's multiplexer service.
//!
//! A [`MultiplexerClient`] keeps one subscription open to the host, replays
//! its interest set on every bind, caches what the host streams back, and
//! re-binds after a fixed delay when the host goes away. Host verification
//! runs before every bind and fails closed.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::client::{connect_stream, unexpected, HostClient, HostStream};
use super::protocol::{MessageFrame, Request, Response};
use crate::clienv;
use crate::error::{HostError, Result};
use crate::extension::{ExtensionIdentity, ExtensionListing, StatusPayload};
use crate::user_config::MultiplexerConfig;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Binding,
    Bound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplexerEvent {
    Bound,
    /// The host went away; the local cache has been cleared.
    Lost,
    ExtensionsChanged,
    StatusChanged(ExtensionIdentity),
}

/// How a multiplexer client reaches the host.
#[async_trait]
pub trait HostConnector: Send + Sync {
    /// Confirms the host service may be trusted. `HostError::Untrusted` is
    /// final; any other error is retried.
    async fn verify(&self) -> Result<()>;

    async fn request(&self, request: Request) -> Result<Response>;

    /// Opens a subscription carrying the given interest set.
    async fn subscribe(&self, identities: Vec<String>) -> Result<Box<dyn HostConnection>>;
}

/// An open subscription.
#[async_trait]
pub trait HostConnection: Send {
    async fn send(&mut self, request: &Request) -> Result<()>;

    /// Next frame from the host; `None` once it closed the connection.
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Result<Option<Response>>;
}

/// Connector for the local host socket. The socket must be owned by the
/// current user or root unless debug hosts are trusted.
pub struct SocketConnector {
    client: HostClient,
    trust_debug_hosts: bool,
}

impl SocketConnector {
    pub fn new(socket_path: impl Into<PathBuf>, config: &MultiplexerConfig) -> Self {
        Self {
            client: HostClient::new(socket_path),
            trust_debug_hosts: config.trust_debug_hosts || clienv::debug_mode(),
        }
    }
}

#[async_trait]
impl HostConnector for SocketConnector {
    async fn verify(&self) -> Result<()> {
        let path = self.client.socket_path();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| HostError::connect(path.display(), e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let own = unsafe { libc::geteuid() };
            if meta.uid() == own || meta.uid() == 0 {
                return Ok(());
            }
            if self.trust_debug_hosts {
                warn!(uid = meta.uid(), "Trusting host socket owned by another user");
                return Ok(());
            }
            Err(HostError::Untrusted(format!(
                "{} is owned by uid {}",
                path.display(),
                meta.uid()
            )))
        }

        #[cfg(not(unix))]
        {
            let _ = meta;
            if self.trust_debug_hosts {
                return Ok(());
            }
            Err(HostError::Untrusted("host ownership cannot be verified".into()))
        }
    }

    async fn request(&self, request: Request) -> Result<Response> {
        self.client.request(&request).await
    }

    async fn subscribe(&self, identities: Vec<String>) -> Result<Box<dyn HostConnection>> {
        let stream = connect_stream(self.client.socket_path()).await?;
        let mut connection = SocketConnection::new(stream);
        connection.send(&Request::Subscribe { identities }).await?;
        Ok(Box::new(connection))
    }
}

struct SocketConnection {
    writer: tokio::io::WriteHalf<HostStream>,
    frames: mpsc::Receiver<Result<Response>>,
    reader: JoinHandle<()>,
}

impl SocketConnection {
    fn new(stream: HostStream) -> Self {
        let (mut reader, writer) = tokio::io::split(stream);
        let (tx, frames) = mpsc::channel(32);
        let reader = tokio::spawn(async move {
            loop {
                match MessageFrame::read_response(&mut reader).await {
                    Ok(Some(response)) => {
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        Self {
            writer,
            frames,
            reader,
        }
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl HostConnection for SocketConnection {
    async fn send(&mut self, request: &Request) -> Result<()> {
        MessageFrame::write_request(&mut self.writer, request).await
    }

    async fn recv(&mut self) -> Result<Option<Response>> {
        self.frames.recv().await.transpose()
    }
}

#[derive(Default)]
struct MuxCache {
    extensions: Vec<ExtensionListing>,
    trusted: bool,
    statuses: HashMap<ExtensionIdentity, StatusPayload>,
}

type SettingsQuery = (ExtensionIdentity, oneshot::Sender<Result<String>>);

struct MuxShared {
    connector: Arc<dyn HostConnector>,
    reconnect_delay: Duration,
    state: watch::Sender<BindState>,
    interest: watch::Sender<BTreeSet<ExtensionIdentity>>,
    cache: Mutex<MuxCache>,
    events: broadcast::Sender<MultiplexerEvent>,
}

impl MuxShared {
    fn cache(&self) -> std::sync::MutexGuard<'_, MuxCache> {
        self.cache.lock().expect("multiplexer cache lock poisoned")
    }

    fn set_state(&self, state: BindState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: MultiplexerEvent) {
        let _ = self.events.send(event);
    }

    fn interest_list(&self) -> Vec<String> {
        self.interest.borrow().iter().map(|i| i.to_string()).collect()
    }

    async fn run(self: Arc<Self>, mut queries: mpsc::UnboundedReceiver<SettingsQuery>) {
        loop {
            self.set_state(BindState::Binding);
            // Subscribed before the set is read, so changes made while binding
            // are still pending when the pump starts.
            let mut interest = self.interest.subscribe();
            match self.bind(&mut interest).await {
                Ok(connection) => {
                    info!("Bound to host");
                    self.set_state(BindState::Bound);
                    self.emit(MultiplexerEvent::Bound);
                    self.emit(MultiplexerEvent::ExtensionsChanged);

                    self.pump(connection, &mut interest, &mut queries).await;

                    *self.cache() = MuxCache::default();
                    self.set_state(BindState::Unbound);
                    self.emit(MultiplexerEvent::Lost);
                    info!("Host connection lost");
                }
                Err(HostError::Untrusted(reason)) => {
                    error!("Refusing to bind to host: {}", reason);
                    self.set_state(BindState::Unbound);
                    return;
                }
                Err(e) => {
                    debug!(error = e.slug(), "Bind failed: {}", e);
                    self.set_state(BindState::Unbound);
                }
            }
            trace!("Retrying bind in {:?}", self.reconnect_delay);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn bind(
        &self,
        interest: &mut watch::Receiver<BTreeSet<ExtensionIdentity>>,
    ) -> Result<Box<dyn HostConnection>> {
        self.connector.verify().await?;
        let identities: Vec<String> = interest
            .borrow_and_update()
            .iter()
            .map(|i| i.to_string())
            .collect();
        let connection = self.connector.subscribe(identities).await?;

        let request = Request::ListExtensions {
            world_readable_only: false,
        };
        match self.connector.request(request).await? {
            Response::Extensions { list, trusted } => {
                let mut cache = self.cache();
                cache.extensions = listings(&list);
                cache.trusted = trusted;
            }
            other => return Err(unexpected(other)),
        }
        Ok(connection)
    }

    async fn pump(
        &self,
        mut connection: Box<dyn HostConnection>,
        interest: &mut watch::Receiver<BTreeSet<ExtensionIdentity>>,
        queries: &mut mpsc::UnboundedReceiver<SettingsQuery>,
    ) {
        let mut waiting: VecDeque<oneshot::Sender<Result<String>>> = VecDeque::new();

        loop {
            tokio::select! {
                changed = interest.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let identities = self.interest_list();
                    debug!(count = identities.len(), "Replacing interest set");
                    if connection.send(&Request::Subscribe { identities }).await.is_err() {
                        break;
                    }
                }
                query = queries.recv() => {
                    let Some((identity, reply)) = query else { break };
                    let request = Request::ShowSettings { identity: identity.to_string() };
                    if let Err(e) = connection.send(&request).await {
                        let _ = reply.send(Err(e));
                        break;
                    }
                    waiting.push_back(reply);
                }
                message = connection.recv() => match message {
                    Ok(Some(response)) => self.apply(response, &mut waiting),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = e.slug(), "Subscription failed: {}", e);
                        break;
                    }
                },
            }
        }
    }

    fn apply(&self, response: Response, waiting: &mut VecDeque<oneshot::Sender<Result<String>>>) {
        match response {
            Response::StatusChanged { identity, status } => {
                let Ok(identity) = ExtensionIdentity::from_str(&identity) else {
                    warn!(%identity, "Host sent an invalid identity");
                    return;
                };
                if !self.interest.borrow().contains(&identity) {
                    return;
                }
                self.cache()
                    .statuses
                    .insert(identity.clone(), StatusPayload::from(status));
                self.emit(MultiplexerEvent::StatusChanged(identity));
            }
            Response::ExtensionsChanged { list } => {
                self.cache().extensions = listings(&list);
                self.emit(MultiplexerEvent::ExtensionsChanged);
            }
            Response::SettingsEntry { entry, .. } => {
                if let Some(reply) = waiting.pop_front() {
                    let _ = reply.send(Ok(entry));
                }
            }
            Response::Error { message } => match waiting.pop_front() {
                Some(reply) => {
                    let _ = reply.send(Err(HostError::Ipc(message)));
                }
                None => warn!("Host reported: {}", message),
            },
            other => trace!(?other, "Ignoring frame"),
        }
    }
}

fn listings(list: &[super::protocol::ExtensionInfo]) -> Vec<ExtensionListing> {
    list.iter()
        .filter_map(|info| match info.to_listing() {
            Ok(listing) => Some(listing),
            Err(e) => {
                warn!("Ignoring listing: {}", e);
                None
            }
        })
        .collect()
}

pub struct MultiplexerClient {
    shared: Arc<MuxShared>,
    queries: mpsc::UnboundedSender<SettingsQuery>,
    task: JoinHandle<()>,
}

impl MultiplexerClient {
    /// Starts binding right away. Must be called inside a tokio runtime.
    pub fn start(connector: Arc<dyn HostConnector>, config: &MultiplexerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(MuxShared {
            connector,
            reconnect_delay: config.reconnect_delay(),
            state: watch::channel(BindState::Unbound).0,
            interest: watch::channel(BTreeSet::new()).0,
            cache: Mutex::new(MuxCache::default()),
            events,
        });
        let (queries, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(shared.clone().run(rx));
        Self {
            shared,
            queries,
            task,
        }
    }

    /// Replaces the interest set; sent to the host now if bound, and on
    /// every later bind.
    pub fn listen_to(&self, identities: impl IntoIterator<Item = ExtensionIdentity>) {
        let wanted: BTreeSet<ExtensionIdentity> = identities.into_iter().collect();
        self.shared
            .cache()
            .statuses
            .retain(|identity, _| wanted.contains(identity));
        self.shared.interest.send_replace(wanted);
    }

    pub fn interest(&self) -> BTreeSet<ExtensionIdentity> {
        self.shared.interest.borrow().clone()
    }

    pub fn state(&self) -> BindState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BindState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.shared.events.subscribe()
    }

    /// Whether the host shows this client non-world-readable data.
    pub fn is_trusted(&self) -> bool {
        self.shared.cache().trusted
    }

    pub fn available_extensions(&self, world_readable_only: bool) -> Vec<ExtensionListing> {
        self.shared
            .cache()
            .extensions
            .iter()
            .filter(|l| !world_readable_only || l.world_readable)
            .cloned()
            .collect()
    }

    pub fn status(&self, identity: &ExtensionIdentity) -> Option<StatusPayload> {
        self.shared.cache().statuses.get(identity).cloned()
    }

    /// Asks the host for a collapsed manual refresh. False when unbound or
    /// the host declined.
    pub async fn request_update(&self, identities: Option<Vec<ExtensionIdentity>>) -> bool {
        if self.state() != BindState::Bound {
            return false;
        }
        let request = Request::RequestUpdate {
            identities: identities.map(|list| list.iter().map(|i| i.to_string()).collect()),
        };
        match self.shared.connector.request(request).await {
            Ok(Response::Accepted { accepted }) => accepted,
            Ok(other) => {
                warn!("{}", unexpected(other));
                false
            }
            Err(e) => {
                debug!(error = e.slug(), "Update request failed: {}", e);
                false
            }
        }
    }

    /// Settings entry point of an identity in the interest set.
    pub async fn show_settings(&self, identity: &ExtensionIdentity) -> Result<String> {
        if self.state() != BindState::Bound {
            return Err(HostError::connect("host", "not bound"));
        }
        let (reply, answer) = oneshot::channel();
        self.queries
            .send((identity.clone(), reply))
            .map_err(|_| HostError::Ipc("client stopped".into()))?;
        answer
            .await
            .map_err(|_| HostError::Ipc("host connection lost".into()))?
    }

    /// Stops binding and drops the connection.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for MultiplexerClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::{ExtensionInfo, StatusInfo};
    use crate::daemon::testing::{id, wait_until};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    struct HostSide {
        requests: mpsc::UnboundedReceiver<Request>,
        responses: mpsc::UnboundedSender<Response>,
    }

    struct FakeConnection {
        requests: mpsc::UnboundedSender<Request>,
        responses: mpsc::UnboundedReceiver<Response>,
    }

    #[async_trait]
    impl HostConnection for FakeConnection {
        async fn send(&mut self, request: &Request) -> Result<()> {
            self.requests
                .send(request.clone())
                .map_err(|_| HostError::Ipc("closed".into()))
        }

        async fn recv(&mut self) -> Result<Option<Response>> {
            Ok(self.responses.recv().await)
        }
    }

    #[derive(Default)]
    struct FakeHost {
        available: AtomicBool,
        untrusted: AtomicBool,
        verifies: AtomicUsize,
        list_delay_ms: AtomicU64,
        subscribes: Mutex<Vec<Vec<String>>>,
        current: Mutex<Option<HostSide>>,
    }

    impl FakeHost {
        fn up() -> Arc<Self> {
            let host = Arc::new(Self::default());
            host.available.store(true, Ordering::SeqCst);
            host
        }

        fn subscribes(&self) -> Vec<Vec<String>> {
            self.subscribes.lock().unwrap().clone()
        }

        fn push(&self, response: Response) {
            let current = self.current.lock().unwrap();
            current.as_ref().unwrap().responses.send(response).unwrap();
        }

        async fn next_request(&self) -> Request {
            let mut side = self.current.lock().unwrap().take().unwrap();
            let request = tokio::time::timeout(Duration::from_secs(2), side.requests.recv())
                .await
                .unwrap()
                .unwrap();
            *self.current.lock().unwrap() = Some(side);
            request
        }

        /// Simulates the host process dying.
        fn kill(&self) {
            self.available.store(false, Ordering::SeqCst);
            self.current.lock().unwrap().take();
        }
    }

    #[async_trait]
    impl HostConnector for FakeHost {
        async fn verify(&self) -> Result<()> {
            self.verifies.fetch_add(1, Ordering::SeqCst);
            if self.untrusted.load(Ordering::SeqCst) {
                return Err(HostError::Untrusted("wrong signer".into()));
            }
            Ok(())
        }

        async fn request(&self, request: Request) -> Result<Response> {
            if !self.available.load(Ordering::SeqCst) {
                return Err(HostError::Ipc("down".into()));
            }
            if matches!(request, Request::ListExtensions { .. }) {
                let delay = self.list_delay_ms.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(match request {
                Request::ListExtensions { .. } => Response::Extensions {
                    list: vec![ExtensionInfo {
                        identity: "pkg/X".into(),
                        title: "X".into(),
                        description: None,
                        protocol_version: 1,
                        compatible: true,
                        world_readable: true,
                        settings: None,
                        active: true,
                    }],
                    trusted: false,
                },
                Request::RequestUpdate { .. } => Response::Accepted { accepted: true },
                _ => Response::Ok,
            })
        }

        async fn subscribe(&self, identities: Vec<String>) -> Result<Box<dyn HostConnection>> {
            if !self.available.load(Ordering::SeqCst) {
                return Err(HostError::connect("host", "socket not found"));
            }
            self.subscribes.lock().unwrap().push(identities);
            let (req_tx, req_rx) = mpsc::unbounded_channel();
            let (resp_tx, resp_rx) = mpsc::unbounded_channel();
            *self.current.lock().unwrap() = Some(HostSide {
                requests: req_rx,
                responses: resp_tx,
            });
            Ok(Box::new(FakeConnection {
                requests: req_tx,
                responses: resp_rx,
            }))
        }
    }

    fn config() -> MultiplexerConfig {
        MultiplexerConfig {
            reconnect_delay_ms: 20,
            ..MultiplexerConfig::default()
        }
    }

    fn bound(client: &MultiplexerClient) -> impl FnMut() -> bool + '_ {
        move || client.state() == BindState::Bound
    }

    #[tokio::test]
    async fn replays_interest_on_bind() {
        let host = Arc::new(FakeHost::default());
        let client = MultiplexerClient::start(host.clone(), &config());
        client.listen_to([id("X")]);
        wait_until(|| host.verifies.load(Ordering::SeqCst) >= 1).await;
        assert_ne!(client.state(), BindState::Bound);

        host.available.store(true, Ordering::SeqCst);
        wait_until(bound(&client)).await;
        assert_eq!(host.subscribes().last().unwrap(), &vec!["pkg/X".to_string()]);
        assert_eq!(client.available_extensions(true).len(), 1);
        assert!(!client.is_trusted());
    }

    #[tokio::test]
    async fn caches_streamed_status_for_interest_set() {
        let host = FakeHost::up();
        let client = MultiplexerClient::start(host.clone(), &config());
        let mut events = client.events();
        client.listen_to([id("X")]);
        wait_until(bound(&client)).await;

        host.push(Response::StatusChanged {
            identity: "pkg/X".into(),
            status: StatusInfo::from(&StatusPayload::visible("5")),
        });
        host.push(Response::StatusChanged {
            identity: "pkg/Other".into(),
            status: StatusInfo::from(&StatusPayload::visible("9")),
        });
        wait_until(|| client.status(&id("X")).is_some()).await;
        assert_eq!(client.status(&id("X")), Some(StatusPayload::visible("5")));
        assert_eq!(client.status(&id("Other")), None);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&MultiplexerEvent::Bound));
        assert!(seen.contains(&MultiplexerEvent::StatusChanged(id("X"))));
    }

    #[tokio::test]
    async fn interest_change_is_sent_while_bound() {
        let host = FakeHost::up();
        let client = MultiplexerClient::start(host.clone(), &config());
        wait_until(bound(&client)).await;

        client.listen_to([id("A"), id("B")]);
        assert_eq!(
            host.next_request().await,
            Request::Subscribe {
                identities: vec!["pkg/A".into(), "pkg/B".into()]
            }
        );
    }

    #[tokio::test]
    async fn interest_changed_while_binding_reaches_host() {
        let host = FakeHost::up();
        host.list_delay_ms.store(150, Ordering::SeqCst);
        let client = MultiplexerClient::start(host.clone(), &config());

        // Subscribed with the empty set; the snapshot is still in flight.
        wait_until(|| host.subscribes().len() == 1).await;
        assert_ne!(client.state(), BindState::Bound);
        client.listen_to([id("A")]);

        wait_until(bound(&client)).await;
        assert_eq!(host.subscribes(), vec![Vec::<String>::new()]);
        assert_eq!(
            host.next_request().await,
            Request::Subscribe {
                identities: vec!["pkg/A".into()]
            }
        );
    }

    #[tokio::test]
    async fn loss_clears_cache_and_rebinds() {
        let host = FakeHost::up();
        let client = MultiplexerClient::start(host.clone(), &config());
        client.listen_to([id("X")]);
        wait_until(bound(&client)).await;
        host.push(Response::StatusChanged {
            identity: "pkg/X".into(),
            status: StatusInfo::from(&StatusPayload::visible("5")),
        });
        wait_until(|| client.status(&id("X")).is_some()).await;

        host.kill();
        wait_until(|| client.state() != BindState::Bound).await;
        assert!(client.status(&id("X")).is_none());
        assert!(client.available_extensions(false).is_empty());
        assert!(!client.request_update(None).await);

        host.available.store(true, Ordering::SeqCst);
        wait_until(bound(&client)).await;
        assert_eq!(host.subscribes().len(), 2);
        assert_eq!(host.subscribes()[1], vec!["pkg/X".to_string()]);
        assert!(client.request_update(Some(vec![id("X")])).await);
    }

    #[tokio::test]
    async fn untrusted_host_fails_closed() {
        let host = FakeHost::up();
        host.untrusted.store(true, Ordering::SeqCst);
        let client = MultiplexerClient::start(host.clone(), &config());

        wait_until(|| host.verifies.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(host.verifies.load(Ordering::SeqCst), 1);
        assert!(host.subscribes().is_empty());
        assert_eq!(client.state(), BindState::Unbound);
    }

    #[tokio::test]
    async fn settings_go_through_the_subscription() {
        let host = FakeHost::up();
        let client = Arc::new(MultiplexerClient::start(host.clone(), &config()));
        client.listen_to([id("X")]);
        wait_until(bound(&client)).await;

        let asking = client.clone();
        let answer = tokio::spawn(async move { asking.show_settings(&id("X")).await });
        assert_eq!(
            host.next_request().await,
            Request::ShowSettings {
                identity: "pkg/X".into()
            }
        );
        host.push(Response::SettingsEntry {
            identity: "pkg/X".into(),
            entry: ".Settings".into(),
        });
        assert_eq!(answer.await.unwrap().unwrap(), ".Settings");
    }
}
