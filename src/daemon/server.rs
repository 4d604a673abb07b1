use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use super::host::{ClientId, HostRuntime};
use super::protocol::{MessageFrame, Request, Response, StatusInfo};
use crate::clienv;
use crate::extension::{ExtensionIdentity, Reason};
use crate::notifier::ChangeEvent;

/// Requests only the host's own user may send.
fn is_privileged(request: &Request) -> bool {
    matches!(
        request,
        Request::Shutdown
            | Request::UpdateExtensions { .. }
            | Request::ScreenOn
            | Request::PackagesChanged { .. }
    )
}

/// Stops a running [`HostServer`].
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

pub struct HostServer {
    runtime: Arc<HostRuntime>,
    socket_path: PathBuf,
    shutdown: ShutdownHandle,
    version: String,
}

impl HostServer {
    pub fn new(runtime: Arc<HostRuntime>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            socket_path: socket_path.into(),
            shutdown: ShutdownHandle(Arc::new(watch::channel(false).0)),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_default_socket(runtime: Arc<HostRuntime>) -> Self {
        Self::new(runtime, clienv::socket_path())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serves until a signal or a `Shutdown` request, then stops the host.
    pub async fn run(self) -> Result<()> {
        info!("Status host starting...");

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        let listener = tokio::net::UnixListener::bind(&self.socket_path)?;

        #[cfg(not(unix))]
        let listener = {
            let port = clienv::tcp_port();
            tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?
        };

        info!("IPC server listening on: {}", self.socket_path.display());

        // Any local user may connect; reads are gated per peer.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o666);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        self.spawn_signal_handler()?;
        self.runtime.start();

        let mut stop = self.shutdown.0.subscribe();
        let server = Arc::new(self);
        info!("Status host ready");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let trusted = peer_is_trusted(&stream);
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, trusted).await {
                                    debug!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = stopped(&mut stop) => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        server.runtime.shutdown().await;

        if server.socket_path.exists() {
            std::fs::remove_file(&server.socket_path)?;
        }

        info!("Status host stopped");
        Ok(())
    }

    fn spawn_signal_handler(&self) -> Result<()> {
        let handle = self.shutdown.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                        handle.shutdown();
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                        handle.shutdown();
                    }
                }
            });
        }

        #[cfg(not(unix))]
        {
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received Ctrl+C");
                handle.shutdown();
            });
        }

        Ok(())
    }

    /// One request per connection, except `Subscribe`, which streams.
    pub async fn handle_connection<S>(&self, mut stream: S, trusted: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        trace!(trusted, "New connection accepted");

        let Some(request) = MessageFrame::read_request(&mut stream).await? else {
            return Ok(());
        };

        if let Request::Subscribe { identities } = request {
            return self.serve_subscription(stream, trusted, identities).await;
        }

        let response = self.handle_request(request, trusted, None);
        MessageFrame::write_response(&mut stream, &response).await?;
        trace!("Response sent");
        Ok(())
    }

    fn handle_request(&self, request: Request, trusted: bool, client: Option<ClientId>) -> Response {
        if is_privileged(&request) && !trusted {
            warn!(?request, "Refusing privileged request from untrusted peer");
            return Response::error("permission denied");
        }

        match request {
            Request::Ping => {
                debug!("Handling: Ping");
                Response::Pong {
                    uptime_secs: self.runtime.uptime_secs(),
                    version: self.version.clone(),
                }
            }

            Request::Shutdown => {
                info!("Handling: Shutdown");
                self.shutdown.shutdown();
                Response::Ok
            }

            Request::ListExtensions {
                world_readable_only,
            } => {
                debug!("Handling: ListExtensions(world_readable_only: {})", world_readable_only);
                Response::Extensions {
                    list: self.runtime.list_extensions(world_readable_only),
                    trusted,
                }
            }

            Request::GetStatus { identity } => {
                debug!("Handling: GetStatus({})", identity);
                match ExtensionIdentity::from_str(&identity) {
                    Ok(identity) => Response::Status {
                        status: self
                            .runtime
                            .status_for(&identity, trusted)
                            .as_ref()
                            .map(StatusInfo::from),
                    },
                    Err(e) => Response::error(e.to_string()),
                }
            }

            Request::RequestUpdate { identities } => {
                debug!("Handling: RequestUpdate({:?})", identities);
                let identities = identities.map(|list| parse_identities(&list));
                Response::Accepted {
                    accepted: self.runtime.request_update(identities),
                }
            }

            Request::Subscribe { .. } => Response::error("subscribe requires a streaming connection"),

            Request::ShowSettings { identity } => {
                debug!("Handling: ShowSettings({})", identity);
                match ExtensionIdentity::from_str(&identity) {
                    Ok(identity) => self.settings_entry(&identity, trusted, client),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            Request::UpdateExtensions { identity, reason } => {
                let reason = Reason::from_code(reason);
                info!("Handling: UpdateExtensions({:?}, {})", identity, reason);
                let identity = match identity.map(|s| ExtensionIdentity::from_str(&s)).transpose() {
                    Ok(identity) => identity,
                    Err(e) => return Response::error(e.to_string()),
                };
                Response::Accepted {
                    accepted: self.runtime.update_extensions(identity, reason),
                }
            }

            Request::ScreenOn => {
                debug!("Handling: ScreenOn");
                Response::Accepted {
                    accepted: self.runtime.screen_on(),
                }
            }

            Request::PackagesChanged { package } => {
                info!("Handling: PackagesChanged({:?})", package);
                self.runtime.packages_changed(package.as_deref());
                Response::Ok
            }

            Request::ListSessions => {
                debug!("Handling: ListSessions");
                Response::Sessions {
                    list: self.runtime.sessions(),
                }
            }
        }
    }

    /// Allowed for identities in the caller's interest set, or any identity
    /// for a trusted caller.
    fn settings_entry(
        &self,
        identity: &ExtensionIdentity,
        trusted: bool,
        client: Option<ClientId>,
    ) -> Response {
        let interested = client.is_some_and(|c| self.runtime.interest(c).contains(identity));
        if !interested && !trusted {
            return Response::error(format!("'{identity}' is not in the subscription"));
        }
        let entry = self
            .runtime
            .manager()
            .available_extensions()
            .into_iter()
            .find(|l| &l.identity == identity)
            .and_then(|l| l.settings);
        match entry {
            Some(entry) => Response::SettingsEntry {
                identity: identity.to_string(),
                entry,
            },
            None => Response::error(format!("'{identity}' has no settings")),
        }
    }

    async fn serve_subscription<S>(&self, stream: S, trusted: bool, first: Vec<String>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let client = self.runtime.register_client();
        let (listener, mut events) = self.runtime.manager().subscribe();
        let mut stop = self.shutdown.0.subscribe();
        debug!(client, trusted, "Subscription opened");

        let (requests_tx, mut requests) = mpsc::channel::<Request>(16);
        let reader_task = tokio::spawn(async move {
            loop {
                match MessageFrame::read_request(&mut reader).await {
                    Ok(Some(request)) => {
                        if requests_tx.send(request).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Subscription read error: {}", e);
                        break;
                    }
                }
            }
        });

        let result = async {
            self.subscribe(&mut writer, client, trusted, &first).await?;
            loop {
                tokio::select! {
                    request = requests.recv() => match request {
                        Some(Request::Subscribe { identities }) => {
                            self.subscribe(&mut writer, client, trusted, &identities).await?;
                        }
                        Some(request) => {
                            let response = self.handle_request(request, trusted, Some(client));
                            MessageFrame::write_response(&mut writer, &response).await?;
                        }
                        None => break,
                    },
                    event = events.recv() => match event {
                        Some(event) => self.forward(&mut writer, client, trusted, &event).await?,
                        None => break,
                    },
                    _ = stopped(&mut stop) => break,
                }
            }
            Ok::<(), crate::error::HostError>(())
        }
        .await;

        reader_task.abort();
        self.runtime.manager().remove_listener(listener);
        self.runtime.remove_client(client);
        debug!(client, "Subscription closed");
        Ok(result?)
    }

    /// Replaces the interest set and sends the current payload of each
    /// newly-registered identity.
    async fn subscribe<W>(
        &self,
        writer: &mut W,
        client: ClientId,
        trusted: bool,
        identities: &[String],
    ) -> crate::error::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let added = self
            .runtime
            .set_interest(client, parse_identities(identities));
        debug!(client, added = added.len(), "Interest set replaced");
        for identity in added {
            if let Some(status) = self.runtime.status_for(&identity, trusted) {
                let response = Response::StatusChanged {
                    identity: identity.to_string(),
                    status: StatusInfo::from(&status),
                };
                MessageFrame::write_response(writer, &response).await?;
            }
        }
        Ok(())
    }

    async fn forward<W>(
        &self,
        writer: &mut W,
        client: ClientId,
        trusted: bool,
        event: &ChangeEvent,
    ) -> crate::error::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let response = match event {
            ChangeEvent::SetChanged => Response::ExtensionsChanged {
                list: self.runtime.list_extensions(false),
            },
            ChangeEvent::StatusChanged(identity) => {
                if !self.runtime.interest(client).contains(identity) {
                    return Ok(());
                }
                let Some(status) = self.runtime.status_for(identity, trusted) else {
                    return Ok(());
                };
                Response::StatusChanged {
                    identity: identity.to_string(),
                    status: StatusInfo::from(&status),
                }
            }
        };
        MessageFrame::write_response(writer, &response).await
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

fn parse_identities(list: &[String]) -> Vec<ExtensionIdentity> {
    list.iter()
        .filter_map(|s| match ExtensionIdentity::from_str(s) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Ignoring identity: {}", e);
                None
            }
        })
        .collect()
}

/// Same OS user as the host.
#[cfg(unix)]
fn peer_is_trusted(stream: &tokio::net::UnixStream) -> bool {
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == unsafe { libc::geteuid() },
        Err(e) => {
            warn!("Cannot read peer credentials: {}", e);
            false
        }
    }
}

#[cfg(not(unix))]
fn peer_is_trusted(_stream: &tokio::net::TcpStream) -> bool {
    false
}
