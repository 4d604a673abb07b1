//! Extensions as child processes speaking JSON lines over stdio.
//!
//! Host to extension: one serialized [`Operation`] per line on stdin.
//! Extension to host: one [`ExtensionMessage`] per line on stdout. Stderr is
//! forwarded to the host log. EOF on stdout means the connection is lost.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::link::{ExtensionBinder, ExtensionLink, HostCallback};
use crate::clienv::EnvVar;
use crate::error::{HostError, Result};
use crate::extension::{ExtensionIdentity, Operation, ProtocolRange, StatusPayload};
use crate::registry::{ManifestRegistry, PluginRegistry};
use crate::user_config::HostConfig;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// What an extension process may write to its stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionMessage {
    /// A missing or null payload clears the status.
    Publish {
        #[serde(default)]
        payload: Option<StatusPayload>,
    },
    Watch {
        uris: Vec<String>,
    },
    ScreenOn {
        enabled: bool,
    },
}

impl ExtensionMessage {
    async fn deliver(self, callback: &HostCallback) {
        match self {
            ExtensionMessage::Publish { payload } => callback.publish_status(payload).await,
            ExtensionMessage::Watch { uris } => callback.register_content_triggers(uris).await,
            ExtensionMessage::ScreenOn { enabled } => callback.set_screen_on_trigger(enabled).await,
        }
    }
}

pub struct ProcessBinder {
    registry: Arc<ManifestRegistry>,
    range: ProtocolRange,
    blocked: HashSet<ExtensionIdentity>,
    stop_timeout: Duration,
}

impl ProcessBinder {
    pub fn new(registry: Arc<ManifestRegistry>, config: &HostConfig) -> Self {
        Self {
            registry,
            range: config.supervisor.protocol_range(),
            blocked: config.blocked_extensions.iter().cloned().collect(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

#[async_trait]
impl ExtensionBinder for ProcessBinder {
    fn resolve(&self, identity: &ExtensionIdentity) -> Result<()> {
        let listing = self
            .registry
            .find(identity)
            .ok_or_else(|| HostError::connect(identity, "not installed"))?;
        if self.blocked.contains(identity) {
            return Err(HostError::connect(identity, "permission denied"));
        }
        if !self.range.supports(listing.protocol_version) {
            return Err(HostError::Protocol {
                identity: identity.to_string(),
                version: listing.protocol_version,
            });
        }
        Ok(())
    }

    async fn bind(
        &self,
        identity: &ExtensionIdentity,
        callback: HostCallback,
    ) -> Result<Box<dyn ExtensionLink>> {
        self.resolve(identity)?;
        let spec = self
            .registry
            .launch_spec(identity)
            .ok_or_else(|| HostError::connect(identity, "no launch command"))?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env(EnvVar::Extension.as_str(), identity.to_string());
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::connect(identity, format!("failed to start: {e}")))?;
        info!(%identity, pid = ?child.id(), "Started extension process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::connect(identity, "stdin not available"))?;
        let reader = spawn_readers(identity, &mut child, callback);

        Ok(Box::new(ProcessLink {
            identity: identity.clone(),
            child,
            stdin: Some(stdin),
            reader,
            stop_timeout: self.stop_timeout,
        }))
    }
}

fn spawn_readers(identity: &ExtensionIdentity, child: &mut Child, callback: HostCallback) -> JoinHandle<()> {
    if let Some(stderr) = child.stderr.take() {
        let name = identity.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(identity = %name, "{}", line);
            }
        });
    }

    let stdout = child.stdout.take();
    tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ExtensionMessage>(&line) {
                    Ok(message) => message.deliver(&callback).await,
                    Err(e) => warn!(identity = %callback.identity(), "Ignoring malformed message: {}", e),
                }
            }
        }
        trace!(identity = %callback.identity(), "Extension stdout closed");
        callback.connection_lost().await;
    })
}

struct ProcessLink {
    identity: ExtensionIdentity,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
    stop_timeout: Duration,
}

#[async_trait]
impl ExtensionLink for ProcessLink {
    async fn call(&mut self, op: &Operation) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| HostError::transport(&self.identity, "connection closed"))?;
        let mut line = serde_json::to_string(op)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HostError::transport(&self.identity, e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| HostError::transport(&self.identity, e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) {
        self.reader.abort();
        // Closing stdin asks the extension to exit on its own.
        self.stdin.take();

        if tokio::time::timeout(self.stop_timeout, self.child.wait())
            .await
            .is_ok()
        {
            debug!(identity = %self.identity, "Extension exited");
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            if tokio::time::timeout(self.stop_timeout, self.child.wait())
                .await
                .is_ok()
            {
                debug!(identity = %self.identity, "Extension stopped after SIGTERM");
                return;
            }
        }

        warn!(identity = %self.identity, "Extension did not stop in time, killing");
        if let Err(e) = self.child.kill().await {
            warn!(identity = %self.identity, "Failed to kill extension: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::daemon::link::{CallbackEvent, CallbackMessage};
    use tokio::sync::mpsc;

    fn write_manifest(dir: &std::path::Path, name: &str, version: i32, script: &str) {
        let ext_dir = dir.join(name);
        std::fs::create_dir_all(&ext_dir).unwrap();
        let manifest = format!(
            r#"
[extension]
package = "com.example"
component = "{name}"
protocol_version = {version}

[launch]
command = "sh"
args = ["-c", '''{script}''']
"#
        );
        std::fs::write(ext_dir.join("extension.toml"), manifest).unwrap();
    }

    fn binder(dir: &std::path::Path, config: &HostConfig) -> ProcessBinder {
        let registry = Arc::new(ManifestRegistry::new(dir));
        ProcessBinder::new(registry, config).with_stop_timeout(Duration::from_millis(200))
    }

    fn ident(name: &str) -> ExtensionIdentity {
        ExtensionIdentity::new("com.example", name)
    }

    #[test]
    fn message_wire_format() {
        let msg: ExtensionMessage =
            serde_json::from_str(r#"{"type":"publish","payload":{"visible":true,"status":"3"}}"#)
                .unwrap();
        assert_eq!(
            msg,
            ExtensionMessage::Publish {
                payload: Some(StatusPayload::visible("3"))
            }
        );

        let cleared: ExtensionMessage = serde_json::from_str(r#"{"type":"publish"}"#).unwrap();
        assert_eq!(cleared, ExtensionMessage::Publish { payload: None });

        let watch: ExtensionMessage =
            serde_json::from_str(r#"{"type":"watch","uris":["file:///tmp/a"]}"#).unwrap();
        assert_eq!(
            watch,
            ExtensionMessage::Watch {
                uris: vec!["file:///tmp/a".into()]
            }
        );
    }

    #[test]
    fn resolve_classifies_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "Ok", 1, "cat");
        write_manifest(dir.path(), "Future", 99, "cat");
        write_manifest(dir.path(), "Blocked", 1, "cat");

        let config = HostConfig {
            blocked_extensions: vec![ident("Blocked")],
            ..HostConfig::default()
        };
        let binder = binder(dir.path(), &config);

        assert!(binder.resolve(&ident("Ok")).is_ok());
        assert_eq!(binder.resolve(&ident("Missing")).unwrap_err().slug(), "connect");
        assert_eq!(binder.resolve(&ident("Blocked")).unwrap_err().slug(), "connect");
        assert_eq!(binder.resolve(&ident("Future")).unwrap_err().slug(), "protocol");
    }

    #[tokio::test]
    async fn process_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "Echo",
            1,
            r#"read line; echo '{"type":"publish","payload":{"visible":true,"status":"up"}}'; cat > /dev/null"#,
        );
        let binder = binder(dir.path(), &HostConfig::default());

        let (tx, mut rx) = mpsc::channel::<CallbackMessage>(8);
        let callback = HostCallback::new(ident("Echo"), 7, 1, tx);
        let mut link = binder.bind(&ident("Echo"), callback).await.unwrap();

        link.call(&Operation::initialize(false)).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.session, 7);
        assert_eq!(
            message.event,
            CallbackEvent::Publish(Some(StatusPayload::visible("up")))
        );

        tokio::time::timeout(Duration::from_secs(5), link.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exit_reports_connection_lost() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "Quitter", 1, "exit 0");
        let binder = binder(dir.path(), &HostConfig::default());

        let (tx, mut rx) = mpsc::channel::<CallbackMessage>(8);
        let callback = HostCallback::new(ident("Quitter"), 1, 3, tx);
        let _link = binder.bind(&ident("Quitter"), callback).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.event, CallbackEvent::Lost);
        assert_eq!(message.link, 3);
    }
}
