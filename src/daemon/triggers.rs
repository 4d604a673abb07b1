//! Update triggers: adapters that turn outside events into dispatches.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::supervisor::ExtensionSupervisor;
use crate::error::{HostError, Result};
use crate::extension::{Operation, Reason};
use crate::user_config::TriggerConfig;

/// Invoked when a trigger fires. Must not block.
pub type TriggerSink = Arc<dyn Fn() + Send + Sync>;

/// A registered trigger; dropping it unregisters.
pub struct TriggerSubscription {
    key: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TriggerSubscription {
    pub fn new(key: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key: key.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for TriggerSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            trace!(key = %self.key, "Trigger unregistered");
            cancel();
        }
    }
}

impl std::fmt::Debug for TriggerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerSubscription")
            .field("key", &self.key)
            .finish()
    }
}

/// Platform-level screen-on notifications. At most one sink is registered.
pub trait ScreenEvents: Send + Sync {
    fn register(&self, sink: TriggerSink);
    fn unregister(&self);
}

/// Watches external resources for content changes.
pub trait ContentWatcher: Send + Sync {
    fn watch(&self, uri: &str, sink: TriggerSink) -> Result<TriggerSubscription>;
}

/// Screen-on source fed from outside the process (the `ScreenOn` request).
#[derive(Default)]
pub struct RelayScreenEvents {
    sink: Mutex<Option<TriggerSink>>,
    registrations: AtomicUsize,
}

impl RelayScreenEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a screen-on event. Returns false when nobody listens.
    pub fn fire(&self) -> bool {
        let sink = self.sink.lock().expect("screen lock poisoned").clone();
        match sink {
            Some(sink) => {
                sink();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.sink.lock().expect("screen lock poisoned").is_some()
    }

    /// How many times a listener has been registered.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl ScreenEvents for RelayScreenEvents {
    fn register(&self, sink: TriggerSink) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().expect("screen lock poisoned") = Some(sink);
        debug!("Screen-on listener registered");
    }

    fn unregister(&self) {
        *self.sink.lock().expect("screen lock poisoned") = None;
        debug!("Screen-on listener unregistered");
    }
}

/// Content watcher on filesystem events: one non-recursive `notify`
/// watcher per subscription. Must be used inside a tokio runtime.
///
/// A file is watched through its parent directory so replacing it by rename
/// is still seen; events are filtered to the file's name.
#[derive(Debug, Default)]
pub struct FsContentWatcher;

impl FsContentWatcher {
    pub fn new() -> Self {
        Self
    }
}

/// Accepts `file://` URIs and plain paths.
pub fn uri_to_path(uri: &str) -> Result<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if uri.contains("://") {
        return Err(HostError::Config(format!("unsupported content uri '{uri}'")));
    }
    Ok(PathBuf::from(uri))
}

/// Directory to watch and, for a file, the name to filter events on.
fn watch_target(path: &Path) -> Result<(PathBuf, Option<OsString>)> {
    if path.is_dir() {
        return Ok((path.to_path_buf(), None));
    }
    let name = path
        .file_name()
        .ok_or_else(|| HostError::Config(format!("cannot watch '{}'", path.display())))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, Some(name.to_os_string())))
}

fn touches(event: &notify::Event, name: Option<&OsString>) -> bool {
    if event.kind.is_access() || event.kind.is_other() {
        return false;
    }
    match name {
        None => true,
        Some(name) => event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(name.as_os_str())),
    }
}

impl ContentWatcher for FsContentWatcher {
    fn watch(&self, uri: &str, sink: TriggerSink) -> Result<TriggerSubscription> {
        let path = uri_to_path(uri)?;
        let (dir, name) = watch_target(&path)?;
        let key = uri.to_string();

        // Events arrive on the watcher's own thread; the sink runs on the runtime.
        let (tx, mut changes) = mpsc::unbounded_channel::<()>();
        let uri_field = key.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if touches(&event, name.as_ref()) => {
                    trace!(uri = %uri_field, kind = ?event.kind, "Content changed");
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => debug!(uri = %uri_field, "Watch error: {}", e),
            }
        })
        .map_err(|e| HostError::Config(format!("cannot watch '{uri}': {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| HostError::Config(format!("cannot watch '{uri}': {e}")))?;
        trace!(uri = %key, dir = %dir.display(), "Watching content");

        let forward = tokio::spawn(async move {
            while changes.recv().await.is_some() {
                sink();
            }
        });

        Ok(TriggerSubscription::new(key, move || {
            drop(watcher);
            forward.abort();
        }))
    }
}

/// Refreshes every active extension once at start-up and then on a fixed
/// interval.
pub struct PeriodicRefresh {
    supervisor: ExtensionSupervisor,
    interval: Duration,
}

impl PeriodicRefresh {
    pub fn new(supervisor: ExtensionSupervisor, config: &TriggerConfig) -> Self {
        Self {
            supervisor,
            interval: config.periodic_interval(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs forever; spawn it as a background task.
    pub async fn run(&self) {
        info!("Periodic refresh started (interval: {:?})", self.interval);
        self.supervisor
            .dispatch_all(Operation::refresh(Reason::Manual));

        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        loop {
            interval.tick().await;
            debug!("Periodic refresh tick");
            self.supervisor
                .dispatch_all(Operation::refresh(Reason::Periodic));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn uri_forms() {
        assert_eq!(
            uri_to_path("file:///tmp/inbox").unwrap(),
            PathBuf::from("/tmp/inbox")
        );
        assert_eq!(uri_to_path("notes.txt").unwrap(), PathBuf::from("notes.txt"));
        assert!(uri_to_path("content://sms/inbox").is_err());
    }

    #[test]
    fn dropping_subscription_cancels() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let sub = TriggerSubscription::new("k", move || flag.store(true, Ordering::SeqCst));
        assert_eq!(sub.key(), "k");
        drop(sub);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn relay_fires_only_when_registered() {
        let relay = RelayScreenEvents::new();
        assert!(!relay.fire());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        relay.register(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(relay.fire());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        relay.unregister();
        assert!(!relay.is_registered());
        assert!(!relay.fire());
        assert_eq!(relay.registrations(), 1);
    }

    #[tokio::test]
    async fn fs_watcher_sees_writes_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, "one").unwrap();
        std::fs::write(dir.path().join("other"), "x").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = FsContentWatcher::new()
            .watch(
                &format!("file://{}", path.display()),
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // Writes to a sibling are filtered out.
        std::fs::write(dir.path().join("other"), "y").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        std::fs::write(&path, "one two").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "no change seen");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(sub);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = hits.load(Ordering::SeqCst);
        std::fs::write(&path, "one two three").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn watch_target_uses_parent_for_files() {
        let dir = tempfile::tempdir().unwrap();
        let (watched, name) = watch_target(&dir.path().join("inbox")).unwrap();
        assert_eq!(watched, dir.path());
        assert_eq!(name.as_deref(), Some(std::ffi::OsStr::new("inbox")));

        let (watched, name) = watch_target(dir.path()).unwrap();
        assert_eq!(watched, dir.path());
        assert!(name.is_none());
    }
}
