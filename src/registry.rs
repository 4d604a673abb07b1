//! Plugin registry: where installed extensions and their metadata come from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{HostError, Result};
use crate::extension::{ExtensionIdentity, ExtensionListing};

pub const MANIFEST_FILE_NAME: &str = "extension.toml";

/// Read-only source of installed extension listings.
///
/// Listings are returned raw; the status cache derives `compatible`.
pub trait PluginRegistry: Send + Sync {
    fn available_extensions(&self) -> Vec<ExtensionListing>;

    /// Re-reads the underlying source. Returns whether anything changed.
    fn refresh(&self) -> Result<bool> {
        Ok(false)
    }

    fn find(&self, identity: &ExtensionIdentity) -> Option<ExtensionListing> {
        self.available_extensions()
            .into_iter()
            .find(|l| &l.identity == identity)
    }
}

/// How to start an extension process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    extension: ManifestExtension,
    launch: ManifestLaunch,
}

#[derive(Debug, Deserialize)]
struct ManifestExtension {
    package: String,
    component: String,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    protocol_version: i32,
    #[serde(default)]
    world_readable: bool,
    settings: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestLaunch {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct ManifestEntry {
    listing: ExtensionListing,
    launch: LaunchSpec,
}

/// Registry backed by `extension.toml` manifests, one per sub-directory of
/// the plugins directory.
pub struct ManifestRegistry {
    plugins_dir: PathBuf,
    entries: RwLock<Vec<ManifestEntry>>,
}

impl ManifestRegistry {
    /// Creates the registry and performs the first scan.
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        let registry = Self {
            plugins_dir: plugins_dir.into(),
            entries: RwLock::new(Vec::new()),
        };
        if let Err(e) = registry.refresh() {
            warn!("Failed to scan extension manifests: {}", e);
        }
        registry
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn launch_spec(&self, identity: &ExtensionIdentity) -> Option<LaunchSpec> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries
            .iter()
            .find(|e| &e.listing.identity == identity)
            .map(|e| e.launch.clone())
    }

    fn scan(&self) -> Result<Vec<ManifestEntry>> {
        if !self.plugins_dir.exists() {
            debug!(dir = %self.plugins_dir.display(), "Plugins directory does not exist");
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.plugins_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }

            let manifest_path = path.join(MANIFEST_FILE_NAME);
            if !manifest_path.is_file() {
                continue;
            }

            match load_manifest(&manifest_path) {
                Ok(entry) => found.push(entry),
                Err(e) => warn!("Failed to load manifest {:?}: {}", manifest_path, e),
            }
        }

        found.sort_by(|a, b| a.listing.identity.cmp(&b.listing.identity));
        found.dedup_by(|a, b| a.listing.identity == b.listing.identity);
        Ok(found)
    }
}

impl PluginRegistry for ManifestRegistry {
    fn available_extensions(&self) -> Vec<ExtensionListing> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.iter().map(|e| e.listing.clone()).collect()
    }

    fn refresh(&self) -> Result<bool> {
        let scanned = self.scan()?;
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let changed = entries.len() != scanned.len()
            || entries
                .iter()
                .zip(scanned.iter())
                .any(|(a, b)| a.listing != b.listing || a.launch != b.launch);
        if changed {
            info!(count = scanned.len(), "Extension registry changed");
        }
        *entries = scanned;
        Ok(changed)
    }
}

fn load_manifest(path: &Path) -> Result<ManifestEntry> {
    let content = std::fs::read_to_string(path)?;
    let manifest: ManifestFile = toml::from_str(&content)
        .map_err(|e| HostError::Config(format!("invalid manifest: {}", e)))?;

    let ext = manifest.extension;
    if ext.package.is_empty() || ext.component.is_empty() {
        return Err(HostError::Config("manifest lacks package or component".into()));
    }
    let identity = ExtensionIdentity::new(ext.package, ext.component);

    let mut listing = ExtensionListing::new(identity, ext.protocol_version)
        .world_readable(ext.world_readable);
    if let Some(title) = ext.title {
        listing = listing.title(title);
    }
    if let Some(description) = ext.description {
        listing = listing.description(description);
    }
    if let Some(settings) = ext.settings.filter(|s| !s.is_empty()) {
        listing = listing.settings(settings);
    }

    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let command = resolve_command(&base_dir, &manifest.launch.command);
    let mut launch = LaunchSpec::new(command)
        .args(manifest.launch.args)
        .working_dir(base_dir);
    let mut env: Vec<_> = manifest.launch.env.into_iter().collect();
    env.sort();
    for (key, value) in env {
        launch = launch.env(key, value);
    }

    debug!(identity = %listing.identity, "Discovered extension");
    Ok(ManifestEntry { listing, launch })
}

/// Commands given with a path separator are relative to the manifest.
fn resolve_command(base_dir: &Path, command: &str) -> String {
    if command.contains('/') && !Path::new(command).is_absolute() {
        base_dir.join(command).display().to_string()
    } else {
        command.to_string()
    }
}

/// Registry over a fixed, replaceable set of listings.
#[derive(Default)]
pub struct StaticRegistry {
    listings: RwLock<Vec<ExtensionListing>>,
}

impl StaticRegistry {
    pub fn new(listings: Vec<ExtensionListing>) -> Self {
        Self {
            listings: RwLock::new(listings),
        }
    }

    pub fn set_listings(&self, listings: Vec<ExtensionListing>) {
        *self.listings.write().expect("registry lock poisoned") = listings;
    }
}

impl PluginRegistry for StaticRegistry {
    fn available_extensions(&self) -> Vec<ExtensionListing> {
        self.listings.read().expect("registry lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(root: &Path, dir: &str, body: &str) {
        let dir = root.join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE_NAME), body).unwrap();
    }

    const WEATHER: &str = r#"
[extension]
package = "com.example"
component = ".Weather"
title = "Weather"
protocol_version = 2
world_readable = true
settings = "WeatherSettings"

[launch]
command = "./weather-ext"
args = ["--units", "metric"]
env = { WEATHER_API = "demo" }
"#;

    #[test]
    fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ManifestRegistry::new(dir.path().join("absent"));
        assert!(registry.available_extensions().is_empty());
    }

    #[test]
    fn scans_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "weather", WEATHER);
        write_manifest(dir.path(), "broken", "not = [valid");

        let registry = ManifestRegistry::new(dir.path());
        let listings = registry.available_extensions();
        assert_eq!(listings.len(), 1);

        let listing = &listings[0];
        assert_eq!(listing.identity.to_string(), "com.example/com.example.Weather");
        assert_eq!(listing.protocol_version, 2);
        assert!(listing.world_readable);
        assert_eq!(listing.settings.as_deref(), Some("WeatherSettings"));

        let launch = registry.launch_spec(&listing.identity).unwrap();
        assert!(launch.command.ends_with("weather/./weather-ext"));
        assert_eq!(launch.args, vec!["--units", "metric"]);
        assert_eq!(launch.env, vec![("WEATHER_API".into(), "demo".into())]);
    }

    #[test]
    fn refresh_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ManifestRegistry::new(dir.path());
        assert!(!registry.refresh().unwrap());

        write_manifest(dir.path(), "weather", WEATHER);
        assert!(registry.refresh().unwrap());
        assert!(!registry.refresh().unwrap());

        std::fs::remove_dir_all(dir.path().join("weather")).unwrap();
        assert!(registry.refresh().unwrap());
        assert!(registry.available_extensions().is_empty());
    }

    #[test]
    fn static_registry_find() {
        let id = ExtensionIdentity::new("pkg", "A");
        let registry = StaticRegistry::new(vec![ExtensionListing::new(id.clone(), 1)]);
        assert!(registry.find(&id).is_some());
        registry.set_listings(Vec::new());
        assert!(registry.find(&id).is_none());
    }
}
