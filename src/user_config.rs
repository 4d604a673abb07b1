use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extension::{ExtensionIdentity, ProtocolRange};

const DEFAULT_MAX_DEFERRED_OPS: usize = 64;
const DEFAULT_COLLAPSE_WINDOW_MS: u64 = 500;
const DEFAULT_PERIODIC_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Extensions active in the host's own view, in display order.
    pub active_extensions: Vec<ExtensionIdentity>,
    /// Expose every extension's data to every multiplexer client.
    pub force_world_readable: bool,
    /// Extensions the host refuses to bind to.
    pub blocked_extensions: Vec<ExtensionIdentity>,
    pub supervisor: SupervisorConfig,
    pub triggers: TriggerConfig,
    pub multiplexer: MultiplexerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub protocol_min: i32,
    pub protocol_max: i32,
    /// Per-session cap; the oldest deferred operation is dropped beyond it.
    pub max_deferred_ops: usize,
    pub collapse_window_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            protocol_min: ProtocolRange::CURRENT.min,
            protocol_max: ProtocolRange::CURRENT.max,
            max_deferred_ops: DEFAULT_MAX_DEFERRED_OPS,
            collapse_window_ms: DEFAULT_COLLAPSE_WINDOW_MS,
        }
    }
}

impl SupervisorConfig {
    pub fn protocol_range(&self) -> ProtocolRange {
        ProtocolRange::new(self.protocol_min, self.protocol_max)
    }

    pub fn collapse_window(&self) -> Duration {
        Duration::from_millis(self.collapse_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub periodic_interval_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            periodic_interval_secs: DEFAULT_PERIODIC_INTERVAL_SECS,
        }
    }
}

impl TriggerConfig {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Fixed delay between reconnect attempts of a multiplexer client.
    pub reconnect_delay_ms: u64,
    /// Accept host services that fail ownership verification.
    pub trust_debug_hosts: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            trust_debug_hosts: false,
        }
    }
}

impl MultiplexerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl HostConfig {
    /// $STATUSHUB_CONFIG_DIR/config.toml or ~/.config/statushub/config.toml
    pub fn config_path() -> PathBuf {
        crate::clienv::config_dir().join("config.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading host config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            active = config.active_extensions.len(),
            blocked = config.blocked_extensions.len(),
            force_world_readable = config.force_world_readable,
            "Host config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        tracing::trace!(path = %path.display(), "Saving host config");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        tracing::trace!("Host config saved");
        Ok(())
    }

    pub fn is_blocked(&self, identity: &ExtensionIdentity) -> bool {
        self.blocked_extensions.contains(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert!(config.active_extensions.is_empty());
        assert_eq!(config.supervisor.max_deferred_ops, DEFAULT_MAX_DEFERRED_OPS);
        assert_eq!(config.supervisor.protocol_range(), ProtocolRange::CURRENT);
        assert_eq!(
            config.multiplexer.reconnect_delay(),
            Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS)
        );
    }

    #[test]
    fn parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
active_extensions = ["com.example/.Weather", "com.example/.Mail"]
blocked_extensions = ["evil/Thing"]

[supervisor]
protocol_max = 1
"#,
        )
        .unwrap();

        let config = HostConfig::load_from(&path).unwrap();
        assert_eq!(config.active_extensions.len(), 2);
        assert_eq!(
            config.active_extensions[0].to_string(),
            "com.example/com.example.Weather"
        );
        assert!(config.is_blocked(&"evil/Thing".parse().unwrap()));
        assert_eq!(config.supervisor.protocol_range(), ProtocolRange::new(1, 1));
        assert_eq!(
            config.supervisor.collapse_window(),
            Duration::from_millis(DEFAULT_COLLAPSE_WINDOW_MS)
        );
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = HostConfig::default();
        config.force_world_readable = true;
        config.triggers.periodic_interval_secs = 60;
        config.save_to(&path).unwrap();

        let loaded = HostConfig::load_from(&path).unwrap();
        assert!(loaded.force_world_readable);
        assert_eq!(loaded.triggers.periodic_interval(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_bad_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "active_extensions = [\"nope\"]\n").unwrap();
        assert!(HostConfig::load_from(&path).is_err());
    }
}
