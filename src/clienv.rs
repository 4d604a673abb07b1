use std::path::PathBuf;

/// Environment variables understood by the host and its CLI.
#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    ConfigDir,
    DataDir,
    PluginsDir,
    Socket,
    TcpPort,
    Debug,
    /// Set for extension processes: the identity they were started as.
    Extension,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::ConfigDir => "STATUSHUB_CONFIG_DIR",
            EnvVar::DataDir => "STATUSHUB_DATA_DIR",
            EnvVar::PluginsDir => "STATUSHUB_PLUGINS_DIR",
            EnvVar::Socket => "STATUSHUB_SOCKET",
            EnvVar::TcpPort => "STATUSHUB_TCP_PORT",
            EnvVar::Debug => "STATUSHUB_DEBUG",
            EnvVar::Extension => "STATUSHUB_EXTENSION",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const APP_SUBDIR: &str = "statushub";
const DEFAULT_TCP_PORT: u16 = 14790;

/// Non-empty value of an environment variable.
pub fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Config directory ($STATUSHUB_CONFIG_DIR or ~/.config/statushub)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ConfigDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(APP_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Data directory ($STATUSHUB_DATA_DIR or ~/.local/share/statushub)
pub fn data_dir() -> PathBuf {
    let dir = env_opt(EnvVar::DataDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(APP_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Installed extensions ($STATUSHUB_PLUGINS_DIR or <data>/extensions)
pub fn plugins_dir() -> PathBuf {
    env_opt(EnvVar::PluginsDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("extensions"))
}

/// Persisted status cache (<data>/status-cache.json)
pub fn cache_path() -> PathBuf {
    data_dir().join("status-cache.json")
}

/// Host socket path ($STATUSHUB_SOCKET or <data>/host.sock)
pub fn socket_path() -> PathBuf {
    let path = env_opt(EnvVar::Socket.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("host.sock"));
    tracing::trace!(path = %path.display(), "Host socket path");
    path
}

/// Host TCP port for non-Unix platforms ($STATUSHUB_TCP_PORT or 14790)
pub fn tcp_port() -> u16 {
    env_opt(EnvVar::TcpPort.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_TCP_PORT)
}

/// Debug builds trust any host service ($STATUSHUB_DEBUG)
pub fn debug_mode() -> bool {
    let enabled = env_opt(EnvVar::Debug.as_str())
        .map(|v| is_truthy(&v))
        .unwrap_or(cfg!(debug_assertions));
    tracing::trace!(enabled, "Debug mode check");
    enabled
}
