//! Server configuration.
//!
//! Reads TOML from `$CHUNKLINE_CONFIG` or
//! `~/.config/chunkline/server.toml`. A missing file is created with
//! defaults and a freshly generated access token.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use chunkline_upload_server::{StoreConfig, SweeperConfig};
use chunkline_ws_server::ServerConfig;

const CONFIG_ENV: &str = "CHUNKLINE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSection {
    /// Announced to clients in the handshake.
    pub name: String,
    pub bind: SocketAddr,
    pub max_connections: usize,
}

impl Default for ListenSection {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            name: "chunkline".into(),
            bind: ([127, 0, 0, 1], 7460).into(),
            max_connections: server.max_connections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Staged chunks, session manifests and artifacts live below this.
    pub data_dir: PathBuf,
    pub max_file_size: u64,
    pub max_chunk_size: u64,
    pub max_concurrent_chunk_writes: usize,
    pub retention_secs: u64,
    pub assemble_on_last_chunk: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            data_dir: config_dir().join("data"),
            max_file_size: store.max_file_size,
            max_chunk_size: store.max_chunk_size,
            max_concurrent_chunk_writes: store.max_concurrent_chunk_writes,
            retention_secs: store.retention.as_secs(),
            assemble_on_last_chunk: store.assemble_on_last_chunk,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSection {
    pub interval_secs: u64,
    pub max_idle_secs: u64,
}

impl Default for SweeperSection {
    fn default() -> Self {
        let sweeper = SweeperConfig::default();
        Self {
            interval_secs: sweeper.interval.as_secs(),
            max_idle_secs: sweeper.max_idle.as_secs(),
        }
    }
}

/// One accepted bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub identity: String,
}

/// Full server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ListenSection,
    pub store: StoreSection,
    pub sweeper: SweeperSection,
    pub tokens: Vec<TokenEntry>,
}

impl Settings {
    /// Loads the configuration, writing a default file first if none exists.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_file_path();
        if !path.exists() {
            let settings = Self::with_generated_token();
            settings.save(&path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            return Ok(settings);
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        set_permissions_0600(path);
        Ok(())
    }

    /// Defaults plus one random token for a `default` identity.
    pub fn with_generated_token() -> Self {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            tokens: vec![TokenEntry {
                token: hex::encode(bytes),
                identity: "default".into(),
            }],
            ..Default::default()
        }
    }

    pub fn listen_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.server.bind,
            max_connections: self.server.max_connections,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_file_size: self.store.max_file_size,
            max_chunk_size: self.store.max_chunk_size,
            max_concurrent_chunk_writes: self.store.max_concurrent_chunk_writes,
            retention: Duration::from_secs(self.store.retention_secs),
            assemble_on_last_chunk: self.store.assemble_on_last_chunk,
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweeper.interval_secs.max(1)),
            max_idle: Duration::from_secs(self.sweeper.max_idle_secs),
        }
    }
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

fn config_file_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => config_dir().join("server.toml"),
    }
}

fn config_dir() -> PathBuf {
    config_base_dir().join("chunkline")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}
