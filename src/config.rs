// Engine configuration, following the teacher's `DatabaseConfig` /
// `rustydb.toml` convention: a serde-backed struct with a `Default` impl
// for the values fixed by the specification, optionally overlaid with a
// TOML file and a handful of environment variables for containerized
// deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Chunk files are sealed once they exceed this size (2^26 bytes = 64 MiB).
pub const DEFAULT_CHUNK_SIZE_LIMIT: u64 = 1 << 26;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory under which the WAL and per-user chunk directories live.
    pub data_dir: PathBuf,
    /// Size at which an append chunk is sealed and a new one opened.
    pub chunk_size_limit: u64,
    /// How often the server's background loop should checkpoint the engine.
    pub checkpoint_interval: Duration,
    /// Listen address for the node-to-node / client wire protocol.
    pub listen_address: String,
    pub port: u16,
    /// Addresses of secondaries this node forwards to when acting as primary.
    pub secondaries: Vec<String>,
    /// Read deadline applied to sync sessions (9: explicit improvement
    /// over the unbounded original).
    pub sync_read_timeout: Duration,
    /// Whether this node starts as primary. The master/coordinator is the
    /// sole authority on this in production; it is a config default here
    /// purely to let the binary start standalone.
    pub start_as_primary: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            chunk_size_limit: DEFAULT_CHUNK_SIZE_LIMIT,
            checkpoint_interval: Duration::from_secs(5),
            listen_address: "127.0.0.1".to_string(),
            port: 9090,
            secondaries: Vec::new(),
            sync_read_timeout: Duration::from_secs(30),
            start_as_primary: true,
        }
    }
}

impl EngineConfig {
    /// Loads a config file (TOML) if present, falling back to defaults,
    /// then applies `KVSTORE_*` environment overrides on top - the same
    /// layering the teacher's server binary documents for `rustydb.toml`.
    pub fn load(config_path: &std::path::Path) -> Self {
        let mut config = if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(text) => toml::from_str(&text).unwrap_or_default(),
                Err(_) => Self::default(),
            }
        } else {
            Self::default()
        };

        if let Ok(dir) = std::env::var("KVSTORE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("KVSTORE_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }

        config
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("logging")
    }

    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.data_dir.join(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chunk_limit_matches_spec() {
        assert_eq!(EngineConfig::default().chunk_size_limit, 1 << 26);
    }

    #[test]
    fn missing_config_file_falls_back_to_default() {
        let config = EngineConfig::load(std::path::Path::new("/nonexistent/kvstore.toml"));
        assert_eq!(config.port, 9090);
    }
}
