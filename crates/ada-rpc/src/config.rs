//! Transport constants and the on-disk RPC configuration.

use crate::error::{Result, RpcError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transport timing and sizing limits.
pub struct TransportConfig;

impl TransportConfig {
    /// How long the watcher waits for input before re-checking its stop signal.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Requests from connected peers queued behind the one being served.
    pub const PENDING_REQUESTS: usize = 16;
    /// Bound on reading the rest of a message once its first byte arrived,
    /// and on writing one.
    pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
    /// Largest single frame body accepted from a peer (64 MiB).
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
}

/// Certificate file naming.
pub struct CertificateConfig;

impl CertificateConfig {
    pub const PUBLIC_SUFFIX: &'static str = ".key";
    pub const SECRET_SUFFIX: &'static str = ".key_secret";
    pub const DEFAULT_NAME: &'static str = "server";
}

/// Settings a deployment supplies to a server or client.
///
/// Loaded from a JSON file; every field except `endpoint` is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RpcConfig {
    /// Socket address, e.g. `tcp://127.0.0.1:5555` or `ipc:///tmp/ada.sock`.
    pub endpoint: String,
    /// Pinned server public certificate (client side).
    #[serde(default)]
    pub server_certificate: Option<PathBuf>,
    /// Server key pair certificate (server side).
    #[serde(default)]
    pub secret_certificate: Option<PathBuf>,
    #[serde(default = "RpcConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Endpoint that receives requests carrying no endpoint name.
    #[serde(default)]
    pub default_endpoint: Option<String>,
    /// TTL consumed by the response cache outside this crate, e.g. `"5m"`.
    #[serde(default)]
    pub cache_ttl: Option<String>,
}

impl RpcConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            server_certificate: None,
            secret_certificate: None,
            poll_interval_ms: Self::default_poll_interval_ms(),
            default_endpoint: None,
            cache_ttl: None,
        }
    }

    fn default_poll_interval_ms() -> u64 {
        TransportConfig::POLL_INTERVAL.as_millis() as u64
    }

    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RpcError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: RpcConfig = serde_json::from_str(&contents)
            .map_err(|e| RpcError::config(format!("invalid {}: {}", path.display(), e)))?;
        if config.poll_interval_ms == 0 {
            return Err(RpcError::config("poll_interval_ms must be greater than zero"));
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"endpoint": "tcp://127.0.0.1:5555"}}"#).unwrap();

        let config = RpcConfig::load(file.path()).unwrap();
        assert_eq!(config, RpcConfig::new("tcp://127.0.0.1:5555"));
        assert_eq!(config.poll_interval(), TransportConfig::POLL_INTERVAL);
    }

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "endpoint": "ipc:///tmp/ada.sock",
                "server_certificate": "/etc/ada/server.key",
                "poll_interval_ms": 250,
                "default_endpoint": "transcribe",
                "cache_ttl": "5m"
            }}"#
        )
        .unwrap();

        let config = RpcConfig::load(file.path()).unwrap();
        assert_eq!(
            config.server_certificate.as_deref(),
            Some(Path::new("/etc/ada/server.key"))
        );
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.default_endpoint.as_deref(), Some("transcribe"));
    }

    #[test]
    fn test_load_rejects_zero_poll_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"endpoint": "tcp://127.0.0.1:1", "poll_interval_ms": 0}}"#).unwrap();

        assert!(matches!(
            RpcConfig::load(file.path()),
            Err(RpcError::Config { .. })
        ));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        assert!(matches!(
            RpcConfig::load("/nonexistent/ada-rpc.json"),
            Err(RpcError::Config { .. })
        ));
    }
}
