//! Broker configuration.
//!
//! Every threshold the broker uses lives here. Values come from an
//! optional TOML file; any section or key left out falls back to its
//! default, so an empty file is a valid configuration.
//!
//! ```toml
//! listen = "0.0.0.0:3002"
//! min_sdk_version = "0.20.0"
//!
//! [rate_limit.client]
//! max_per_second = 25
//!
//! [transactions]
//! dropped_grace_secs = 600
//! ```

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use iob_core::{ApiKeyRecord, SessionRecord};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "IOB_CONFIG";

/// Environment variable overriding the listen address.
pub const LISTEN_ENV: &str = "IOB_LISTEN";

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub listen: SocketAddr,
    /// Hosts built with an older SDK are rejected at registration.
    pub min_sdk_version: String,
    pub rate_limit: RateLimits,
    pub liveness: LivenessConfig,
    pub transactions: TransactionConfig,
    pub registration: RegistrationConfig,
    pub channel: ChannelConfig,
    pub credentials: CredentialsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3002)),
            min_sdk_version: "0.20.0".to_string(),
            rate_limit: RateLimits::default(),
            liveness: LivenessConfig::default(),
            transactions: TransactionConfig::default(),
            registration: RegistrationConfig::default(),
            channel: ChannelConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

/// Rate-limit settings, one set per connection role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub host: RateLimitConfig,
    pub client: RateLimitConfig,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            host: RateLimitConfig {
                max_per_second: 250,
                alert_threshold: 50,
                history_size: 60,
                history_alert_limit: 30,
            },
            client: RateLimitConfig {
                max_per_second: 25,
                alert_threshold: 10,
                history_size: 60,
                history_alert_limit: 30,
            },
        }
    }
}

/// Sliding-window limits for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Hard cap on unprompted messages within one second.
    pub max_per_second: u32,
    /// A one-second window above this count is an "alert" window.
    pub alert_threshold: u32,
    /// Number of past windows remembered.
    pub history_size: usize,
    /// Close once more than this many remembered windows are alert windows.
    pub history_alert_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub heartbeat_interval_secs: u64,
    pub ping_timeout_secs: u64,
    /// A client with no successful ping for this long is closed.
    pub client_unreachable_secs: u64,
    /// A host whose instance was not touched for this long is closed.
    pub host_stale_secs: u64,
    pub sweep_interval_secs: u64,
    /// Instances untouched for this long are marked unreachable by the sweep.
    pub host_unreachable_secs: u64,
    /// Unreachable/offline instances untouched for this long are deleted.
    pub instance_retention_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            ping_timeout_secs: 5,
            client_unreachable_secs: 60,
            host_stale_secs: 6 * 60 * 60,
            sweep_interval_secs: 60,
            host_unreachable_secs: 60,
            instance_retention_secs: 6 * 60 * 60,
        }
    }
}

impl LivenessConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn client_unreachable(&self) -> Duration {
        Duration::from_secs(self.client_unreachable_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// How long a transaction may sit in CLIENT_CONNECTION_DROPPED.
    pub dropped_grace_secs: u64,
    pub sweep_interval_secs: u64,
    /// Timeout for broker-initiated calls to peers.
    ///
    /// A connection's reader waits on such calls inline, so this must stay
    /// below `liveness.client_unreachable_secs`.
    pub call_timeout_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            dropped_grace_secs: 10 * 60,
            sweep_interval_secs: 60,
            call_timeout_secs: 30,
        }
    }
}

impl TransactionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Bounded wait for a host registration to reach the head of its queue.
    pub queue_timeout_secs: u64,
    /// Bounded wait for a host to appear when starting a transaction.
    pub deferred_handshake_timeout_secs: u64,
    pub deferred_handshake_poll_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            queue_timeout_secs: 60,
            deferred_handshake_timeout_secs: 10,
            deferred_handshake_poll_ms: 250,
        }
    }
}

impl RegistrationConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn deferred_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.deferred_handshake_timeout_secs)
    }

    pub fn deferred_handshake_poll(&self) -> Duration {
        Duration::from_millis(self.deferred_handshake_poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    pub max_message_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 1024,
            max_message_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Credentials loaded into the in-memory store at startup, keyed by
/// token.
///
/// ```toml
/// [credentials.api_keys.live_3f9a]
/// id = "key-1"
/// user_id = "dev"
/// organization_id = "org-1"
/// environment = "PRODUCTION"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub api_keys: HashMap<String, ApiKeyRecord>,
    pub sessions: HashMap<String, SessionRecord>,
}

impl BrokerConfig {
    /// Loads the configuration.
    ///
    /// The file is `explicit` if given, else `$IOB_CONFIG`, else
    /// `<config_dir>/iob/iobd.toml`. A missing file yields defaults.
    /// `$IOB_LISTEN` overrides the listen address either way.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .or_else(default_config_path),
        };

        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) if explicit.is_some() => return Err(ConfigError::Missing(path)),
            _ => Self::default(),
        };

        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            config.listen = listen
                .parse()
                .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;
        }

        Ok(config)
    }

    /// Parses a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks constraints that span sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transactions.call_timeout_secs >= self.liveness.client_unreachable_secs {
            return Err(ConfigError::Invalid(format!(
                "transactions.call_timeout_secs ({}) must be less than \
                 liveness.client_unreachable_secs ({})",
                self.transactions.call_timeout_secs, self.liveness.client_unreachable_secs
            )));
        }
        Ok(())
    }
}

/// `<config_dir>/iob/iobd.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("iob").join("iobd.toml"))
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to read {}: {error}", path.display())]
    Read { path: PathBuf, error: String },

    #[error("failed to parse {}: {error}", path.display())]
    Parse { path: PathBuf, error: String },

    #[error("invalid listen address: {0}")]
    InvalidListen(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.listen.port(), 3002);
        assert_eq!(cfg.rate_limit.host.max_per_second, 250);
        assert_eq!(cfg.rate_limit.client.max_per_second, 25);
        assert_eq!(cfg.rate_limit.client.alert_threshold, 10);
        assert_eq!(cfg.liveness.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.transactions.dropped_grace_secs, 600);
        assert_eq!(cfg.registration.queue_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.min_sdk_version, "0.20.0");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen = \"0.0.0.0:9000\"\n\n[rate_limit.client]\nmax_per_second = 5\nalert_threshold = 2\nhistory_size = 10\nhistory_alert_limit = 3\n\n[transactions]\ndropped_grace_secs = 30"
        )
        .unwrap();

        let cfg = BrokerConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.listen.port(), 9000);
        assert_eq!(cfg.rate_limit.client.max_per_second, 5);
        assert_eq!(cfg.rate_limit.host.max_per_second, 250);
        assert_eq!(cfg.transactions.dropped_grace_secs, 30);
        assert_eq!(cfg.transactions.sweep_interval_secs, 60);
        assert_eq!(cfg.liveness, LivenessConfig::default());
    }

    #[test]
    fn test_credentials_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[credentials.api_keys.live_1]\nid = \"key-1\"\nuser_id = \"dev\"\norganization_id = \"org-1\"\nenvironment = \"PRODUCTION\"\n\n[credentials.sessions.s1]\nuser_id = \"alice\"\norganization_id = \"org-1\""
        )
        .unwrap();

        let cfg = BrokerConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.credentials.api_keys["live_1"].id.as_str(), "key-1");
        let session = &cfg.credentials.sessions["s1"];
        assert!(!session.ghost);
        assert_eq!(session.user_id.as_str(), "alice");
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cfg = BrokerConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg, BrokerConfig::default());
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen = [").unwrap();
        let err = BrokerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_call_timeout_must_undercut_client_unreachable() {
        assert!(BrokerConfig::default().validate().is_ok());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[liveness]\nclient_unreachable_secs = 20\n\n[transactions]\ncall_timeout_secs = 20"
        )
        .unwrap();
        let err = BrokerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("call_timeout_secs"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let err = BrokerConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }
}
