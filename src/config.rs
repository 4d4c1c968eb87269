//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AMTRELAY_API_KEY`, `AMTRELAY_LISTEN`,
//!    `AMTRELAY_SERVER_ID`
//! 2. **Config file** — path via `--config <path>`, or `amtrelay.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:2040"
//! data_dir = "/var/lib/amtrelay"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [logging]
//! level = "info"
//!
//! [relay]
//! recording = false
//! recordings_dir = "recordings"   # relative to data_dir unless absolute
//!
//! [cluster]
//! server_id = "relay-1"
//! [cluster.peers]
//! relay-2 = "wss://relay-2.example.com"
//!
//! [[domain]]
//! id = "default"
//! activation = "acm"              # "ccm" = CCM only, "acm" = ACM capable
//! amt_password = "P@ssw0rd!"      # omit to generate per-device credentials
//! recording = true                # per-group override of [relay].recording
//! [[domain.trusted_certs]]
//! common_name = "mgmt.example.com"
//! sha256 = "deadbeef..."
//! sha1 = ""
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::util::expand_tilde;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Device groups. Devices activate into exactly one group; the group
    /// carries the activation policy and certificate allow-list.
    #[serde(default, rename = "domain")]
    pub domains: Vec<DomainConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:2040`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persistent data (session recordings). Default
    /// `/var/lib/amtrelay`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `AMTRELAY_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Relay engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Record relay sessions to disk by default (default false). Device
    /// groups can override with their own `recording` flag.
    #[serde(default)]
    pub recording: bool,
    /// Directory for session recordings, relative to `data_dir` unless
    /// absolute (default `recordings`).
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: String,
}

/// Cluster identity and peer endpoints for multi-server deployments.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// This server's id in the cluster routing table (default `local`).
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Peer server id → base WebSocket URL (e.g. `wss://relay-2.example.com`).
    #[serde(default)]
    pub peers: HashMap<String, String>,
}

/// Device-group activation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationPolicy {
    /// Client control mode only; never attempt ACM.
    Ccm,
    /// Admin control mode when a trusted certificate matches, CCM otherwise.
    Acm,
}

/// A certificate-hash allow-list entry for ACM activation.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustedCert {
    /// Certificate common name. `*` matches any FQDN but never qualifies a
    /// device for ACM on its own.
    pub common_name: String,
    /// Hex SHA-256 fingerprint, empty if unknown.
    #[serde(default)]
    pub sha256: String,
    /// Hex SHA-1 fingerprint, empty if unknown.
    #[serde(default)]
    pub sha1: String,
}

/// Per-device-group configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    /// Group identifier, referenced by device records and handshakes.
    pub id: String,
    /// Activation policy (default CCM only).
    #[serde(default = "default_activation_policy")]
    pub activation: ActivationPolicy,
    /// Administrative credential configured for the group. When absent, a
    /// random credential meeting the complexity rule is generated per device.
    pub amt_password: Option<String>,
    /// Per-group session recording override.
    pub recording: Option<bool>,
    /// Certificate allow-list consulted during ACM mode selection.
    #[serde(default)]
    pub trusted_certs: Vec<TrustedCert>,
}

fn default_listen() -> String {
    "0.0.0.0:2040".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/amtrelay".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_recordings_dir() -> String {
    "recordings".to_string()
}
fn default_server_id() -> String {
    "local".to_string()
}
fn default_activation_policy() -> ActivationPolicy {
    ActivationPolicy::Ccm
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            recording: false,
            recordings_dir: default_recordings_dir(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            peers: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `amtrelay.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("amtrelay.toml").exists() {
            let content =
                std::fs::read_to_string("amtrelay.toml").expect("Failed to read amtrelay.toml");
            toml::from_str(&content).expect("Failed to parse amtrelay.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                logging: LoggingConfig::default(),
                relay: RelayConfig::default(),
                cluster: ClusterConfig::default(),
                domains: Vec::new(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("AMTRELAY_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("AMTRELAY_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(id) = std::env::var("AMTRELAY_SERVER_ID") {
            config.cluster.server_id = id;
        }

        config
    }

    /// Look up a device-group configuration by id.
    pub fn domain(&self, id: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.id == id)
    }

    /// Whether sessions for the given device group are recorded.
    pub fn recording_enabled(&self, domain_id: &str) -> bool {
        self.domain(domain_id)
            .and_then(|d| d.recording)
            .unwrap_or(self.relay.recording)
    }

    /// Absolute path of the recordings directory.
    pub fn recordings_dir(&self) -> PathBuf {
        let dir = PathBuf::from(expand_tilde(&self.relay.recordings_dir).into_owned());
        if dir.is_absolute() {
            dir
        } else {
            PathBuf::from(expand_tilde(&self.server.data_dir).into_owned()).join(dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:2040");
        assert_eq!(config.auth.api_key, "change-me");
        assert!(!config.relay.recording);
        assert_eq!(config.cluster.server_id, "local");
        assert!(config.domains.is_empty());
    }

    #[test]
    fn test_domain_parsing_and_recording_override() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            recording = false

            [[domain]]
            id = "default"
            activation = "acm"
            recording = true

            [[domain.trusted_certs]]
            common_name = "mgmt.example.com"
            sha256 = "deadbeef"
            "#,
        )
        .unwrap();

        let d = config.domain("default").unwrap();
        assert_eq!(d.activation, ActivationPolicy::Acm);
        assert_eq!(d.trusted_certs.len(), 1);
        assert_eq!(d.trusted_certs[0].common_name, "mgmt.example.com");
        assert!(config.recording_enabled("default"));
        assert!(!config.recording_enabled("other"));
    }

    #[test]
    fn test_recordings_dir_relative_to_data_dir() {
        let config: Config = toml::from_str(
            r#"
            [server]
            data_dir = "/tmp/amtrelay"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.recordings_dir(),
            PathBuf::from("/tmp/amtrelay/recordings")
        );
    }
}
