//! Configuration for identity acquisition, staging and TLS

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the Workload API endpoint
pub const ENDPOINT_SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Default SPIRE agent endpoint
pub const DEFAULT_SOCKET: &str = "unix:///tmp/spire-agent/public/api.sock";

/// Top level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Workload API connection settings
    #[serde(default)]
    pub workload_api: WorkloadApiConfig,

    /// TLS settings
    #[serde(default)]
    pub tls: TlsSettings,

    /// Credential staging settings
    #[serde(default)]
    pub staging: StagingConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Parse configuration from a JSON document
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        if let Ok(socket) = std::env::var(ENDPOINT_SOCKET_ENV) {
            if !socket.is_empty() {
                self.workload_api.socket = socket;
            }
        }
    }
}

/// Workload API connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct WorkloadApiConfig {
    /// Endpoint address, `unix:///path` or a bare path
    #[serde(default = "default_socket")]
    pub socket: String,

    /// Bound on waiting for the first identity, in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Bound on connecting the socket, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for WorkloadApiConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl WorkloadApiConfig {
    /// Config pointing at a specific endpoint, other fields defaulted
    pub fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            ..Self::default()
        }
    }

    /// Filesystem path of the Unix socket
    pub fn socket_path(&self) -> Result<PathBuf> {
        let path = match self.socket.split_once("://") {
            Some(("unix", rest)) => rest,
            Some((scheme, _)) => {
                return Err(Error::Config(format!(
                    "Unsupported Workload API scheme {:?}, expected unix",
                    scheme
                )))
            }
            None => self.socket.as_str(),
        };

        if path.is_empty() {
            return Err(Error::Config("Workload API socket path is empty".into()));
        }
        Ok(PathBuf::from(path))
    }

    /// Initial fetch timeout
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Socket connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_socket() -> String {
    DEFAULT_SOCKET.to_string()
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// Lowest TLS version a session may negotiate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum MinTlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    /// TLS 1.3 only
    #[serde(rename = "1.3")]
    Tls13,
}

/// TLS settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TlsSettings {
    /// Minimum protocol version
    #[serde(default)]
    pub min_version: MinTlsVersion,

    /// Bound on a single handshake, in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            min_version: MinTlsVersion::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl TlsSettings {
    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

/// Where staged credentials live
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StagingMode {
    /// Zeroizing in-memory buffers
    #[default]
    Memory,
    /// Private temporary files
    TempFiles,
}

/// Credential staging settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StagingConfig {
    /// Backend
    #[serde(default)]
    pub mode: StagingMode,

    /// Parent directory for temp files, the system temp dir if unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}
