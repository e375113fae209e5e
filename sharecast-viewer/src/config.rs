//! Viewer configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sharecast_core::ClientConfig;

/// Top-level configuration for the viewer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub network: NetworkConfig,
    pub client: ClientSection,
    pub logging: LoggingConfig,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host address (IP:port).
    pub host_address: String,
    /// Name shown to the host.
    pub identity: String,
    /// Join timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Acknowledgement cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub ack_every: u64,
    pub ack_interval_ms: u64,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host_address: "127.0.0.1:7340".into(),
            identity: "viewer".into(),
            timeout_ms: 10_000,
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            ack_every: 15,
            ack_interval_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ViewerConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            ack_every: self.client.ack_every.clamp(1, 1000),
            ack_interval: Duration::from_millis(self.client.ack_interval_ms.clamp(50, 60_000)),
            join_timeout: Duration::from_millis(self.network.timeout_ms.clamp(100, 120_000)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
