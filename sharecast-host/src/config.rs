//! Configuration for the host service.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sharecast_core::invite::MAX_CODE_EXPIRY;
use sharecast_core::stream::CaptureConfig;
use sharecast_core::{
    BroadcastConfig, CodePolicy, EncoderConfig, InviteCode, NetworkConfig, PipelineConfig,
    SessionConfig,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub network: NetworkSection,
    pub session: SessionSection,
    pub capture: CaptureSection,
    pub encoder: EncoderSection,
    pub broadcast: BroadcastSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Address viewers connect to.
    pub listen: String,
    /// Seconds a new connection has to present its code.
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Name this host announces itself with.
    pub host_name: String,
    /// Fixed invitation code; empty means generate one.
    pub code: String,
    pub code_length: usize,
    /// Code lifetime in seconds.
    pub code_expiry_secs: u64,
    /// Successful joins per code; 0 means unlimited.
    pub max_uses: u32,
    pub max_viewers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Captures per second.
    pub rate_hz: u32,
    /// Size of the synthetic test pattern.
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub keyframe_interval: u64,
    pub delta_ratio: f64,
    pub block_size: usize,
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSection {
    /// Per-viewer queue budget in keyframes.
    pub queue_keyframes: usize,
    pub min_queue_kib: usize,
    pub stall_timeout_ms: u64,
    /// Unacknowledged frames before a resync.
    pub loss_threshold: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7340".into(),
            join_timeout_secs: 10,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            host_name: "sharecast-host".into(),
            code: String::new(),
            code_length: 6,
            code_expiry_secs: 600,
            max_uses: 0,
            max_viewers: 32,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            rate_hz: 20,
            width: 1280,
            height: 720,
        }
    }
}

impl Default for EncoderSection {
    fn default() -> Self {
        let d = EncoderConfig::default();
        Self {
            keyframe_interval: d.keyframe_interval,
            delta_ratio: d.delta_ratio,
            block_size: d.block_size,
            compression_level: d.compression_level,
        }
    }
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            queue_keyframes: 3,
            min_queue_kib: 64,
            stall_timeout_ms: 5000,
            loss_threshold: 60,
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

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
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

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.network.listen.parse()
    }

    pub fn to_network_config(&self) -> NetworkConfig {
        NetworkConfig {
            join_timeout: Duration::from_secs(self.network.join_timeout_secs.clamp(1, 300)),
        }
    }

    pub fn to_code_policy(&self) -> CodePolicy {
        CodePolicy {
            expiry: Duration::from_secs(
                self.session
                    .code_expiry_secs
                    .clamp(1, MAX_CODE_EXPIRY.as_secs()),
            ),
            max_uses: (self.session.max_uses > 0).then_some(self.session.max_uses),
            length: self.session.code_length.clamp(6, 8),
        }
    }

    /// The configured fixed code, if any. An unusable code is ignored.
    pub fn fixed_code(&self) -> Option<InviteCode> {
        if self.session.code.trim().is_empty() {
            return None;
        }
        match InviteCode::parse(&self.session.code) {
            Ok(code) => Some(code),
            Err(_) => {
                tracing::warn!(code = %self.session.code, "configured code is not 6-8 letters/digits; generating one");
                None
            }
        }
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            max_sessions_per_host: 1,
            max_viewers: self.session.max_viewers.clamp(1, 1024),
            code_policy: self.to_code_policy(),
            broadcast: self.to_broadcast_config(),
        }
    }

    pub fn to_broadcast_config(&self) -> BroadcastConfig {
        let b = &self.broadcast;
        BroadcastConfig {
            queue_keyframes: b.queue_keyframes.clamp(1, 16),
            min_queue_bytes: b.min_queue_kib.max(16) * 1024,
            stall_timeout: Duration::from_millis(b.stall_timeout_ms.clamp(100, 60_000)),
            loss_threshold: b.loss_threshold.max(1),
            ..BroadcastConfig::default()
        }
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let e = &self.encoder;
        PipelineConfig {
            capture: CaptureConfig {
                rate_hz: self.capture.rate_hz.clamp(1, 60),
            },
            encoder: EncoderConfig {
                keyframe_interval: e.keyframe_interval.max(1),
                delta_ratio: e.delta_ratio.clamp(0.05, 1.0),
                block_size: e.block_size.clamp(8, 256),
                compression_level: e.compression_level.clamp(1, 19),
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
