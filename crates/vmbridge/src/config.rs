use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use vmbridge_firewall::{RuleCacheConfig, DEFAULT_RULE_CACHE_CAPACITY};
use vmbridge_packet::ETH_HEADER_LEN;
use vmbridge_protocol::DEFAULT_MAX_FRAME_LEN;

use crate::bridge::BridgeSettings;
use crate::mac_table::DEFAULT_MAC_CAPACITY;

pub const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--uplink is required unless --no-uplink is given")]
    MissingUplink,
    #[error("--uplink and --no-uplink are mutually exclusive")]
    ConflictingUplink,
    #[error("no guest ports configured (use --listen, --connect or --tap)")]
    NoGuestPorts,
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("--max-frame-len must be at least 14 bytes, got {0}")]
    FrameLenTooSmall(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Command line and environment configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "vmbridge", version, about)]
pub struct Cli {
    /// Physical interface bridged to the guests.
    ///
    /// Environment variable: `VMBRIDGE_UPLINK`.
    #[arg(long, env = "VMBRIDGE_UPLINK")]
    uplink: Option<String>,

    /// Run without an uplink, bridging guests only to each other.
    ///
    /// Environment variable: `VMBRIDGE_NO_UPLINK`.
    #[arg(long, env = "VMBRIDGE_NO_UPLINK")]
    no_uplink: bool,

    /// Unix socket path on which guest device backends are accepted.
    ///
    /// Environment variable: `VMBRIDGE_LISTEN`.
    #[arg(long, env = "VMBRIDGE_LISTEN")]
    listen: Option<PathBuf>,

    /// Guest device socket to dial at startup. Repeatable.
    ///
    /// Environment variable: `VMBRIDGE_CONNECT` (comma separated).
    #[arg(long = "connect", env = "VMBRIDGE_CONNECT", value_delimiter = ',')]
    connect: Vec<PathBuf>,

    /// TAP device attached as a guest-facing port. Repeatable.
    ///
    /// Environment variable: `VMBRIDGE_TAP` (comma separated).
    #[arg(long = "tap", env = "VMBRIDGE_TAP", value_delimiter = ',')]
    tap: Vec<String>,

    /// JSON rule file. Without one, all IP traffic from guests is dropped.
    ///
    /// Environment variable: `VMBRIDGE_RULES`.
    #[arg(long, env = "VMBRIDGE_RULES")]
    rules: Option<PathBuf>,

    /// Largest frame accepted on a guest session.
    ///
    /// Environment variable: `VMBRIDGE_MAX_FRAME_LEN`.
    #[arg(long, env = "VMBRIDGE_MAX_FRAME_LEN", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,

    /// Outbound queue depth per port, in frames.
    ///
    /// Environment variable: `VMBRIDGE_QUEUE_DEPTH`.
    #[arg(long, env = "VMBRIDGE_QUEUE_DEPTH", default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    /// Environment variable: `VMBRIDGE_MAC_TTL_SECS`.
    #[arg(long, env = "VMBRIDGE_MAC_TTL_SECS", default_value_t = 300)]
    mac_ttl_secs: u64,

    /// Environment variable: `VMBRIDGE_MAC_CAPACITY`.
    #[arg(long, env = "VMBRIDGE_MAC_CAPACITY", default_value_t = DEFAULT_MAC_CAPACITY)]
    mac_capacity: usize,

    /// How long a source's rule list is cached. 0 caches until evicted or reloaded.
    ///
    /// Environment variable: `VMBRIDGE_RULE_TTL_SECS`.
    #[arg(long, env = "VMBRIDGE_RULE_TTL_SECS", default_value_t = 60)]
    rule_ttl_secs: u64,

    /// Environment variable: `VMBRIDGE_RULE_CACHE_CAPACITY`.
    #[arg(long, env = "VMBRIDGE_RULE_CACHE_CAPACITY", default_value_t = DEFAULT_RULE_CACHE_CAPACITY)]
    rule_cache_capacity: usize,

    /// Address of the HTTP endpoint serving `/metrics` and `/healthz`.
    ///
    /// Environment variable: `VMBRIDGE_METRICS_ADDR`.
    #[arg(long, env = "VMBRIDGE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Interval of the periodic stats log line. 0 disables it.
    ///
    /// Environment variable: `VMBRIDGE_STATS_INTERVAL_SECS`.
    #[arg(long, env = "VMBRIDGE_STATS_INTERVAL_SECS", default_value_t = 60)]
    stats_interval_secs: u64,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` takes precedence.
    ///
    /// Environment variable: `VMBRIDGE_LOG_LEVEL`.
    #[arg(long, env = "VMBRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Environment variable: `VMBRIDGE_LOG_FORMAT`.
    #[arg(long, env = "VMBRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub uplink: Option<String>,
    pub listen: Option<PathBuf>,
    pub connect: Vec<PathBuf>,
    pub taps: Vec<String>,
    pub rules: Option<PathBuf>,
    pub max_frame_len: usize,
    pub queue_depth: usize,
    pub mac_ttl: Duration,
    pub mac_capacity: usize,
    pub rule_ttl: Option<Duration>,
    pub rule_cache_capacity: usize,
    pub metrics_addr: Option<SocketAddr>,
    pub stats_interval: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            uplink: None,
            listen: None,
            connect: Vec::new(),
            taps: Vec::new(),
            rules: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            mac_ttl: Duration::from_secs(300),
            mac_capacity: DEFAULT_MAC_CAPACITY,
            rule_ttl: Some(Duration::from_secs(60)),
            rule_cache_capacity: DEFAULT_RULE_CACHE_CAPACITY,
            metrics_addr: None,
            stats_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_len == 0 {
            return Err(ConfigError::Zero("--max-frame-len"));
        }
        if self.max_frame_len < ETH_HEADER_LEN {
            return Err(ConfigError::FrameLenTooSmall(self.max_frame_len));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Zero("--queue-depth"));
        }
        if self.mac_capacity == 0 {
            return Err(ConfigError::Zero("--mac-capacity"));
        }
        if self.rule_cache_capacity == 0 {
            return Err(ConfigError::Zero("--rule-cache-capacity"));
        }
        if self.mac_ttl.is_zero() {
            return Err(ConfigError::Zero("--mac-ttl-secs"));
        }
        Ok(())
    }

    pub fn limits(&self) -> vmbridge_protocol::Limits {
        vmbridge_protocol::Limits {
            max_frame_len: self.max_frame_len,
        }
    }

    pub fn bridge_settings(&self) -> Result<BridgeSettings, ConfigError> {
        Ok(BridgeSettings {
            queue_depth: self.queue_depth,
            mac_ttl: self.mac_ttl,
            mac_capacity: NonZeroUsize::new(self.mac_capacity)
                .ok_or(ConfigError::Zero("--mac-capacity"))?,
        })
    }

    pub fn rule_cache(&self) -> Result<RuleCacheConfig, ConfigError> {
        Ok(RuleCacheConfig {
            capacity: NonZeroUsize::new(self.rule_cache_capacity)
                .ok_or(ConfigError::Zero("--rule-cache-capacity"))?,
            ttl: self.rule_ttl,
        })
    }
}

impl Cli {
    pub fn into_config(self) -> Result<(BridgeConfig, LogConfig), ConfigError> {
        let uplink = match (self.uplink, self.no_uplink) {
            (Some(_), true) => return Err(ConfigError::ConflictingUplink),
            (None, false) => return Err(ConfigError::MissingUplink),
            (uplink, _) => uplink.map(|name| name.trim().to_string()),
        };
        if self.listen.is_none() && self.connect.is_empty() && self.tap.is_empty() {
            return Err(ConfigError::NoGuestPorts);
        }

        let cfg = BridgeConfig {
            uplink,
            listen: self.listen,
            connect: self.connect,
            taps: self.tap,
            rules: self.rules,
            max_frame_len: self.max_frame_len,
            queue_depth: self.queue_depth,
            mac_ttl: Duration::from_secs(self.mac_ttl_secs),
            mac_capacity: self.mac_capacity,
            rule_ttl: (self.rule_ttl_secs != 0).then(|| Duration::from_secs(self.rule_ttl_secs)),
            rule_cache_capacity: self.rule_cache_capacity,
            metrics_addr: self.metrics_addr,
            stats_interval: (self.stats_interval_secs != 0)
                .then(|| Duration::from_secs(self.stats_interval_secs)),
        };
        cfg.validate()?;

        let log = LogConfig {
            level: self.log_level,
            format: self.log_format,
        };
        Ok((cfg, log))
    }
}
