//! Userspace Ethernet bridge between sandboxed guests and an uplink, with a per-source firewall
//! on guest traffic.
#![forbid(unsafe_code)]

mod bridge;
mod config;
mod mac_table;
mod metrics;
mod server;
mod session;
pub mod transport;

pub use bridge::{Bridge, BridgeSettings, Disposition, Frame, PortAttachment, PortId, PortKind};
pub use config::{BridgeConfig, Cli, ConfigError, LogConfig, LogFormat, DEFAULT_QUEUE_DEPTH};
pub use mac_table::{Learned, MacTable, DEFAULT_MAC_CAPACITY, DEFAULT_MAC_TTL};
pub use metrics::{Metrics, MetricsSnapshot, PortMetrics, PortStats};
pub use server::{
    start_server, start_server_with, Attachments, RuleReloader, ServerError, ServerHandle,
};
