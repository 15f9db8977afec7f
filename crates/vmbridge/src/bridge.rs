//! Forwarding core: MAC learning, firewall enforcement and fan-out to port queues.
//!
//! The bridge is plain owned state driven by one task. Port I/O happens elsewhere; the bridge
//! only sees whole frames coming in and hands shared frame buffers to bounded per-port queues.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use vmbridge_firewall::{Firewall, RuleError};
use vmbridge_packet::{
    extract_dst_port, is_broadcast_or_multicast, parse_ethernet, parse_ip, FrameError,
};

use crate::mac_table::{Learned, MacTable, DEFAULT_MAC_CAPACITY, DEFAULT_MAC_TTL};
use crate::metrics::{Metrics, PortMetrics};

/// A frame shared between every queue it is flooded to.
pub type Frame = Arc<[u8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// The physical/upstream side. Traffic from it is not filtered.
    Uplink,
    /// A guest-facing port. IP traffic from it goes through the firewall.
    Guest,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uplink => "uplink",
            Self::Guest => "guest",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub queue_depth: usize,
    pub mac_ttl: Duration,
    pub mac_capacity: NonZeroUsize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            mac_ttl: DEFAULT_MAC_TTL,
            mac_capacity: NonZeroUsize::new(DEFAULT_MAC_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// What happened to one ingress frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Sent to the single port the destination was learned on.
    Unicast(PortId),
    /// Sent to this many ports.
    Flooded(usize),
    /// The destination lives behind the ingress port.
    Filtered,
    /// Denied by the firewall.
    Blocked,
    Malformed(FrameError),
    /// The ingress port is no longer registered.
    UnknownPort,
}

struct Port {
    name: String,
    kind: PortKind,
    tx: mpsc::Sender<Frame>,
    metrics: PortMetrics,
}

/// A newly attached port: its id, the queue its writer drains and its counters.
pub struct PortAttachment {
    pub id: PortId,
    pub outbound: mpsc::Receiver<Frame>,
    pub metrics: PortMetrics,
}

pub struct Bridge {
    ports: BTreeMap<PortId, Port>,
    next_port: u64,
    mac_table: MacTable,
    firewall: Firewall,
    settings: BridgeSettings,
    metrics: Metrics,
}

impl Bridge {
    pub fn new(firewall: Firewall, settings: BridgeSettings, metrics: Metrics) -> Self {
        Self {
            ports: BTreeMap::new(),
            next_port: 1,
            mac_table: MacTable::new(settings.mac_capacity, settings.mac_ttl),
            firewall,
            settings,
            metrics,
        }
    }

    pub fn add_port(&mut self, name: impl Into<String>, kind: PortKind) -> PortAttachment {
        let id = PortId(self.next_port);
        self.next_port += 1;
        let name = name.into();
        let (tx, outbound) = mpsc::channel(self.settings.queue_depth.max(1));
        let metrics = self.metrics.register_port(id, &name, kind);
        tracing::debug!(port = %id, %name, %kind, "port attached");
        self.ports.insert(
            id,
            Port {
                name,
                kind,
                tx,
                metrics: metrics.clone(),
            },
        );
        PortAttachment {
            id,
            outbound,
            metrics,
        }
    }

    /// Detach a port and forget every MAC address learned on it.
    ///
    /// Dropping the queue sender lets the port's writer drain what is already queued and stop.
    pub fn remove_port(&mut self, id: PortId) -> Option<PortKind> {
        let port = self.ports.remove(&id)?;
        let purged = self.mac_table.purge_port(id);
        self.metrics.unregister_port(id);
        self.metrics.set_mac_table_entries(self.mac_table.len());
        tracing::debug!(port = %id, name = %port.name, purged, "port detached");
        Some(port.kind)
    }

    pub fn port_ids(&self, kind: PortKind) -> Vec<PortId> {
        self.ports
            .iter()
            .filter(|(_, port)| port.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn port_name(&self, id: PortId) -> Option<&str> {
        self.ports.get(&id).map(|port| port.name.as_str())
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn ingress(&mut self, from: PortId, frame: &[u8], now: Instant) -> Disposition {
        let Some(port) = self.ports.get(&from) else {
            return Disposition::UnknownPort;
        };
        let ingress_kind = port.kind;
        let ingress_metrics = port.metrics.clone();
        ingress_metrics.frame_rx(frame.len());

        let eth = match parse_ethernet(frame) {
            Ok(eth) => eth,
            Err(err) => {
                ingress_metrics.parse_error();
                tracing::trace!(port = %from, len = frame.len(), error = %err, "dropping malformed frame");
                return Disposition::Malformed(err);
            }
        };

        match self.mac_table.learn(eth.src_mac, from, now) {
            Learned::New => {
                tracing::debug!(port = %from, mac = %eth.src_mac, "learned address");
                self.metrics.set_mac_table_entries(self.mac_table.len());
            }
            Learned::Moved { from: old } => {
                tracing::debug!(port = %from, previous = %old, mac = %eth.src_mac, "address moved");
            }
            Learned::Refreshed | Learned::Ignored => {}
        }

        if ingress_kind == PortKind::Guest && eth.is_ip() {
            let verdict = parse_ip(frame, &eth)
                .and_then(|ip| extract_dst_port(frame, &ip).map(|port| (ip, port)));
            let (ip, dst_port) = match verdict {
                Ok(v) => v,
                Err(err) => {
                    ingress_metrics.parse_error();
                    tracing::trace!(port = %from, error = %err, "dropping frame with malformed ip header");
                    return Disposition::Malformed(err);
                }
            };
            if !self
                .firewall
                .is_allowed_at(ip.src, ip.dst, ip.protocol, dst_port, now)
            {
                ingress_metrics.frame_blocked();
                tracing::trace!(
                    port = %from,
                    src = %ip.src,
                    dst = %ip.dst,
                    protocol = ip.protocol,
                    dst_port,
                    "blocked by firewall"
                );
                return Disposition::Blocked;
            }
        }

        let shared: Frame = Arc::from(frame);
        if !is_broadcast_or_multicast(&eth.dst_mac) {
            match self.mac_table.lookup(&eth.dst_mac, now) {
                Some(target) if target == from => return Disposition::Filtered,
                Some(target) if self.ports.contains_key(&target) => {
                    self.enqueue(target, shared);
                    return Disposition::Unicast(target);
                }
                _ => {}
            }
        }

        let targets: Vec<PortId> = self
            .ports
            .keys()
            .copied()
            .filter(|id| *id != from)
            .collect();
        for target in &targets {
            self.enqueue(*target, shared.clone());
        }
        Disposition::Flooded(targets.len())
    }

    fn enqueue(&self, target: PortId, frame: Frame) {
        let Some(port) = self.ports.get(&target) else {
            return;
        };
        match port.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                port.metrics.frame_dropped();
                tracing::trace!(port = %target, "outbound queue full; dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                port.metrics.frame_dropped();
            }
        }
    }

    /// Periodic maintenance: age out MAC entries and publish table sizes.
    pub fn housekeeping(&mut self, now: Instant) {
        let expired = self.mac_table.expire(now);
        if expired > 0 {
            tracing::debug!(expired, "mac entries aged out");
        }
        self.metrics.set_mac_table_entries(self.mac_table.len());
        let stats = self.firewall.cache_stats();
        self.metrics
            .set_rule_cache(self.firewall.cached_sources(), stats.hits, stats.misses);
    }

    /// Reload the firewall's rule source. On failure the previous rules stay active.
    pub fn reload_rules(&mut self) -> Result<(), RuleError> {
        let result = self.firewall.reload();
        self.metrics.rule_reloaded(result.is_ok());
        result
    }

    pub fn firewall_mut(&mut self) -> &mut Firewall {
        &mut self.firewall
    }

    pub fn mac_table(&self) -> &MacTable {
        &self.mac_table
    }
}
