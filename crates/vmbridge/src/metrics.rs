use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use crate::bridge::{PortId, PortKind};

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Sessions
    sessions_active: AtomicU64,
    sessions_total: AtomicU64,
    protocol_violations_total: AtomicU64,

    // Frames/bytes
    frames_rx_total: AtomicU64,
    frames_tx_total: AtomicU64,
    bytes_rx_total: AtomicU64,
    bytes_tx_total: AtomicU64,
    frames_dropped_total: AtomicU64,
    frames_blocked_total: AtomicU64,
    parse_errors_total: AtomicU64,

    // Bridge state
    mac_table_entries: AtomicU64,
    rule_cache_entries: AtomicU64,
    rule_cache_hits_total: AtomicU64,
    rule_cache_misses_total: AtomicU64,
    rule_reloads_total: AtomicU64,
    rule_reload_failures_total: AtomicU64,

    ports: Mutex<BTreeMap<PortId, RegisteredPort>>,
}

struct RegisteredPort {
    name: String,
    kind: PortKind,
    counters: Arc<PortCounters>,
}

/// Point-in-time copy of the global counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_active: u64,
    pub sessions_total: u64,
    pub protocol_violations_total: u64,
    pub frames_rx_total: u64,
    pub frames_tx_total: u64,
    pub bytes_rx_total: u64,
    pub bytes_tx_total: u64,
    pub frames_dropped_total: u64,
    pub frames_blocked_total: u64,
    pub parse_errors_total: u64,
    pub mac_table_entries: u64,
    pub rule_cache_entries: u64,
    pub rule_reloads_total: u64,
    pub rule_reload_failures_total: u64,
}

#[derive(Debug, Default)]
pub struct PortCounters {
    rx_frames: AtomicU64,
    rx_bytes: AtomicU64,
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    dropped: AtomicU64,
    blocked: AtomicU64,
    parse_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub rx_frames: u64,
    pub rx_bytes: u64,
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub dropped: u64,
    pub blocked: u64,
    pub parse_errors: u64,
}

impl PortCounters {
    pub fn snapshot(&self) -> PortStats {
        PortStats {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one port, updating the global totals alongside.
#[derive(Clone)]
pub struct PortMetrics {
    port: Arc<PortCounters>,
    global: Metrics,
}

impl PortMetrics {
    pub fn frame_rx(&self, bytes: usize) {
        self.port.rx_frames.fetch_add(1, Ordering::Relaxed);
        self.port.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.global.frame_rx(bytes);
    }

    pub fn frame_tx(&self, bytes: usize) {
        self.port.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.port.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.global.frame_tx(bytes);
    }

    pub fn frame_dropped(&self) {
        self.port.dropped.fetch_add(1, Ordering::Relaxed);
        self.global.frame_dropped();
    }

    pub fn frame_blocked(&self) {
        self.port.blocked.fetch_add(1, Ordering::Relaxed);
        self.global
            .inner
            .frames_blocked_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_error(&self) {
        self.port.parse_errors.fetch_add(1, Ordering::Relaxed);
        self.global
            .inner
            .parse_errors_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PortStats {
        self.port.snapshot()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a port. Its labelled series disappear again on [`Metrics::unregister_port`].
    pub fn register_port(&self, id: PortId, name: &str, kind: PortKind) -> PortMetrics {
        let counters = Arc::new(PortCounters::default());
        if let Ok(mut ports) = self.inner.ports.lock() {
            ports.insert(
                id,
                RegisteredPort {
                    name: name.to_string(),
                    kind,
                    counters: counters.clone(),
                },
            );
        }
        PortMetrics {
            port: counters,
            global: self.clone(),
        }
    }

    pub fn unregister_port(&self, id: PortId) {
        if let Ok(mut ports) = self.inner.ports.lock() {
            ports.remove(&id);
        }
    }

    /// Live ports with their current counters, in port order.
    pub fn ports(&self) -> Vec<(PortId, String, PortKind, PortStats)> {
        match self.inner.ports.lock() {
            Ok(ports) => ports
                .iter()
                .map(|(id, p)| (*id, p.name.clone(), p.kind, p.counters.snapshot()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn session_opened(&self) {
        self.inner.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn protocol_violation(&self) {
        self.inner
            .protocol_violations_total
            .fetch_add(1, Ordering::Relaxed);
    }

    fn frame_rx(&self, bytes: usize) {
        self.inner.frames_rx_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_rx_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn frame_tx(&self, bytes: usize) {
        self.inner.frames_tx_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_tx_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn frame_dropped(&self) {
        self.inner
            .frames_dropped_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn rule_reloaded(&self, ok: bool) {
        if ok {
            self.inner.rule_reloads_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner
                .rule_reload_failures_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_mac_table_entries(&self, entries: usize) {
        self.inner
            .mac_table_entries
            .store(entries as u64, Ordering::Relaxed);
    }

    pub fn set_rule_cache(&self, entries: usize, hits: u64, misses: u64) {
        self.inner
            .rule_cache_entries
            .store(entries as u64, Ordering::Relaxed);
        self.inner.rule_cache_hits_total.store(hits, Ordering::Relaxed);
        self.inner
            .rule_cache_misses_total
            .store(misses, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        let inner = &self.inner;
        MetricsSnapshot {
            sessions_active: load(&inner.sessions_active),
            sessions_total: load(&inner.sessions_total),
            protocol_violations_total: load(&inner.protocol_violations_total),
            frames_rx_total: load(&inner.frames_rx_total),
            frames_tx_total: load(&inner.frames_tx_total),
            bytes_rx_total: load(&inner.bytes_rx_total),
            bytes_tx_total: load(&inner.bytes_tx_total),
            frames_dropped_total: load(&inner.frames_dropped_total),
            frames_blocked_total: load(&inner.frames_blocked_total),
            parse_errors_total: load(&inner.parse_errors_total),
            mac_table_entries: load(&inner.mac_table_entries),
            rule_cache_entries: load(&inner.rule_cache_entries),
            rule_reloads_total: load(&inner.rule_reloads_total),
            rule_reload_failures_total: load(&inner.rule_reload_failures_total),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let rule_cache_hits_total = self.inner.rule_cache_hits_total.load(Ordering::Relaxed);
        let rule_cache_misses_total = self.inner.rule_cache_misses_total.load(Ordering::Relaxed);

        let mut out = String::new();

        push_gauge(&mut out, "vmbridge_sessions_active", s.sessions_active);
        push_counter(&mut out, "vmbridge_sessions_total", s.sessions_total);
        push_counter(
            &mut out,
            "vmbridge_protocol_violations_total",
            s.protocol_violations_total,
        );

        push_counter(&mut out, "vmbridge_frames_rx_total", s.frames_rx_total);
        push_counter(&mut out, "vmbridge_frames_tx_total", s.frames_tx_total);
        push_counter(&mut out, "vmbridge_bytes_rx_total", s.bytes_rx_total);
        push_counter(&mut out, "vmbridge_bytes_tx_total", s.bytes_tx_total);
        push_counter(&mut out, "vmbridge_frames_dropped_total", s.frames_dropped_total);
        push_counter(&mut out, "vmbridge_frames_blocked_total", s.frames_blocked_total);
        push_counter(&mut out, "vmbridge_parse_errors_total", s.parse_errors_total);

        push_gauge(&mut out, "vmbridge_mac_table_entries", s.mac_table_entries);
        push_gauge(&mut out, "vmbridge_rule_cache_entries", s.rule_cache_entries);
        push_counter(&mut out, "vmbridge_rule_cache_hits_total", rule_cache_hits_total);
        push_counter(
            &mut out,
            "vmbridge_rule_cache_misses_total",
            rule_cache_misses_total,
        );
        push_counter(&mut out, "vmbridge_rule_reloads_total", s.rule_reloads_total);
        push_counter(
            &mut out,
            "vmbridge_rule_reload_failures_total",
            s.rule_reload_failures_total,
        );

        let ports = self.ports();
        let series: [(&str, fn(&PortStats) -> u64); 7] = [
            ("vmbridge_port_rx_frames_total", |p| p.rx_frames),
            ("vmbridge_port_rx_bytes_total", |p| p.rx_bytes),
            ("vmbridge_port_tx_frames_total", |p| p.tx_frames),
            ("vmbridge_port_tx_bytes_total", |p| p.tx_bytes),
            ("vmbridge_port_dropped_total", |p| p.dropped),
            ("vmbridge_port_blocked_total", |p| p.blocked),
            ("vmbridge_port_parse_errors_total", |p| p.parse_errors),
        ];
        for (name, get) in series {
            let _ = writeln!(out, "# TYPE {name} counter");
            for (id, port_name, kind, stats) in &ports {
                let _ = writeln!(
                    out,
                    "{name}{{port=\"{id}\",name=\"{}\",kind=\"{kind}\"}} {}",
                    escape_label(port_name),
                    get(stats)
                );
            }
        }

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    let _ = writeln!(out, "# TYPE {name} gauge\n{name} {val}");
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    let _ = writeln!(out, "# TYPE {name} counter\n{name} {val}");
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
