use std::collections::HashMap;
use std::future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, Sleep};
use vmbridge_adapter::{AdapterError, FrameLink};
use vmbridge_firewall::{Firewall, RuleError, RuleFile, RuleSource, StaticRules};

use crate::bridge::{Bridge, PortId, PortKind};
use crate::config::{BridgeConfig, ConfigError};
use crate::metrics::Metrics;
use crate::session::{self, CloseReason, Event, PortTasks};
use crate::transport::{FrameListener, FrameTransport, TransportError};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Rules(#[from] RuleError),
    #[error("failed to listen on {}: {source}", path.display())]
    Listen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to guest socket {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: TransportError,
    },
    #[error("failed to bind metrics endpoint {addr}: {source}")]
    MetricsBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("uplink {name} failed: {reason}")]
    UplinkFailed { name: String, reason: String },
    #[error("bridge task ended abnormally: {0}")]
    Task(String),
}

/// Host-side resources a bridge runs over.
pub struct Attachments {
    pub uplink: Option<Arc<dyn FrameLink>>,
    pub guest_links: Vec<Arc<dyn FrameLink>>,
    pub rules: Box<dyn RuleSource>,
}

impl Attachments {
    /// Load the rule source and open the adapters named in `cfg`.
    pub fn open(cfg: &BridgeConfig) -> Result<Self, ServerError> {
        let rules: Box<dyn RuleSource> = match &cfg.rules {
            Some(path) => {
                let file = RuleFile::load(path)?;
                tracing::info!(path = %path.display(), sources = file.sources(), "rules loaded");
                Box::new(file)
            }
            None => {
                tracing::warn!("no rule file configured; all IP traffic from guests will be dropped");
                Box::new(StaticRules::new())
            }
        };

        let uplink = match &cfg.uplink {
            Some(name) => Some(open_uplink(name)?),
            None => None,
        };
        let guest_links = cfg
            .taps
            .iter()
            .map(|name| open_tap(name))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            uplink,
            guest_links,
            rules,
        })
    }
}

#[cfg(target_os = "linux")]
fn open_uplink(name: &str) -> Result<Arc<dyn FrameLink>, AdapterError> {
    Ok(Arc::new(vmbridge_adapter::RawSocketLink::open(name)?))
}

#[cfg(target_os = "linux")]
fn open_tap(name: &str) -> Result<Arc<dyn FrameLink>, AdapterError> {
    Ok(Arc::new(vmbridge_adapter::TapLink::open(name)?))
}

#[cfg(not(target_os = "linux"))]
fn open_uplink(_name: &str) -> Result<Arc<dyn FrameLink>, AdapterError> {
    Err(AdapterError::Unsupported("raw socket"))
}

#[cfg(not(target_os = "linux"))]
fn open_tap(_name: &str) -> Result<Arc<dyn FrameLink>, AdapterError> {
    Err(AdapterError::Unsupported("tap"))
}

enum Control {
    ReloadRules,
}

/// Requests a rule reload from a running bridge.
#[derive(Clone)]
pub struct RuleReloader {
    tx: mpsc::Sender<Control>,
}

impl RuleReloader {
    /// Returns false if the bridge is gone or a reload is already pending.
    pub fn reload(&self) -> bool {
        self.tx.try_send(Control::ReloadRules).is_ok()
    }
}

struct HttpServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ServerHandle {
    metrics: Metrics,
    listen_path: Option<PathBuf>,
    reloader: RuleReloader,
    http: Option<HttpServer>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|http| http.addr)
    }

    pub fn listen_path(&self) -> Option<&Path> {
        self.listen_path.as_deref()
    }

    pub fn reloader(&self) -> RuleReloader {
        self.reloader.clone()
    }

    /// Resolves when the bridge stops on its own, which only happens on a fatal error.
    pub async fn closed(&mut self) -> Result<(), ServerError> {
        let Some(task) = self.task.as_mut() else {
            return future::pending().await;
        };
        let result = task.await;
        self.task = None;
        flatten(result)
    }

    /// Stop accepting, close every guest port, then the uplink.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let result = match self.task.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        };
        if let Some(http) = self.http.take() {
            let _ = http.shutdown_tx.send(());
            let _ = http.task.await;
        }
        result
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(http) = self.http.take() {
            let _ = http.shutdown_tx.send(());
            http.task.abort();
        }
    }
}

fn flatten(
    result: Result<Result<(), ServerError>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    result.map_err(|err| ServerError::Task(err.to_string()))?
}

/// Open everything `cfg` names and start bridging.
pub async fn start_server(cfg: BridgeConfig) -> Result<ServerHandle, ServerError> {
    cfg.validate()?;
    let attachments = Attachments::open(&cfg)?;
    start_server_with(cfg, attachments).await
}

/// Start bridging over already opened attachments.
pub async fn start_server_with(
    cfg: BridgeConfig,
    attachments: Attachments,
) -> Result<ServerHandle, ServerError> {
    cfg.validate()?;
    let limits = cfg.limits();
    let metrics = Metrics::new();
    let firewall = Firewall::from_boxed(attachments.rules, cfg.rule_cache()?);
    let bridge = Bridge::new(firewall, cfg.bridge_settings()?, metrics.clone());

    let listener = match &cfg.listen {
        Some(path) => Some(FrameListener::bind(path, limits).map_err(|source| {
            ServerError::Listen {
                path: path.clone(),
                source,
            }
        })?),
        None => None,
    };

    let mut dialed = Vec::with_capacity(cfg.connect.len());
    for path in &cfg.connect {
        let transport = FrameTransport::connect(path, limits)
            .await
            .map_err(|source| ServerError::Connect {
                path: path.clone(),
                source,
            })?;
        dialed.push((path.display().to_string(), transport));
    }

    let http = match cfg.metrics_addr {
        Some(addr) => Some(serve_metrics(addr, metrics.clone()).await?),
        None => None,
    };

    let (events_tx, events_rx) = mpsc::channel(cfg.queue_depth);
    let (control_tx, control_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let listen_path = listener.as_ref().map(|l| l.path().to_path_buf());
    if let Some(path) = &listen_path {
        tracing::info!(path = %path.display(), "accepting guest sessions");
    }

    let mut server = Server {
        bridge,
        metrics: metrics.clone(),
        max_frame_len: cfg.max_frame_len,
        stats_interval: cfg.stats_interval,
        events_tx,
        ports: HashMap::new(),
        next_session: 1,
    };
    if let Some(uplink) = attachments.uplink {
        server.attach_link(uplink, PortKind::Uplink);
    }
    for link in attachments.guest_links {
        server.attach_link(link, PortKind::Guest);
    }
    for (name, transport) in dialed {
        server.attach_stream(transport, name);
    }

    let task = tokio::spawn(server.run(listener, events_rx, control_rx, shutdown_rx));

    Ok(ServerHandle {
        metrics,
        listen_path,
        reloader: RuleReloader { tx: control_tx },
        http,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn serve_metrics(addr: SocketAddr, metrics: Metrics) -> Result<HttpServer, ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::MetricsBind { addr, source })?;
    let addr = listener
        .local_addr()
        .map_err(|source| ServerError::MetricsBind { addr, source })?;

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(metrics);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    tracing::info!("metrics listening on http://{addr}/metrics");

    Ok(HttpServer {
        addr,
        shutdown_tx,
        task,
    })
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn render_metrics(State(metrics): State<Metrics>) -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        metrics.render_prometheus(),
    )
}

struct PortEntry {
    name: String,
    kind: PortKind,
    tasks: PortTasks,
    /// Counted as a guest session in the metrics.
    session: bool,
}

/// The bridge task: sole owner of the bridge and the port registry.
struct Server {
    bridge: Bridge,
    metrics: Metrics,
    max_frame_len: usize,
    stats_interval: Option<Duration>,
    events_tx: mpsc::Sender<Event>,
    ports: HashMap<PortId, PortEntry>,
    next_session: u64,
}

impl Server {
    fn attach_stream(&mut self, transport: FrameTransport, name: String) {
        let attachment = self.bridge.add_port(name.clone(), PortKind::Guest);
        let (reader, writer) = transport.into_split();
        let tasks = session::spawn_stream_port(
            attachment.id,
            reader,
            writer,
            attachment.outbound,
            self.events_tx.clone(),
            attachment.metrics,
        );
        self.metrics.session_opened();
        tracing::info!(port = %attachment.id, %name, "session opened");
        self.ports.insert(
            attachment.id,
            PortEntry {
                name,
                kind: PortKind::Guest,
                tasks,
                session: true,
            },
        );
    }

    fn attach_link(&mut self, link: Arc<dyn FrameLink>, kind: PortKind) {
        let name = link.name().to_string();
        let attachment = self.bridge.add_port(name.clone(), kind);
        let tasks = session::spawn_link_port(
            attachment.id,
            link,
            self.max_frame_len,
            attachment.outbound,
            self.events_tx.clone(),
            attachment.metrics,
        );
        tracing::info!(port = %attachment.id, %name, %kind, "link attached");
        self.ports.insert(
            attachment.id,
            PortEntry {
                name,
                kind,
                tasks,
                session: false,
            },
        );
    }

    async fn run(
        mut self,
        listener: Option<FrameListener>,
        mut events_rx: mpsc::Receiver<Event>,
        mut control_rx: mpsc::Receiver<Control>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), ServerError> {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = self.stats_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut backoff = AcceptBackoff::default();

        let result = loop {
            tokio::select! {
                _ = &mut shutdown_rx => break Ok(()),
                Some(event) = events_rx.recv() => {
                    if let Err(err) = self.handle_event(event) {
                        break Err(err);
                    }
                }
                accepted = accept(listener.as_ref()), if !backoff.is_armed() => match accepted {
                    Ok(transport) => {
                        let name = format!("guest-{}", self.next_session);
                        self.next_session += 1;
                        self.attach_stream(transport, name);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed; pausing accepts");
                        backoff.arm();
                    }
                },
                _ = backoff.elapsed() => {}
                Some(control) = control_rx.recv() => self.handle_control(control),
                _ = housekeeping.tick() => self.bridge.housekeeping(Instant::now()),
                _ = tick(stats.as_mut()) => self.log_stats(),
            }
        };

        drop(listener);
        // Port tasks reporting during shutdown must not wait on a bridge that no longer listens.
        drop(events_rx);
        self.shutdown().await;
        result
    }

    fn handle_event(&mut self, event: Event) -> Result<(), ServerError> {
        match event {
            Event::Frame { port, frame } => {
                self.bridge.ingress(port, &frame, Instant::now());
                Ok(())
            }
            Event::Closed { port, reason } => self.detach(port, reason),
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::ReloadRules => match self.bridge.reload_rules() {
                Ok(()) => tracing::info!("rules reloaded; rule cache cleared"),
                Err(err) => tracing::warn!(error = %err, "rule reload failed; keeping previous rules"),
            },
        }
    }

    fn detach(&mut self, port: PortId, reason: CloseReason) -> Result<(), ServerError> {
        // Reader and writer may both report the same port.
        let Some(entry) = self.ports.remove(&port) else {
            return Ok(());
        };
        self.bridge.remove_port(port);
        entry.tasks.reader.abort();
        entry.tasks.writer.abort();
        if entry.session {
            self.metrics.session_closed();
        }

        match &reason {
            CloseReason::Eof => tracing::info!(%port, name = %entry.name, "session closed"),
            CloseReason::ProtocolViolation(err) => {
                self.metrics.protocol_violation();
                tracing::warn!(%port, name = %entry.name, error = %err, "closing session after protocol violation");
            }
            CloseReason::Failed(err) => {
                tracing::warn!(%port, name = %entry.name, error = %err, "port failed");
            }
        }

        if entry.kind == PortKind::Uplink {
            let reason = match reason {
                CloseReason::Eof => "link closed".to_string(),
                CloseReason::ProtocolViolation(err) | CloseReason::Failed(err) => err,
            };
            tracing::error!(name = %entry.name, %reason, "uplink failed");
            return Err(ServerError::UplinkFailed {
                name: entry.name,
                reason,
            });
        }
        Ok(())
    }

    fn log_stats(&self) {
        let s = self.metrics.snapshot();
        tracing::info!(
            sessions = s.sessions_active,
            ports = self.bridge.port_count(),
            frames_rx = s.frames_rx_total,
            frames_tx = s.frames_tx_total,
            dropped = s.frames_dropped_total,
            blocked = s.frames_blocked_total,
            parse_errors = s.parse_errors_total,
            mac_entries = self.bridge.mac_table().len(),
            "bridge stats"
        );
        for (id, name, kind, p) in self.metrics.ports() {
            tracing::debug!(
                port = %id,
                %name,
                %kind,
                rx_frames = p.rx_frames,
                tx_frames = p.tx_frames,
                dropped = p.dropped,
                blocked = p.blocked,
                parse_errors = p.parse_errors,
                "port stats"
            );
        }
    }

    async fn shutdown(mut self) {
        let guests = self.bridge.port_ids(PortKind::Guest);
        tracing::info!(ports = guests.len(), "closing guest ports");
        self.close_ports(guests).await;
        let uplinks = self.bridge.port_ids(PortKind::Uplink);
        if !uplinks.is_empty() {
            tracing::info!("closing uplink");
        }
        self.close_ports(uplinks).await;
    }

    /// Detach `ids`, then give their writers one shared deadline to flush what is already
    /// queued.
    async fn close_ports(&mut self, ids: Vec<PortId>) {
        let mut writers = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = self.ports.remove(&id) else {
                continue;
            };
            self.bridge.remove_port(id);
            entry.tasks.reader.abort();
            if entry.session {
                self.metrics.session_closed();
            }
            writers.push((id, entry.tasks.writer));
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        for (id, mut writer) in writers {
            if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
                tracing::debug!(port = %id, "writer did not drain in time");
                writer.abort();
            }
        }
    }
}

/// Keeps the accept branch disabled for a while after an accept error.
#[derive(Default)]
struct AcceptBackoff {
    until: Option<Pin<Box<Sleep>>>,
}

impl AcceptBackoff {
    fn arm(&mut self) {
        self.until = Some(Box::pin(tokio::time::sleep(ACCEPT_ERROR_BACKOFF)));
    }

    fn is_armed(&self) -> bool {
        self.until.is_some()
    }

    async fn elapsed(&mut self) {
        match self.until.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.until = None;
            }
            None => future::pending().await,
        }
    }
}

async fn accept(listener: Option<&FrameListener>) -> io::Result<FrameTransport> {
    match listener {
        Some(listener) => listener.accept().await,
        None => future::pending().await,
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn accept_backoff_disarms_after_its_delay() {
        let mut backoff = AcceptBackoff::default();
        assert!(!backoff.is_armed());

        backoff.arm();
        assert!(backoff.is_armed());
        let start = tokio::time::Instant::now();
        backoff.elapsed().await;
        assert!(!backoff.is_armed());
        assert!(start.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_accept_backoff_never_fires() {
        let mut backoff = AcceptBackoff::default();
        let waited = tokio::time::timeout(Duration::from_secs(60), backoff.elapsed()).await;
        assert!(waited.is_err());
    }
}
