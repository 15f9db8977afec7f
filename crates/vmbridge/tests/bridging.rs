use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use vmbridge::transport::{FrameTransport, TransportError};
use vmbridge::{start_server_with, Attachments, BridgeConfig, ServerError, ServerHandle};
use vmbridge_adapter::{DatagramLink, FrameLink};
use vmbridge_firewall::{PortMatch, Rule, RuleFile, RuleProtocol, RuleSource, StaticRules};
use vmbridge_packet::builder::{ethernet_frame, ipv4_packet, tcp_syn, udp_datagram};
use vmbridge_packet::{MacAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4, IPPROTO_TCP, IPPROTO_UDP};
use vmbridge_protocol::Limits;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

const MAC1: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 1]);
const MAC2: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 2]);
const MAC3: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 3]);
const REMOTE_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);

const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);
const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

struct TestBridge {
    _dir: tempfile::TempDir,
    path: PathBuf,
    handle: ServerHandle,
    uplink: DatagramLink,
}

impl TestBridge {
    async fn start(rules: impl RuleSource + 'static, cfg: BridgeConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let (bridge_side, switch_side) = DatagramLink::pair("uplink0", "switch").unwrap();

        let cfg = BridgeConfig {
            listen: Some(path.clone()),
            stats_interval: None,
            ..cfg
        };
        let handle = start_server_with(
            cfg,
            Attachments {
                uplink: Some(Arc::new(bridge_side)),
                guest_links: Vec::new(),
                rules: Box::new(rules),
            },
        )
        .await
        .unwrap();

        Self {
            _dir: dir,
            path,
            handle,
            uplink: switch_side,
        }
    }

    async fn guest(&self) -> FrameTransport {
        let before = self.handle.metrics().snapshot().sessions_total;
        let transport = FrameTransport::connect(&self.path, Limits::default())
            .await
            .unwrap();
        self.wait_until(|s| s.sessions_total > before).await;
        transport
    }

    async fn wait_until(&self, cond: impl Fn(&vmbridge::MetricsSnapshot) -> bool) {
        let metrics = self.handle.metrics().clone();
        tokio::time::timeout(WAIT, async {
            while !cond(&metrics.snapshot()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn uplink_recv(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let len = tokio::time::timeout(WAIT, self.uplink.recv(&mut buf))
            .await
            .expect("no frame on uplink")
            .unwrap();
        buf.truncate(len);
        buf
    }

    async fn assert_uplink_quiet(&self) {
        let mut buf = vec![0u8; 2048];
        assert!(
            tokio::time::timeout(QUIET, self.uplink.recv(&mut buf))
                .await
                .is_err(),
            "unexpected frame on uplink"
        );
    }
}

async fn recv(guest: &mut FrameTransport) -> Vec<u8> {
    tokio::time::timeout(WAIT, guest.recv())
        .await
        .expect("no frame for guest")
        .unwrap()
}

async fn assert_quiet(guest: &mut FrameTransport) {
    assert!(
        tokio::time::timeout(QUIET, guest.recv()).await.is_err(),
        "unexpected frame for guest"
    );
}

fn arp(dst: MacAddr, src: MacAddr) -> Vec<u8> {
    ethernet_frame(dst, src, ETHERTYPE_ARP, &[0u8; 28])
}

fn tcp_from_guest(dst_port: u16) -> Vec<u8> {
    let ip = ipv4_packet(GUEST_IP, REMOTE_IP, IPPROTO_TCP, &tcp_syn(40000, dst_port));
    ethernet_frame(REMOTE_MAC, MAC1, ETHERTYPE_IPV4, &ip)
}

fn guest_rules() -> StaticRules {
    StaticRules::new().with_rules(
        IpAddr::V4(GUEST_IP),
        vec![
            Rule::accept(RuleProtocol::Tcp, PortMatch::Single(443)),
            Rule::accept(RuleProtocol::Udp, PortMatch::Single(53)),
            Rule::drop(RuleProtocol::Any, PortMatch::Any),
        ],
    )
}

#[tokio::test]
async fn learned_destination_is_delivered_to_one_session() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;
    let mut g2 = bridge.guest().await;

    let announce = arp(MacAddr::BROADCAST, MAC2);
    g2.send(&announce).await.unwrap();
    assert_eq!(recv(&mut g1).await, announce);
    assert_eq!(bridge.uplink_recv().await, announce);

    let unicast = arp(MAC2, MAC1);
    g1.send(&unicast).await.unwrap();
    assert_eq!(recv(&mut g2).await, unicast);
    bridge.assert_uplink_quiet().await;
}

#[tokio::test]
async fn broadcast_floods_to_every_other_port() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;
    let mut g2 = bridge.guest().await;
    let mut g3 = bridge.guest().await;

    let frame = arp(MacAddr::BROADCAST, MAC1);
    g1.send(&frame).await.unwrap();

    assert_eq!(recv(&mut g2).await, frame);
    assert_eq!(recv(&mut g3).await, frame);
    assert_eq!(bridge.uplink_recv().await, frame);
    assert_quiet(&mut g1).await;
}

#[tokio::test]
async fn uplink_frames_reach_learned_guests() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;
    let mut g2 = bridge.guest().await;

    g1.send(&arp(MacAddr::BROADCAST, MAC1)).await.unwrap();
    recv(&mut g2).await;
    bridge.uplink_recv().await;

    // Not subject to guest policy: port 80 would be denied from the guest side.
    let ip = ipv4_packet(REMOTE_IP, GUEST_IP, IPPROTO_TCP, &tcp_syn(80, 40000));
    let inbound = ethernet_frame(MAC1, REMOTE_MAC, ETHERTYPE_IPV4, &ip);
    bridge.uplink.send(&inbound).await.unwrap();

    assert_eq!(recv(&mut g1).await, inbound);
    assert_quiet(&mut g2).await;
}

#[tokio::test]
async fn firewall_blocks_and_counts() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;

    g1.send(&tcp_from_guest(80)).await.unwrap();
    let allowed = tcp_from_guest(443);
    g1.send(&allowed).await.unwrap();

    // Frames from one port are handled in order, so the blocked one is already accounted for.
    assert_eq!(bridge.uplink_recv().await, allowed);
    let snapshot = bridge.handle.metrics().snapshot();
    assert_eq!(snapshot.frames_blocked_total, 1);
    assert_eq!(snapshot.frames_rx_total, 2);

    let udp = ipv4_packet(GUEST_IP, REMOTE_IP, IPPROTO_UDP, &udp_datagram(5353, 53, b"q"));
    let dns = ethernet_frame(REMOTE_MAC, MAC1, ETHERTYPE_IPV4, &udp);
    g1.send(&dns).await.unwrap();
    assert_eq!(bridge.uplink_recv().await, dns);
}

#[tokio::test]
async fn unknown_sources_are_denied_but_arp_passes() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;

    let stranger = Ipv4Addr::new(10, 9, 9, 9);
    let udp = ipv4_packet(stranger, REMOTE_IP, IPPROTO_UDP, &udp_datagram(5353, 53, b"q"));
    g1.send(&ethernet_frame(REMOTE_MAC, MAC1, ETHERTYPE_IPV4, &udp))
        .await
        .unwrap();

    let announce = arp(MacAddr::BROADCAST, MAC1);
    g1.send(&announce).await.unwrap();
    assert_eq!(bridge.uplink_recv().await, announce);
    assert_eq!(bridge.handle.metrics().snapshot().frames_blocked_total, 1);
}

#[tokio::test]
async fn oversized_prefix_closes_only_that_session() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;
    let mut g2 = bridge.guest().await;

    let mut rogue = UnixStream::connect(&bridge.path).await.unwrap();
    bridge.wait_until(|s| s.sessions_active == 3).await;
    rogue.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    bridge
        .wait_until(|s| s.protocol_violations_total == 1 && s.sessions_active == 2)
        .await;
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, rogue.read(&mut buf))
        .await
        .expect("rogue session not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let frame = arp(MacAddr::BROADCAST, MAC1);
    g1.send(&frame).await.unwrap();
    assert_eq!(recv(&mut g2).await, frame);
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_counted() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;

    g1.send(&[0u8; 13]).await.unwrap();
    g1.send(&ethernet_frame(REMOTE_MAC, MAC1, ETHERTYPE_IPV4, &[0x45, 0, 0]))
        .await
        .unwrap();
    let announce = arp(MacAddr::BROADCAST, MAC1);
    g1.send(&announce).await.unwrap();

    assert_eq!(bridge.uplink_recv().await, announce);
    assert_eq!(bridge.handle.metrics().snapshot().parse_errors_total, 2);
}

#[tokio::test]
async fn overloaded_port_drops_while_bridge_keeps_forwarding() {
    let cfg = BridgeConfig {
        queue_depth: 4,
        ..Default::default()
    };
    let bridge = TestBridge::start(guest_rules(), cfg).await;
    let mut g1 = bridge.guest().await;
    let mut g2 = bridge.guest().await;
    let mut slow = bridge.guest().await;

    slow.send(&arp(MacAddr::BROADCAST, MAC3)).await.unwrap();
    recv(&mut g1).await;
    recv(&mut g2).await;
    g2.send(&arp(MacAddr::BROADCAST, MAC2)).await.unwrap();
    recv(&mut g1).await;

    // The slow guest never reads; its socket buffer and then its queue fill up.
    let bulk = ethernet_frame(MAC3, MAC1, ETHERTYPE_ARP, &[0xab; 1000]);
    for _ in 0..3000 {
        g1.send(&bulk).await.unwrap();
    }
    bridge.wait_until(|s| s.frames_dropped_total > 0).await;

    let probe = arp(MAC2, MAC1);
    g1.send(&probe).await.unwrap();
    assert_eq!(recv(&mut g2).await, probe);

    let slow_port = bridge
        .handle
        .metrics()
        .ports()
        .into_iter()
        .find(|(_, name, _, _)| name == "guest-3")
        .expect("slow port registered");
    assert!(slow_port.3.dropped > 0);
    drop(slow);
}

#[tokio::test]
async fn closed_session_forgets_its_addresses() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;
    let mut g2 = bridge.guest().await;

    g2.send(&arp(MacAddr::BROADCAST, MAC2)).await.unwrap();
    recv(&mut g1).await;
    bridge.uplink_recv().await;
    assert_eq!(bridge.handle.metrics().snapshot().mac_table_entries, 1);

    drop(g2);
    bridge
        .wait_until(|s| s.sessions_active == 1 && s.mac_table_entries == 0)
        .await;

    // With the address gone the frame is flooded instead of sent to a dead port.
    let frame = arp(MAC2, MAC1);
    g1.send(&frame).await.unwrap();
    assert_eq!(bridge.uplink_recv().await, frame);
}

#[tokio::test]
async fn rules_reload_on_request() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"10.1.2.3": [{{"action": "accept", "protocol": "udp", "dst_port": 53}}]}}"#
    )
    .unwrap();
    file.flush().unwrap();

    let bridge = TestBridge::start(
        RuleFile::load(file.path()).unwrap(),
        BridgeConfig::default(),
    )
    .await;
    let mut g1 = bridge.guest().await;

    g1.send(&tcp_from_guest(443)).await.unwrap();
    bridge.wait_until(|s| s.frames_blocked_total == 1).await;

    std::fs::write(
        file.path(),
        r#"{"10.1.2.3": [{"action": "accept", "protocol": "tcp", "dst_port": "400-500"}]}"#,
    )
    .unwrap();
    assert!(bridge.handle.reloader().reload());
    bridge.wait_until(|s| s.rule_reloads_total == 1).await;

    let allowed = tcp_from_guest(443);
    g1.send(&allowed).await.unwrap();
    assert_eq!(bridge.uplink_recv().await, allowed);

    std::fs::write(file.path(), "not json").unwrap();
    assert!(bridge.handle.reloader().reload());
    bridge.wait_until(|s| s.rule_reload_failures_total == 1).await;
    g1.send(&allowed).await.unwrap();
    assert_eq!(bridge.uplink_recv().await, allowed);
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let cfg = BridgeConfig {
        metrics_addr: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    };
    let bridge = TestBridge::start(guest_rules(), cfg).await;
    let mut g1 = bridge.guest().await;
    g1.send(&arp(MacAddr::BROADCAST, MAC1)).await.unwrap();
    bridge.uplink_recv().await;

    let addr = bridge.handle.metrics_addr().unwrap();
    let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let body = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("vmbridge_sessions_active 1\n"), "{body}");
    assert!(body.contains("vmbridge_frames_rx_total 1\n"), "{body}");
    assert!(
        body.contains("vmbridge_port_rx_frames_total{port=\"2\",name=\"guest-1\",kind=\"guest\"} 1\n"),
        "{body}"
    );
    assert!(
        body.contains("vmbridge_port_tx_frames_total{port=\"1\",name=\"uplink0\",kind=\"uplink\"} 1\n"),
        "{body}"
    );
}

#[tokio::test]
async fn shutdown_closes_sessions_and_removes_socket() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;
    let path = bridge.path.clone();
    assert_eq!(bridge.handle.listen_path(), Some(path.as_path()));

    let TestBridge {
        _dir, handle, uplink, ..
    } = bridge;
    handle.shutdown().await.unwrap();

    assert!(!path.exists());
    assert!(matches!(
        tokio::time::timeout(WAIT, g1.recv()).await.unwrap(),
        Err(TransportError::Disconnected)
    ));
    drop(uplink);
}

#[tokio::test]
async fn uplink_failure_stops_the_bridge() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;

    let TestBridge {
        _dir,
        mut handle,
        uplink,
        ..
    } = bridge;
    drop(uplink);

    g1.send(&arp(MacAddr::BROADCAST, MAC1)).await.unwrap();
    let result = tokio::time::timeout(WAIT, handle.closed())
        .await
        .expect("bridge kept running without its uplink");
    assert!(matches!(result, Err(ServerError::UplinkFailed { .. })));
    assert!(matches!(
        tokio::time::timeout(WAIT, g1.recv()).await.unwrap(),
        Err(TransportError::Disconnected)
    ));
}

#[tokio::test]
async fn oversized_uplink_frame_is_dropped_whole() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;

    let jumbo = ethernet_frame(MacAddr::BROADCAST, REMOTE_MAC, ETHERTYPE_ARP, &[0xee; 3000]);
    bridge.uplink.send(&jumbo).await.unwrap();
    let normal = arp(MacAddr::BROADCAST, REMOTE_MAC);
    bridge.uplink.send(&normal).await.unwrap();

    assert_eq!(recv(&mut g1).await, normal);
    assert_eq!(bridge.handle.metrics().snapshot().frames_dropped_total, 1);
}

#[tokio::test]
async fn empty_uplink_datagram_costs_one_frame() {
    let bridge = TestBridge::start(guest_rules(), BridgeConfig::default()).await;
    let mut g1 = bridge.guest().await;

    bridge.uplink.send(&[]).await.unwrap();
    let normal = arp(MacAddr::BROADCAST, REMOTE_MAC);
    bridge.uplink.send(&normal).await.unwrap();

    assert_eq!(recv(&mut g1).await, normal);
    assert_eq!(bridge.handle.metrics().snapshot().parse_errors_total, 1);

    g1.send(&arp(MacAddr::BROADCAST, MAC1)).await.unwrap();
    bridge.uplink_recv().await;
}

#[tokio::test]
async fn shutdown_with_stalled_guests_shares_one_drain_deadline() {
    let cfg = BridgeConfig {
        queue_depth: 4,
        ..Default::default()
    };
    let bridge = TestBridge::start(guest_rules(), cfg).await;
    let stalled = [
        bridge.guest().await,
        bridge.guest().await,
        bridge.guest().await,
    ];
    let mut sender = bridge.guest().await;

    let TestBridge {
        _dir,
        handle,
        uplink,
        ..
    } = bridge;
    // Keep the uplink drained so only the guests are stuck.
    let drain = tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while uplink.recv(&mut buf).await.is_ok() {}
    });

    let bulk = ethernet_frame(MacAddr::BROADCAST, MAC1, ETHERTYPE_ARP, &[0xab; 1000]);
    let metrics = handle.metrics().clone();
    tokio::time::timeout(WAIT, async {
        loop {
            sender.send(&bulk).await.unwrap();
            let all_stuck = metrics
                .ports()
                .iter()
                .filter(|(_, name, _, _)| name != "guest-4" && name != "uplink0")
                .all(|(_, _, _, stats)| stats.dropped > 0);
            if all_stuck {
                break;
            }
        }
    })
    .await
    .expect("guests never backed up");

    let started = std::time::Instant::now();
    handle.shutdown().await.unwrap();
    let took = started.elapsed();
    assert!(took < Duration::from_millis(3500), "shutdown took {took:?}");

    drop(stalled);
    drain.abort();
}
