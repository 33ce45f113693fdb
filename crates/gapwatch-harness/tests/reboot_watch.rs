//! Integration tests: the watcher classifying a scripted reboot timeline,
//! and the warm-reboot stream path from capture to verdict.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gapwatch_common::config::{RebootKind, TestConfig};
use gapwatch_common::report::Verdict;
use gapwatch_harness::orchestrator::apply_outage_verdicts;
use gapwatch_harness::sendsniff::send_and_sniff;
use gapwatch_harness::state::PlaneState;
use gapwatch_harness::watcher::{self, extract_no_cpu_replies, WatchShared};
use gapwatch_probes::analysis::{examine_flow, CapturedPacket};
use gapwatch_probes::dataplane::testing::{FakeDataplane, ProbeKind};
use gapwatch_probes::packet::{UdpFrame, PROBE_DPORT};
use gapwatch_probes::probes::ProbeSet;
use gapwatch_probes::stream::{stream_payload, StreamPlan};
use pnet::util::MacAddr;

const DUT_MAC: MacAddr = MacAddr(0x4c, 0x76, 0x25, 0xf5, 0x48, 0x80);

fn test_config() -> TestConfig {
    TestConfig {
        dut_ssh: "admin@10.0.0.243".into(),
        dut_mac: DUT_MAC,
        reboot: RebootKind::Fast,
        service: None,
        reboot_limit: Duration::from_secs(30),
        graceful_limit: Duration::from_secs(180),
        min_bgp_gr_timeout: 15,
        warm_up_timeout: Duration::from_secs(180),
        stabilize: Duration::from_secs(20),
        default_ip_range: "192.168.0.0/16".parse().unwrap(),
        vlan_ip_range: "172.0.0.0/26".parse().unwrap(),
        lo_prefix: "10.1.0.32/32".parse().unwrap(),
        lo_v6_prefix: "fc00:1::/64".parse().unwrap(),
        neighbors: vec![],
        neighbor_login: "admin".into(),
        port_indices: BTreeMap::new(),
        portchannel_ports: vec![28, 29],
        vlan_ports: (0..8).collect(),
        nr_pc_pkts: 100,
        ping_dut_pkts: 10,
        arp_ping_pkts: 1,
        max_nr_vl_pkts: 500,
        nr_tests: 3,
        probe_timeout: Duration::from_millis(2),
        reboot_delay: Duration::from_secs(10),
        task_timeout: Duration::from_secs(300),
        time_to_listen: Duration::from_secs(180),
        send_interval: Duration::from_micros(3500),
        arp_responder_cmd: None,
    }
}

fn fake_mac(_iface: &str) -> Option<MacAddr> {
    Some(MacAddr(0x02, 0x42, 0x00, 0x00, 0x00, 0x01))
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(120), poll)
        .await
        .unwrap_or_else(|_| panic!("never observed: {what}"));
}

#[tokio::test(start_paused = true)]
async fn watcher_tracks_a_scripted_reboot_timeline() {
    let cfg = Arc::new(test_config());
    let mut rng = rand::rng();
    let probes = Arc::new(ProbeSet::build(&cfg, &mut rng, fake_mac).unwrap());
    let full = probes.nr_vl_pkts; // 61 hosts in a /26

    let dp = Arc::new(FakeDataplane::new(cfg.portchannel_ports.clone()));
    // Iterations 0-4 healthy, 5-9 control plane gone, 10-14 forwarding
    // gone too, 15+ everything back.
    dp.push_counts(
        ProbeKind::ServerToUplink,
        &[100, 100, 100, 100, 100, 100, 100, 100, 100, 100, 0, 0, 0, 0, 0, 100],
    );
    dp.push_counts(
        ProbeKind::UplinkToServer,
        &[
            full, full, full, full, full, full, full, full, full, full, 0, 0, 0, 0, 0, full,
        ],
    );
    dp.push_counts(
        ProbeKind::LoopbackPing,
        &[10, 10, 10, 10, 10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 10],
    );
    dp.push_counts(ProbeKind::ArpPing, &[1]);

    let shared = WatchShared::new();
    shared.start_recording();
    let handle = watcher::spawn(dp.clone(), probes, cfg, shared.clone());

    let mut running = handle.running.clone();
    running.wait_for(|v| *v).await.unwrap();

    // The control plane drops before forwarding does.
    wait_until("control plane down", || {
        shared.cpu.get() == PlaneState::Down
    })
    .await;
    assert_eq!(shared.asic.get(), PlaneState::Up);

    wait_until("data plane down", || {
        shared.asic.get() == PlaneState::Down
    })
    .await;

    wait_until("both planes back up", || {
        shared.asic.get() == PlaneState::Up && shared.cpu.get() == PlaneState::Up
    })
    .await;
    shared.stop_recording();

    let cpu_down = shared.cpu.state_time(PlaneState::Down).unwrap();
    let asic_down = shared.asic.state_time(PlaneState::Down).unwrap();
    let asic_up = shared.asic.state_time(PlaneState::Up).unwrap();
    assert!(cpu_down <= asic_down);
    assert!(asic_down < asic_up);
    assert!(!shared.asic.is_flooding());

    // The recorded uplink trace saw the outage and the recovery.
    let trace = shared.trace_snapshot();
    assert!(trace.contains(&0));
    assert_eq!(extract_no_cpu_replies(&trace), Some(full));

    shared.stop_watching();
    let mut stopped = handle.stopped.clone();
    stopped.wait_for(|v| *v).await.unwrap();
    assert!(dp.sent_packets() > 0);
}

#[tokio::test(start_paused = true)]
async fn light_probe_skips_the_uplink_sweep_when_servers_fail() {
    let cfg = Arc::new(test_config());
    let mut rng = rand::rng();
    let probes = Arc::new(ProbeSet::build(&cfg, &mut rng, fake_mac).unwrap());

    let dp = Arc::new(FakeDataplane::new(cfg.portchannel_ports.clone()));
    dp.push_counts(ProbeKind::ServerToUplink, &[0]);
    // The sweep would report healthy; with the light probe on, its count
    // must never be consulted once the server probe fails.
    dp.push_counts(ProbeKind::UplinkToServer, &[probes.nr_vl_pkts]);
    dp.push_counts(ProbeKind::LoopbackPing, &[10]);
    dp.push_counts(ProbeKind::ArpPing, &[1]);

    let shared = WatchShared::new();
    shared.set_light_probe(true);
    shared.start_recording();
    let handle = watcher::spawn(dp, probes, cfg, shared.clone());

    let mut running = handle.running.clone();
    running.wait_for(|v| *v).await.unwrap();
    wait_until("data plane down", || {
        shared.asic.get() == PlaneState::Down
    })
    .await;
    shared.stop_recording();
    shared.stop_watching();

    // Every recorded sweep sample was short-circuited to zero.
    assert!(shared.trace_snapshot().iter().all(|&t| t == 0));
}

#[tokio::test(start_paused = true)]
async fn warm_stream_capture_yields_a_verdict() {
    let cfg = {
        let mut cfg = test_config();
        cfg.reboot = RebootKind::Warm;
        cfg
    };

    // A capture in which IDs 400..408 never came back, 3.5 ms spacing.
    let packets_to_send = 1000usize;
    let mut capture = Vec::new();
    for id in 0..packets_to_send {
        let t = 1_700_000_000.0 + id as f64 * 0.0035;
        let host = MacAddr(0x5c, 0x01, 0x02, 0x03, 0x00, 0x00);
        let mk = |src: MacAddr, dst: MacAddr| {
            UdpFrame {
                eth_src: src,
                eth_dst: dst,
                dport: PROBE_DPORT,
                payload: stream_payload(id),
                ..UdpFrame::default()
            }
            .build()
        };
        capture.push(CapturedPacket {
            time: t,
            data: mk(host, DUT_MAC),
        });
        if !(400..408).contains(&id) {
            capture.push(CapturedPacket {
                time: t + 0.001,
                data: mk(DUT_MAC, host),
            });
        }
    }

    let dp = Arc::new(FakeDataplane::new(cfg.portchannel_ports.clone()));
    dp.set_capture(capture);
    let plan = Arc::new(StreamPlan {
        packets: (0..50).map(|i| (28u32, stream_payload(i))).collect(),
        send_interval: cfg.send_interval,
    });

    let captured = send_and_sniff(dp.clone(), plan, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(dp.sent_packets(), 50);

    let analysis = examine_flow(&captured, DUT_MAC, packets_to_send).unwrap();
    let longest = analysis.longest.as_ref().unwrap();
    assert_eq!(longest.first_lost_id, 400);
    assert_eq!(longest.lost_count, 8);

    // 28 ms of outage is far inside a 30 s budget.
    let mut verdict = Verdict::new();
    apply_outage_verdicts(
        &mut verdict,
        RebootKind::Warm,
        Some(longest.stop - longest.start),
        Some(45.0),
        cfg.reboot_limit.as_secs_f64(),
        cfg.graceful_limit.as_secs_f64(),
        None,
    );
    assert!(verdict.is_pass());
}
