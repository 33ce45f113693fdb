//! Pre-materialized probe families.
//!
//! All probe frames and their reply templates are built once at setup and
//! never mutated afterwards; the watcher only replays them. Four families:
//!
//! - **uplink sweep** — one TCP packet per VLAN host, injected on random
//!   port-channel members, expected back on the VLAN ports
//! - **server probe** — a single TCP packet from the canonical VLAN host
//!   towards the uplinks
//! - **loopback ping** — ICMP echo to the switch loopback address
//! - **ARP ping** — one ARP request between two VLAN hosts
//!
//! The sweep also emits a seed map so the external ARP responder can answer
//! for every synthetic VLAN host before the switch asks.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use gapwatch_common::config::TestConfig;
use gapwatch_common::netmath::{self, NetMathError};
use pnet::packet::arp::ArpOperations;
use pnet::util::MacAddr;
use rand::seq::IndexedRandom;
use rand::Rng;
use thiserror::Error;

use crate::mask::{Field, Mask};
use crate::packet::{
    lag_mac, vlan_mac_hex, ArpFrame, IcmpEchoFrame, TcpFrame, PROBE_DPORT,
};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    NetMath(#[from] NetMathError),
    #[error("no MAC address found for interface {0}")]
    InterfaceMac(String),
    #[error("need at least one port-channel member and one VLAN port")]
    NoPorts,
    #[error("ARP ping needs at least four VLAN ports")]
    TooFewVlanPorts,
    #[error("failed to write ARP responder seed map: {0}")]
    SeedIo(#[from] std::io::Error),
}

/// One packet of the uplink sweep with its ingress port.
#[derive(Debug, Clone)]
pub struct SweepEntry {
    pub ingress_port: u32,
    pub frame: Vec<u8>,
}

/// Everything the reachability watcher sends and matches.
#[derive(Debug)]
pub struct ProbeSet {
    pub from_t1: Vec<SweepEntry>,
    pub from_t1_mask: Mask,
    /// Number of sweep packets; also the expected reply count.
    pub nr_vl_pkts: usize,

    pub from_vlan_frame: Vec<u8>,
    pub from_vlan_mask: Mask,

    pub ping_dut_frame: Vec<u8>,
    pub ping_dut_mask: Mask,

    pub arp_frame: Vec<u8>,
    pub arp_mask: Mask,
    pub arp_src_port: u32,

    /// Canonical VLAN host used as the source of all server-side traffic.
    pub vlan_src_addr: Ipv4Addr,
    pub vlan_src_port: u32,
    /// Upstream destination the server probe and stream are sent to.
    pub server_dst_addr: Ipv4Addr,

    /// `{vlan_iface → {dst_ip → mac_hex}}` for the external ARP responder.
    pub arp_seed: BTreeMap<String, BTreeMap<String, String>>,
}

impl ProbeSet {
    /// Build all probe families.
    ///
    /// `lookup_mac` resolves a local interface name to its MAC; the ARP
    /// ping must carry the real address of the injecting port.
    pub fn build<R: Rng>(
        cfg: &TestConfig,
        rng: &mut R,
        lookup_mac: impl Fn(&str) -> Option<MacAddr>,
    ) -> Result<Self, ProbeError> {
        if cfg.portchannel_ports.is_empty() || cfg.vlan_ports.is_empty() {
            return Err(ProbeError::NoPorts);
        }

        let n_hosts = (netmath::address_count(cfg.vlan_ip_range) as usize - 3)
            .min(cfg.max_nr_vl_pkts);

        let mut from_t1 = Vec::with_capacity(n_hosts);
        let mut arp_seed: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut counter: u16 = 0;
        for i in 2..n_hosts as u32 + 2 {
            let src_addr = netmath::random_ip(rng, cfg.default_ip_range);
            let ingress_port = *cfg
                .portchannel_ports
                .choose(rng)
                .ok_or(ProbeError::NoPorts)?;
            let dst_addr = netmath::host_ip(cfg.vlan_ip_range, i)?;
            let dst_port = cfg.vlan_ports[i as usize % cfg.vlan_ports.len()];
            let frame = TcpFrame {
                eth_src: lag_mac(counter),
                eth_dst: cfg.dut_mac,
                ip_src: src_addr,
                ip_dst: dst_addr,
                ip_ttl: 255,
                dport: PROBE_DPORT,
                ..TcpFrame::default()
            }
            .build();
            from_t1.push(SweepEntry {
                ingress_port,
                frame,
            });
            arp_seed
                .entry(format!("eth{dst_port}"))
                .or_default()
                .insert(dst_addr.to_string(), vlan_mac_hex(counter));
            counter += 1;
        }

        let from_t1_mask = Mask::new(
            TcpFrame {
                ip_src: Ipv4Addr::UNSPECIFIED,
                ip_dst: Ipv4Addr::UNSPECIFIED,
                dport: PROBE_DPORT,
                ..TcpFrame::default()
            }
            .build(),
        )
        .ignore(Field::EtherSrc)
        .ignore(Field::EtherDst)
        .ignore(Field::Ipv4Src)
        .ignore(Field::Ipv4Dst)
        .ignore(Field::Ipv4Checksum)
        .ignore(Field::TcpChecksum)
        .ignore(Field::Ipv4Ttl);

        // Canonical VLAN source: any host of the sweep.
        let ifaces: Vec<&String> = arp_seed.keys().collect();
        let vlan_iface = (*ifaces.choose(rng).ok_or(ProbeError::NoPorts)?).clone();
        let vlan_src_port: u32 = vlan_iface
            .trim_start_matches("eth")
            .parse()
            .unwrap_or_default();
        let addrs: Vec<&String> = arp_seed[&vlan_iface].keys().collect();
        let vlan_src_addr: Ipv4Addr = addrs
            .choose(rng)
            .and_then(|a| a.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let server_dst_addr = netmath::random_ip(rng, cfg.default_ip_range);

        let from_vlan_frame = TcpFrame {
            eth_dst: cfg.dut_mac,
            ip_src: vlan_src_addr,
            ip_dst: server_dst_addr,
            dport: PROBE_DPORT,
            ..TcpFrame::default()
        }
        .build();
        let from_vlan_mask = Mask::new(
            TcpFrame {
                ip_src: vlan_src_addr,
                ip_dst: server_dst_addr,
                ip_ttl: 63,
                dport: PROBE_DPORT,
                ..TcpFrame::default()
            }
            .build(),
        )
        .ignore(Field::EtherSrc)
        .ignore(Field::EtherDst);

        let lo_addr = cfg.lo_prefix.addr();
        let default_src = TcpFrame::default().eth_src;
        let ping_dut_frame =
            IcmpEchoFrame::request(default_src, cfg.dut_mac, vlan_src_addr, lo_addr).build();
        let ping_dut_mask = Mask::new(
            IcmpEchoFrame::reply(
                cfg.dut_mac,
                TcpFrame::default().eth_dst,
                lo_addr,
                vlan_src_addr,
            )
            .build(),
        )
        .ignore(Field::EtherDst)
        .ignore(Field::Ipv4Id)
        .ignore(Field::Ipv4Checksum);

        let (arp_frame, arp_mask, arp_src_port) = Self::build_arp_ping(cfg, rng, &lookup_mac)?;

        Ok(ProbeSet {
            from_t1,
            from_t1_mask,
            nr_vl_pkts: n_hosts,
            from_vlan_frame,
            from_vlan_mask,
            ping_dut_frame,
            ping_dut_mask,
            arp_frame,
            arp_mask,
            arp_src_port,
            vlan_src_addr,
            vlan_src_port,
            server_dst_addr,
            arp_seed,
        })
    }

    fn build_arp_ping<R: Rng>(
        cfg: &TestConfig,
        rng: &mut R,
        lookup_mac: impl Fn(&str) -> Option<MacAddr>,
    ) -> Result<(Vec<u8>, Mask, u32), ProbeError> {
        // Indices 0 and 1 are the subnet prefix and the switch's own VLAN
        // address; never ARP for those.
        let mut candidates: Vec<u32> = (2..cfg.vlan_ports.len() as u32).collect();
        if candidates.len() < 2 {
            return Err(ProbeError::TooFewVlanPorts);
        }
        let src_pos = rng.random_range(0..candidates.len());
        let src_idx = candidates.swap_remove(src_pos);
        let dst_idx = candidates[rng.random_range(0..candidates.len())];

        let src_port = cfg.vlan_ports[src_idx as usize];
        let iface = format!("eth{src_port}");
        let src_mac = lookup_mac(&iface).ok_or_else(|| ProbeError::InterfaceMac(iface))?;
        let src_addr = netmath::host_ip(cfg.vlan_ip_range, src_idx)?;
        let dst_addr = netmath::host_ip(cfg.vlan_ip_range, dst_idx)?;

        let request = ArpFrame::request(src_mac, src_addr, dst_addr).build();
        let reply = ArpFrame {
            eth_src: TcpFrame::default().eth_src,
            eth_dst: src_mac,
            operation: ArpOperations::Reply,
            sender_hw: MacAddr::zero(),
            sender_ip: dst_addr,
            target_hw: src_mac,
            target_ip: src_addr,
        }
        .build();
        let mask = Mask::new(reply)
            .ignore(Field::EtherSrc)
            .ignore(Field::ArpHwType)
            .ignore(Field::ArpSenderHw);

        Ok((request, mask, src_port))
    }

    /// Dump the seed map for the external ARP responder.
    pub fn write_arp_seed(&self, path: &Path) -> Result<(), ProbeError> {
        let json = serde_json::to_string(&self.arp_seed).map_err(std::io::Error::other)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use gapwatch_common::config::RebootKind;
    use std::collections::BTreeSet;
    use std::time::Duration;

    pub(crate) fn test_config() -> TestConfig {
        TestConfig {
            dut_ssh: "admin@10.0.0.243".into(),
            dut_mac: "4c:76:25:f5:48:80".parse().unwrap(),
            reboot: RebootKind::Fast,
            service: None,
            reboot_limit: Duration::from_secs(30),
            graceful_limit: Duration::from_secs(180),
            min_bgp_gr_timeout: 15,
            warm_up_timeout: Duration::from_secs(180),
            stabilize: Duration::from_secs(20),
            default_ip_range: "192.168.0.0/16".parse().unwrap(),
            vlan_ip_range: "172.0.0.0/22".parse().unwrap(),
            lo_prefix: "10.1.0.32/32".parse().unwrap(),
            lo_v6_prefix: "fc00:1::/64".parse().unwrap(),
            neighbors: vec!["10.0.0.200".into()],
            neighbor_login: "admin".into(),
            port_indices: BTreeMap::new(),
            portchannel_ports: vec![28, 29, 30, 31],
            vlan_ports: (0..25).collect(),
            nr_pc_pkts: 100,
            ping_dut_pkts: 10,
            arp_ping_pkts: 1,
            max_nr_vl_pkts: 500,
            nr_tests: 3,
            probe_timeout: Duration::from_millis(500),
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

    #[test]
    fn sweep_sources_are_pairwise_distinct_macs() {
        let cfg = test_config();
        let mut rng = rand::rng();
        let set = ProbeSet::build(&cfg, &mut rng, fake_mac).unwrap();

        let macs: BTreeSet<[u8; 6]> = set
            .from_t1
            .iter()
            .map(|e| {
                let f = &e.frame;
                [f[6], f[7], f[8], f[9], f[10], f[11]]
            })
            .collect();
        assert_eq!(macs.len(), set.from_t1.len());
        assert_eq!(set.nr_vl_pkts, 500);
    }

    #[test]
    fn sweep_destinations_avoid_network_and_switch_addresses() {
        let cfg = test_config();
        let mut rng = rand::rng();
        let set = ProbeSet::build(&cfg, &mut rng, fake_mac).unwrap();

        let net = cfg.vlan_ip_range;
        let dut_vlan_addr = netmath::host_ip(net, 1).unwrap();
        for entry in &set.from_t1 {
            let dst = Ipv4Addr::new(
                entry.frame[30],
                entry.frame[31],
                entry.frame[32],
                entry.frame[33],
            );
            assert!(net.contains(&dst), "{dst} outside {net}");
            assert_ne!(dst, net.network());
            assert_ne!(dst, dut_vlan_addr);
        }
    }

    #[test]
    fn sweep_replies_match_their_own_template() {
        let cfg = test_config();
        let mut rng = rand::rng();
        let set = ProbeSet::build(&cfg, &mut rng, fake_mac).unwrap();

        // A routed copy of any sweep frame must satisfy the reply mask.
        for entry in set.from_t1.iter().take(10) {
            let mut routed = entry.frame.clone();
            routed[0..6].copy_from_slice(&[0x72, 0x06, 0x00, 0x01, 0x00, 0x00]);
            routed[6..12].copy_from_slice(&[0x4c, 0x76, 0x25, 0xf5, 0x48, 0x80]);
            routed[22] -= 1; // ttl
            assert!(set.from_t1_mask.matches(&routed));
        }
    }

    #[test]
    fn seed_map_covers_every_sweep_destination() {
        let cfg = test_config();
        let mut rng = rand::rng();
        let set = ProbeSet::build(&cfg, &mut rng, fake_mac).unwrap();

        let total: usize = set.arp_seed.values().map(|m| m.len()).sum();
        assert_eq!(total, set.nr_vl_pkts);
    }

    #[test]
    fn arp_ping_needs_enough_vlan_ports() {
        let mut cfg = test_config();
        cfg.vlan_ports = vec![0, 1, 2];
        let mut rng = rand::rng();
        assert!(matches!(
            ProbeSet::build(&cfg, &mut rng, fake_mac),
            Err(ProbeError::TooFewVlanPorts)
        ));
    }
}
