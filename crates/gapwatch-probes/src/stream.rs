//! The paced bidirectional UDP stream sent across a warm reboot.
//!
//! Packets are pre-built so the sender loop does nothing but sleep and
//! send. The mix is one server→uplink packet for every five uplink→server
//! packets, and every payload is the packet's own sequence index so the
//! capture analysis can reconstruct exactly which packets never made it
//! through.

use std::time::Duration;

use gapwatch_common::config::TestConfig;
use gapwatch_common::netmath;
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::packet::{lag_mac, UdpFrame, PROBE_DPORT, STREAM_SPORT};
use crate::probes::{ProbeError, ProbeSet};

/// Hard cap on the stream length, matching what a software dataplane can
/// absorb without self-inflicted drops.
pub const MAX_PACKETS_TO_SEND: usize = 45_000;
/// Per-packet overhead added to the send interval when sizing the stream.
const SEND_OVERHEAD: Duration = Duration::from_micros(1500);

/// The pre-built stream and its pacing.
#[derive(Debug)]
pub struct StreamPlan {
    /// `(ingress_port, frame)`, in send order.
    pub packets: Vec<(u32, Vec<u8>)>,
    pub send_interval: Duration,
}

/// Sequence payload: 60 zero-pad characters followed by the index digits.
pub fn stream_payload(index: usize) -> Vec<u8> {
    format!("{:0>60}{index}", "").into_bytes()
}

/// Parse a payload produced by [`stream_payload`].
pub fn parse_stream_payload(payload: &[u8]) -> Option<usize> {
    std::str::from_utf8(payload).ok()?.parse().ok()
}

/// Number of packets that fit into the listen window at this interval.
pub fn packets_to_send(time_to_listen: Duration, send_interval: Duration) -> usize {
    let per_packet = (send_interval + SEND_OVERHEAD).as_secs_f64();
    ((time_to_listen.as_secs_f64() / per_packet) as usize).min(MAX_PACKETS_TO_SEND)
}

impl StreamPlan {
    pub fn build<R: Rng>(
        cfg: &TestConfig,
        probes: &ProbeSet,
        rng: &mut R,
    ) -> Result<Self, ProbeError> {
        let count = packets_to_send(cfg.time_to_listen, cfg.send_interval);
        let n_hosts = (netmath::address_count(cfg.vlan_ip_range) as usize - 3)
            .min(cfg.max_nr_vl_pkts) as u32;

        let mut packets = Vec::with_capacity(count);
        let mut counter: u32 = 0;
        for i in 0..count {
            let payload = stream_payload(i);
            if i % 5 == 0 {
                // Server → uplink.
                let frame = UdpFrame {
                    eth_dst: cfg.dut_mac,
                    ip_src: probes.vlan_src_addr,
                    ip_dst: probes.server_dst_addr,
                    sport: STREAM_SPORT,
                    dport: PROBE_DPORT,
                    payload,
                    ..UdpFrame::default()
                }
                .build();
                packets.push((probes.vlan_src_port, frame));
            } else {
                // Uplink → server, rotating over the sweep's VLAN hosts.
                let src_addr = netmath::random_ip(rng, cfg.default_ip_range);
                let ingress_port = *cfg
                    .portchannel_ports
                    .choose(rng)
                    .ok_or(ProbeError::NoPorts)?;
                let dst_addr =
                    netmath::host_ip(cfg.vlan_ip_range, 2 + (counter % (n_hosts - 2)))?;
                let frame = UdpFrame {
                    eth_src: lag_mac(counter as u16),
                    eth_dst: cfg.dut_mac,
                    ip_src: src_addr,
                    ip_dst: dst_addr,
                    ip_ttl: 255,
                    sport: STREAM_SPORT,
                    dport: PROBE_DPORT,
                    payload,
                }
                .build();
                counter += 1;
                packets.push((ingress_port, frame));
            }
        }

        Ok(StreamPlan {
            packets,
            send_interval: cfg.send_interval,
        })
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ethernet::EthernetPacket;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::udp::UdpPacket;
    use pnet::packet::Packet;
    use pnet::util::MacAddr;

    #[test]
    fn payload_round_trips() {
        for i in [0usize, 1, 42, 44_999] {
            let payload = stream_payload(i);
            assert!(payload.len() >= 61);
            assert_eq!(parse_stream_payload(&payload), Some(i));
        }
    }

    #[test]
    fn default_sizing_matches_the_listen_window() {
        let n = packets_to_send(Duration::from_secs(180), Duration::from_micros(3500));
        assert_eq!(n, 36_000);
        // Long windows are capped.
        let capped = packets_to_send(Duration::from_secs(3600), Duration::from_micros(3500));
        assert_eq!(capped, MAX_PACKETS_TO_SEND);
    }

    #[test]
    fn stream_mixes_one_server_packet_per_five() {
        let cfg = crate::probes::tests::test_config();
        let mut rng = rand::rng();
        let probes = ProbeSet::build(&cfg, &mut rng, |_| {
            Some(MacAddr(0x02, 0x42, 0, 0, 0, 1))
        })
        .unwrap();
        let plan = StreamPlan::build(&cfg, &probes, &mut rng).unwrap();
        assert_eq!(plan.len(), 36_000);

        for (i, (port, frame)) in plan.packets.iter().enumerate().take(100) {
            let eth = EthernetPacket::new(frame).unwrap();
            let ip = Ipv4Packet::new(eth.payload()).unwrap();
            let udp = UdpPacket::new(ip.payload()).unwrap();
            assert_eq!(udp.get_source(), STREAM_SPORT);
            assert_eq!(udp.get_destination(), PROBE_DPORT);
            assert_eq!(parse_stream_payload(udp.payload()), Some(i));
            if i % 5 == 0 {
                assert_eq!(*port, probes.vlan_src_port);
                assert_eq!(ip.get_source(), probes.vlan_src_addr);
            } else {
                assert!(cfg.portchannel_ports.contains(port));
                assert_eq!(ip.get_ttl(), 255);
            }
        }
    }
}
