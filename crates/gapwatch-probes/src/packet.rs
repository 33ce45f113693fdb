//! Raw frame builders for probe traffic.
//!
//! Every probe family is built once at setup from these helpers, so they
//! favour clarity over speed. Frames are plain `Vec<u8>` buffers; replies
//! are matched against them through [`crate::mask::Mask`].

use std::net::Ipv4Addr;

use pnet::packet::arp::{ArpHardwareTypes, ArpOperation, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::icmp::{checksum as icmp_checksum, IcmpPacket, IcmpType, IcmpTypes};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{checksum as ipv4_checksum, MutableIpv4Packet};
use pnet::packet::tcp::{ipv4_checksum as tcp_ipv4_checksum, MutableTcpPacket, TcpFlags};
use pnet::packet::udp::{ipv4_checksum as udp_ipv4_checksum, MutableUdpPacket};
use pnet::util::MacAddr;

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;
pub const ICMP_ECHO_HDR_LEN: usize = 8;
pub const ARP_LEN: usize = 28;

/// Probes and the UDP stream are addressed to this destination port.
pub const PROBE_DPORT: u16 = 5000;
/// Source port that marks stream packets on the wire.
pub const STREAM_SPORT: u16 = 1234;

/// Total TCP probe frame length, padded with a zero payload.
pub const TCP_FRAME_LEN: usize = 100;
/// ARP frames are padded to the classic minimum frame size.
pub const ARP_FRAME_LEN: usize = 60;

/// Synthesized uplink-side source MAC: `5c:01:02:03:<counter>`.
///
/// Each probe gets its own source MAC so the switch never collapses the
/// whole sweep onto a single FDB entry.
pub fn lag_mac(counter: u16) -> MacAddr {
    let [hi, lo] = counter.to_be_bytes();
    MacAddr(0x5c, 0x01, 0x02, 0x03, hi, lo)
}

/// Recover the counter bits from a MAC produced by [`lag_mac`].
pub fn lag_mac_counter(mac: MacAddr) -> Option<u16> {
    if (mac.0, mac.1, mac.2, mac.3) == (0x5c, 0x01, 0x02, 0x03) {
        Some(u16::from_be_bytes([mac.4, mac.5]))
    } else {
        None
    }
}

/// Server-side MAC handed to the external ARP responder, as the bare hex
/// string the responder's seed file expects.
pub fn vlan_mac_hex(counter: u16) -> String {
    format!("72060001{counter:04x}")
}

fn write_ethernet(buf: &mut [u8], src: MacAddr, dst: MacAddr, ethertype: pnet::packet::ethernet::EtherType) {
    let mut eth = MutableEthernetPacket::new(buf).expect("ethernet buffer");
    eth.set_destination(dst);
    eth.set_source(src);
    eth.set_ethertype(ethertype);
}

fn write_ipv4(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: u8,
    protocol: IpNextHeaderProtocol,
    payload_len: usize,
) {
    let mut ip = MutableIpv4Packet::new(buf).expect("ipv4 buffer");
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length((IPV4_HDR_LEN + payload_len) as u16);
    ip.set_identification(1);
    ip.set_ttl(ttl);
    ip.set_next_level_protocol(protocol);
    ip.set_source(src);
    ip.set_destination(dst);
    let immutable = ip.to_immutable();
    let cksum = ipv4_checksum(&immutable);
    ip.set_checksum(cksum);
}

/// Field set of a TCP probe frame.
#[derive(Debug, Clone)]
pub struct TcpFrame {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub ip_ttl: u8,
    pub sport: u16,
    pub dport: u16,
}

impl Default for TcpFrame {
    fn default() -> Self {
        TcpFrame {
            eth_src: MacAddr(0x00, 0x06, 0x07, 0x08, 0x09, 0x0a),
            eth_dst: MacAddr(0x00, 0x01, 0x02, 0x03, 0x04, 0x05),
            ip_src: Ipv4Addr::new(192, 168, 0, 1),
            ip_dst: Ipv4Addr::new(192, 168, 0, 2),
            ip_ttl: 64,
            sport: 1234,
            dport: 80,
        }
    }
}

impl TcpFrame {
    pub fn build(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TCP_FRAME_LEN];
        let tcp_len = TCP_FRAME_LEN - ETH_HDR_LEN - IPV4_HDR_LEN;
        write_ethernet(&mut buf, self.eth_src, self.eth_dst, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[ETH_HDR_LEN..],
            self.ip_src,
            self.ip_dst,
            self.ip_ttl,
            IpNextHeaderProtocols::Tcp,
            tcp_len,
        );
        let mut tcp =
            MutableTcpPacket::new(&mut buf[ETH_HDR_LEN + IPV4_HDR_LEN..]).expect("tcp buffer");
        tcp.set_source(self.sport);
        tcp.set_destination(self.dport);
        tcp.set_sequence(0);
        tcp.set_acknowledgement(0);
        tcp.set_data_offset(5);
        tcp.set_flags(TcpFlags::SYN);
        tcp.set_window(8192);
        let cksum = tcp_ipv4_checksum(&tcp.to_immutable(), &self.ip_src, &self.ip_dst);
        tcp.set_checksum(cksum);
        buf
    }
}

/// Field set of a UDP frame carrying an explicit payload.
#[derive(Debug, Clone)]
pub struct UdpFrame {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub ip_ttl: u8,
    pub sport: u16,
    pub dport: u16,
    pub payload: Vec<u8>,
}

impl Default for UdpFrame {
    fn default() -> Self {
        UdpFrame {
            eth_src: MacAddr(0x00, 0x06, 0x07, 0x08, 0x09, 0x0a),
            eth_dst: MacAddr(0x00, 0x01, 0x02, 0x03, 0x04, 0x05),
            ip_src: Ipv4Addr::new(192, 168, 0, 1),
            ip_dst: Ipv4Addr::new(192, 168, 0, 2),
            ip_ttl: 64,
            sport: STREAM_SPORT,
            dport: 80,
            payload: Vec::new(),
        }
    }
}

impl UdpFrame {
    pub fn build(&self) -> Vec<u8> {
        let udp_len = UDP_HDR_LEN + self.payload.len();
        let mut buf = vec![0u8; ETH_HDR_LEN + IPV4_HDR_LEN + udp_len];
        write_ethernet(&mut buf, self.eth_src, self.eth_dst, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[ETH_HDR_LEN..],
            self.ip_src,
            self.ip_dst,
            self.ip_ttl,
            IpNextHeaderProtocols::Udp,
            udp_len,
        );
        let mut udp =
            MutableUdpPacket::new(&mut buf[ETH_HDR_LEN + IPV4_HDR_LEN..]).expect("udp buffer");
        udp.set_source(self.sport);
        udp.set_destination(self.dport);
        udp.set_length(udp_len as u16);
        udp.set_payload(&self.payload);
        let cksum = udp_ipv4_checksum(&udp.to_immutable(), &self.ip_src, &self.ip_dst);
        udp.set_checksum(cksum);
        buf
    }
}

/// Field set of an ICMP echo frame.
#[derive(Debug, Clone)]
pub struct IcmpEchoFrame {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub icmp_type: IcmpType,
}

impl IcmpEchoFrame {
    pub fn request(eth_src: MacAddr, eth_dst: MacAddr, ip_src: Ipv4Addr, ip_dst: Ipv4Addr) -> Self {
        IcmpEchoFrame {
            eth_src,
            eth_dst,
            ip_src,
            ip_dst,
            icmp_type: IcmpTypes::EchoRequest,
        }
    }

    pub fn reply(eth_src: MacAddr, eth_dst: MacAddr, ip_src: Ipv4Addr, ip_dst: Ipv4Addr) -> Self {
        IcmpEchoFrame {
            eth_src,
            eth_dst,
            ip_src,
            ip_dst,
            icmp_type: IcmpTypes::EchoReply,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ETH_HDR_LEN + IPV4_HDR_LEN + ICMP_ECHO_HDR_LEN];
        write_ethernet(&mut buf, self.eth_src, self.eth_dst, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[ETH_HDR_LEN..],
            self.ip_src,
            self.ip_dst,
            64,
            IpNextHeaderProtocols::Icmp,
            ICMP_ECHO_HDR_LEN,
        );
        let icmp_start = ETH_HDR_LEN + IPV4_HDR_LEN;
        {
            let mut echo =
                MutableEchoRequestPacket::new(&mut buf[icmp_start..]).expect("icmp buffer");
            echo.set_icmp_type(self.icmp_type);
            echo.set_identifier(1);
            echo.set_sequence_number(1);
        }
        let cksum = {
            let icmp = IcmpPacket::new(&buf[icmp_start..]).expect("icmp view");
            icmp_checksum(&icmp)
        };
        buf[icmp_start + 2..icmp_start + 4].copy_from_slice(&cksum.to_be_bytes());
        buf
    }
}

/// Field set of an ARP frame within the VLAN.
#[derive(Debug, Clone)]
pub struct ArpFrame {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub operation: ArpOperation,
    pub sender_hw: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpFrame {
    pub fn build(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ARP_FRAME_LEN];
        write_ethernet(&mut buf, self.eth_src, self.eth_dst, EtherTypes::Arp);
        let mut arp =
            MutableArpPacket::new(&mut buf[ETH_HDR_LEN..ETH_HDR_LEN + ARP_LEN]).expect("arp buffer");
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(self.operation);
        arp.set_sender_hw_addr(self.sender_hw);
        arp.set_sender_proto_addr(self.sender_ip);
        arp.set_target_hw_addr(self.target_hw);
        arp.set_target_proto_addr(self.target_ip);
        buf
    }

    pub fn request(sender_hw: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        ArpFrame {
            eth_src: sender_hw,
            eth_dst: MacAddr::broadcast(),
            operation: ArpOperations::Request,
            sender_hw,
            sender_ip,
            target_hw: MacAddr::zero(),
            target_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ethernet::EthernetPacket;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::udp::UdpPacket;
    use pnet::packet::Packet;

    #[test]
    fn lag_mac_round_trips_every_counter() {
        for counter in 0..=u16::MAX {
            assert_eq!(lag_mac_counter(lag_mac(counter)), Some(counter));
        }
    }

    #[test]
    fn lag_mac_counter_rejects_foreign_prefix() {
        let mac = MacAddr(0x72, 0x06, 0x00, 0x01, 0x00, 0x01);
        assert_eq!(lag_mac_counter(mac), None);
    }

    #[test]
    fn tcp_frame_has_expected_headers() {
        let frame = TcpFrame {
            ip_ttl: 255,
            dport: PROBE_DPORT,
            ..TcpFrame::default()
        }
        .build();
        assert_eq!(frame.len(), TCP_FRAME_LEN);

        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_ethertype(), EtherTypes::Ipv4);
        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        assert_eq!(ip.get_ttl(), 255);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Tcp);
        assert_eq!(
            ip.get_total_length() as usize,
            TCP_FRAME_LEN - ETH_HDR_LEN
        );
    }

    #[test]
    fn udp_frame_carries_payload_verbatim() {
        let payload = b"00000000042".to_vec();
        let frame = UdpFrame {
            dport: PROBE_DPORT,
            payload: payload.clone(),
            ..UdpFrame::default()
        }
        .build();

        let eth = EthernetPacket::new(&frame).unwrap();
        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        let udp = UdpPacket::new(ip.payload()).unwrap();
        assert_eq!(udp.get_source(), STREAM_SPORT);
        assert_eq!(udp.get_destination(), PROBE_DPORT);
        assert_eq!(udp.payload(), &payload[..]);
    }

    #[test]
    fn arp_request_is_broadcast_and_padded() {
        let sender = MacAddr(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);
        let frame = ArpFrame::request(
            sender,
            Ipv4Addr::new(172, 0, 0, 5),
            Ipv4Addr::new(172, 0, 0, 9),
        )
        .build();
        assert_eq!(frame.len(), ARP_FRAME_LEN);
        assert_eq!(&frame[0..6], &[0xff; 6]);
        // operation: request
        assert_eq!(frame[ETH_HDR_LEN + 6..ETH_HDR_LEN + 8], [0x00, 0x01]);
    }
}
