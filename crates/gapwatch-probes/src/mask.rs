//! Expected-reply templates.
//!
//! A [`Mask`] wraps an expected frame and a list of header fields whose
//! bytes are irrelevant when matching a reply: addresses rewritten by
//! routing, checksums, the decremented TTL. A frame matches when it has
//! the same length and agrees on every byte outside the ignored fields.

use std::ops::Range;

use crate::packet::{ARP_LEN, ETH_HDR_LEN, IPV4_HDR_LEN, TCP_HDR_LEN, UDP_HDR_LEN};

/// Header fields that can be declared don't-care.
///
/// Offsets assume untagged Ethernet + option-less IPv4, which is what all
/// probe builders emit and what the switch hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    EtherDst,
    EtherSrc,
    Ipv4Id,
    Ipv4Ttl,
    Ipv4Checksum,
    Ipv4Src,
    Ipv4Dst,
    TcpChecksum,
    UdpChecksum,
    ArpHwType,
    ArpSenderHw,
}

impl Field {
    fn range(self) -> Range<usize> {
        const IP: usize = ETH_HDR_LEN;
        const L4: usize = ETH_HDR_LEN + IPV4_HDR_LEN;
        match self {
            Field::EtherDst => 0..6,
            Field::EtherSrc => 6..12,
            Field::Ipv4Id => IP + 4..IP + 6,
            Field::Ipv4Ttl => IP + 8..IP + 9,
            Field::Ipv4Checksum => IP + 10..IP + 12,
            Field::Ipv4Src => IP + 12..IP + 16,
            Field::Ipv4Dst => IP + 16..IP + 20,
            Field::TcpChecksum => L4 + 16..L4 + 18,
            Field::UdpChecksum => L4 + 6..L4 + 8,
            Field::ArpHwType => ETH_HDR_LEN..ETH_HDR_LEN + 2,
            Field::ArpSenderHw => ETH_HDR_LEN + 8..ETH_HDR_LEN + 14,
        }
    }
}

/// An expected frame with don't-care fields.
#[derive(Debug, Clone)]
pub struct Mask {
    expected: Vec<u8>,
    ignored: Vec<Range<usize>>,
}

impl Mask {
    pub fn new(expected: Vec<u8>) -> Self {
        Mask {
            expected,
            ignored: Vec::new(),
        }
    }

    pub fn ignore(mut self, field: Field) -> Self {
        self.ignored.push(field.range());
        self
    }

    pub fn matches(&self, frame: &[u8]) -> bool {
        if frame.len() != self.expected.len() {
            return false;
        }
        frame
            .iter()
            .zip(self.expected.iter())
            .enumerate()
            .all(|(i, (got, want))| got == want || self.ignored.iter().any(|r| r.contains(&i)))
    }

    pub fn expected(&self) -> &[u8] {
        &self.expected
    }
}

// Sanity: the L4 offsets stay in step with the builder constants.
const _: () = assert!(ETH_HDR_LEN + IPV4_HDR_LEN + TCP_HDR_LEN == 54);
const _: () = assert!(ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN == 42);
const _: () = assert!(ETH_HDR_LEN + ARP_LEN == 42);
