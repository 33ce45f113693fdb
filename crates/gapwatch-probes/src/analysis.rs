//! Reconstruction of forwarding disruptions from a stream capture.
//!
//! The capture sees every stream packet twice when forwarding works: once
//! as injected (addressed *to* the switch) and once as forwarded back out
//! (sourced *from* the switch). Missing forwarded copies are gaps; each
//! run of consecutive missing sequence IDs becomes one [`Disruption`].

use std::collections::{HashMap, HashSet};

use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use pnet::util::MacAddr;
use thiserror::Error;

use crate::packet::{PROBE_DPORT, STREAM_SPORT};
use crate::stream::parse_stream_payload;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Sniffer failed to capture any traffic")]
    NoTraffic,
    #[error("Sniffer failed to filter any traffic from DUT")]
    NoTrafficFromDut,
}

/// One frame lifted off the wire, with its capture timestamp in epoch
/// seconds.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub time: f64,
    pub data: Vec<u8>,
}

/// A run of consecutive sequence IDs that never came back.
#[derive(Debug, Clone, PartialEq)]
pub struct Disruption {
    pub first_lost_id: usize,
    pub lost_count: usize,
    /// Send-side duration of the gap.
    pub duration: f64,
    /// When forwarding stopped (derived from the resume time and duration).
    pub start: f64,
    /// When forwarding resumed (capture time of the first packet after the
    /// gap).
    pub stop: f64,
}

/// Everything the walk produced.
#[derive(Debug)]
pub struct FlowAnalysis {
    pub disruptions: Vec<Disruption>,
    /// The biggest gap: most packets lost, ties broken by duration.
    pub longest: Option<Disruption>,
    pub total_lost_packets: usize,
    pub total_disrupt_time: f64,
    /// `[last receive before the first gap, first receive after the last
    /// gap]`.
    pub window: Option<(f64, f64)>,
    /// Forwarded packets that survived the filter.
    pub received_count: usize,
    /// All survivors in `(id, time)` order, for the filtered pcap dump.
    pub filtered: Vec<CapturedPacket>,
}

enum Direction {
    /// Injected by us, addressed to the switch.
    Sent,
    /// Forwarded by the switch back to the wire.
    Received,
}

fn classify(frame: &[u8], dut_mac: MacAddr, packets_to_send: usize) -> Option<(Direction, usize)> {
    let eth = EthernetPacket::new(frame)?;
    let ip = Ipv4Packet::new(eth.payload())?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }
    let udp = UdpPacket::new(ip.payload())?;
    if udp.get_source() != STREAM_SPORT || udp.get_destination() != PROBE_DPORT {
        return None;
    }
    let id = parse_stream_payload(udp.payload())?;
    if id >= packets_to_send {
        return None;
    }
    if eth.get_source() == dut_mac {
        Some((Direction::Received, id))
    } else if eth.get_destination() == dut_mac {
        Some((Direction::Sent, id))
    } else {
        None
    }
}

/// Walk a capture and reconstruct every forwarding gap.
///
/// Running this twice over the same capture yields identical results; all
/// state lives on the stack.
pub fn examine_flow(
    capture: &[CapturedPacket],
    dut_mac: MacAddr,
    packets_to_send: usize,
) -> Result<FlowAnalysis, AnalysisError> {
    // Filter, dropping flooded duplicates: a forwarded copy counts only the
    // first time its sequence ID shows up.
    let mut seen_ids: HashSet<usize> = HashSet::new();
    let mut survivors: Vec<(usize, Direction, CapturedPacket)> = Vec::new();
    for pkt in capture {
        match classify(&pkt.data, dut_mac, packets_to_send) {
            Some((Direction::Received, id)) => {
                if seen_ids.insert(id) {
                    survivors.push((id, Direction::Received, pkt.clone()));
                }
            }
            Some((Direction::Sent, id)) => {
                survivors.push((id, Direction::Sent, pkt.clone()));
            }
            None => {}
        }
    }
    if survivors.is_empty() {
        return Err(AnalysisError::NoTraffic);
    }

    // Late arrivals may be out of order on the wire.
    survivors.sort_by(|a, b| {
        (a.0, a.2.time)
            .partial_cmp(&(b.0, b.2.time))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut sent_times: HashMap<usize, f64> = HashMap::new();
    let mut disruptions: Vec<Disruption> = Vec::new();
    let mut prev: Option<(usize, f64)> = None;
    let mut received_count = 0usize;
    let mut window: Option<(f64, f64)> = None;

    for (id, direction, pkt) in &survivors {
        match direction {
            Direction::Sent => {
                sent_times.insert(*id, pkt.time);
            }
            Direction::Received => {
                received_count += 1;
                let (prev_id, prev_time) = match prev {
                    None => {
                        prev = Some((*id, pkt.time));
                        continue;
                    }
                    Some(p) => p,
                };
                if *id > prev_id + 1 {
                    let lost_count = (*id - 1) - prev_id;
                    // The send-side spacing of the lost run; fall back to
                    // receive timestamps if the capture missed a sent copy.
                    let duration = match (sent_times.get(id), sent_times.get(&(prev_id + 1))) {
                        (Some(resume), Some(first_lost)) => resume - first_lost,
                        _ => pkt.time - prev_time,
                    };
                    disruptions.push(Disruption {
                        first_lost_id: prev_id + 1,
                        lost_count,
                        duration,
                        start: pkt.time - duration,
                        stop: pkt.time,
                    });
                    window = match window {
                        None => Some((prev_time, pkt.time)),
                        Some((start, _)) => Some((start, pkt.time)),
                    };
                }
                prev = Some((*id, pkt.time));
            }
        }
    }

    if received_count == 0 {
        return Err(AnalysisError::NoTrafficFromDut);
    }

    let longest = disruptions
        .iter()
        .max_by(|a, b| {
            (a.lost_count, a.duration)
                .partial_cmp(&(b.lost_count, b.duration))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned();
    let total_lost_packets = disruptions.iter().map(|d| d.lost_count).sum();
    let total_disrupt_time = disruptions.iter().map(|d| d.duration).sum();

    Ok(FlowAnalysis {
        disruptions,
        longest,
        total_lost_packets,
        total_disrupt_time,
        window,
        received_count,
        filtered: survivors.into_iter().map(|(_, _, p)| p).collect(),
    })
}
