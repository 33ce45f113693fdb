//! Probe traffic for the gapwatch harness.
//!
//! - **packet** — raw Ethernet/IPv4/TCP/UDP/ICMP/ARP frame builders
//! - **mask** — expected-reply templates with per-field don't-care ranges
//! - **probes** — the pre-materialized probe families sent at the switch
//! - **stream** — the paced bidirectional UDP stream used across a warm reboot
//! - **analysis** — reconstruction of forwarding disruptions from a capture
//! - **dataplane** — send/count/capture access, real (netdev) and fake
//! - **pcapdump** — pcap side-outputs for offline inspection

pub mod analysis;
pub mod dataplane;
pub mod mask;
pub mod packet;
pub mod pcapdump;
pub mod probes;
pub mod stream;
