//! Dataplane access: inject frames on numbered ports, count reply matches,
//! and capture the stream off the wire.
//!
//! The harness only ever talks to the [`Dataplane`] trait. The production
//! implementation drives kernel netdevs through `pnet::datalink`; tests use
//! [`testing::FakeDataplane`] with scripted reply counts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use crate::analysis::CapturedPacket;
use crate::mask::Mask;

/// BPF expression equivalent of the stream capture predicate, for
/// implementations that hand filtering to the kernel.
pub const STREAM_CAPTURE_FILTER: &str =
    "udp and udp dst port 5000 and udp src port 1234 and not icmp";

#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("no netdev found for port {0}")]
    NoInterface(String),
    #[error("unsupported datalink channel type on {0}")]
    ChannelType(String),
    #[error("port {0} is not attached")]
    UnknownPort(u32),
    #[error("dataplane I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Send, count and capture on the test ports.
#[async_trait]
pub trait Dataplane: Send + Sync {
    async fn send_packet(&self, port: u32, frame: &[u8]) -> Result<(), DataplaneError>;

    /// Count frames arriving on any of `ports` within `timeout` that match
    /// `mask`.
    async fn count_matched_all_ports(
        &self,
        mask: &Mask,
        ports: &[u32],
        timeout: Duration,
    ) -> Result<usize, DataplaneError>;

    /// Collect every stream packet seen on any port for `duration`.
    async fn capture_stream(&self, duration: Duration)
        -> Result<Vec<CapturedPacket>, DataplaneError>;
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Stream predicate mirrored in [`STREAM_CAPTURE_FILTER`].
fn is_stream_frame(frame: &[u8]) -> bool {
    use crate::packet::{ETH_HDR_LEN, PROBE_DPORT, STREAM_SPORT};
    use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::udp::UdpPacket;
    use pnet::packet::Packet;

    let Some(eth) = EthernetPacket::new(frame) else {
        return false;
    };
    if eth.get_ethertype() != EtherTypes::Ipv4 || frame.len() < ETH_HDR_LEN {
        return false;
    }
    let Some(ip) = Ipv4Packet::new(eth.payload()) else {
        return false;
    };
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return false;
    }
    let Some(udp) = UdpPacket::new(ip.payload()) else {
        return false;
    };
    udp.get_source() == STREAM_SPORT && udp.get_destination() == PROBE_DPORT
}

struct TimedFrame {
    port: u32,
    time: f64,
    data: Vec<u8>,
}

/// `pnet::datalink` backed implementation.
///
/// One receiver thread per port feeds a shared frame log; counting and
/// capturing are window scans over that log.
pub struct NetdevDataplane {
    senders: HashMap<u32, Mutex<Box<dyn pnet::datalink::DataLinkSender>>>,
    frames: Arc<Mutex<Vec<TimedFrame>>>,
    stop: Arc<AtomicBool>,
}

impl NetdevDataplane {
    /// Attach to `eth<port>` for every port index.
    pub fn open(ports: &[u32]) -> Result<Self, DataplaneError> {
        use pnet::datalink::{self, Channel, Config};

        let interfaces = datalink::interfaces();
        let frames: Arc<Mutex<Vec<TimedFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let mut senders = HashMap::new();

        for &port in ports {
            let name = format!("eth{port}");
            let iface = interfaces
                .iter()
                .find(|i| i.name == name)
                .ok_or_else(|| DataplaneError::NoInterface(name.clone()))?;
            let config = Config {
                read_timeout: Some(Duration::from_millis(100)),
                ..Config::default()
            };
            let (tx, mut rx) = match datalink::channel(iface, config) {
                Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
                Ok(_) => return Err(DataplaneError::ChannelType(name)),
                Err(e) => return Err(DataplaneError::Io(e)),
            };
            senders.insert(port, Mutex::new(tx));

            let frames = frames.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut pushes = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    match rx.next() {
                        Ok(frame) => {
                            let mut log = frames.lock().unwrap_or_else(|e| e.into_inner());
                            log.push(TimedFrame {
                                port,
                                time: epoch_now(),
                                data: frame.to_vec(),
                            });
                            pushes += 1;
                            if pushes % 1024 == 0 {
                                // Frames older than any window we scan are
                                // dead weight.
                                let horizon = epoch_now() - 600.0;
                                log.retain(|f| f.time >= horizon);
                            }
                        }
                        Err(ref e)
                            if matches!(
                                e.kind(),
                                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                            ) => {}
                        Err(_) => break,
                    }
                }
            });
        }

        Ok(NetdevDataplane {
            senders,
            frames,
            stop,
        })
    }
}

impl Drop for NetdevDataplane {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Dataplane for NetdevDataplane {
    async fn send_packet(&self, port: u32, frame: &[u8]) -> Result<(), DataplaneError> {
        let sender = self
            .senders
            .get(&port)
            .ok_or(DataplaneError::UnknownPort(port))?;
        let mut tx = sender.lock().unwrap_or_else(|e| e.into_inner());
        match tx.send_to(frame, None) {
            Some(result) => Ok(result?),
            None => Ok(()),
        }
    }

    async fn count_matched_all_ports(
        &self,
        mask: &Mask,
        ports: &[u32],
        timeout: Duration,
    ) -> Result<usize, DataplaneError> {
        let window_start = epoch_now();
        tokio::time::sleep(timeout).await;
        let log = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        Ok(log
            .iter()
            .filter(|f| f.time >= window_start && ports.contains(&f.port) && mask.matches(&f.data))
            .count())
    }

    async fn capture_stream(
        &self,
        duration: Duration,
    ) -> Result<Vec<CapturedPacket>, DataplaneError> {
        let window_start = epoch_now();
        tokio::time::sleep(duration).await;
        let log = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        Ok(log
            .iter()
            .filter(|f| f.time >= window_start && is_stream_frame(&f.data))
            .map(|f| CapturedPacket {
                time: f.time,
                data: f.data.clone(),
            })
            .collect())
    }
}

pub mod testing {
    //! Scripted dataplane for harness tests.

    use super::*;
    use std::collections::VecDeque;

    /// Which probe family a count request belongs to, recovered from the
    /// shape of the expected frame and the ports polled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ProbeKind {
        ServerToUplink,
        UplinkToServer,
        LoopbackPing,
        ArpPing,
    }

    #[derive(Default)]
    struct Script {
        counts: HashMap<ProbeKind, VecDeque<usize>>,
        last: HashMap<ProbeKind, usize>,
    }

    /// In-memory dataplane with scripted reply counts.
    ///
    /// Counts are consumed per probe kind; when a script runs dry the last
    /// value repeats, so "steady up" needs only one entry.
    pub struct FakeDataplane {
        pc_ports: Vec<u32>,
        script: Mutex<Script>,
        sent: Mutex<Vec<(u32, Vec<u8>)>>,
        capture: Mutex<Vec<CapturedPacket>>,
        /// How long `capture_stream` pretends to listen.
        pub capture_delay: Duration,
    }

    impl FakeDataplane {
        pub fn new(pc_ports: Vec<u32>) -> Self {
            FakeDataplane {
                pc_ports,
                script: Mutex::new(Script::default()),
                sent: Mutex::new(Vec::new()),
                capture: Mutex::new(Vec::new()),
                capture_delay: Duration::from_millis(10),
            }
        }

        /// Queue reply counts for one probe kind.
        pub fn push_counts(&self, kind: ProbeKind, counts: &[usize]) {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            script.counts.entry(kind).or_default().extend(counts);
        }

        /// Preload what `capture_stream` returns.
        pub fn set_capture(&self, packets: Vec<CapturedPacket>) {
            *self.capture.lock().unwrap_or_else(|e| e.into_inner()) = packets;
        }

        pub fn sent_packets(&self) -> usize {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
        }

        fn kind_of(&self, mask: &Mask, ports: &[u32]) -> ProbeKind {
            match mask.expected().len() {
                crate::packet::ARP_FRAME_LEN => ProbeKind::ArpPing,
                42 => ProbeKind::LoopbackPing,
                _ if ports == self.pc_ports => ProbeKind::ServerToUplink,
                _ => ProbeKind::UplinkToServer,
            }
        }
    }

    #[async_trait]
    impl Dataplane for FakeDataplane {
        async fn send_packet(&self, port: u32, frame: &[u8]) -> Result<(), DataplaneError> {
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((port, frame.to_vec()));
            Ok(())
        }

        async fn count_matched_all_ports(
            &self,
            mask: &Mask,
            ports: &[u32],
            timeout: Duration,
        ) -> Result<usize, DataplaneError> {
            // Counting blocks for the probe window, like the real thing.
            tokio::time::sleep(timeout).await;
            let kind = self.kind_of(mask, ports);
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            let next = script.counts.get_mut(&kind).and_then(|q| q.pop_front());
            let value = match next {
                Some(v) => {
                    script.last.insert(kind, v);
                    v
                }
                None => script.last.get(&kind).copied().unwrap_or(0),
            };
            Ok(value)
        }

        async fn capture_stream(
            &self,
            _duration: Duration,
        ) -> Result<Vec<CapturedPacket>, DataplaneError> {
            tokio::time::sleep(self.capture_delay).await;
            Ok(self
                .capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeDataplane, ProbeKind};
    use super::*;
    use crate::packet::{UdpFrame, PROBE_DPORT};

    #[tokio::test]
    async fn fake_scripts_run_dry_to_last_value() {
        let dp = FakeDataplane::new(vec![28, 29]);
        dp.push_counts(ProbeKind::ServerToUplink, &[100, 50]);
        let mask = Mask::new(vec![0u8; 100]);
        let ports = vec![28, 29];
        let t = Duration::from_millis(1);
        assert_eq!(dp.count_matched_all_ports(&mask, &ports, t).await.unwrap(), 100);
        assert_eq!(dp.count_matched_all_ports(&mask, &ports, t).await.unwrap(), 50);
        assert_eq!(dp.count_matched_all_ports(&mask, &ports, t).await.unwrap(), 50);
    }

    #[test]
    fn stream_predicate_accepts_only_the_stream_tuple() {
        let good = UdpFrame {
            dport: PROBE_DPORT,
            payload: b"0001".to_vec(),
            ..UdpFrame::default()
        }
        .build();
        assert!(is_stream_frame(&good));

        let bad = UdpFrame {
            sport: 4321,
            dport: PROBE_DPORT,
            payload: b"0001".to_vec(),
            ..UdpFrame::default()
        }
        .build();
        assert!(!is_stream_frame(&bad));
    }
}
