//! The reachability watcher.
//!
//! A background task that keeps probing the switch in both directions and
//! classifies the forwarding plane, the control plane, and the VLAN ARP
//! path into the per-plane state machines. The orchestrator never probes
//! itself; it only waits on the state machines this task maintains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gapwatch_common::config::TestConfig;
use gapwatch_probes::dataplane::Dataplane;
use gapwatch_probes::probes::ProbeSet;
use rand::seq::IndexedRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state::{PlaneState, StateMachine};

struct ReachTrace {
    recording: bool,
    samples: Vec<usize>,
}

/// State shared between the watcher task and the orchestrator.
pub struct WatchShared {
    pub asic: StateMachine,
    pub cpu: StateMachine,
    pub vlan: StateMachine,
    watching: AtomicBool,
    light_probe: AtomicBool,
    trace: Mutex<ReachTrace>,
}

impl WatchShared {
    pub fn new() -> Arc<Self> {
        Arc::new(WatchShared {
            asic: StateMachine::new("asic"),
            cpu: StateMachine::new("cpu"),
            vlan: StateMachine::new("vlan"),
            watching: AtomicBool::new(true),
            light_probe: AtomicBool::new(false),
            trace: Mutex::new(ReachTrace {
                recording: false,
                samples: Vec::new(),
            }),
        })
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    pub fn stop_watching(&self) {
        self.watching.store(false, Ordering::SeqCst);
    }

    /// When set, a failed server-side probe skips the expensive uplink
    /// sweep for that iteration.
    pub fn set_light_probe(&self, on: bool) {
        self.light_probe.store(on, Ordering::SeqCst);
    }

    pub fn is_light_probe(&self) -> bool {
        self.light_probe.load(Ordering::SeqCst)
    }

    /// Start a fresh uplink→VLAN reply-count trace.
    pub fn start_recording(&self) {
        let mut trace = self.trace.lock().unwrap_or_else(|e| e.into_inner());
        trace.samples.clear();
        trace.recording = true;
    }

    pub fn stop_recording(&self) {
        self.trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recording = false;
    }

    pub fn trace_snapshot(&self) -> Vec<usize> {
        self.trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .samples
            .clone()
    }

    fn record(&self, t1_to_vlan: usize) {
        let mut trace = self.trace.lock().unwrap_or_else(|e| e.into_inner());
        if trace.recording {
            trace.samples.push(t1_to_vlan);
        }
    }
}

/// Classify the forwarding plane from the two directional reply counts.
///
/// More replies than probes means the switch is still flooding the VLAN
/// because the FDB entry is unlearnt; that is reachable, but not healthy.
pub fn classify_plane(
    vlan_to_t1: usize,
    t1_to_vlan: usize,
    nr_pc_pkts: usize,
    nr_vl_pkts: usize,
) -> (PlaneState, bool) {
    let reachable = t1_to_vlan as f64 > nr_vl_pkts as f64 * 0.7
        && vlan_to_t1 as f64 > nr_pc_pkts as f64 * 0.7;
    let partial = reachable && (t1_to_vlan < nr_vl_pkts || vlan_to_t1 < nr_pc_pkts);
    let flooding = reachable && (t1_to_vlan > nr_vl_pkts || vlan_to_t1 > nr_pc_pkts);
    let state = if reachable {
        if partial {
            PlaneState::Partial
        } else {
            PlaneState::Up
        }
    } else {
        PlaneState::Down
    };
    (state, flooding)
}

/// Classify the control plane from the loopback-ping reply count.
pub fn classify_cpu(replies: usize, expected: usize) -> (PlaneState, bool) {
    let reachable = replies > 0 && replies as f64 > expected as f64 * 0.7;
    let partial = replies > 0 && replies < expected;
    let flooding = reachable && replies > expected;
    let state = if reachable {
        if partial {
            PlaneState::Partial
        } else {
            PlaneState::Up
        }
    } else {
        PlaneState::Down
    };
    (state, flooding)
}

/// Replies seen while the control plane was down, from a recorded trace.
///
/// The trace tails off with zeros while the switch boots; the last
/// non-zero sample is the answer unless its predecessor is larger, which
/// means the final burst was already cut short.
pub fn extract_no_cpu_replies(trace: &[usize]) -> Option<usize> {
    let non_zero: Vec<usize> = trace.iter().copied().filter(|&v| v > 0).collect();
    match non_zero.as_slice() {
        [] => None,
        [only] => Some(*only),
        [.., prev, last] => Some(if last < prev { *prev } else { *last }),
    }
}

/// Handle returned by [`spawn`].
pub struct WatcherHandle {
    pub task: JoinHandle<()>,
    /// Becomes `true` once the first full probe iteration completed.
    pub running: watch::Receiver<bool>,
    /// Becomes `true` when the loop has exited.
    pub stopped: watch::Receiver<bool>,
}

/// Spawn the watcher task.
pub fn spawn(
    dp: Arc<dyn Dataplane>,
    probes: Arc<ProbeSet>,
    cfg: Arc<TestConfig>,
    shared: Arc<WatchShared>,
) -> WatcherHandle {
    let (running_tx, running) = watch::channel(false);
    let (stopped_tx, stopped) = watch::channel(false);

    let task = tokio::spawn(async move {
        let watcher = Watcher {
            dp,
            probes,
            cfg,
            shared,
        };
        watcher.run(running_tx, stopped_tx).await;
    });

    WatcherHandle {
        task,
        running,
        stopped,
    }
}

struct Watcher {
    dp: Arc<dyn Dataplane>,
    probes: Arc<ProbeSet>,
    cfg: Arc<TestConfig>,
    shared: Arc<WatchShared>,
}

impl Watcher {
    async fn run(&self, running_tx: watch::Sender<bool>, stopped_tx: watch::Sender<bool>) {
        info!("reachability watcher started");
        while self.shared.is_watching() {
            let (vlan_to_t1, t1_to_vlan) = self.ping_data_plane().await;
            let (state, flooding) = classify_plane(
                vlan_to_t1,
                t1_to_vlan,
                self.cfg.nr_pc_pkts,
                self.probes.nr_vl_pkts,
            );
            self.shared.record(t1_to_vlan);
            self.shared.asic.set_flooding(flooding);
            let old = self.shared.asic.get();
            if old != state {
                info!(%old, new = %state, t1_to_vlan, "data plane state transition");
                self.shared.asic.set(state);
            }

            let replies = self.ping_dut().await;
            let (state, flooding) = classify_cpu(replies, self.cfg.ping_dut_pkts);
            self.shared.cpu.set_flooding(flooding);
            let old = self.shared.cpu.get();
            if old != state {
                info!(%old, new = %state, "control plane state transition");
                self.shared.cpu.set(state);
            }

            let arp_replies = self.arp_ping().await;
            let state = if arp_replies >= self.cfg.arp_ping_pkts {
                PlaneState::Up
            } else {
                PlaneState::Down
            };
            let old = self.shared.vlan.get();
            if old != state {
                info!(%old, new = %state, "VLAN ARP state transition");
                self.shared.vlan.set(state);
            }

            let _ = running_tx.send(true);
        }
        let _ = stopped_tx.send(true);
        let _ = running_tx.send(false);
        info!("reachability watcher stopped");
    }

    async fn ping_data_plane(&self) -> (usize, usize) {
        let vlan_to_t1 = self.ping_from_servers().await;
        let t1_to_vlan = if vlan_to_t1 > 0 || !self.shared.is_light_probe() {
            self.ping_from_upper_tier().await
        } else {
            0
        };
        (vlan_to_t1, t1_to_vlan)
    }

    async fn ping_from_servers(&self) -> usize {
        for _ in 0..self.cfg.nr_pc_pkts {
            if let Err(e) = self
                .dp
                .send_packet(self.probes.vlan_src_port, &self.probes.from_vlan_frame)
                .await
            {
                warn!("server probe send failed: {e}");
            }
        }
        let count = self
            .count(
                &self.probes.from_vlan_mask,
                &self.cfg.portchannel_ports,
            )
            .await;
        debug!(
            "Send {:5} Received {count:5} servers->t1",
            self.cfg.nr_pc_pkts
        );
        count
    }

    async fn ping_from_upper_tier(&self) -> usize {
        for entry in &self.probes.from_t1 {
            if let Err(e) = self.dp.send_packet(entry.ingress_port, &entry.frame).await {
                warn!("uplink sweep send failed: {e}");
            }
        }
        let count = self
            .count(&self.probes.from_t1_mask, &self.cfg.vlan_ports)
            .await;
        debug!(
            "Send {:5} Received {count:5} t1->servers",
            self.probes.nr_vl_pkts
        );
        count
    }

    async fn ping_dut(&self) -> usize {
        for _ in 0..self.cfg.ping_dut_pkts {
            let port = {
                let mut rng = rand::rng();
                self.cfg
                    .vlan_ports
                    .choose(&mut rng)
                    .copied()
                    .unwrap_or(self.probes.vlan_src_port)
            };
            if let Err(e) = self.dp.send_packet(port, &self.probes.ping_dut_frame).await {
                warn!("loopback ping send failed: {e}");
            }
        }
        let count = self
            .count(&self.probes.ping_dut_mask, &self.cfg.vlan_ports)
            .await;
        debug!("Send {:5} Received {count:5} ping DUT", self.cfg.ping_dut_pkts);
        count
    }

    async fn arp_ping(&self) -> usize {
        for _ in 0..self.cfg.arp_ping_pkts {
            if let Err(e) = self
                .dp
                .send_packet(self.probes.arp_src_port, &self.probes.arp_frame)
                .await
            {
                warn!("arp ping send failed: {e}");
            }
        }
        let ports = [self.probes.arp_src_port];
        let count = self.count(&self.probes.arp_mask, &ports).await;
        debug!("Send {:5} Received {count:5} arp ping", self.cfg.arp_ping_pkts);
        count
    }

    async fn count(&self, mask: &gapwatch_probes::mask::Mask, ports: &[u32]) -> usize {
        match self
            .dp
            .count_matched_all_ports(mask, ports, self.cfg.probe_timeout)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                // A transient dataplane hiccup reads as zero replies; the
                // classification thresholds absorb it.
                warn!("reply count failed: {e}");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_classification_thresholds() {
        // healthy: full replies in both directions
        assert_eq!(classify_plane(100, 500, 100, 500), (PlaneState::Up, false));
        // partial: above threshold but lossy
        assert_eq!(
            classify_plane(100, 400, 100, 500),
            (PlaneState::Partial, false)
        );
        // down: one direction under 70 %
        assert_eq!(classify_plane(100, 350, 100, 500), (PlaneState::Down, false));
        assert_eq!(classify_plane(0, 500, 100, 500), (PlaneState::Down, false));
    }

    #[test]
    fn flooding_implies_reachable() {
        // more replies than probes: FDB unlearnt, still forwarding
        let (state, flooding) = classify_plane(100, 800, 100, 500);
        assert_eq!(state, PlaneState::Up);
        assert!(flooding);

        // not reachable can never flood
        for v in [0usize, 10, 70] {
            let (state, flooding) = classify_plane(v, 0, 100, 500);
            assert_eq!(state, PlaneState::Down);
            assert!(!flooding);
        }
    }

    #[test]
    fn cpu_classification_thresholds() {
        assert_eq!(classify_cpu(10, 10), (PlaneState::Up, false));
        assert_eq!(classify_cpu(8, 10), (PlaneState::Partial, false));
        assert_eq!(classify_cpu(7, 10), (PlaneState::Down, false));
        assert_eq!(classify_cpu(0, 10), (PlaneState::Down, false));
        // floods count as reachable
        assert_eq!(classify_cpu(12, 10), (PlaneState::Up, true));
    }

    #[test]
    fn no_cpu_replies_extraction_uses_the_predecessor_rule() {
        // tail-off during boot: the last burst was already cut short
        assert_eq!(extract_no_cpu_replies(&[500, 480, 470, 0, 0, 0]), Some(480));
        // steady tail: take the last non-zero sample
        assert_eq!(extract_no_cpu_replies(&[400, 480, 490, 0]), Some(490));
        assert_eq!(extract_no_cpu_replies(&[0, 0, 0]), None);
        assert_eq!(extract_no_cpu_replies(&[0, 300, 0]), Some(300));
        assert_eq!(extract_no_cpu_replies(&[]), None);
    }
}
