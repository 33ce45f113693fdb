//! The reboot orchestrator.
//!
//! Sequences a full run: warm-up, watcher and observer spawn, the remote
//! reboot, disruption measurement (state machines for fast-reboot, the
//! stream capture for warm-reboot), observer collection, verdicts, and the
//! final report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Result};
use gapwatch_common::config::{RebootKind, TestConfig};
use gapwatch_common::report::{render_report, NeighborReport, RunSummary, Verdict};
use gapwatch_probes::analysis::examine_flow;
use gapwatch_probes::dataplane::Dataplane;
use gapwatch_probes::pcapdump::write_pcap;
use gapwatch_probes::probes::ProbeSet;
use gapwatch_probes::stream::{packets_to_send, StreamPlan};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::neighbor::{run_observer, ObserverCommand, ObserverConfig};
use crate::sendsniff::send_and_sniff;
use crate::ssh::{reboot_exit_ok, run_dut_command};
use crate::state::PlaneState;
use crate::watcher::{self, extract_no_cpu_replies, WatchShared, WatcherHandle};

/// Cadence of the orchestrator's polling loops.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What a finished run hands back to the caller.
pub struct RunOutcome {
    pub verdict: Verdict,
    pub neighbors: Vec<NeighborReport>,
    pub summary: RunSummary,
    pub report_text: String,
}

impl RunOutcome {
    pub fn is_pass(&self) -> bool {
        self.verdict.is_pass()
    }
}

pub struct Orchestrator {
    cfg: Arc<TestConfig>,
    dp: Arc<dyn Dataplane>,
    probes: Arc<ProbeSet>,
    stream_plan: Option<Arc<StreamPlan>>,
    output_dir: PathBuf,

    shared: Arc<WatchShared>,
    verdict: Verdict,
    observers: Vec<(mpsc::Sender<ObserverCommand>, JoinHandle<NeighborReport>)>,
    reboot_err: Option<watch::Receiver<Option<String>>>,

    downtime_secs: Option<f64>,
    reboot_time_secs: Option<f64>,
    no_cp_replies: Option<usize>,
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl Orchestrator {
    pub fn new(
        cfg: Arc<TestConfig>,
        dp: Arc<dyn Dataplane>,
        probes: Arc<ProbeSet>,
        stream_plan: Option<Arc<StreamPlan>>,
        output_dir: PathBuf,
    ) -> Self {
        Orchestrator {
            cfg,
            dp,
            probes,
            stream_plan,
            output_dir,
            shared: WatchShared::new(),
            verdict: Verdict::new(),
            observers: Vec::new(),
            reboot_err: None,
            downtime_secs: None,
            reboot_time_secs: None,
            no_cp_replies: None,
        }
    }

    /// Run the whole sequence and always come back with a report.
    pub async fn run(mut self) -> RunOutcome {
        let watcher_handle = watcher::spawn(
            self.dp.clone(),
            self.probes.clone(),
            self.cfg.clone(),
            self.shared.clone(),
        );
        self.spawn_observers();

        if let Err(e) = self.execute(&watcher_handle).await {
            error!("run aborted: {e}");
        }

        self.shared.stop_watching();
        let neighbors = self.collect_observer_reports().await;
        for report in &neighbors {
            self.verdict.absorb_neighbor(report);
        }

        let summary = RunSummary {
            downtime_secs: self.downtime_secs,
            reboot_time_secs: self.reboot_time_secs,
            reboot_limit_secs: self.cfg.reboot_limit.as_secs_f64(),
            no_cp_replies: self
                .no_cp_replies
                .map(|got| (got, self.probes.nr_vl_pkts)),
        };
        let report_text = render_report(&self.verdict, &neighbors, &summary);
        for line in report_text.lines() {
            info!("{line}");
        }

        RunOutcome {
            verdict: self.verdict,
            neighbors,
            summary,
            report_text,
        }
    }

    async fn execute(&mut self, watcher_handle: &WatcherHandle) -> Result<()> {
        if let Some(cmd) = &self.cfg.arp_responder_cmd {
            info!("enabling ARP responder");
            let status = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .status()
                .await;
            if let Err(e) = status {
                warn!("ARP responder command failed: {e}");
            }
        }

        info!("check that device is alive and pinging");
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.verdict.fail("dut", "DUT is not ready for test");
        if !self.wait_dut_to_warm_up().await {
            bail!("DUT is not stable");
        }
        self.verdict.clear_scope("dut");

        info!(
            "scheduling reboot of the remote switch in {:?}",
            self.cfg.reboot_delay
        );
        let _reboot_task = self.spawn_reboot();

        if self.cfg.service.is_none() {
            info!("waiting until the control plane is down");
            let timeout = self.cfg.task_timeout;
            self.with_deadline(
                timeout,
                &format!("DUT hasn't shutdown in {} seconds", timeout.as_secs()),
                Self::pump_until(
                    self.shared.clone(),
                    self.observer_senders(),
                    self.reboot_err.clone(),
                    |shared| shared.cpu.get() == PlaneState::Down,
                ),
            )
            .await?
            .map_err(|msg| anyhow!(msg))?;
        }

        if self.cfg.reboot == RebootKind::Fast {
            self.shared.set_light_probe(true);
        }
        let reboot_start = (Instant::now(), epoch_now());
        info!("switch reboots: reboot start recorded");

        match self.cfg.reboot {
            RebootKind::Fast => self.fast_reboot_phase(reboot_start).await?,
            RebootKind::Warm => self.warm_reboot_phase(reboot_start, watcher_handle).await?,
        }

        Ok(())
    }

    // ── Fast reboot: the watcher sees the outage ────────────────────

    async fn fast_reboot_phase(&mut self, reboot_start: (Instant, f64)) -> Result<()> {
        info!("check that the device is still forwarding dataplane traffic");
        self.verdict.fail("dut", "Data plane has a forwarding problem");
        if !self.check_alive().await {
            bail!("DUT is not stable after the reboot was issued");
        }
        self.verdict.clear_scope("dut");

        let timeout = self.cfg.task_timeout;

        info!("waiting until the control plane is back up");
        let cpu_up = Self::pump_until(
            self.shared.clone(),
            self.observer_senders(),
            self.reboot_err.clone(),
            |shared| shared.cpu.get() == PlaneState::Up,
        );

        info!("waiting until the data plane stops");
        let shared = self.shared.clone();
        let senders = self.observer_senders();
        let reboot_err = self.reboot_err.clone();
        let forwarding = async move {
            shared.start_recording();
            Self::pump_until(shared.clone(), senders, reboot_err, |shared| {
                shared.asic.get() == PlaneState::Down
            })
            .await?;
            shared.stop_recording();
            let stopped_at = shared.asic.state_time(PlaneState::Down);

            // No go-token pumping here; the observers are woken again when
            // the orchestrator collects them.
            loop {
                let state = shared.asic.get();
                if state != PlaneState::Down {
                    return Ok::<_, String>((stopped_at, shared.asic.state_time(state)));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };

        let (cpu_result, forward_result) = tokio::join!(
            tokio::time::timeout(timeout, cpu_up),
            tokio::time::timeout(timeout, forwarding),
        );

        match cpu_result {
            Ok(result) => result.map_err(|msg| anyhow!(msg))?,
            Err(_) => {
                let msg = format!("DUT hasn't booted up in {} seconds", timeout.as_secs());
                self.verdict.fail("dut", msg.clone());
                bail!(msg);
            }
        }
        let (no_routing_start, no_routing_stop) = match forward_result {
            Ok(result) => result.map_err(|msg| anyhow!(msg))?,
            Err(_) => {
                let msg = format!(
                    "Data plane outage was not observed within {} seconds",
                    timeout.as_secs()
                );
                self.verdict.fail("dut", msg.clone());
                bail!(msg);
            }
        };

        self.shared.stop_watching();

        if let (Some(start), Some(stop)) = (no_routing_start, no_routing_stop) {
            let downtime = stop.saturating_duration_since(start).as_secs_f64();
            let reboot_time = stop.saturating_duration_since(reboot_start.0).as_secs_f64();
            info!(downtime, reboot_time, "data plane works again");
            self.downtime_secs = Some(downtime);
            self.reboot_time_secs = Some(reboot_time);
        }

        let trace = self.shared.trace_snapshot();
        self.no_cp_replies = extract_no_cpu_replies(&trace);
        self.apply_outage_verdicts();
        Ok(())
    }

    // ── Warm reboot: the stream capture sees the outage ─────────────

    async fn warm_reboot_phase(
        &mut self,
        reboot_start: (Instant, f64),
        watcher_handle: &WatcherHandle,
    ) -> Result<()> {
        let plan = self
            .stream_plan
            .clone()
            .ok_or_else(|| anyhow!("warm reboot requires a pre-built stream"))?;

        info!("stopping the reachability watcher");
        self.shared.stop_watching();
        let mut stopped = watcher_handle.stopped.clone();
        let _ = tokio::time::timeout(Duration::from_secs(10), stopped.wait_for(|v| *v)).await;

        let capture = send_and_sniff(self.dp.clone(), plan, self.cfg.time_to_listen).await?;
        let capture_path = self.output_dir.join("capture.pcap");
        if let Err(e) = write_pcap(&capture_path, &capture) {
            warn!("failed to dump capture: {e}");
        }

        let examine_start = Instant::now();
        let expected = packets_to_send(self.cfg.time_to_listen, self.cfg.send_interval);
        match examine_flow(&capture, self.cfg.dut_mac, expected) {
            Ok(analysis) => {
                info!(
                    "packet flow examined in {:?}: {} disruption(s), {} packet(s) lost, {} received",
                    examine_start.elapsed(),
                    analysis.disruptions.len(),
                    analysis.total_lost_packets,
                    analysis.received_count,
                );
                for d in &analysis.disruptions {
                    info!(
                        "disruption from packet ID {} ({} lost) lasting {:.4} s",
                        d.first_lost_id, d.lost_count, d.duration
                    );
                }
                let filtered_path = self.output_dir.join("capture_filtered.pcap");
                if let Err(e) = write_pcap(&filtered_path, &analysis.filtered) {
                    warn!("failed to dump filtered capture: {e}");
                }

                let (start, stop) = match &analysis.longest {
                    Some(longest) => {
                        info!(
                            "the longest disruption lasted {:.3} seconds, {} packet(s) lost",
                            longest.duration, longest.lost_count
                        );
                        (longest.start, longest.stop)
                    }
                    None => {
                        info!("gaps in forwarding not found");
                        (reboot_start.1, reboot_start.1)
                    }
                };
                self.downtime_secs = Some(stop - start);
                self.reboot_time_secs = Some(stop - reboot_start.1);
            }
            Err(e) => {
                self.verdict.fail("dut", e.to_string());
            }
        }

        self.apply_outage_verdicts();
        Ok(())
    }

    // ── Verdicts ────────────────────────────────────────────────────

    fn apply_outage_verdicts(&mut self) {
        apply_outage_verdicts(
            &mut self.verdict,
            self.cfg.reboot,
            self.downtime_secs,
            self.reboot_time_secs,
            self.cfg.reboot_limit.as_secs_f64(),
            self.cfg.graceful_limit.as_secs_f64(),
            self.no_cp_replies.map(|got| (got, self.probes.nr_vl_pkts)),
        );
    }

    // ── Observers ───────────────────────────────────────────────────

    fn spawn_observers(&mut self) {
        for ip in &self.cfg.neighbors {
            let (tx, rx) = mpsc::channel(1024);
            let observer_cfg = ObserverConfig {
                ip: ip.clone(),
                login: self.cfg.neighbor_login.clone(),
                v4_routes: self.cfg.expected_v4_routes(),
                v6_routes: self.cfg.expected_v6_routes(),
                min_bgp_gr_timeout: self.cfg.min_bgp_gr_timeout,
                data_dir: self.output_dir.clone(),
            };
            let handle = tokio::spawn(run_observer(observer_cfg, rx));
            self.observers.push((tx, handle));
        }
    }

    fn observer_senders(&self) -> Vec<mpsc::Sender<ObserverCommand>> {
        self.observers.iter().map(|(tx, _)| tx.clone()).collect()
    }

    /// Tell every observer to wind down, keep pumping go tokens until they
    /// all finish, and collect their reports.
    async fn collect_observer_reports(&mut self) -> Vec<NeighborReport> {
        info!("waiting until BGP routing is back on all neighbors");
        for (tx, _) in &self.observers {
            let _ = tx.try_send(ObserverCommand::Quit);
        }

        let deadline = Instant::now() + self.cfg.task_timeout;
        loop {
            if self.observers.iter().all(|(_, h)| h.is_finished()) {
                break;
            }
            if Instant::now() >= deadline {
                let msg = format!(
                    "SSH threads haven't finished in {} seconds",
                    self.cfg.task_timeout.as_secs()
                );
                self.verdict.fail("dut", msg.clone());
                error!("{msg}");
                for (_, handle) in &self.observers {
                    handle.abort();
                }
                break;
            }
            for (tx, _) in &self.observers {
                let _ = tx.try_send(ObserverCommand::Go);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let mut reports = Vec::new();
        for (ip, (_, handle)) in self
            .cfg
            .neighbors
            .clone()
            .into_iter()
            .zip(self.observers.drain(..))
        {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(_) => {
                    let mut report = NeighborReport::new(ip);
                    report.logs.error = Some("observer did not finish".into());
                    reports.push(report);
                }
            }
        }
        reports
    }

    // ── Reboot issue ────────────────────────────────────────────────

    fn spawn_reboot(&mut self) -> JoinHandle<()> {
        let cfg = self.cfg.clone();
        let (err_tx, err_rx) = watch::channel(None);
        self.reboot_err = Some(err_rx);
        tokio::spawn(async move {
            tokio::time::sleep(cfg.reboot_delay).await;
            if let Err(msg) = issue_reboot(&cfg).await {
                error!("{msg}");
                let _ = err_tx.send(Some(msg));
            }
        })
    }

    // ── Waits ───────────────────────────────────────────────────────

    /// Poll `cond` at the orchestrator cadence, pumping one go token to
    /// every observer per poll; aborts when the reboot task reported a
    /// failure.
    async fn pump_until<F>(
        shared: Arc<WatchShared>,
        senders: Vec<mpsc::Sender<ObserverCommand>>,
        reboot_err: Option<watch::Receiver<Option<String>>>,
        cond: F,
    ) -> Result<(), String>
    where
        F: Fn(&WatchShared) -> bool,
    {
        loop {
            for tx in &senders {
                let _ = tx.try_send(ObserverCommand::Go);
            }
            if let Some(rx) = &reboot_err {
                if let Some(msg) = rx.borrow().clone() {
                    return Err(msg);
                }
            }
            if cond(&shared) {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn with_deadline<T>(
        &mut self,
        duration: Duration,
        message: &str,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T> {
        match tokio::time::timeout(duration, fut).await {
            Ok(value) => Ok(value),
            Err(_) => {
                error!("timeout reached: {message}");
                self.verdict.fail("dut", message.to_string());
                Err(anyhow!(message.to_string()))
            }
        }
    }

    /// Wait for both planes to be steadily up and the VLAN flood to clear.
    ///
    /// A freshly booted switch takes a while to learn FDB and ARP entries;
    /// it must hold `up` without flooding past the stabilization window,
    /// and neither plane may flap while we wait.
    async fn wait_dut_to_warm_up(&self) -> bool {
        let stabilize = self.cfg.stabilize;
        let warm_up_timeout = self.cfg.warm_up_timeout;
        let start = Instant::now();

        loop {
            let dataplane = self.shared.asic.get();
            let ctrlplane = self.shared.cpu.get();
            if dataplane == PlaneState::Up
                && ctrlplane == PlaneState::Up
                && start.elapsed() > stabilize
            {
                break;
            }
            if start.elapsed() > warm_up_timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let uptime = Instant::now();
        loop {
            if !self.shared.asic.is_flooding() && start.elapsed() > stabilize {
                break;
            }
            if start.elapsed() > warm_up_timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if self.shared.asic.get() != PlaneState::Up || self.shared.cpu.get() != PlaneState::Up {
            return false;
        }
        // A plane that re-entered `up` after the flood cleared flapped
        // while we were waiting.
        let flapped = |t: Option<Instant>| t.is_some_and(|t| t > uptime);
        if flapped(self.shared.asic.state_time(PlaneState::Up))
            || flapped(self.shared.cpu.state_time(PlaneState::Up))
        {
            return false;
        }
        true
    }

    /// Confirm the data plane keeps forwarding while the control plane
    /// goes away, then outlast the FDB re-learning flood.
    async fn check_alive(&self) -> bool {
        let mut uptime: Option<Instant> = None;
        for _ in 0..self.cfg.nr_tests * 2 {
            if self.shared.asic.get() == PlaneState::Up {
                if uptime.is_none() {
                    uptime = self.shared.asic.state_time(PlaneState::Up);
                }
            } else if uptime.is_some() {
                // Stopped working after it had been working for some time.
                return false;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        for _ in 0..self.cfg.nr_tests * 10 {
            if !self.shared.asic.is_flooding() {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        false
    }
}

/// Issue the remote restart: either the whole switch or one service.
async fn issue_reboot(cfg: &TestConfig) -> Result<(), String> {
    let run = |command: String| {
        let dut_ssh = cfg.dut_ssh.clone();
        async move {
            run_dut_command(&dut_ssh, &command)
                .await
                .map_err(|e| format!("reboot command failed: {e}"))
        }
    };

    let code = match &cfg.service {
        None => {
            info!("rebooting remote side");
            run(format!("sudo {}", cfg.reboot.command())).await?
        }
        Some(service) => {
            info!(service, "restarting remote service");
            if cfg.reboot == RebootKind::Warm {
                run(format!("sudo config warm_restart enable {service}")).await?;
                match service.as_str() {
                    "teamd" => {
                        run("docker exec -i teamd pkill -USR1 teamd".to_string()).await?;
                    }
                    "swss" => {
                        run("docker exec -i swss orchagent_restart_check -w 1000".to_string())
                            .await?;
                    }
                    "bgp" => {
                        run(
                            "docker exec -i bgp pkill -9 zebra && docker exec -i bgp pkill -9 bgpd"
                                .to_string(),
                        )
                        .await?;
                    }
                    other => {
                        warn!("warm restart for {other} is not supported, proceeding to cold restart");
                    }
                }
                // Give the pre-processing a moment to settle.
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            run(format!("sudo systemctl restart {service}")).await?
        }
    };

    if reboot_exit_ok(code) {
        Ok(())
    } else {
        Err(format!("reboot command exited with unexpected code {code}"))
    }
}

/// Dataplane-side pass/fail rules shared by both reboot kinds.
pub fn apply_outage_verdicts(
    verdict: &mut Verdict,
    kind: RebootKind,
    downtime_secs: Option<f64>,
    reboot_time_secs: Option<f64>,
    reboot_limit_secs: f64,
    graceful_limit_secs: f64,
    no_cp_replies: Option<(usize, usize)>,
) {
    if let Some(downtime) = downtime_secs {
        if downtime > reboot_limit_secs {
            verdict.fail(
                "dut",
                format!(
                    "Downtime must be less than {reboot_limit_secs:.0} seconds. It was {downtime:.3}"
                ),
            );
        }
    }
    if let Some(reboot_time) = reboot_time_secs {
        if reboot_time > graceful_limit_secs {
            verdict.fail(
                "dut",
                format!(
                    "{kind} cycle must be less than graceful limit {graceful_limit_secs:.0} seconds"
                ),
            );
        }
    }
    if kind == RebootKind::Fast {
        if let Some((got, expected)) = no_cp_replies {
            if (got as f64) < 0.95 * expected as f64 {
                verdict.fail(
                    "dut",
                    format!(
                        "Dataplane didn't route to all servers, when control-plane was down: {got} vs {expected}"
                    ),
                );
            }
        }
    }
}
