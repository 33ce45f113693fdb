//! Run verdicts and per-neighbor reports.
//!
//! `Verdict` is the single accumulator every check writes into; the run
//! passes iff every failure set is empty at teardown. Neighbor observers
//! return a [`NeighborReport`] when their session terminates, and the
//! orchestrator absorbs those into the verdict before rendering the final
//! human-readable report.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;

/// Down/total status of one sampled CLI series.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeriesStatus {
    pub down_count: u32,
    pub down_secs: f64,
}

/// One graceful-restart route-timeout event: seconds offset and the ASN
/// the stale routes belonged to.
#[derive(Debug, Clone, Serialize)]
pub struct RouteTimeoutEvent {
    pub offset_secs: i64,
    pub asn: String,
}

/// Status series derived from CLI polling of one neighbor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CliSeries {
    pub lacp: SeriesStatus,
    pub bgp_v4: SeriesStatus,
    pub bgp_v6: SeriesStatus,
    /// Number of observed port-channel status-change timestamp updates.
    /// (The companion downtime slot of the other series is unused here.)
    pub po_changes: u32,
    pub route_timeout: BTreeMap<String, Vec<RouteTimeoutEvent>>,
}

/// Scalar metrics scraped from the neighbor's syslog after the reboot.
///
/// Every field is `None` when the log window was incomplete or failed a
/// sanity condition; `error` then says why.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogMetrics {
    pub error: Option<String>,
    pub po_down_secs: Option<i64>,
    pub if_down_counts: BTreeMap<String, u32>,
    pub bgp_v4_down_secs: Option<i64>,
    pub bgp_v6_down_secs: Option<i64>,
    pub bgp_v4_down_count: Option<u32>,
    pub bgp_v6_down_count: Option<u32>,
    pub po_down_after_bgp_secs: Option<i64>,
    pub bgp_v4_up_after_po_secs: Option<i64>,
    pub bgp_v6_up_after_po_secs: Option<i64>,
}

impl LogMetrics {
    /// Flatten to labelled scalars for the report.
    pub fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(err) = &self.error {
            out.push(format!("error : {err}"));
        }
        if let Some(v) = self.po_down_secs {
            out.push(format!("PortChannel was down (seconds) : {v}"));
        }
        for (ifname, count) in &self.if_down_counts {
            out.push(format!("Interface {ifname} was down (times) : {count}"));
        }
        if let Some(v) = self.bgp_v4_down_secs {
            out.push(format!("BGP IPv4 was down (seconds) : {v}"));
        }
        if let Some(v) = self.bgp_v6_down_secs {
            out.push(format!("BGP IPv6 was down (seconds) : {v}"));
        }
        if let Some(v) = self.bgp_v4_down_count {
            out.push(format!("BGP IPv4 was down (times) : {v}"));
        }
        if let Some(v) = self.bgp_v6_down_count {
            out.push(format!("BGP IPv6 was down (times) : {v}"));
        }
        if let Some(v) = self.po_down_after_bgp_secs {
            out.push(format!(
                "PortChannel went down after bgp session was down (seconds) : {v}"
            ));
        }
        if let Some(v) = self.bgp_v4_up_after_po_secs {
            out.push(format!(
                "BGP IPv4 was gotten up after Po was up (seconds) : {v}"
            ));
        }
        if let Some(v) = self.bgp_v6_up_after_po_secs {
            out.push(format!(
                "BGP IPv6 was gotten up after Po was up (seconds) : {v}"
            ));
        }
        out
    }
}

/// Everything one neighbor observer produced.
#[derive(Debug, Clone, Serialize)]
pub struct NeighborReport {
    pub ip: String,
    pub fails: BTreeSet<String>,
    pub info: BTreeSet<String>,
    pub cli: Option<CliSeries>,
    pub logs: LogMetrics,
}

impl NeighborReport {
    pub fn new(ip: impl Into<String>) -> Self {
        NeighborReport {
            ip: ip.into(),
            fails: BTreeSet::new(),
            info: BTreeSet::new(),
            cli: None,
            logs: LogMetrics::default(),
        }
    }
}

/// Process-wide pass/fail accumulator.
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    fails: BTreeMap<String, BTreeSet<String>>,
    info: BTreeMap<String, BTreeSet<String>>,
}

impl Verdict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, scope: &str, message: impl Into<String>) {
        self.fails
            .entry(scope.to_string())
            .or_default()
            .insert(message.into());
    }

    pub fn note(&mut self, scope: &str, message: impl Into<String>) {
        self.info
            .entry(scope.to_string())
            .or_default()
            .insert(message.into());
    }

    pub fn clear_scope(&mut self, scope: &str) {
        if let Some(set) = self.fails.get_mut(scope) {
            set.clear();
        }
    }

    pub fn absorb_neighbor(&mut self, report: &NeighborReport) {
        for fail in &report.fails {
            self.fail(&report.ip, fail.clone());
        }
        for note in &report.info {
            self.note(&report.ip, note.clone());
        }
    }

    pub fn is_pass(&self) -> bool {
        self.fails.values().all(|set| set.is_empty())
    }

    pub fn fails(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.fails
    }

    pub fn info(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.info
    }
}

/// Dataplane-side numbers the orchestrator feeds the final report.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub downtime_secs: Option<f64>,
    pub reboot_time_secs: Option<f64>,
    pub reboot_limit_secs: f64,
    /// Replies seen while the control plane was down, with the expected
    /// fan-out, for fast-reboot runs.
    pub no_cp_replies: Option<(usize, usize)>,
}

const RULE_HEAVY: &str = "==================================================";
const RULE_LIGHT: &str = "--------------------------------------------------";

/// Render the end-of-run report.
pub fn render_report(
    verdict: &Verdict,
    neighbors: &[NeighborReport],
    summary: &RunSummary,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{RULE_HEAVY}");
    let _ = writeln!(out, "Report:");
    let _ = writeln!(out, "{RULE_HEAVY}");

    let _ = writeln!(out, "LACP/BGP were down for (extracted from cli):");
    let _ = writeln!(out, "{RULE_LIGHT}");
    for report in neighbors {
        if let Some(cli) = &report.cli {
            let _ = writeln!(
                out,
                "    {} - lacp: {:7.3} ({}) po_events: ({}) bgp v4: {:7.3} ({}) bgp v6: {:7.3} ({})",
                report.ip,
                cli.lacp.down_secs,
                cli.lacp.down_count,
                cli.po_changes,
                cli.bgp_v4.down_secs,
                cli.bgp_v4.down_count,
                cli.bgp_v6.down_secs,
                cli.bgp_v6.down_count,
            );
        }
    }

    let _ = writeln!(out, "{RULE_LIGHT}");
    let _ = writeln!(out, "Extracted from neighbor logs:");
    let _ = writeln!(out, "{RULE_LIGHT}");
    for report in neighbors {
        let _ = writeln!(out, "Extracted log info from {}", report.ip);
        for line in report.logs.lines() {
            let _ = writeln!(out, "    {line}");
        }
        let _ = writeln!(out, "{RULE_LIGHT}");
    }

    let _ = writeln!(out, "Summary:");
    let _ = writeln!(out, "{RULE_LIGHT}");
    if let (Some(downtime), Some(reboot_time)) = (summary.downtime_secs, summary.reboot_time_secs) {
        let _ = writeln!(out, "Downtime was {downtime:.3} seconds");
        let _ = writeln!(out, "Reboot time was {reboot_time:.3} seconds");
        let _ = writeln!(
            out,
            "Expected downtime is less than {:.0} seconds",
            summary.reboot_limit_secs
        );
    }
    if let Some((got, expected)) = summary.no_cp_replies {
        let _ = writeln!(
            out,
            "How many packets were received back when control plane was down: {got} Expected: {expected}"
        );
    }

    let has_info = verdict.info().values().any(|set| !set.is_empty());
    if has_info {
        let _ = writeln!(out, "{RULE_LIGHT}");
        let _ = writeln!(out, "Additional info:");
        let _ = writeln!(out, "{RULE_LIGHT}");
        for (scope, notes) in verdict.info() {
            for note in notes {
                let _ = writeln!(out, "INFO:{scope}:{note}");
            }
        }
    }

    if !verdict.is_pass() {
        let _ = writeln!(out, "{RULE_LIGHT}");
        let _ = writeln!(out, "Fails:");
        let _ = writeln!(out, "{RULE_LIGHT}");
        for (scope, fails) in verdict.fails() {
            for fail in fails {
                let _ = writeln!(out, "FAILED:{scope}:{fail}");
            }
        }
    }
    let _ = writeln!(out, "{RULE_HEAVY}");

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_verdict_passes() {
        let verdict = Verdict::new();
        assert!(verdict.is_pass());
    }

    #[test]
    fn cleared_scope_passes_again() {
        let mut verdict = Verdict::new();
        verdict.fail("dut", "DUT is not ready for test");
        assert!(!verdict.is_pass());
        verdict.clear_scope("dut");
        assert!(verdict.is_pass());
    }

    #[test]
    fn info_does_not_fail_the_run() {
        let mut verdict = Verdict::new();
        verdict.note("10.0.0.200", "LACP session must be down just for once");
        assert!(verdict.is_pass());
    }

    #[test]
    fn neighbor_fails_are_scoped_by_ip() {
        let mut report = NeighborReport::new("10.0.0.201");
        report.fails.insert("bgp ipv4 graceful restart is not enabled".into());
        let mut verdict = Verdict::new();
        verdict.absorb_neighbor(&report);
        assert!(!verdict.is_pass());
        assert!(verdict.fails().contains_key("10.0.0.201"));
    }

    #[test]
    fn report_renders_fails_and_summary() {
        let mut verdict = Verdict::new();
        verdict.fail("dut", "Downtime must be less than 30 seconds");
        let mut report = NeighborReport::new("10.0.0.200");
        report.cli = Some(CliSeries::default());
        let summary = RunSummary {
            downtime_secs: Some(14.8),
            reboot_time_secs: Some(35.0),
            reboot_limit_secs: 30.0,
            no_cp_replies: Some((480, 500)),
        };

        let text = render_report(&verdict, &[report], &summary);
        assert!(text.contains("FAILED:dut:Downtime must be less than 30 seconds"));
        assert!(text.contains("Downtime was 14.800 seconds"));
        assert!(text.contains("480 Expected: 500"));
        assert!(text.contains("10.0.0.200 - lacp:"));
    }
}
