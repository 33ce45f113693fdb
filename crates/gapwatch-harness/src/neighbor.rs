//! Per-neighbor observation over an interactive shell.
//!
//! One observer task per neighbor router. While the switch reboots, the
//! observer keeps sampling LACP, BGP neighbor state, and the advertised
//! route sets; afterwards it scrapes the router's syslog for the adjacency
//! and line-protocol timeline. Everything ends up in a [`NeighborReport`].
//!
//! The observer is driven by its command queue: the orchestrator pumps
//! `Go` tokens to trigger sampling turns and sends `Quit` when the reboot
//! is over. The loop only exits once `Quit` has been seen *and* both route
//! sets are fully restored.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{NaiveDate, NaiveDateTime};
use gapwatch_common::report::{
    CliSeries, LogMetrics, NeighborReport, RouteTimeoutEvent, SeriesStatus,
};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::ssh::InteractiveShell;

/// Rendezvous tokens from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverCommand {
    Go,
    Quit,
}

/// Static inputs of one observer.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub ip: String,
    pub login: String,
    /// IPv4 routes that must be back before the observer may exit.
    pub v4_routes: Vec<String>,
    /// IPv6 routes that must be back before the observer may exit.
    pub v6_routes: Vec<String>,
    pub min_bgp_gr_timeout: u32,
    /// Where the sampled timeline is dumped for troubleshooting.
    pub data_dir: PathBuf,
}

/// One CLI sampling turn.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub time: f64,
    pub lacp: bool,
    pub gr_active: Option<bool>,
    pub gr_timer: Option<String>,
    pub bgp_route_v4: bool,
    pub bgp_route_v6: bool,
}

#[derive(Debug, Clone, Serialize)]
struct PoSample {
    time: f64,
    changetime: Option<f64>,
}

/// Graceful-restart facts extracted from the first full sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GrInfo {
    pub v4_enabled: bool,
    pub v6_enabled: bool,
    pub restart_time: Option<u32>,
}

// ─── CLI output parsing ─────────────────────────────────────────────

/// At least one port is bundled into the LAG.
pub fn parse_lacp(output: &str) -> bool {
    output.contains("Bundled")
}

/// Graceful-restart configuration, from `show ip bgp neighbors`.
pub fn parse_bgp_neighbor_once(output: &str) -> GrInfo {
    let restart_re = Regex::new(r"Restart-time is (\d+)").expect("restart-time regex");
    let mut info = GrInfo::default();
    for line in output.lines() {
        if let Some(caps) = restart_re.captures(line) {
            info.restart_time = caps[1].parse().ok();
            continue;
        }
        if line.contains("is enabled, Forwarding State is") {
            if line.contains("IPv6") {
                info.v6_enabled = true;
            } else if line.contains("IPv4") {
                info.v4_enabled = true;
            }
        }
    }
    info
}

/// Restart-timer state: whether it is running and the `HH:MM:SS` left.
pub fn parse_bgp_neighbor(output: &str) -> (Option<bool>, Option<String>) {
    let timer_re = Regex::new(r"(\d{2}:\d{2}:\d{2})").expect("timer regex");
    let mut gr_active = None;
    let mut gr_timer = None;
    for line in output.lines() {
        if line.contains("Restart timer is") {
            gr_active = Some(line.contains("is active"));
            gr_timer = timer_re.captures(line).map(|c| c[1].to_string());
        }
    }
    (gr_active, gr_timer)
}

/// Drop the echoed command and the trailing prompt from CLI output.
pub fn strip_cli_lines(output: &str) -> Vec<String> {
    let lines: Vec<&str> = output.split("\r\n").collect();
    if lines.len() <= 2 {
        return Vec::new();
    }
    lines[1..lines.len() - 1]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn strip_cli_json(output: &str) -> String {
    strip_cli_lines(output).join("\n")
}

/// `true` iff the advertised route set equals `expects`, every route is
/// forwarding, and every next-hop leaves through a port-channel.
pub fn parse_bgp_route(output: &str, expects: &[String]) -> bool {
    let body = strip_cli_json(output);
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&body) else {
        return false;
    };
    if let Some(default_vrf) = value.get("vrfs").and_then(|v| v.get("default")) {
        value = default_vrf.clone();
    }
    let Some(routes) = value.get("routes").and_then(|r| r.as_object()) else {
        return false;
    };

    let mut prefixes: Vec<&String> = Vec::new();
    for (prefix, attrs) in routes {
        if attrs.get("routeAction").and_then(|a| a.as_str()) != Some("forward") {
            continue;
        }
        let all_po = attrs
            .get("vias")
            .and_then(|v| v.as_array())
            .is_some_and(|vias| {
                !vias.is_empty()
                    && vias.iter().all(|via| {
                        via.get("interface")
                            .and_then(|i| i.as_str())
                            .is_some_and(|i| i.contains("Port-Channel"))
                    })
            });
        if all_po {
            prefixes.push(prefix);
        }
    }

    let mut expected: Vec<&String> = expects.iter().collect();
    expected.sort();
    prefixes.sort();
    expected == prefixes
}

/// `lastStatusChangeTimestamp` of the port-channel.
pub fn parse_po_changetime(output: &str) -> Option<f64> {
    let body = strip_cli_json(output);
    let value: serde_json::Value = serde_json::from_str(&body).ok()?;
    value
        .get("interfaces")?
        .get("Port-Channel1")?
        .get("lastStatusChangeTimestamp")?
        .as_f64()
}

pub fn hhmmss_to_secs(timer: &str) -> Option<u32> {
    let mut parts = timer.split(':');
    let h: u32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let s: u32 = parts.next()?.parse().ok()?;
    Some(h * 3600 + m * 60 + s)
}

// ─── Log scraping ───────────────────────────────────────────────────

fn parse_syslog_time(stamp: &str) -> Option<NaiveDateTime> {
    let mut it = stamp.split_whitespace();
    let month = match it.next()? {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    let day: u32 = it.next()?.parse().ok()?;
    let mut time = it.next()?.split(':');
    let h: u32 = time.next()?.parse().ok()?;
    let m: u32 = time.next()?.parse().ok()?;
    let s: u32 = time.next()?.parse().ok()?;
    // Syslog carries no year; offsets are all that matter downstream.
    NaiveDate::from_ymd_opt(2000, month, day)?.and_hms_opt(h, m, s)
}

type EventSeries = BTreeMap<String, Vec<(i64, String)>>;

/// Pull `(timestamp, subject, status)` events out of log lines, with
/// timestamps converted to offsets from the first event seen.
pub fn extract_from_logs(pattern: &Regex, lines: &[String]) -> (EventSeries, Option<NaiveDateTime>) {
    let mut raw: Vec<(NaiveDateTime, String, String)> = Vec::new();
    for line in lines {
        let Some(caps) = pattern.captures(line) else {
            continue;
        };
        let Some(when) = parse_syslog_time(&caps[1]) else {
            continue;
        };
        raw.push((when, caps[2].to_string(), caps[3].to_string()));
    }

    let mut series: EventSeries = BTreeMap::new();
    let initial = raw.first().map(|(when, _, _)| *when);
    if let Some(initial) = initial {
        for (when, what, status) in raw {
            let offset = (when - initial).num_seconds().abs();
            series.entry(what).or_default().push((offset, status));
        }
    }
    (series, initial)
}

/// Everything scraped from the post-reboot log window.
#[derive(Debug, Default)]
pub struct LogScrape {
    pub metrics: LogMetrics,
    pub route_timeout: BTreeMap<String, Vec<RouteTimeoutEvent>>,
}

fn bgp_adjchange_re() -> Regex {
    Regex::new(r"^(\S+\s+\d+\s+\S+) \S+ Rib: %BGP-5-ADJCHANGE: peer (\S+) .+ (\S+)$")
        .expect("adjchange regex")
}

fn lineproto_re() -> Regex {
    Regex::new(
        r"^(\S+\s+\d+\s+\S+) \S+ Ebra: %LINEPROTO-5-UPDOWN: Line protocol on Interface (\S+), changed state to (\S+)$",
    )
    .expect("lineproto regex")
}

fn gr_timeout_re() -> Regex {
    Regex::new(
        r"^(\S+\s+\d+\s+\S+) \S+ Rib: %BGP-5-BGP_GRACEFUL_RESTART_TIMEOUT: Deleting stale routes from peer (\S+) .+ (\S+)$",
    )
    .expect("gr-timeout regex")
}

/// Parse the scraped log window into per-category timelines and derived
/// scalars.
///
/// The scalars are only produced when the window tells a complete story:
/// BGP events present and ending `Established`, interface events present,
/// starting `down` and ending `up`. An incomplete window keeps the raw
/// route-timeout events but records an error instead of metrics.
pub fn parse_logs(lines: &[String]) -> LogScrape {
    let (bgp, initial_bgp) = extract_from_logs(&bgp_adjchange_re(), lines);
    let (ifs, initial_if) = extract_from_logs(&lineproto_re(), lines);
    let (route, _) = extract_from_logs(&gr_timeout_re(), lines);

    let mut scrape = LogScrape::default();
    for (nei, events) in route {
        scrape.route_timeout.insert(
            nei,
            events
                .into_iter()
                .map(|(offset_secs, asn)| RouteTimeoutEvent { offset_secs, asn })
                .collect(),
        );
    }

    let (Some(initial_bgp), Some(initial_if)) = (initial_bgp, initial_if) else {
        scrape.metrics.error = Some("Incomplete output".into());
        return scrape;
    };

    for events in bgp.values() {
        let complete = events.last().is_some_and(|(_, s)| s == "Established")
            && (events.len() == 1 || events.first().is_some_and(|(_, s)| s != "Established"));
        if !complete {
            scrape.metrics.error = Some("BGP session did not settle in Established".into());
            return scrape;
        }
    }
    for events in ifs.values() {
        let complete = events.first().is_some_and(|(_, s)| s == "down")
            && events.last().is_some_and(|(_, s)| s == "up");
        if !complete {
            scrape.metrics.error = Some("interface did not settle in up".into());
            return scrape;
        }
    }

    let Some(po_name) = ifs.keys().find(|name| name.contains("Port-Channel")).cloned() else {
        scrape.metrics.error = Some("no Port-Channel interface events".into());
        return scrape;
    };
    let po_events = &ifs[&po_name];
    let po_first = po_events.first().map(|(o, _)| *o).unwrap_or(0);
    let po_last = po_events.last().map(|(o, _)| *o).unwrap_or(0);
    scrape.metrics.po_down_secs = Some(po_last - po_first);

    for (ifname, events) in &ifs {
        let downs = events.iter().filter(|(_, s)| s == "down").count() as u32;
        scrape.metrics.if_down_counts.insert(ifname.clone(), downs);
    }

    let bgp_po_offset = (initial_if - initial_bgp).num_seconds().abs();
    scrape.metrics.po_down_after_bgp_secs = Some(bgp_po_offset + po_first);

    for (nei, events) in &bgp {
        let first = events.first().map(|(o, _)| *o).unwrap_or(0);
        let last = events.last().map(|(o, _)| *o).unwrap_or(0);
        let downs = events.iter().filter(|(_, s)| s == "Idle").count() as u32;
        let up_after_po = last - bgp_po_offset - po_last;
        if nei.contains(':') {
            scrape.metrics.bgp_v6_down_secs = Some(last - first);
            scrape.metrics.bgp_v6_down_count = Some(downs);
            scrape.metrics.bgp_v6_up_after_po_secs = Some(up_after_po);
        } else {
            scrape.metrics.bgp_v4_down_secs = Some(last - first);
            scrape.metrics.bgp_v4_down_count = Some(downs);
            scrape.metrics.bgp_v4_up_after_po_secs = Some(up_after_po);
        }
    }

    scrape
}

// ─── Series checks ──────────────────────────────────────────────────

/// Downtime of a sampled boolean series.
///
/// The series must be up at both ends of the window; being down more than
/// once is worth a note but not a failure.
pub fn check_series_status(
    samples: &[(f64, bool)],
    what: &str,
    report: &mut NeighborReport,
) -> SeriesStatus {
    let Some(first) = samples.first() else {
        return SeriesStatus::default();
    };
    if !first.1 {
        report.fails.insert(format!("{what} must be up when the test starts"));
        return SeriesStatus::default();
    }
    if !samples.last().is_some_and(|(_, up)| *up) {
        report.fails.insert(format!("{what} must be up when the test stops"));
        return SeriesStatus::default();
    }

    let mut down_count = 0u32;
    let mut down_secs = 0.0f64;
    let mut segment_start = first.0;
    let mut current = first.1;
    for &(when, up) in &samples[1..] {
        if up != current {
            if !current {
                down_count += 1;
                down_secs += when - segment_start;
            }
            segment_start = when;
            current = up;
        }
    }

    if down_count > 1 {
        report
            .info
            .insert(format!("{what} must be down just for once"));
    }
    SeriesStatus {
        down_count,
        down_secs,
    }
}

/// Count value changes of a sampled timestamp series.
///
/// The first slot of the returned pair is a placeholder kept for shape
/// compatibility with the other series; only the change count is used.
pub fn check_change_time(
    samples: &[(f64, Option<f64>)],
    what: &str,
    report: &mut NeighborReport,
) -> (u32, u32) {
    let Some(first) = samples.first() else {
        report.fails.insert(format!("{what} cannot be empty"));
        return (0, 0);
    };
    let mut prev = first.1;
    let mut change_count = 0u32;
    for (_, value) in &samples[1..] {
        if *value != prev {
            prev = *value;
            change_count += 1;
        }
    }
    if change_count > 0 {
        report
            .info
            .insert(format!("{what} state changed {change_count} times"));
    }
    (0, change_count)
}

/// Graceful-restart verdicts over the sampled timer states.
pub fn check_gr_peer_status(
    samples: &[Sample],
    gr: GrInfo,
    min_bgp_gr_timeout: u32,
    report: &mut NeighborReport,
) {
    if !gr.v4_enabled {
        report
            .fails
            .insert("bgp ipv4 graceful restart is not enabled".into());
    }
    // IPv6 graceful restart being absent is tolerated.
    if !gr.restart_time.is_some_and(|t| t >= 120) {
        report
            .fails
            .insert("bgp graceful restart timeout is less than 120 seconds".into());
    }

    for sample in samples {
        if sample.gr_active != Some(true) {
            continue;
        }
        let remaining = sample.gr_timer.as_deref().and_then(hhmmss_to_secs);
        if remaining.is_some_and(|left| left < min_bgp_gr_timeout) {
            report.fails.insert(format!(
                "graceful restart timer is almost finished. Less than {min_bgp_gr_timeout} seconds left"
            ));
        }
    }
}

// ─── The observer task ──────────────────────────────────────────────

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Run one neighbor observer to completion.
pub async fn run_observer(
    cfg: ObserverConfig,
    mut commands: mpsc::Receiver<ObserverCommand>,
) -> NeighborReport {
    let mut report = NeighborReport::new(&cfg.ip);
    if let Err(e) = observe(&cfg, &mut commands, &mut report).await {
        warn!(ip = %cfg.ip, "neighbor observer failed: {e}");
        report.logs.error = Some(e.to_string());
    }
    report
}

async fn observe(
    cfg: &ObserverConfig,
    commands: &mut mpsc::Receiver<ObserverCommand>,
    report: &mut NeighborReport,
) -> anyhow::Result<()> {
    let mut shell = InteractiveShell::connect(&cfg.login, &cfg.ip).await?;

    let mut samples: Vec<Sample> = Vec::new();
    let mut po_samples: Vec<PoSample> = Vec::new();
    let mut gr = GrInfo::default();
    let mut sentinel: Option<String> = None;
    let mut quit_enabled = false;
    let mut v4_routing_ok = false;
    let mut v6_routing_ok = false;

    let po_output = shell.do_cmd("show interfaces po1 | json").await?;
    po_samples.push(PoSample {
        time: epoch_now(),
        changetime: parse_po_changetime(&po_output),
    });

    while !(quit_enabled && v4_routing_ok && v6_routing_ok) {
        match commands.recv().await {
            Some(ObserverCommand::Quit) => {
                quit_enabled = true;
                continue;
            }
            Some(ObserverCommand::Go) => {}
            // Orchestrator is gone; no more sampling turns will come.
            None => break,
        }

        let now = epoch_now();
        let lacp_output = shell.do_cmd("show lacp neighbor").await?;
        let bgp_neig_output = shell.do_cmd("show ip bgp neighbors").await?;
        let v4_output = shell.do_cmd("show ip route bgp | json").await?;
        v4_routing_ok = parse_bgp_route(&v4_output, &cfg.v4_routes);
        let v6_output = shell.do_cmd("show ipv6 route bgp | json").await?;
        v6_routing_ok = parse_bgp_route(&v6_output, &cfg.v6_routes);
        let po_output = shell.do_cmd("show interfaces po1 | json").await?;

        let (gr_active, gr_timer) = parse_bgp_neighbor(&bgp_neig_output);
        samples.push(Sample {
            time: now,
            lacp: parse_lacp(&lacp_output),
            gr_active,
            gr_timer,
            bgp_route_v4: v4_routing_ok,
            bgp_route_v6: v6_routing_ok,
        });
        po_samples.push(PoSample {
            time: now,
            changetime: parse_po_changetime(&po_output),
        });

        if sentinel.is_none() {
            gr = parse_bgp_neighbor_once(&bgp_neig_output);
            if gr.restart_time.is_some() {
                // Anchor for the post-reboot log scrape: everything before
                // this marker is an earlier run.
                let marker = format!("session_begins_{:.0}", now);
                shell.do_cmd(&format!("send log message {marker}")).await?;
                sentinel = Some(marker);
            }
        }
    }

    // The log takes a moment to flush after the reboot settles.
    let mut log_lines: Vec<String> = Vec::new();
    if let Some(marker) = &sentinel {
        for _ in 0..60 {
            let output = shell.do_cmd(&format!("show log | begin {marker}")).await?;
            log_lines = strip_cli_lines(&output);
            if !log_lines.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    drop(shell);

    let scrape = if log_lines.is_empty() {
        let mut scrape = LogScrape::default();
        scrape.metrics.error = Some("Incomplete output".into());
        scrape
    } else {
        parse_logs(&log_lines)
    };

    // Timeline side-output for troubleshooting.
    let timeline_path = cfg.data_dir.join(format!("{}.data.json", cfg.ip));
    let timeline = serde_json::json!({ "samples": samples, "po": po_samples });
    if let Err(e) = std::fs::write(&timeline_path, timeline.to_string()) {
        warn!(ip = %cfg.ip, "failed to save timeline: {e}");
    }

    check_gr_peer_status(&samples, gr, cfg.min_bgp_gr_timeout, report);

    let lacp_series: Vec<(f64, bool)> = samples.iter().map(|s| (s.time, s.lacp)).collect();
    let v4_series: Vec<(f64, bool)> = samples.iter().map(|s| (s.time, s.bgp_route_v4)).collect();
    let v6_series: Vec<(f64, bool)> = samples.iter().map(|s| (s.time, s.bgp_route_v6)).collect();
    let po_series: Vec<(f64, Option<f64>)> =
        po_samples.iter().map(|s| (s.time, s.changetime)).collect();

    let mut cli = CliSeries {
        lacp: check_series_status(&lacp_series, "LACP session", report),
        bgp_v4: check_series_status(&v4_series, "BGP v4 routes", report),
        bgp_v6: check_series_status(&v6_series, "BGP v6 routes", report),
        po_changes: check_change_time(&po_series, "PortChannel interface", report).1,
        route_timeout: BTreeMap::new(),
    };
    cli.route_timeout = scrape.route_timeout.clone();

    for (nei, events) in &scrape.route_timeout {
        if let Some(event) = events.first() {
            report.fails.insert(format!(
                "BGP route GR timeout: neighbor {nei} (ASN {}",
                event.asn
            ));
        }
    }

    report.cli = Some(cli);
    report.logs = scrape.metrics;
    info!(ip = %cfg.ip, samples = samples.len(), "neighbor observer finished");
    Ok(())
}
