//! gapwatch — reboot-disruption test harness.
//!
//! Probes a switch under test from both sides of its forwarding plane,
//! restarts it remotely, measures the dataplane outage, and verifies that
//! BGP/LACP on the neighbor routers recover gracefully.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use gapwatch_common::config::{PortMaps, RebootKind, TestConfig};
use gapwatch_harness::orchestrator::Orchestrator;
use gapwatch_probes::dataplane::{Dataplane, NetdevDataplane};
use gapwatch_probes::probes::ProbeSet;
use gapwatch_probes::stream::StreamPlan;
use ipnet::{Ipv4Net, Ipv6Net};
use pnet::util::MacAddr;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Reboot-disruption test harness.
#[derive(Parser, Debug)]
#[command(name = "gapwatch", about = "Verify bounded dataplane outage across a switch reboot")]
struct Cli {
    /// SSH user on the switch under test.
    #[arg(long, default_value = "admin")]
    dut_username: String,

    /// Hostname or IP of the switch under test.
    #[arg(long)]
    dut_hostname: String,

    /// Router MAC of the switch.
    #[arg(long)]
    dut_mac: MacAddr,

    /// Reboot kind: fast-reboot or warm-reboot.
    #[arg(long, default_value = "fast-reboot")]
    reboot_type: RebootKind,

    /// Restart only this service instead of the whole switch.
    #[arg(long)]
    service: Option<String>,

    /// Maximum tolerated forwarding outage, seconds.
    #[arg(long, default_value_t = 30)]
    reboot_limit: u64,

    /// Maximum time from reboot to forwarding recovery, seconds.
    #[arg(long, default_value_t = 180)]
    graceful_limit: u64,

    /// Fail a neighbor whose GR restart timer has less than this left,
    /// seconds.
    #[arg(long, default_value_t = 15)]
    min_bgp_gr_timeout: u32,

    /// Give up on warm-up after this long, seconds.
    #[arg(long, default_value_t = 180)]
    warm_up_timeout: u64,

    /// Both planes must hold steady at least this long before the reboot,
    /// seconds.
    #[arg(long, default_value_t = 20)]
    stabilize: u64,

    /// Source range for synthesized uplink traffic.
    #[arg(long, default_value = "192.168.0.0/16")]
    default_ip_range: Ipv4Net,

    /// The VLAN subnet of the server side.
    #[arg(long)]
    vlan_ip_range: Ipv4Net,

    /// Switch loopback prefix.
    #[arg(long, default_value = "10.1.0.32/32")]
    lo_prefix: Ipv4Net,

    /// Switch IPv6 loopback prefix.
    #[arg(long, default_value = "fc00:1::/64")]
    lo_v6_prefix: Ipv6Net,

    /// Neighbor router IPs to observe; repeat per neighbor.
    #[arg(long = "neighbor")]
    neighbors: Vec<String>,

    /// Login for the neighbor shells.
    #[arg(long, default_value = "admin")]
    neighbor_login: String,

    /// JSON map of logical port name to port index.
    #[arg(long)]
    ports_file: PathBuf,

    /// JSON map of port-channels to member ports.
    #[arg(long)]
    portchannel_ports_file: PathBuf,

    /// JSON map with the single VLAN and its member ports.
    #[arg(long)]
    vlan_ports_file: PathBuf,

    /// Command that (re)starts the external ARP responder.
    #[arg(long, default_value = "supervisorctl restart arp_responder")]
    arp_responder_cmd: String,

    /// Where logs, captures, and timelines are written.
    #[arg(long, default_value = "/tmp")]
    output_dir: PathBuf,

    /// Listen window of the warm-reboot stream, seconds.
    #[arg(long, default_value_t = 180)]
    time_to_listen: u64,

    /// Inter-packet interval of the warm-reboot stream, microseconds.
    #[arg(long, default_value_t = 3500)]
    send_interval_us: u64,
}

impl Cli {
    fn into_config(self, maps: PortMaps) -> TestConfig {
        TestConfig {
            dut_ssh: format!("{}@{}", self.dut_username, self.dut_hostname),
            dut_mac: self.dut_mac,
            reboot: self.reboot_type,
            service: self.service,
            reboot_limit: Duration::from_secs(self.reboot_limit),
            graceful_limit: Duration::from_secs(self.graceful_limit),
            min_bgp_gr_timeout: self.min_bgp_gr_timeout,
            warm_up_timeout: Duration::from_secs(self.warm_up_timeout),
            stabilize: Duration::from_secs(self.stabilize),
            default_ip_range: self.default_ip_range,
            vlan_ip_range: self.vlan_ip_range,
            lo_prefix: self.lo_prefix,
            lo_v6_prefix: self.lo_v6_prefix,
            neighbors: self.neighbors,
            neighbor_login: self.neighbor_login,
            port_indices: maps.port_indices,
            portchannel_ports: maps.portchannel_ports,
            vlan_ports: maps.vlan_ports,
            nr_pc_pkts: 100,
            ping_dut_pkts: 10,
            arp_ping_pkts: 1,
            // Capped because FDB and ARP insertion on the switch cannot
            // keep up with a larger fan-out.
            max_nr_vl_pkts: 500,
            nr_tests: 3,
            probe_timeout: Duration::from_millis(500),
            reboot_delay: Duration::from_secs(10),
            task_timeout: Duration::from_secs(300),
            time_to_listen: Duration::from_secs(self.time_to_listen),
            send_interval: Duration::from_micros(self.send_interval_us),
            arp_responder_cmd: Some(self.arp_responder_cmd),
        }
    }
}

fn lookup_iface_mac(name: &str) -> Option<MacAddr> {
    pnet::datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .and_then(|iface| iface.mac)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_path = cli.output_dir.join(format!("{}.log", cli.reboot_type));
    let log_file = File::create(&log_path)
        .with_context(|| format!("cannot create log file {}", log_path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout.and(Mutex::new(log_file)))
        .with_ansi(false)
        .init();

    let maps = PortMaps::load(
        &cli.ports_file,
        &cli.portchannel_ports_file,
        &cli.vlan_ports_file,
    )?;
    let output_dir = cli.output_dir.clone();
    let cfg = Arc::new(cli.into_config(maps));

    tracing::info!(
        dut = %cfg.dut_ssh,
        dut_mac = %cfg.dut_mac,
        reboot = %cfg.reboot,
        reboot_limit = ?cfg.reboot_limit,
        neighbors = ?cfg.neighbors,
        "gapwatch starting"
    );

    let mut all_ports: Vec<u32> = cfg
        .portchannel_ports
        .iter()
        .chain(cfg.vlan_ports.iter())
        .copied()
        .collect();
    all_ports.sort_unstable();
    all_ports.dedup();
    let dp: Arc<dyn Dataplane> =
        Arc::new(NetdevDataplane::open(&all_ports).context("attaching to test ports")?);

    let mut rng = rand::rng();
    let probes = Arc::new(
        ProbeSet::build(&cfg, &mut rng, lookup_iface_mac).context("building probe families")?,
    );
    probes.write_arp_seed(&output_dir.join("from_t1.json"))?;
    tracing::info!(
        sweep = probes.nr_vl_pkts,
        vlan_src = %probes.vlan_src_addr,
        "probe families ready"
    );

    let stream_plan = match cfg.reboot {
        RebootKind::Warm => {
            let plan = StreamPlan::build(&cfg, &probes, &mut rng)?;
            tracing::info!(packets = plan.len(), "bidirectional stream ready");
            Some(Arc::new(plan))
        }
        RebootKind::Fast => None,
    };

    let outcome = Orchestrator::new(cfg, dp, probes, stream_plan, output_dir)
        .run()
        .await;

    if outcome.is_pass() {
        tracing::info!("PASS");
        Ok(())
    } else {
        anyhow::bail!("run failed; see the report above");
    }
}
