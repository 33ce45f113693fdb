//! Test configuration: the immutable parameter bag plus the three port-map
//! files that describe the switch under test.
//!
//! Everything here is resolved once at setup. The rest of the harness only
//! ever reads a shared [`TestConfig`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use pnet::util::MacAddr;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("unsupported reboot kind {0:?}, expected fast-reboot or warm-reboot")]
    UnsupportedRebootKind(String),
    #[error("too many VLANs in the VLAN ports file, expected exactly one")]
    TooManyVlans,
    #[error("no VLAN entry in the VLAN ports file")]
    NoVlan,
    #[error("port {0:?} is not present in the ports file")]
    UnknownPort(String),
}

/// How the switch is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootKind {
    Fast,
    Warm,
}

impl RebootKind {
    /// The remote command name, also used to label the run.
    pub fn command(self) -> &'static str {
        match self {
            RebootKind::Fast => "fast-reboot",
            RebootKind::Warm => "warm-reboot",
        }
    }
}

impl fmt::Display for RebootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

impl FromStr for RebootKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast-reboot" => Ok(RebootKind::Fast),
            "warm-reboot" => Ok(RebootKind::Warm),
            other => Err(ConfigError::UnsupportedRebootKind(other.to_string())),
        }
    }
}

/// The immutable configuration of a single run.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// `user@host` for the one-shot reboot command.
    pub dut_ssh: String,
    /// Router MAC of the switch; every probe is addressed to it.
    pub dut_mac: MacAddr,
    pub reboot: RebootKind,
    /// When set, restart only this service instead of the whole switch.
    pub service: Option<String>,

    /// Maximum tolerated forwarding outage.
    pub reboot_limit: Duration,
    /// Maximum tolerated time from reboot to forwarding recovery.
    pub graceful_limit: Duration,
    /// Fail a neighbor if its GR restart timer ever has less than this left.
    pub min_bgp_gr_timeout: u32,
    pub warm_up_timeout: Duration,
    /// Both planes must be up at least this long before the reboot.
    pub stabilize: Duration,

    pub default_ip_range: Ipv4Net,
    pub vlan_ip_range: Ipv4Net,
    pub lo_prefix: Ipv4Net,
    pub lo_v6_prefix: Ipv6Net,

    /// Neighbor IPs to observe over SSH.
    pub neighbors: Vec<String>,
    /// Login for the neighbor shells.
    pub neighbor_login: String,

    pub port_indices: BTreeMap<String, u32>,
    /// Flattened port-channel member indices.
    pub portchannel_ports: Vec<u32>,
    /// Member indices of the single VLAN.
    pub vlan_ports: Vec<u32>,

    // Probe volumes and pacing. The VLAN fan-out is capped because FDB and
    // ARP insertion on the switch cannot keep up with more.
    pub nr_pc_pkts: usize,
    pub ping_dut_pkts: usize,
    pub arp_ping_pkts: usize,
    pub max_nr_vl_pkts: usize,
    pub nr_tests: usize,
    pub probe_timeout: Duration,

    pub reboot_delay: Duration,
    pub task_timeout: Duration,

    pub time_to_listen: Duration,
    pub send_interval: Duration,

    /// Command that (re)starts the external ARP responder, if any.
    pub arp_responder_cmd: Option<String>,
}

impl TestConfig {
    /// The IPv4 routes every neighbor must advertise back after recovery.
    pub fn expected_v4_routes(&self) -> Vec<String> {
        vec![self.vlan_ip_range.to_string(), self.lo_prefix.to_string()]
    }

    /// The IPv6 routes every neighbor must advertise back after recovery.
    pub fn expected_v6_routes(&self) -> Vec<String> {
        vec![self.lo_v6_prefix.to_string()]
    }
}

#[derive(Debug, Deserialize)]
struct MemberList {
    members: Vec<String>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// The three port-map files, resolved to integer port indices.
#[derive(Debug, Clone)]
pub struct PortMaps {
    pub port_indices: BTreeMap<String, u32>,
    pub portchannel_ports: Vec<u32>,
    pub vlan_ports: Vec<u32>,
}

impl PortMaps {
    pub fn load(
        ports_file: &Path,
        portchannel_ports_file: &Path,
        vlan_ports_file: &Path,
    ) -> Result<Self, ConfigError> {
        let port_indices: BTreeMap<String, u32> = read_json(ports_file)?;

        let resolve = |name: &str| -> Result<u32, ConfigError> {
            port_indices
                .get(name)
                .copied()
                .ok_or_else(|| ConfigError::UnknownPort(name.to_string()))
        };

        let pcs: BTreeMap<String, MemberList> = read_json(portchannel_ports_file)?;
        let mut portchannel_ports = Vec::new();
        for pc in pcs.values() {
            for member in &pc.members {
                portchannel_ports.push(resolve(member)?);
            }
        }

        let vlans: BTreeMap<String, MemberList> = read_json(vlan_ports_file)?;
        if vlans.len() > 1 {
            return Err(ConfigError::TooManyVlans);
        }
        let vlan = vlans.values().next().ok_or(ConfigError::NoVlan)?;
        let vlan_ports = vlan
            .members
            .iter()
            .map(|m| resolve(m))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PortMaps {
            port_indices,
            portchannel_ports,
            vlan_ports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(name: &str, content: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("gapwatch-config-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn reboot_kind_parses_both_commands() {
        assert_eq!("fast-reboot".parse::<RebootKind>().unwrap(), RebootKind::Fast);
        assert_eq!("warm-reboot".parse::<RebootKind>().unwrap(), RebootKind::Warm);
        assert!("cold-reboot".parse::<RebootKind>().is_err());
    }

    #[test]
    fn port_maps_resolve_members_to_indices() {
        let ports = write_tmp(
            "ports.json",
            r#"{"Ethernet0": 0, "Ethernet4": 1, "Ethernet8": 2, "Ethernet12": 3}"#,
        );
        let pcs = write_tmp(
            "pc.json",
            r#"{"PortChannel01": {"members": ["Ethernet0", "Ethernet4"]}}"#,
        );
        let vlan = write_tmp(
            "vlan.json",
            r#"{"Vlan1000": {"members": ["Ethernet8", "Ethernet12"]}}"#,
        );

        let maps = PortMaps::load(&ports, &pcs, &vlan).unwrap();
        assert_eq!(maps.portchannel_ports, vec![0, 1]);
        assert_eq!(maps.vlan_ports, vec![2, 3]);
    }

    #[test]
    fn two_vlans_are_rejected() {
        let ports = write_tmp("ports2.json", r#"{"Ethernet0": 0}"#);
        let pcs = write_tmp("pc2.json", r#"{}"#);
        let vlan = write_tmp(
            "vlan2.json",
            r#"{"Vlan1000": {"members": []}, "Vlan2000": {"members": []}}"#,
        );

        match PortMaps::load(&ports, &pcs, &vlan) {
            Err(ConfigError::TooManyVlans) => {}
            other => panic!("expected TooManyVlans, got {other:?}"),
        }
    }

    #[test]
    fn unknown_member_is_an_error() {
        let ports = write_tmp("ports3.json", r#"{"Ethernet0": 0}"#);
        let pcs = write_tmp(
            "pc3.json",
            r#"{"PortChannel01": {"members": ["Ethernet99"]}}"#,
        );
        let vlan = write_tmp("vlan3.json", r#"{"Vlan1000": {"members": []}}"#);

        assert!(matches!(
            PortMaps::load(&ports, &pcs, &vlan),
            Err(ConfigError::UnknownPort(_))
        ));
    }
}
