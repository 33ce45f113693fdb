//! IPv4 host arithmetic for probe address synthesis.
//!
//! Probe generators need "the n-th host of this range" and "a random host
//! of this range" without ever landing on the network address or the
//! address the switch itself owns.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetMathError {
    #[error("host number {host} is greater than number of hosts {capacity} in {net}")]
    HostOutOfRange {
        host: u32,
        capacity: u32,
        net: Ipv4Net,
    },
}

/// Number of addresses covered by the prefix (including network/broadcast).
pub fn address_count(net: Ipv4Net) -> u32 {
    // /0 would overflow a u32; no deployment probes the whole v4 space.
    1u32 << (32 - net.prefix_len())
}

/// The `host`-th address of `net`, counted from the network address.
///
/// `host` must be at most `address_count - 2` so the broadcast address is
/// never produced.
pub fn host_ip(net: Ipv4Net, host: u32) -> Result<Ipv4Addr, NetMathError> {
    let capacity = address_count(net) - 2;
    if host > capacity {
        return Err(NetMathError::HostOutOfRange {
            host,
            capacity,
            net,
        });
    }
    let base = u32::from(net.network());
    Ok(Ipv4Addr::from(base + host))
}

/// A uniformly random host of `net`, excluding the network address, the
/// first host (owned by the switch on VLAN ranges) and the broadcast.
pub fn random_ip<R: Rng>(rng: &mut R, net: Ipv4Net) -> Ipv4Addr {
    let n_hosts = address_count(net);
    let host = rng.random_range(2..=n_hosts - 2);
    let base = u32::from(net.network());
    Ipv4Addr::from(base + host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn host_ip_counts_from_network_address() {
        let n = net("172.0.0.0/22");
        assert_eq!(host_ip(n, 2).unwrap(), Ipv4Addr::new(172, 0, 0, 2));
        assert_eq!(host_ip(n, 300).unwrap(), Ipv4Addr::new(172, 0, 1, 44));
    }

    #[test]
    fn host_ip_rejects_broadcast_and_beyond() {
        let n = net("192.168.0.0/30");
        // capacity is 2: hosts .1 and .2
        assert!(host_ip(n, 2).is_ok());
        assert!(host_ip(n, 3).is_err());
    }

    #[test]
    fn random_ip_stays_inside_the_range() {
        let n = net("192.168.0.0/16");
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let ip = random_ip(&mut rng, n);
            assert!(n.contains(&ip));
            assert_ne!(ip, n.network());
            assert_ne!(ip, n.broadcast());
            assert_ne!(u32::from(ip), u32::from(n.network()) + 1);
        }
    }
}
