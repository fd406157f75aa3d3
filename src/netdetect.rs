use anyhow::Result;
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Host-side network facts consumed by discovery and polling.
pub trait LocalNetwork: Send + Sync {
    /// Neither scanning nor polling touch the network while this is `false`.
    fn is_up(&self) -> bool;

    /// The device's own IPv4 address, used to derive the scan prefix.
    fn local_ipv4(&self) -> Option<Ipv4Addr>;
}

/// Reads interface addresses from the OS on every call.
///
/// The network counts as up while some non-loopback IPv4 address is assigned.
#[derive(Debug, Clone, Default)]
pub struct InterfaceNetwork;

impl LocalNetwork for InterfaceNetwork {
    fn is_up(&self) -> bool {
        self.local_ipv4().is_some()
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        detect_local_ipv4().ok().and_then(|ips| ips.into_iter().next())
    }
}

/// Fixed answer, for hosts that manage connectivity themselves and for tests.
#[derive(Debug, Clone)]
pub struct StaticNetwork {
    pub up: bool,
    pub ip: Option<Ipv4Addr>,
}

impl StaticNetwork {
    pub fn up(ip: Ipv4Addr) -> Self {
        Self { up: true, ip: Some(ip) }
    }

    pub fn down() -> Self {
        Self { up: false, ip: None }
    }
}

impl LocalNetwork for StaticNetwork {
    fn is_up(&self) -> bool {
        self.up
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        self.ip
    }
}

/// Local non-loopback IPv4 addresses, sorted for stable output.
pub fn detect_local_ipv4() -> Result<Vec<Ipv4Addr>> {
    let mut ips: Vec<Ipv4Addr> = get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) if !v4.ip.is_loopback() && !v4.ip.is_link_local() => Some(v4.ip),
            _ => None,
        })
        .collect();
    ips.sort();
    ips.dedup();
    Ok(ips)
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).expect("/24 is always valid")
}

/// Scan prefix for the /24 an address lives in, e.g. `192.168.1.100` -> `"192.168.1."`.
pub fn subnet_prefix(ip: Ipv4Addr) -> String {
    let o = ipv4_to_default_cidr(ip).network().octets();
    format!("{}.{}.{}.", o[0], o[1], o[2])
}

/// Validate a prefix of the form `"a.b.c."` and return the /24 it names.
pub fn parse_prefix(prefix: &str) -> Option<Ipv4Net> {
    let head = prefix.strip_suffix('.')?;
    if head.split('.').count() != 3 {
        return None;
    }
    let base: Ipv4Addr = format!("{head}.0").parse().ok()?;
    Some(ipv4_to_default_cidr(base))
}

/// Address of host `host` inside `prefix`.
pub fn host_address(prefix: &str, host: u8) -> String {
    format!("{prefix}{host}")
}
