//! Advertised-hostname resolution policy.
//!
//! The platform facts (environment variables, OS hostname, interface
//! addresses) are gathered by thin adapters outside this crate's
//! concern; the policy that ranks them lives here so it can be tested
//! without touching the machine.

use std::net::IpAddr;

/// Platform facts the resolution policy consumes.
#[derive(Debug, Clone, Default)]
pub struct HostDiscovery {
    /// `ROS_HOSTNAME`, if set.
    pub env_hostname: Option<String>,
    /// `ROS_IP`, if set.
    pub env_ip: Option<String>,
    /// The operating system's hostname, if known.
    pub os_hostname: Option<String>,
    /// Addresses of the machine's network interfaces.
    pub interfaces: Vec<IpAddr>,
}

impl HostDiscovery {
    /// Reads the environment variables; OS hostname and interfaces are
    /// left to the embedding adapter.
    pub fn from_env() -> Self {
        Self {
            env_hostname: std::env::var("ROS_HOSTNAME").ok().filter(|s| !s.is_empty()),
            env_ip: std::env::var("ROS_IP").ok().filter(|s| !s.is_empty()),
            os_hostname: None,
            interfaces: Vec::new(),
        }
    }
}

/// Resolves the hostname this node advertises to peers.
///
/// Preference order: `ROS_HOSTNAME`, `ROS_IP`, the OS hostname, then the
/// best interface address (public over private, IPv6 over IPv4, loopback
/// skipped), and finally `127.0.0.1`.
pub fn resolve_advertise_host(discovery: &HostDiscovery) -> String {
    if let Some(host) = &discovery.env_hostname {
        return host.clone();
    }
    if let Some(ip) = &discovery.env_ip {
        return ip.clone();
    }
    if let Some(host) = &discovery.os_hostname {
        if !host.is_empty() {
            return host.clone();
        }
    }

    let best = discovery
        .interfaces
        .iter()
        .filter(|ip| !ip.is_loopback())
        .max_by_key(|ip| (!is_private_ip(ip), ip.is_ipv6()));

    match best {
        Some(ip) => ip.to_string(),
        None => "127.0.0.1".to_string(),
    }
}

/// Returns whether `ip` is in one of the private ranges the advertise
/// policy deprioritizes: `192.168.*`, `10.*`, `169.254.*`.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            (octets[0] == 192 && octets[1] == 168)
                || octets[0] == 10
                || (octets[0] == 169 && octets[1] == 254)
        }
        IpAddr::V6(_) => false,
    }
}
