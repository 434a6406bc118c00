// Target IP admission policies
// Decide which resolved addresses a dialer may connect to

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;

/// Reason a target address was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpRejection {
    #[error("{0} is not a publicly routable address")]
    NotPublic(IpAddr),

    #[error("{0}")]
    Policy(String),
}

/// Callback run against every resolved target IP before connecting
pub type TargetIpValidator = Arc<dyn Fn(IpAddr) -> Result<(), IpRejection> + Send + Sync>;

/// Accept every address
pub fn allow_all() -> TargetIpValidator {
    Arc::new(|_| Ok(()))
}

/// Only accept globally routable addresses.
///
/// Keeps clients from reaching loopback, LAN and other internal services
/// through the proxy.
pub fn require_public_ip() -> TargetIpValidator {
    Arc::new(|ip| {
        if is_public(&ip) {
            Ok(())
        } else {
            Err(IpRejection::NotPublic(ip))
        }
    })
}

pub fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(&v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    // 0.0.0.0/8, 100.64.0.0/10 (carrier-grade NAT), 240.0.0.0/4
    let this_network = octets[0] == 0;
    let shared = octets[0] == 100 && (octets[1] & 0xC0) == 64;
    let reserved = octets[0] >= 240;

    !(this_network
        || shared
        || reserved
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation())
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];

    let unique_local = (first & 0xFE00) == 0xFC00;
    let link_local = (first & 0xFFC0) == 0xFE80;
    let documentation = first == 0x2001 && ip.segments()[1] == 0x0DB8;

    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        || unique_local
        || link_local
        || documentation)
}
