//! Address parsing and formatting shared by the codec, rooms and config files.

use crate::error::{NetError, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, SocketAddr};

/// Parse an allowed address in `addr[/prefix]` form.
///
/// The host bits are kept as given. A missing prefix defaults to /32 for
/// IPv4 and /128 for IPv6.
pub fn parse_allowed_address(input: &str) -> Result<IpNet> {
    let input = input.trim();
    let (addr_part, prefix_part) = match input.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (input, None),
    };

    let addr: IpAddr = addr_part
        .parse()
        .map_err(|_| NetError::AddressFormat(input.to_string()))?;

    let prefix_len = match prefix_part {
        Some(p) => p
            .parse::<u8>()
            .map_err(|_| NetError::AddressFormat(input.to_string()))?,
        None => max_prefix_len(&addr),
    };

    let net = match addr {
        IpAddr::V4(v4) => Ipv4Net::new(v4, prefix_len).map(IpNet::V4),
        IpAddr::V6(v6) => Ipv6Net::new(v6, prefix_len).map(IpNet::V6),
    };
    net.map_err(|_| NetError::AddressFormat(input.to_string()))
}

/// Parse a list of allowed addresses, failing on the first bad entry.
pub fn parse_allowed_addresses<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<IpNet>> {
    inputs
        .iter()
        .map(|s| parse_allowed_address(s.as_ref()))
        .collect()
}

/// Parse a peer endpoint from a host string and port. IPv4 is tried first.
pub fn parse_endpoint(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let ip: IpAddr = host
        .parse()
        .map_err(|_| NetError::AddressFormat(host.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// Render an endpoint as `a.b.c.d:port` or `[v6]:port`.
pub fn format_endpoint(endpoint: &SocketAddr) -> String {
    endpoint.to_string()
}

/// Render an allowed address list as `a/n, b/m`, or `(none)` when empty.
pub fn format_allowed_addresses(addrs: &[IpNet]) -> String {
    if addrs.is_empty() {
        return "(none)".to_string();
    }
    addrs
        .iter()
        .map(|a| format!("{}/{}", a.addr(), a.prefix_len()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}
