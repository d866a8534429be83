//! `network`/`addr` string parsing shared by the TCP and UDP constructors.
//!
//! `network` selects the address family (`tcp`/`tcp4`/`tcp6`/`udp`/`udp4`/
//! `udp6`); `addr` is resolved via the OS resolver through
//! `ToSocketAddrs`, picking the first entry that matches the family.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    Unspecified,
    V4,
    V6,
}

pub fn parse_network(network: &str) -> Result<(bool, Family), Error> {
    match network {
        "tcp" => Ok((true, Family::Unspecified)),
        "tcp4" => Ok((true, Family::V4)),
        "tcp6" => Ok((true, Family::V6)),
        "udp" => Ok((false, Family::Unspecified)),
        "udp4" => Ok((false, Family::V4)),
        "udp6" => Ok((false, Family::V6)),
        other => Err(Error::InvalidArgument(format!("unknown network {other:?}"))),
    }
}

/// Resolves `addr` (possibly empty) to a concrete `SocketAddr`, honoring
/// `family` when given. An empty string is `:0`; a missing port is always
/// rejected, matching the external-interface contract.
pub fn resolve(addr: &str, family: Family) -> Result<SocketAddr, Error> {
    let addr = if addr.is_empty() { ":0" } else { addr };

    let normalized = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };

    let candidates: Vec<SocketAddr> = normalized
        .to_socket_addrs()
        .map_err(|_| Error::InvalidArgument(format!("invalid address {addr:?}")))?
        .collect();

    if candidates.is_empty() {
        return Err(Error::InvalidArgument(format!("address {addr:?} resolved to nothing")));
    }

    let chosen = match family {
        Family::Unspecified => candidates.into_iter().next(),
        Family::V4 => candidates.into_iter().find(|a| matches!(a.ip(), IpAddr::V4(_))),
        Family::V6 => candidates.into_iter().find(|a| matches!(a.ip(), IpAddr::V6(_))),
    };

    chosen.ok_or_else(|| Error::InvalidArgument(format!("no {family:?} address for {addr:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_defaults_to_any_port_zero() {
        let addr = resolve("", Family::V4).unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        assert_eq!(addr.port(), 0);
    }

    #[test]
    fn port_only_binds_any_interface() {
        let addr = resolve(":4242", Family::V4).unwrap();
        assert_eq!(addr.port(), 4242);
    }

    #[test]
    fn ip_and_port() {
        let addr = resolve("127.0.0.1:9000", Family::V4).unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn bracketed_ipv6() {
        let addr = resolve("[::1]:9000", Family::V6).unwrap();
        assert_eq!(addr, "[::1]:9000".parse().unwrap());
    }

    #[test]
    fn missing_port_is_invalid() {
        assert!(resolve("127.0.0.1", Family::V4).is_err());
        assert!(resolve("localhost", Family::V4).is_err());
    }

    #[test]
    fn unknown_network_is_invalid() {
        assert!(parse_network("sctp").is_err());
    }
}
