//! WireGuard subnet addressing.
//!
//! Peers receive addresses `<subnet>.<octet>` with the final octet in
//! `2..=254`; `.0`, `.1` (the server) and `.255` are reserved.

use std::fmt;
use std::net::Ipv4Addr;

/// Lowest assignable host octet.
pub const FIRST_HOST_OCTET: u8 = 2;
/// Highest assignable host octet.
pub const LAST_HOST_OCTET: u8 = 254;

/// A /24 subnet given by its first three octets, e.g. `10.8.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgSubnet([u8; 3]);

impl WgSubnet {
    pub fn parse(prefix: &str) -> Result<Self, String> {
        let parts: Vec<&str> = prefix.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected three octets, got '{prefix}'"));
        }
        let mut octets = [0u8; 3];
        for (slot, part) in octets.iter_mut().zip(parts) {
            *slot = part
                .parse()
                .map_err(|_| format!("invalid octet '{part}' in '{prefix}'"))?;
        }
        Ok(Self(octets))
    }

    /// The address for a host octet.
    pub fn address(&self, octet: u8) -> Ipv4Addr {
        Ipv4Addr::new(self.0[0], self.0[1], self.0[2], octet)
    }

    /// Whether `ip` lies inside this subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip.octets()[..3] == self.0
    }
}

impl fmt::Display for WgSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Whether an octet may be handed to a peer.
pub fn is_host_octet(octet: u8) -> bool {
    (FIRST_HOST_OCTET..=LAST_HOST_OCTET).contains(&octet)
}

/// Final octet of a dotted IPv4 string, if it parses.
pub fn last_octet(ip: &str) -> Option<u8> {
    ip.parse::<Ipv4Addr>().ok().map(|addr| addr.octets()[3])
}

/// The octet after `octet`, wrapping from 254 back to 2.
pub fn next_host_octet(octet: u8) -> u8 {
    if octet >= LAST_HOST_OCTET || octet < FIRST_HOST_OCTET {
        FIRST_HOST_OCTET
    } else {
        octet + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format() {
        let subnet = WgSubnet::parse("10.8.0").unwrap();
        assert_eq!(subnet.to_string(), "10.8.0");
        assert_eq!(subnet.address(7).to_string(), "10.8.0.7");
        assert!(subnet.contains("10.8.0.200".parse().unwrap()));
        assert!(!subnet.contains("10.8.1.200".parse().unwrap()));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(WgSubnet::parse("10.8").is_err());
        assert!(WgSubnet::parse("10.8.0.1").is_err());
        assert!(WgSubnet::parse("10.256.0").is_err());
        assert!(WgSubnet::parse("a.b.c").is_err());
    }

    #[test]
    fn octet_helpers() {
        assert_eq!(last_octet("10.8.0.5"), Some(5));
        assert_eq!(last_octet("garbage"), None);
        assert!(!is_host_octet(0));
        assert!(!is_host_octet(1));
        assert!(!is_host_octet(255));
        assert!(is_host_octet(2) && is_host_octet(254));
        assert_eq!(next_host_octet(2), 3);
        assert_eq!(next_host_octet(254), 2);
        assert_eq!(next_host_octet(255), 2);
    }
}
