//! Network values returned from lookups and enumeration.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use bitflags::bitflags;

use crate::address::{self, Family};
use crate::country;
use crate::error::Result;

bitflags! {
    /// Operator-assigned flags attached to a network.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NetworkFlags: u16 {
        /// The network is used by an anonymizing service.
        const ANONYMOUS_PROXY = 0x1;
        /// The network belongs to a satellite internet provider.
        const SATELLITE_PROVIDER = 0x2;
        /// The network is announced from multiple locations.
        const ANYCAST = 0x4;
        /// The network is on a drop list.
        const DROP = 0x8;
    }
}

impl NetworkFlags {
    /// Parse a single flag from its command-line name.
    pub fn from_flag_name(name: &str) -> Option<Self> {
        match name {
            "anonymous-proxy" => Some(Self::ANONYMOUS_PROXY),
            "satellite-provider" => Some(Self::SATELLITE_PROVIDER),
            "anycast" => Some(Self::ANYCAST),
            "drop" => Some(Self::DROP),
            _ => None,
        }
    }
}

/// A network allocation together with its leaf payload.
///
/// Values are owned copies of the on-disk record; they remain valid after
/// the database that produced them is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    address: Ipv6Addr,
    prefix: u8,
    country: [u8; 2],
    asn: u32,
    flags: NetworkFlags,
}

impl Network {
    pub(crate) fn from_parts(
        address: Ipv6Addr,
        prefix: u8,
        country: [u8; 2],
        asn: u32,
        flags: NetworkFlags,
    ) -> Self {
        Self {
            address,
            prefix,
            country,
            asn,
            flags,
        }
    }

    /// First address of the network, in its native family.
    pub fn address(&self) -> IpAddr {
        match self.address.to_ipv4_mapped() {
            Some(v4) if self.prefix >= address::V4_MAPPED_PREFIX => IpAddr::V4(v4),
            _ => IpAddr::V6(self.address),
        }
    }

    /// Prefix length, relative to the native family.
    pub fn prefix(&self) -> u8 {
        match self.family() {
            Family::V4 => self.prefix - address::V4_MAPPED_PREFIX,
            Family::V6 => self.prefix,
        }
    }

    /// Address family of the network.
    pub fn family(&self) -> Family {
        if self.prefix >= address::V4_MAPPED_PREFIX && self.address.to_ipv4_mapped().is_some() {
            Family::V4
        } else {
            Family::V6
        }
    }

    /// Two-letter country code, if the network carries one.
    pub fn country_code(&self) -> Option<&str> {
        if self.country == [0, 0] {
            return None;
        }
        std::str::from_utf8(&self.country).ok()
    }

    /// Autonomous system number, if the network carries one.
    pub fn asn(&self) -> Option<u32> {
        match self.asn {
            0 => None,
            n => Some(n),
        }
    }

    /// All flags attached to the network.
    pub fn flags(&self) -> NetworkFlags {
        self.flags
    }

    /// Check whether a flag is attached to the network.
    pub fn has_flag(&self, flag: NetworkFlags) -> bool {
        self.flags.contains(flag)
    }

    /// First address in canonical 128-bit form.
    pub fn first_address(&self) -> Ipv6Addr {
        self.address
    }

    /// Last address in canonical 128-bit form.
    pub fn last_address(&self) -> Ipv6Addr {
        address::last_address(&self.address, self.prefix)
    }

    /// Canonical prefix length over the full 128-bit space.
    pub(crate) fn canonical_prefix(&self) -> u8 {
        self.prefix
    }

    pub(crate) fn raw_country(&self) -> [u8; 2] {
        self.country
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address(), self.prefix())
    }
}

/// Predicates for network enumeration. Predicates compose via logical AND;
/// the default filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct NetworkFilter {
    family: Option<Family>,
    flags_mask: NetworkFlags,
    flags_match: NetworkFlags,
    asn: Option<u32>,
    country: Option<[u8; 2]>,
}

impl NetworkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one address family.
    pub fn family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    /// Restrict to networks where `flags & mask == matches`.
    pub fn flags(mut self, mask: NetworkFlags, matches: NetworkFlags) -> Self {
        self.flags_mask = mask;
        self.flags_match = matches;
        self
    }

    /// Restrict to networks announced by one AS.
    pub fn asn(mut self, asn: u32) -> Self {
        self.asn = Some(asn);
        self
    }

    /// Restrict to networks assigned to one country.
    pub fn country(mut self, code: &str) -> Result<Self> {
        self.country = Some(country::parse_code(code)?);
        Ok(self)
    }

    pub(crate) fn matches(&self, network: &Network) -> bool {
        if let Some(family) = self.family {
            if network.family() != family {
                return false;
            }
        }
        if network.flags & self.flags_mask != self.flags_match {
            return false;
        }
        if let Some(asn) = self.asn {
            if network.asn != asn {
                return false;
            }
        }
        if let Some(code) = self.country {
            if network.raw_country() != code {
                return false;
            }
        }
        true
    }

    /// Family restriction, used to prune tree traversal.
    pub(crate) fn family_filter(&self) -> Option<Family> {
        self.family
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(addr: &str, prefix: u8, country: &[u8; 2], asn: u32, flags: NetworkFlags) -> Network {
        let canonical = address::canonical(addr.parse().unwrap());
        Network::from_parts(canonical, prefix, *country, asn, flags)
    }

    #[test]
    fn test_v4_network_display() {
        let n = network("10.0.0.0", 96 + 8, b"US", 64512, NetworkFlags::empty());
        assert_eq!(n.to_string(), "10.0.0.0/8");
        assert_eq!(n.family(), Family::V4);
        assert_eq!(n.prefix(), 8);
    }

    #[test]
    fn test_v6_network_display() {
        let n = network("2001:db8::", 32, b"DE", 0, NetworkFlags::empty());
        assert_eq!(n.to_string(), "2001:db8::/32");
        assert_eq!(n.family(), Family::V6);
        assert!(n.asn().is_none());
    }

    #[test]
    fn test_wide_mapped_prefix_is_v6() {
        // A /95 covers more than the mapped range, so it is an IPv6 network.
        let n = Network::from_parts(
            "::ffff:0:0".parse().unwrap(),
            95,
            [0, 0],
            0,
            NetworkFlags::empty(),
        );
        assert_eq!(n.family(), Family::V6);
        assert_eq!(n.prefix(), 95);
    }

    #[test]
    fn test_country_code_zero_is_none() {
        let n = network("10.0.0.0", 96 + 8, &[0, 0], 0, NetworkFlags::empty());
        assert!(n.country_code().is_none());
    }

    #[test]
    fn test_has_flag() {
        let n = network(
            "10.0.0.0",
            96 + 8,
            b"US",
            0,
            NetworkFlags::ANYCAST | NetworkFlags::DROP,
        );
        assert!(n.has_flag(NetworkFlags::ANYCAST));
        assert!(n.has_flag(NetworkFlags::DROP));
        assert!(!n.has_flag(NetworkFlags::ANONYMOUS_PROXY));
    }

    #[test]
    fn test_filter_composition() {
        let n = network("10.0.0.0", 96 + 8, b"US", 64512, NetworkFlags::ANYCAST);

        assert!(NetworkFilter::new().matches(&n));
        assert!(NetworkFilter::new().family(Family::V4).matches(&n));
        assert!(!NetworkFilter::new().family(Family::V6).matches(&n));
        assert!(NetworkFilter::new().asn(64512).matches(&n));
        assert!(!NetworkFilter::new().asn(64513).matches(&n));
        assert!(NetworkFilter::new().country("US").unwrap().matches(&n));
        assert!(!NetworkFilter::new().country("DE").unwrap().matches(&n));
        assert!(NetworkFilter::new()
            .flags(NetworkFlags::ANYCAST, NetworkFlags::ANYCAST)
            .matches(&n));
        assert!(!NetworkFilter::new()
            .flags(NetworkFlags::DROP, NetworkFlags::DROP)
            .matches(&n));
        // AND composition
        assert!(!NetworkFilter::new()
            .family(Family::V4)
            .asn(1)
            .matches(&n));
    }

    #[test]
    fn test_flags_from_name() {
        assert_eq!(
            NetworkFlags::from_flag_name("anonymous-proxy"),
            Some(NetworkFlags::ANONYMOUS_PROXY)
        );
        assert_eq!(NetworkFlags::from_flag_name("drop"), Some(NetworkFlags::DROP));
        assert_eq!(NetworkFlags::from_flag_name("bogus"), None);
    }
}
