//! Subnets: reachability claims for a MAC address, an IPv4 prefix or an
//! IPv6 prefix.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use tinc_core::Error;

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// True for group (multicast/broadcast) addresses.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:x}:{b:x}:{c:x}:{d:x}:{e:x}:{g:x}")
    }
}

impl FromStr for MacAddr {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut groups = s.split(':');
        for octet in &mut octets {
            let group = groups
                .next()
                .ok_or_else(|| Error::config(format!("invalid MAC address {s}")))?;
            *octet = u8::from_str_radix(group, 16)
                .map_err(|_| Error::config(format!("invalid MAC address {s}")))?;
        }
        if groups.next().is_some() {
            return Err(Error::config(format!("invalid MAC address {s}")));
        }
        Ok(MacAddr(octets))
    }
}

/// Discriminant of the subnet variants. The derived order (MAC < IPv4 <
/// IPv6) keeps each family contiguous in the global subnet index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubnetKind {
    Mac,
    Ipv4,
    Ipv6,
}

/// A reachability claim, without its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subnet {
    Mac { address: MacAddr },
    Ipv4 { address: Ipv4Addr, prefix: u8 },
    Ipv6 { address: Ipv6Addr, prefix: u8 },
}

impl Subnet {
    pub fn kind(&self) -> SubnetKind {
        match self {
            Subnet::Mac { .. } => SubnetKind::Mac,
            Subnet::Ipv4 { .. } => SubnetKind::Ipv4,
            Subnet::Ipv6 { .. } => SubnetKind::Ipv6,
        }
    }

    /// Address bytes padded to 16, for ordered comparison across variants.
    pub(crate) fn key_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        match self {
            Subnet::Mac { address } => bytes[..6].copy_from_slice(&address.0),
            Subnet::Ipv4 { address, .. } => bytes[..4].copy_from_slice(&address.octets()),
            Subnet::Ipv6 { address, .. } => bytes.copy_from_slice(&address.octets()),
        }
        bytes
    }

    pub(crate) fn prefix(&self) -> u8 {
        match self {
            Subnet::Mac { .. } => 0,
            Subnet::Ipv4 { prefix, .. } | Subnet::Ipv6 { prefix, .. } => *prefix,
        }
    }

    /// A subnet is well formed iff the bits beyond the prefix are zero
    /// (network address, not host address).
    pub fn is_network_address(&self) -> bool {
        match self {
            Subnet::Mac { .. } => true,
            Subnet::Ipv4 { address, prefix } => tail_is_zero(&address.octets(), *prefix),
            Subnet::Ipv6 { address, prefix } => tail_is_zero(&address.octets(), *prefix),
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subnet::Mac { address } => write!(f, "{address}"),
            Subnet::Ipv4 { address, prefix } => write!(f, "{address}/{prefix}"),
            Subnet::Ipv6 { address, prefix } => write!(f, "{address}/{prefix}"),
        }
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (
                addr,
                Some(
                    prefix
                        .parse::<u8>()
                        .map_err(|_| Error::config(format!("invalid subnet {s}")))?,
                ),
            ),
            None => (s, None),
        };

        if let Ok(address) = addr.parse::<Ipv4Addr>() {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return Err(Error::config(format!("invalid subnet {s}")));
            }
            return Ok(Subnet::Ipv4 { address, prefix });
        }

        if let Ok(address) = addr.parse::<Ipv6Addr>() {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return Err(Error::config(format!("invalid subnet {s}")));
            }
            return Ok(Subnet::Ipv6 { address, prefix });
        }

        if prefix.is_none() {
            if let Ok(address) = addr.parse::<MacAddr>() {
                return Ok(Subnet::Mac { address });
            }
        }

        Err(Error::config(format!("invalid subnet {s}")))
    }
}

/// True iff all bits of `bytes` past the first `prefix` bits are zero.
pub(crate) fn tail_is_zero(bytes: &[u8], prefix: u8) -> bool {
    let prefix = prefix as usize;
    let mut i = prefix / 8;
    let rem = prefix % 8;
    if rem != 0 {
        if bytes[i] & (0xff >> rem) != 0 {
            return false;
        }
        i += 1;
    }
    bytes[i..].iter().all(|&b| b == 0)
}

/// True iff `addr` and `net` agree on their first `prefix` bits.
pub(crate) fn masked_eq(addr: &[u8], net: &[u8], prefix: u8) -> bool {
    let prefix = prefix as usize;
    let whole = prefix / 8;
    let rem = prefix % 8;
    if addr[..whole] != net[..whole] {
        return false;
    }
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    addr[whole] & mask == net[whole] & mask
}

/// Copy the first `prefix` bits of `src` into a fresh array, zeroing the rest.
pub(crate) fn masked(src: &[u8; 16], prefix: u8) -> [u8; 16] {
    let mut out = [0u8; 16];
    let prefix = prefix as usize;
    let whole = prefix / 8;
    let rem = prefix % 8;
    out[..whole].copy_from_slice(&src[..whole]);
    if rem != 0 {
        out[whole] = src[whole] & (0xffu8 << (8 - rem));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_all_three_forms() {
        assert_eq!(
            "10.1.2.0/24".parse::<Subnet>().unwrap(),
            Subnet::Ipv4 {
                address: Ipv4Addr::new(10, 1, 2, 0),
                prefix: 24
            }
        );
        assert_eq!(
            "10.1.2.3".parse::<Subnet>().unwrap(),
            Subnet::Ipv4 {
                address: Ipv4Addr::new(10, 1, 2, 3),
                prefix: 32
            }
        );
        assert!(matches!(
            "fec0:0:0:1::/64".parse::<Subnet>().unwrap(),
            Subnet::Ipv6 { prefix: 64, .. }
        ));
        assert!(matches!(
            "fec0::1".parse::<Subnet>().unwrap(),
            Subnet::Ipv6 { prefix: 128, .. }
        ));
        assert_eq!(
            "2:0:0:0:0:1".parse::<Subnet>().unwrap(),
            Subnet::Mac {
                address: MacAddr([2, 0, 0, 0, 0, 1])
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "10.0.0.0/33", "fe80::/129", "1:2:3", "hello", "1.2.3.4/x"] {
            assert!(bad.parse::<Subnet>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn network_address_invariant() {
        assert!("10.0.0.0/24".parse::<Subnet>().unwrap().is_network_address());
        assert!(!"10.0.0.1/24".parse::<Subnet>().unwrap().is_network_address());
        assert!("10.0.0.1/32".parse::<Subnet>().unwrap().is_network_address());
        assert!(!"fec0::1/64".parse::<Subnet>().unwrap().is_network_address());
    }

    #[test]
    fn mac_text_uses_bare_hex_groups() {
        let mac: MacAddr = "fe:fd:0:0:a:1".parse().unwrap();
        assert_eq!(mac.0, [0xfe, 0xfd, 0, 0, 0xa, 1]);
        assert_eq!(mac.to_string(), "fe:fd:0:0:a:1");
    }

    #[test]
    fn mask_helpers() {
        assert!(masked_eq(&[10, 1, 2, 3], &[10, 1, 2, 0], 24));
        assert!(!masked_eq(&[10, 1, 3, 3], &[10, 1, 2, 0], 24));
        assert!(masked_eq(&[10, 1, 2, 3], &[10, 1, 0, 0], 18));
        assert!(masked_eq(&[0xff; 4], &[0; 4], 0));

        let mut src = [0u8; 16];
        src[..4].copy_from_slice(&[10, 1, 255, 255]);
        let out = masked(&src, 18);
        assert_eq!(&out[..4], &[10, 1, 0xc0, 0]);
    }

    proptest! {
        #[test]
        fn text_roundtrip(kind in 0u8..3, bytes in proptest::array::uniform16(any::<u8>()), prefix in 0u8..=128) {
            let subnet = match kind {
                0 => {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&bytes[..6]);
                    Subnet::Mac { address: MacAddr(mac) }
                }
                1 => {
                    let mut v4 = [0u8; 4];
                    v4.copy_from_slice(&bytes[..4]);
                    Subnet::Ipv4 { address: Ipv4Addr::from(v4), prefix: prefix % 33 }
                }
                _ => Subnet::Ipv6 { address: Ipv6Addr::from(bytes), prefix },
            };
            let reparsed: Subnet = subnet.to_string().parse().unwrap();
            prop_assert_eq!(reparsed, subnet);
        }
    }
}
