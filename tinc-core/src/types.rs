//! Shared scalar types.

use std::fmt;
use std::str::FromStr;

/// Version of the routing (meta) protocol spoken on tunnels. Peers with a
/// different version are rejected during identification.
pub const PROTOCOL_VERSION: u32 = 17;

/// A node name is valid iff it is non-empty and consists of ASCII
/// alphanumerics and underscores only.
pub fn valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Per-node / per-edge option bits, propagated verbatim as a flat hex
/// bitmask in meta messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeOptions(u32);

impl NodeOptions {
    /// Data for this node must travel via an intermediate hop.
    pub const INDIRECT: NodeOptions = NodeOptions(0x1);
    /// The node only accepts tunnelled (TCP) data. Implies `INDIRECT`.
    pub const TCP_ONLY: NodeOptions = NodeOptions(0x2);
    /// The node participates in path-MTU discovery.
    pub const PMTU_DISCOVERY: NodeOptions = NodeOptions(0x4);

    pub const fn empty() -> Self {
        NodeOptions(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        NodeOptions(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: NodeOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeOptions) {
        self.0 |= other.0;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for NodeOptions {
    type Output = NodeOptions;
    fn bitor(self, rhs: NodeOptions) -> NodeOptions {
        NodeOptions(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for NodeOptions {
    fn bitor_assign(&mut self, rhs: NodeOptions) {
        self.0 |= rhs.0;
    }
}

/// Options travel on the wire in lowercase hex, without a `0x` prefix.
impl fmt::LowerHex for NodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl FromStr for NodeOptions {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s, 16).map(NodeOptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_node_name("alpha_2"));
        assert!(valid_node_name("X"));
        assert!(!valid_node_name(""));
        assert!(!valid_node_name("bad-name"));
        assert!(!valid_node_name("spa ce"));
    }

    #[test]
    fn options_roundtrip_hex() {
        let opts = NodeOptions::INDIRECT | NodeOptions::PMTU_DISCOVERY;
        let text = format!("{opts:x}");
        assert_eq!(text, "5");
        assert_eq!(text.parse::<NodeOptions>().ok(), Some(opts));
        assert!(opts.contains(NodeOptions::INDIRECT));
        assert!(!opts.contains(NodeOptions::TCP_ONLY));
    }
}
