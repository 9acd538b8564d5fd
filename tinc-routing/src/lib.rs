#![forbid(unsafe_code)]

//! Topology database for the tinc daemon.
//!
//! A [`Graph`] holds every known node, the directed edges they announce and
//! the subnets they claim, all in typed arenas addressed by small handle
//! ids. Three ordered indexes sit on top of the arenas: nodes by name,
//! edges by `(weight, from, to)` for the spanning-tree scan, and subnets
//! ordered so that longest-prefix match is a predecessor search. A small
//! open-address cache short-circuits repeated subnet lookups.
//!
//! The graph algorithms ([`Graph::mst_kruskal`] and [`Graph::sssp_bfs`])
//! derive the broadcast tree and the unicast forwarding state from the
//! edge set; both are pure with respect to I/O.

mod cache;
mod edge;
mod graph;
mod node;
mod subnet;

pub use edge::{Edge, EdgeId};
pub use graph::{Graph, ReachabilityChange, SubnetEntry, SubnetId};
pub use node::{Node, NodeId, NodeStatus};
pub use subnet::{MacAddr, Subnet, SubnetKind};

/// Default per-destination MTU before any tunnel reports a smaller one.
pub const DEFAULT_MTU: u16 = 1514;
