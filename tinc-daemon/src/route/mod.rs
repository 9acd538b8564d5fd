//! The forwarding plane: per-frame classification and dispatch.
//!
//! Frames enter from the virtual device (`source == self`) or from a
//! tunnel (`source` is the far node). Depending on the configured mode
//! they are routed at layer 3 with ARP/ND impersonation (`Router`),
//! switched on learned MAC addresses (`Switch`), or flooded (`Hub`).
//! Forwarding never fails the daemon: bad frames are counted and dropped.

mod arp;
mod ipv4;
mod ipv6;

use std::time::{Duration, Instant};

use tinc_routing::{Graph, MacAddr, NodeId, Subnet};
use tracing::warn;

use crate::packet::*;

/// Frame classification regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    Router,
    Switch,
    Hub,
}

/// Where the forwarding plane sends packets. The daemon's implementation
/// resolves nodes to tunnels; tests observe the calls directly.
pub trait PacketIo {
    /// Deliver a frame to the local host interface.
    fn send_to_host(&mut self, frame: &[u8]);
    /// Deliver a frame towards a node. `priority` carries the TOS /
    /// traffic-class byte when priority inheritance is on.
    fn send_to_node(&mut self, node: NodeId, frame: &[u8], priority: Option<u8>);
    /// Path MTU towards a node, as observed by its tunnel.
    fn node_mtu(&self, node: NodeId) -> u16;
}

/// Token bucket with a one-second window.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window_start: Option<Instant>,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        RateLimiter {
            limit,
            window_start: None,
            count: 0,
        }
    }

    /// True if another event is allowed right now.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) < Duration::from_secs(1) => {
                self.count += 1;
                self.count <= self.limit
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
                true
            }
        }
    }
}

/// Drop and synthesis counters.
#[derive(Debug, Default)]
pub struct ForwardStats {
    pub short_frames: u64,
    pub unknown_type: u64,
    pub loops: u64,
    pub unroutable: u64,
    pub icmp_sent: u64,
    pub icmp_suppressed: u64,
    pub fragmented: u64,
    pub learned: u64,
}

/// The forwarding plane state. All of it is per-daemon, never global.
#[derive(Debug)]
pub struct Forwarder {
    mode: RouteMode,
    mac_expire: Duration,
    priority_inheritance: bool,
    /// Adopt the MAC of the host querying through us (some virtual
    /// device stacks need replies to come from "their" address).
    pub overwrite_mac: bool,
    my_mac: MacAddr,
    icmp_limit: RateLimiter,
    pub stats: ForwardStats,
}

impl Forwarder {
    pub fn new(mode: RouteMode, mac_expire: Duration, priority_inheritance: bool) -> Self {
        Forwarder {
            mode,
            mac_expire,
            priority_inheritance,
            overwrite_mac: false,
            my_mac: MacAddr([0xfe, 0xfd, 0, 0, 0, 0]),
            icmp_limit: RateLimiter::new(3),
            stats: ForwardStats::default(),
        }
    }

    pub fn mode(&self) -> RouteMode {
        self.mode
    }

    /// Route one frame. Returns a MAC subnet learned from the frame's
    /// source address, if any, so the caller can announce it.
    pub fn route(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
        now: Instant,
    ) -> Option<Subnet> {
        if !self.check_length(graph, source, frame.len(), ETHER_LEN) {
            return None;
        }

        match self.mode {
            RouteMode::Router => {
                match read_u16(frame, 12) {
                    ETHERTYPE_ARP => self.route_arp(graph, io, source, frame),
                    ETHERTYPE_IPV4 => self.route_ipv4(graph, io, source, frame, now),
                    ETHERTYPE_IPV6 => self.route_ipv6(graph, io, source, frame, now),
                    other => {
                        self.stats.unknown_type += 1;
                        warn!(
                            source = %graph.node(source).name,
                            "cannot route packet: unknown type {other:#06x}"
                        );
                    }
                }
                None
            }
            RouteMode::Switch => self.route_mac(graph, io, source, frame, now),
            RouteMode::Hub => {
                self.broadcast(graph, io, source, frame);
                None
            }
        }
    }

    pub(super) fn check_length(
        &mut self,
        graph: &Graph,
        source: NodeId,
        len: usize,
        min: usize,
    ) -> bool {
        if len < min {
            self.stats.short_frames += 1;
            warn!(source = %graph.node(source).name, len, "got too short packet");
            false
        } else {
            true
        }
    }

    /// `self` writes to the host; everyone else goes out on the tunnel of
    /// the first hop towards them (tunnels exist only to direct peers).
    pub(super) fn send(
        &mut self,
        graph: &Graph,
        io: &mut dyn PacketIo,
        dest: NodeId,
        frame: &[u8],
        priority: Option<u8>,
    ) {
        let myself = graph.self_id();
        if dest == myself {
            io.send_to_host(frame);
            return;
        }
        match graph.node(dest).nexthop {
            Some(hop) if hop != myself => io.send_to_node(hop, frame, priority),
            _ => warn!(dest = %graph.node(dest).name, "no route for packet destination"),
        }
    }

    /// Deliver to the host (unless the frame came from it) and to every
    /// spanning-tree neighbor except the one it arrived from.
    pub(super) fn broadcast(
        &mut self,
        graph: &Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
    ) {
        let myself = graph.self_id();
        if source != myself {
            io.send_to_host(frame);
        }

        let edges: Vec<_> = graph.node(myself).edge_ids().collect();
        for id in edges {
            let edge = graph.edge(id);
            if edge.mst && edge.to != source {
                io.send_to_node(edge.to, frame, None);
            }
        }
    }

    pub(super) fn icmp_allowed(&mut self, now: Instant) -> bool {
        if self.icmp_limit.allow(now) {
            true
        } else {
            self.stats.icmp_suppressed += 1;
            false
        }
    }

    /// Our MAC with the second octet flipped, so synthesised replies are
    /// distinguishable from real stations.
    pub(super) fn mangled_mac(&self) -> [u8; 6] {
        let mut mac = self.my_mac.octets();
        mac[1] ^= 0xff;
        mac
    }

    pub(super) fn snatch_mac(&mut self, frame: &[u8]) {
        if self.overwrite_mac {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&frame[ETH_ALEN..2 * ETH_ALEN]);
            self.my_mac = MacAddr(mac);
        }
    }

    // --- switch mode ---------------------------------------------------

    fn route_mac(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
        now: Instant,
    ) -> Option<Subnet> {
        // Learn on the source side only.
        let learned = if source == graph.self_id() {
            let mut src = [0u8; 6];
            src.copy_from_slice(&frame[ETH_ALEN..2 * ETH_ALEN]);
            self.learn_mac(graph, MacAddr(src), now)
        } else {
            None
        };

        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[..ETH_ALEN]);

        match graph.lookup_mac(&MacAddr(dst)) {
            None => self.broadcast(graph, io, source, frame),
            Some(id) if graph.subnet(id).owner == source => {
                self.stats.loops += 1;
                warn!(source = %graph.node(source).name, "packet looping back");
            }
            Some(id) => {
                let owner = graph.subnet(id).owner;
                self.send(graph, io, owner, frame, None);
            }
        }

        learned
    }

    fn learn_mac(&mut self, graph: &mut Graph, address: MacAddr, now: Instant) -> Option<Subnet> {
        let expires = now + self.mac_expire;
        if let Some(id) = graph.lookup_mac(&address) {
            graph.subnet_refresh(id, expires);
            return None;
        }

        self.stats.learned += 1;
        tracing::info!(%address, "learned new MAC address");
        let subnet = Subnet::Mac { address };
        graph.subnet_add(graph.self_id(), subnet, Some(expires));
        Some(subnet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_burst_then_suppresses() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::new(3);
        assert!(limiter.allow(t0));
        assert!(limiter.allow(t0));
        assert!(limiter.allow(t0));
        assert!(!limiter.allow(t0));
        assert!(!limiter.allow(t0 + Duration::from_millis(500)));
        // A new window opens after a second.
        assert!(limiter.allow(t0 + Duration::from_secs(1)));
    }
}
