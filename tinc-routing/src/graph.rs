//! The in-memory topology database and the algorithms that run over it.

use std::collections::{BTreeMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use tinc_core::NodeOptions;
use tracing::debug;

use crate::cache::{CacheKey, SubnetCache};
use crate::edge::{Edge, EdgeId};
use crate::node::{Node, NodeId};
use crate::subnet::{masked, masked_eq, MacAddr, Subnet, SubnetKind};

/// Handle into the subnet arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubnetId(pub(crate) u32);

impl SubnetId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A subnet together with its owner and optional cache-aging stamp.
#[derive(Debug, Clone)]
pub struct SubnetEntry {
    pub owner: NodeId,
    pub subnet: Subnet,
    /// MAC subnets learned from traffic expire; configured subnets do not.
    pub expires: Option<Instant>,
}

/// Emitted by [`Graph::sssp_bfs`] whenever a node's reachability flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityChange {
    pub node: NodeId,
    pub reachable: bool,
}

/// Ordering key of the global subnet index: `(family, address bytes,
/// prefix, owner name)`. Families are contiguous, and within a family the
/// ordering makes longest-prefix match a predecessor search.
type SubnetOrd = (SubnetKind, [u8; 16], u8, String);

/// Ordering key of the global edge index: `(weight, from name, to name)`.
type EdgeOrd = (i32, String, String);

/// The whole topology: node/edge/subnet arenas plus their ordered indexes
/// and the lookup cache. All cross-references are handle ids.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Option<Edge>>,
    free_edges: Vec<EdgeId>,
    subnets: Vec<Option<SubnetEntry>>,
    free_subnets: Vec<SubnetId>,

    by_name: BTreeMap<String, NodeId>,
    edge_index: BTreeMap<EdgeOrd, EdgeId>,
    subnet_index: BTreeMap<SubnetOrd, SubnetId>,
    cache: SubnetCache,

    self_id: NodeId,
}

impl Graph {
    /// Create a graph containing only `self`, which is always present,
    /// reachable, and its own nexthop and via.
    pub fn new(self_name: &str) -> Self {
        let mut node = Node::new(self_name.to_owned());
        node.status.reachable = true;
        node.nexthop = Some(NodeId(0));
        node.via = Some(NodeId(0));

        let mut by_name = BTreeMap::new();
        by_name.insert(self_name.to_owned(), NodeId(0));

        Graph {
            nodes: vec![node],
            edges: Vec::new(),
            free_edges: Vec::new(),
            subnets: Vec::new(),
            free_subnets: Vec::new(),
            by_name,
            edge_index: BTreeMap::new(),
            subnet_index: BTreeMap::new(),
            cache: SubnetCache::new(),
            self_id: NodeId(0),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    // --- nodes ---------------------------------------------------------

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Look a node up by name, creating it on first mention.
    pub fn ensure_node(&mut self, name: &str) -> NodeId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(name.to_owned()));
        self.by_name.insert(name.to_owned(), id);
        id
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // --- edges ---------------------------------------------------------

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges[id.index()].as_ref().unwrap_or_else(|| {
            unreachable!("edge handle {id:?} used after deletion")
        })
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges[id.index()].as_mut().unwrap_or_else(|| {
            unreachable!("edge handle {id:?} used after deletion")
        })
    }

    pub fn edge_between(&self, from: NodeId, to: NodeId) -> Option<EdgeId> {
        let to_name = &self.nodes[to.index()].name;
        self.nodes[from.index()].edges.get(to_name).copied()
    }

    /// Ids of all edges, in `(weight, from, to)` order.
    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edge_index.values().copied()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_index.len()
    }

    /// Insert a directed edge and wire up its reverse pointer if the
    /// opposite direction already exists.
    pub fn edge_add(
        &mut self,
        from: NodeId,
        to: NodeId,
        address: SocketAddr,
        weight: i32,
        options: NodeOptions,
    ) -> EdgeId {
        debug_assert!(self.edge_between(from, to).is_none());

        let reverse = self.edge_between(to, from);
        let edge = Edge {
            from,
            to,
            address,
            weight,
            options,
            reverse,
            mst: false,
        };

        let id = match self.free_edges.pop() {
            Some(id) => {
                self.edges[id.index()] = Some(edge);
                id
            }
            None => {
                let id = EdgeId(self.edges.len() as u32);
                self.edges.push(Some(edge));
                id
            }
        };

        if let Some(rev) = reverse {
            self.edge_mut(rev).reverse = Some(id);
        }

        let from_name = self.nodes[from.index()].name.clone();
        let to_name = self.nodes[to.index()].name.clone();
        self.nodes[from.index()].edges.insert(to_name.clone(), id);
        self.edge_index.insert((weight, from_name, to_name), id);

        id
    }

    /// Remove a directed edge, unlinking its reverse.
    pub fn edge_del(&mut self, id: EdgeId) {
        let Some(edge) = self.edges[id.index()].take() else {
            return;
        };

        if let Some(rev) = edge.reverse {
            if let Some(reverse) = self.edges[rev.index()].as_mut() {
                reverse.reverse = None;
            }
        }

        let from_name = self.nodes[edge.from.index()].name.clone();
        let to_name = self.nodes[edge.to.index()].name.clone();
        self.nodes[edge.from.index()].edges.remove(&to_name);
        self.edge_index.remove(&(edge.weight, from_name, to_name));
        self.free_edges.push(id);
    }

    // --- subnets -------------------------------------------------------

    pub fn subnet(&self, id: SubnetId) -> &SubnetEntry {
        self.subnets[id.index()].as_ref().unwrap_or_else(|| {
            unreachable!("subnet handle {id:?} used after deletion")
        })
    }

    fn subnet_ord(&self, entry: &SubnetEntry) -> SubnetOrd {
        (
            entry.subnet.kind(),
            entry.subnet.key_bytes(),
            entry.subnet.prefix(),
            self.nodes[entry.owner.index()].name.clone(),
        )
    }

    /// Insert a subnet owned by `owner`. Flushes the lookup cache.
    pub fn subnet_add(
        &mut self,
        owner: NodeId,
        subnet: Subnet,
        expires: Option<Instant>,
    ) -> SubnetId {
        let entry = SubnetEntry {
            owner,
            subnet,
            expires,
        };
        let ord = self.subnet_ord(&entry);

        let id = match self.free_subnets.pop() {
            Some(id) => {
                self.subnets[id.index()] = Some(entry);
                id
            }
            None => {
                let id = SubnetId(self.subnets.len() as u32);
                self.subnets.push(Some(entry));
                id
            }
        };

        self.subnet_index.insert(ord, id);
        self.nodes[owner.index()].subnets.insert(id);
        self.cache.flush();
        id
    }

    /// Remove a subnet. Flushes the lookup cache.
    pub fn subnet_del(&mut self, id: SubnetId) {
        let Some(entry) = self.subnets[id.index()].take() else {
            return;
        };
        let ord = (
            entry.subnet.kind(),
            entry.subnet.key_bytes(),
            entry.subnet.prefix(),
            self.nodes[entry.owner.index()].name.clone(),
        );
        self.subnet_index.remove(&ord);
        self.nodes[entry.owner.index()].subnets.remove(&id);
        self.free_subnets.push(id);
        self.cache.flush();
    }

    /// Exact lookup of a subnet owned by a specific node.
    pub fn subnet_find(&self, owner: NodeId, subnet: &Subnet) -> Option<SubnetId> {
        let ord = (
            subnet.kind(),
            subnet.key_bytes(),
            subnet.prefix(),
            self.nodes[owner.index()].name.clone(),
        );
        self.subnet_index.get(&ord).copied()
    }

    /// Refresh the aging stamp of a learned subnet. Configured subnets
    /// (no stamp) are left alone.
    pub fn subnet_refresh(&mut self, id: SubnetId, expires: Instant) {
        if let Some(entry) = self.subnets[id.index()].as_mut() {
            if entry.expires.is_some() {
                entry.expires = Some(expires);
            }
        }
    }

    pub fn subnet_count(&self) -> usize {
        self.subnet_index.len()
    }

    /// Delete every subnet whose stamp lies in the past; returns the
    /// deleted claims so the caller can announce them.
    pub fn age_subnets(&mut self, now: Instant) -> Vec<(NodeId, Subnet)> {
        let expired: Vec<SubnetId> = self
            .subnet_index
            .values()
            .copied()
            .filter(|id| {
                self.subnet(*id)
                    .expires
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();

        expired
            .into_iter()
            .map(|id| {
                let entry = self.subnet(id);
                let out = (entry.owner, entry.subnet);
                debug!(subnet = %out.1, "subnet expired");
                self.subnet_del(id);
                out
            })
            .collect()
    }

    // --- destination lookup --------------------------------------------

    /// Exact-match lookup of a MAC address.
    pub fn lookup_mac(&mut self, address: &MacAddr) -> Option<SubnetId> {
        let key = CacheKey::Mac(address.octets());
        if let Some(id) = self.cache.get(&key) {
            return Some(id);
        }

        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&address.octets());
        let start: SubnetOrd = (SubnetKind::Mac, bytes, 0, String::new());
        let (&(kind, addr, _, _), &id) = self.subnet_index.range(start..).next()?;
        if kind != SubnetKind::Mac || addr != bytes {
            return None;
        }
        self.cache.put(key, id);
        Some(id)
    }

    /// Longest-prefix match of an IPv4 destination.
    pub fn lookup_ipv4(&mut self, address: &Ipv4Addr) -> Option<SubnetId> {
        let key = CacheKey::Ipv4(address.octets());
        if let Some(id) = self.cache.get(&key) {
            return Some(id);
        }
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&address.octets());
        let id = self.lookup_prefix(SubnetKind::Ipv4, bytes, 32, &address.octets())?;
        self.cache.put(key, id);
        Some(id)
    }

    /// Longest-prefix match of an IPv6 destination.
    pub fn lookup_ipv6(&mut self, address: &Ipv6Addr) -> Option<SubnetId> {
        let key = CacheKey::Ipv6(address.octets());
        if let Some(id) = self.cache.get(&key) {
            return Some(id);
        }
        let bytes = address.octets();
        let id = self.lookup_prefix(SubnetKind::Ipv6, bytes, 128, &address.octets())?;
        self.cache.put(key, id);
        Some(id)
    }

    /// Predecessor walk through the subnet ordering: start just above the
    /// host prefix and keep narrowing the candidate prefix until a subnet
    /// contains the address or the family boundary is crossed.
    fn lookup_prefix(
        &self,
        kind: SubnetKind,
        mut search: [u8; 16],
        host_prefix: u8,
        address: &[u8],
    ) -> Option<SubnetId> {
        // The owner field of real keys is never empty, so an empty owner
        // makes the bound exclusive at (addr, prefix).
        let mut bound = host_prefix + 1;

        loop {
            let upper: SubnetOrd = (kind, search, bound, String::new());
            let (&(found_kind, found_addr, found_prefix, _), &id) =
                self.subnet_index.range(..upper).next_back()?;

            if found_kind != kind {
                return None;
            }
            if masked_eq(address, &found_addr[..address.len()], found_prefix) {
                return Some(id);
            }
            if found_prefix == 0 {
                return None;
            }
            bound = found_prefix;
            search = masked(&found_addr, found_prefix - 1);
        }
    }

    // --- graph algorithms ----------------------------------------------

    /// Kruskal variant over the weight-ordered edge index. Marks `mst`
    /// symmetrically on every tree edge; an edge is safe iff it is
    /// bidirectional and exactly one endpoint is in the visited set. When
    /// an edge was skipped because both endpoints were unvisited, the scan
    /// restarts from the head after the next safe edge.
    pub fn mst_kruskal(&mut self) {
        let order: Vec<EdgeId> = self.edge_index.values().copied().collect();
        let Some(&first) = order.first() else {
            return;
        };

        for slot in self.edges.iter_mut().flatten() {
            slot.mst = false;
        }
        for node in &mut self.nodes {
            node.status.visited = false;
        }

        debug!("running spanning tree scan");

        let start = self.edge(first).from;
        self.nodes[start.index()].status.visited = true;

        let mut skipped = false;
        let mut i = 0;
        while i < order.len() {
            let id = order[i];
            i += 1;

            let (from, to, reverse) = {
                let edge = self.edge(id);
                (edge.from, edge.to, edge.reverse)
            };
            let from_visited = self.nodes[from.index()].status.visited;
            let to_visited = self.nodes[to.index()].status.visited;

            let Some(reverse) = reverse else {
                skipped = true;
                continue;
            };
            if from_visited == to_visited {
                skipped = true;
                continue;
            }

            self.nodes[from.index()].status.visited = true;
            self.nodes[to.index()].status.visited = true;
            self.edge_mut(id).mst = true;
            self.edge_mut(reverse).mst = true;

            if skipped {
                skipped = false;
                i = 0;
            }
        }
    }

    /// Breadth-first search from `self`, deriving `nexthop`, `via`,
    /// `indirect` and reachability for every node. A visited node is
    /// re-examined only when the new path upgrades it from indirect to
    /// direct. Returns the reachability transitions since the last run.
    pub fn sssp_bfs(&mut self) -> Vec<ReachabilityChange> {
        for node in &mut self.nodes {
            node.status.visited = false;
            node.status.indirect = true;
        }

        let myself = self.self_id;
        {
            let me = &mut self.nodes[myself.index()];
            me.status.visited = true;
            me.status.indirect = false;
            me.nexthop = Some(myself);
            me.via = Some(myself);
        }

        let mut todo = VecDeque::new();
        todo.push_back(myself);

        while let Some(n) = todo.pop_front() {
            let edge_ids: Vec<EdgeId> = self.nodes[n.index()].edges.values().copied().collect();

            for id in edge_ids {
                let (to, options, address, reverse) = {
                    let edge = self.edge(id);
                    (edge.to, edge.options, edge.address, edge.reverse)
                };
                let Some(reverse) = reverse else {
                    continue;
                };

                // If the far side reaches us on a different address than
                // the one our upstream used for us, nodes behind us likely
                // cannot reach it directly either; treat the hop as
                // indirect.
                let reverse_address = self.edge(reverse).address;
                let indirect = self.nodes[n.index()].status.indirect
                    || options.contains(NodeOptions::INDIRECT)
                    || (n != myself && self.nodes[n.index()].address != Some(reverse_address));

                let target = &self.nodes[to.index()];
                if target.status.visited && (!target.status.indirect || indirect) {
                    continue;
                }

                let nexthop = if self.nodes[n.index()].nexthop == Some(myself) {
                    to
                } else {
                    self.nodes[n.index()].nexthop.unwrap_or(to)
                };
                let via = if indirect {
                    self.nodes[n.index()].via
                } else {
                    Some(to)
                };

                let target = &mut self.nodes[to.index()];
                target.status.visited = true;
                target.status.indirect = indirect;
                target.nexthop = Some(nexthop);
                target.via = via;
                target.options = options;
                target.address = Some(address);

                todo.push_back(to);
            }
        }

        let mut changes = Vec::new();
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            if node.status.visited != node.status.reachable {
                node.status.reachable = node.status.visited;
                debug!(
                    node = %node.name,
                    reachable = node.status.reachable,
                    "reachability changed"
                );
                changes.push(ReachabilityChange {
                    node: NodeId(idx as u32),
                    reachable: node.status.reachable,
                });
            }
        }
        changes
    }

    /// Convenience: run both derivations, MST first.
    pub fn recalculate(&mut self) -> Vec<ReachabilityChange> {
        self.mst_kruskal();
        self.sssp_bfs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(last: u8) -> SocketAddr {
        format!("192.0.2.{last}:655").parse().unwrap()
    }

    /// Insert both directions of a link with symmetric addresses.
    fn link(g: &mut Graph, a: NodeId, b: NodeId, weight: i32) {
        let a_last = a.index() as u8 + 1;
        let b_last = b.index() as u8 + 1;
        g.edge_add(a, b, addr(b_last), weight, NodeOptions::empty());
        g.edge_add(b, a, addr(a_last), weight, NodeOptions::empty());
    }

    fn triangle() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new("a");
        let a = g.self_id();
        let b = g.ensure_node("b");
        let c = g.ensure_node("c");
        // Seed our own address so direct paths stay direct.
        g.node_mut(a).address = Some(addr(1));
        link(&mut g, a, b, 10);
        link(&mut g, b, c, 20);
        link(&mut g, c, a, 30);
        (g, a, b, c)
    }

    #[test]
    fn reverse_pointers_stay_symmetric() {
        let (g, a, b, _) = triangle();
        for id in g.edge_ids() {
            let e = g.edge(id);
            let rev = g.edge(e.reverse.unwrap());
            assert_eq!(rev.from, e.to);
            assert_eq!(rev.to, e.from);
            assert_eq!(rev.reverse, Some(id));
        }

        // Deleting one direction clears the peer's pointer.
        let ab = g.edge_between(a, b).unwrap();
        let ba = g.edge_between(b, a).unwrap();
        let mut g = g;
        g.edge_del(ab);
        assert_eq!(g.edge(ba).reverse, None);
    }

    #[test]
    fn mst_spans_the_triangle_without_the_heaviest_edge() {
        let (mut g, a, b, c) = triangle();
        g.mst_kruskal();

        let mst = |from, to| g.edge(g.edge_between(from, to).unwrap()).mst;
        assert!(mst(a, b) && mst(b, a));
        assert!(mst(b, c) && mst(c, b));
        assert!(!mst(c, a) && !mst(a, c));
    }

    #[test]
    fn mst_ignores_unidirectional_edges() {
        let mut g = Graph::new("a");
        let a = g.self_id();
        let b = g.ensure_node("b");
        g.edge_add(a, b, addr(2), 1, NodeOptions::empty());
        g.mst_kruskal();
        assert!(!g.edge(g.edge_between(a, b).unwrap()).mst);
    }

    #[test]
    fn bfs_derives_nexthop_and_via() {
        let mut g = Graph::new("a");
        let a = g.self_id();
        let b = g.ensure_node("b");
        let c = g.ensure_node("c");
        g.node_mut(a).address = Some(addr(1));
        link(&mut g, a, b, 10);
        link(&mut g, b, c, 10);

        let changes = g.sssp_bfs();

        assert!(g.node(a).status.reachable);
        assert_eq!(g.node(a).nexthop, Some(a));
        assert_eq!(g.node(a).via, Some(a));

        assert_eq!(g.node(b).nexthop, Some(b));
        assert_eq!(g.node(c).nexthop, Some(b));
        assert_eq!(g.node(c).via, Some(c));
        assert!(!g.node(c).status.indirect);

        let mut became: Vec<_> = changes.iter().map(|c| (c.node, c.reachable)).collect();
        became.sort();
        assert_eq!(became, vec![(b, true), (c, true)]);

        // A second run is quiescent.
        assert!(g.sssp_bfs().is_empty());
    }

    #[test]
    fn bfs_marks_indirect_through_indirect_edges() {
        let mut g = Graph::new("a");
        let a = g.self_id();
        let b = g.ensure_node("b");
        let c = g.ensure_node("c");
        g.node_mut(a).address = Some(addr(1));
        g.edge_add(a, b, addr(2), 10, NodeOptions::INDIRECT);
        g.edge_add(b, a, addr(1), 10, NodeOptions::empty());
        link(&mut g, b, c, 10);

        g.sssp_bfs();

        assert!(g.node(b).status.indirect);
        assert_eq!(g.node(b).via, Some(a));
        // Indirection propagates: c is reached through b's via.
        assert!(g.node(c).status.indirect);
        assert_eq!(g.node(c).via, Some(a));
        assert_eq!(g.node(c).nexthop, Some(b));
    }

    #[test]
    fn edge_churn_convergence() {
        // Triangle; dropping one side keeps everything reachable with no
        // transition, dropping a second side cuts off exactly one node.
        let (mut g, a, b, c) = triangle();
        g.recalculate();
        assert!(g.node(c).status.reachable);

        let ca = g.edge_between(c, a).unwrap();
        let ac = g.edge_between(a, c).unwrap();
        g.edge_del(ca);
        g.edge_del(ac);
        let changes = g.recalculate();
        assert!(changes.is_empty());
        assert!(g.node(c).status.reachable);
        assert_eq!(g.node(c).nexthop, Some(b));

        let bc = g.edge_between(b, c).unwrap();
        let cb = g.edge_between(c, b).unwrap();
        g.edge_del(bc);
        g.edge_del(cb);
        let changes = g.recalculate();
        assert_eq!(
            changes,
            vec![ReachabilityChange {
                node: c,
                reachable: false
            }]
        );
        assert!(!g.node(c).status.reachable);
        assert!(g.node(b).status.reachable);
    }

    #[test]
    fn lpm_prefers_the_longest_prefix() {
        let mut g = Graph::new("a");
        let a = g.self_id();
        let b = g.ensure_node("b");
        g.subnet_add(a, "10.0.0.0/8".parse().unwrap(), None);
        g.subnet_add(b, "10.1.0.0/16".parse().unwrap(), None);
        g.subnet_add(b, "10.1.2.0/24".parse().unwrap(), None);

        let hit = |g: &mut Graph, ip: &str| {
            let ip: Ipv4Addr = ip.parse().unwrap();
            g.lookup_ipv4(&ip).map(|id| g.subnet(id).subnet.to_string())
        };

        assert_eq!(hit(&mut g, "10.1.2.3").as_deref(), Some("10.1.2.0/24"));
        assert_eq!(hit(&mut g, "10.1.9.9").as_deref(), Some("10.1.0.0/16"));
        assert_eq!(hit(&mut g, "10.9.9.9").as_deref(), Some("10.0.0.0/8"));
        assert_eq!(hit(&mut g, "192.168.0.1"), None);
    }

    #[test]
    fn lpm_does_not_cross_the_family_boundary() {
        let mut g = Graph::new("a");
        let a = g.self_id();
        g.subnet_add(
            a,
            Subnet::Mac {
                address: MacAddr([0xff; 6]),
            },
            None,
        );
        let ip: Ipv4Addr = "1.2.3.4".parse().unwrap();
        assert_eq!(g.lookup_ipv4(&ip), None);

        let ip6: Ipv6Addr = "fe80::1".parse().unwrap();
        assert_eq!(g.lookup_ipv6(&ip6), None);
    }

    #[test]
    fn ipv6_lpm() {
        let mut g = Graph::new("a");
        let b = g.ensure_node("b");
        g.subnet_add(b, "fec0:1::/32".parse().unwrap(), None);
        g.subnet_add(b, "fec0:1:2::/48".parse().unwrap(), None);

        let ip: Ipv6Addr = "fec0:1:2::9".parse().unwrap();
        let id = g.lookup_ipv6(&ip).unwrap();
        assert_eq!(g.subnet(id).subnet.to_string(), "fec0:1:2::/48");

        let ip: Ipv6Addr = "fec0:1:9::9".parse().unwrap();
        let id = g.lookup_ipv6(&ip).unwrap();
        assert_eq!(g.subnet(id).subnet.to_string(), "fec0:1::/32");
    }

    #[test]
    fn cache_is_coherent_and_flushed_on_mutation() {
        let mut g = Graph::new("a");
        let a = g.self_id();
        let b = g.ensure_node("b");
        g.subnet_add(a, "10.0.0.0/8".parse().unwrap(), None);

        let ip: Ipv4Addr = "10.1.2.3".parse().unwrap();
        let first = g.lookup_ipv4(&ip).unwrap();
        // The hit is now cached, and the cached answer matches the tree.
        assert_eq!(g.cache.get(&CacheKey::Ipv4(ip.octets())), Some(first));
        assert_eq!(g.lookup_ipv4(&ip), Some(first));

        // Any subnet mutation empties the cache.
        let id = g.subnet_add(b, "10.1.0.0/16".parse().unwrap(), None);
        assert!(g.cache.is_empty());
        // And the next lookup re-resolves through the tree.
        assert_eq!(g.lookup_ipv4(&ip), Some(id));

        g.subnet_del(id);
        assert!(g.cache.is_empty());
        assert_eq!(g.lookup_ipv4(&ip), Some(first));
    }

    #[test]
    fn mac_lookup_is_exact() {
        let mut g = Graph::new("a");
        let a = g.self_id();
        let mac = MacAddr([2, 0, 0, 0, 0, 1]);
        g.subnet_add(a, Subnet::Mac { address: mac }, None);

        assert!(g.lookup_mac(&mac).is_some());
        assert!(g.lookup_mac(&MacAddr([2, 0, 0, 0, 0, 2])).is_none());
    }

    #[test]
    fn aging_removes_only_expired_learned_subnets() {
        let now = Instant::now();
        let mut g = Graph::new("a");
        let a = g.self_id();
        let mac = MacAddr([2, 0, 0, 0, 0, 1]);
        let learned = g.subnet_add(a, Subnet::Mac { address: mac }, Some(now));
        g.subnet_add(a, "10.0.0.0/8".parse().unwrap(), None);

        // Refresh moves the stamp forward, so nothing expires yet.
        g.subnet_refresh(learned, now + Duration::from_secs(60));
        assert!(g.age_subnets(now + Duration::from_secs(1)).is_empty());

        let gone = g.age_subnets(now + Duration::from_secs(120));
        assert_eq!(gone, vec![(a, Subnet::Mac { address: mac })]);
        assert_eq!(g.subnet_count(), 1);
        assert!(g.lookup_mac(&mac).is_none());
    }

    #[test]
    fn subnet_find_is_owner_scoped() {
        let mut g = Graph::new("a");
        let a = g.self_id();
        let b = g.ensure_node("b");
        let net: Subnet = "10.0.0.0/24".parse().unwrap();
        let id = g.subnet_add(a, net, None);

        assert_eq!(g.subnet_find(a, &net), Some(id));
        assert_eq!(g.subnet_find(b, &net), None);
    }
}
