//! Request handling for active peer connections.
//!
//! [`Peering::handle`] applies one request to the routing state and
//! returns the I/O the daemon must perform as a list of [`Action`]s, so
//! the whole protocol surface is testable without sockets. Errors close
//! the originating tunnel and never touch any other.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tinc_core::{Error, Result};
use tinc_proto::{fresh_nonce, Request, SeenRequests};
use tinc_routing::{EdgeId, Graph, NodeId};
use tinc_tunnel::TunnelId;
use tracing::warn;

use crate::keys::{KeyStore, PeerKey};

/// How long a mutation nonce suppresses duplicates, and how many we keep.
const SEEN_WINDOW: Duration = Duration::from_secs(600);
const SEEN_CAPACITY: usize = 4096;

/// Where a request came from.
#[derive(Debug, Clone, Copy)]
pub struct Origin {
    pub tunnel: TunnelId,
    /// The authenticated peer on that tunnel.
    pub node: NodeId,
}

/// I/O the daemon must perform after a request was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send back on the originating tunnel.
    Reply(Request),
    /// Send to every active connection except the originating one.
    Forward(Request),
    /// Send along the unicast nexthop towards `node`; drop if unroutable.
    RouteTo { node: String, request: Request },
    /// The edge set changed; re-derive MST and BFS state.
    RunGraph,
}

/// Protocol state shared by all active connections.
pub struct Peering {
    pub tunnel_server: bool,
    pub seen: SeenRequests,
    pub keys: KeyStore,
    my_name: String,
}

impl Peering {
    pub fn new(my_name: String, tunnel_server: bool, keys: KeyStore) -> Self {
        Peering {
            tunnel_server,
            seen: SeenRequests::new(SEEN_WINDOW, SEEN_CAPACITY),
            keys,
            my_name,
        }
    }

    pub fn my_name(&self) -> &str {
        &self.my_name
    }

    /// Apply one request from an active connection.
    pub fn handle(
        &mut self,
        graph: &mut Graph,
        origin: Origin,
        line: &str,
        request: Request,
        now: Instant,
    ) -> Result<Vec<Action>> {
        match request {
            Request::Id { .. } | Request::Ack { .. } => Err(Error::protocol(
                "identification on an already active connection",
            )),

            Request::Ping => Ok(vec![Action::Reply(Request::Pong)]),
            Request::Pong => Ok(Vec::new()),

            Request::AddSubnet { nonce, owner, subnet } => {
                if self.seen.check_and_insert(line, now) {
                    return Ok(Vec::new());
                }
                let owner_id = graph.ensure_node(&owner);
                if self.refused_by_tunnel_server(graph, origin, owner_id) {
                    return Ok(Vec::new());
                }
                if graph.subnet_find(owner_id, &subnet).is_some() {
                    return Ok(Vec::new());
                }
                graph.subnet_add(owner_id, subnet, None);
                Ok(self.forwarded(Request::AddSubnet {
                    nonce,
                    owner,
                    subnet,
                }))
            }

            Request::DelSubnet { nonce, owner, subnet } => {
                if self.seen.check_and_insert(line, now) {
                    return Ok(Vec::new());
                }
                let Some(owner_id) = graph.node_by_name(&owner) else {
                    warn!(%owner, "got DEL_SUBNET for an unknown node");
                    return Ok(Vec::new());
                };
                let Some(id) = graph.subnet_find(owner_id, &subnet) else {
                    return Ok(Vec::new());
                };
                if owner_id == graph.self_id() {
                    // Nobody deletes our subnets but us.
                    warn!(%subnet, "peer tried to delete our own subnet");
                    return Ok(vec![Action::Reply(Request::AddSubnet {
                        nonce: fresh_nonce(),
                        owner,
                        subnet,
                    })]);
                }
                graph.subnet_del(id);
                Ok(self.forwarded(Request::DelSubnet {
                    nonce,
                    owner,
                    subnet,
                }))
            }

            Request::AddEdge {
                nonce,
                from,
                to,
                address,
                port,
                options,
                weight,
            } => {
                if self.seen.check_and_insert(line, now) {
                    return Ok(Vec::new());
                }
                let from_id = graph.ensure_node(&from);
                let to_id = graph.ensure_node(&to);
                if self.refused_by_tunnel_server(graph, origin, from_id) {
                    return Ok(Vec::new());
                }

                let announced = SocketAddr::new(address, port);
                if let Some(existing) = graph.edge_between(from_id, to_id) {
                    let edge = graph.edge(existing);
                    if edge.weight == weight
                        && edge.options == options
                        && edge.address == announced
                    {
                        return Ok(Vec::new());
                    }
                    if from_id == graph.self_id() {
                        // Someone is spreading stale information about our
                        // own edge; correct them.
                        warn!(%to, "got ADD_EDGE for our own edge with different properties");
                        return Ok(vec![Action::Reply(edge_request(graph, existing))]);
                    }
                    graph.edge_del(existing);
                } else if from_id == graph.self_id() {
                    warn!(%to, "got ADD_EDGE for an edge of ours that does not exist");
                    return Ok(vec![Action::Reply(Request::DelEdge {
                        nonce: fresh_nonce(),
                        from,
                        to,
                    })]);
                }

                graph.edge_add(from_id, to_id, announced, weight, options);
                let mut actions = self.forwarded(Request::AddEdge {
                    nonce,
                    from,
                    to,
                    address,
                    port,
                    options,
                    weight,
                });
                actions.push(Action::RunGraph);
                Ok(actions)
            }

            Request::DelEdge { nonce, from, to } => {
                if self.seen.check_and_insert(line, now) {
                    return Ok(Vec::new());
                }
                let (Some(from_id), Some(to_id)) =
                    (graph.node_by_name(&from), graph.node_by_name(&to))
                else {
                    warn!(%from, %to, "got DEL_EDGE for unknown nodes");
                    return Ok(Vec::new());
                };
                let Some(existing) = graph.edge_between(from_id, to_id) else {
                    return Ok(Vec::new());
                };
                if from_id == graph.self_id() {
                    warn!(%to, "peer tried to delete our own edge");
                    return Ok(vec![Action::Reply(edge_request(graph, existing))]);
                }

                graph.edge_del(existing);
                let mut actions = self.forwarded(Request::DelEdge {
                    nonce,
                    from,
                    to,
                });
                actions.push(Action::RunGraph);
                Ok(actions)
            }

            Request::KeyChanged { nonce, name } => {
                if self.seen.check_and_insert(line, now) {
                    return Ok(Vec::new());
                }
                if graph.node_by_name(&name).is_none() {
                    return Err(Error::protocol(format!(
                        "got KEY_CHANGED for unknown node {name}"
                    )));
                }
                self.keys.invalidate(&name);
                Ok(self.forwarded(Request::KeyChanged {
                    nonce,
                    name,
                }))
            }

            Request::ReqKey { from, to } => {
                if graph.node_by_name(&from).is_none() || graph.node_by_name(&to).is_none() {
                    return Err(Error::protocol(format!(
                        "got REQ_KEY between unknown nodes {from} and {to}"
                    )));
                }
                if to == self.my_name {
                    self.keys.mark_my_key_used();
                    let (cipher_key, digest_key, cipher, digest, maclength, compression) =
                        self.keys.my_key();
                    return Ok(vec![Action::Reply(Request::AnsKey {
                        from: self.my_name.clone(),
                        to: from,
                        cipher_key,
                        digest_key,
                        cipher,
                        digest,
                        maclength,
                        compression,
                    })]);
                }
                if self.tunnel_server {
                    return Err(Error::protocol("tunnel server does not route key requests"));
                }
                Ok(vec![Action::RouteTo {
                    node: to.clone(),
                    request: Request::ReqKey { from, to },
                }])
            }

            Request::AnsKey {
                from,
                to,
                cipher_key,
                digest_key,
                cipher,
                digest,
                maclength,
                compression,
            } => {
                if graph.node_by_name(&from).is_none() || graph.node_by_name(&to).is_none() {
                    return Err(Error::protocol(format!(
                        "got ANS_KEY between unknown nodes {from} and {to}"
                    )));
                }
                if to != self.my_name {
                    if self.tunnel_server {
                        return Err(Error::protocol("tunnel server does not route key answers"));
                    }
                    return Ok(vec![Action::RouteTo {
                        node: to.clone(),
                        request: Request::AnsKey {
                            from,
                            to,
                            cipher_key,
                            digest_key,
                            cipher,
                            digest,
                            maclength,
                            compression,
                        },
                    }]);
                }

                self.keys.install(
                    &from,
                    PeerKey {
                        cipher_key,
                        digest_key,
                        cipher,
                        digest,
                        maclength,
                        compression,
                    },
                )?;
                Ok(Vec::new())
            }
        }
    }

    /// In tunnel-server mode, peers may only talk about themselves.
    fn refused_by_tunnel_server(&self, graph: &Graph, origin: Origin, about: NodeId) -> bool {
        self.tunnel_server && about != graph.self_id() && about != origin.node
    }

    fn forwarded(&self, request: Request) -> Vec<Action> {
        if self.tunnel_server {
            Vec::new()
        } else {
            vec![Action::Forward(request)]
        }
    }
}

/// The `ADD_EDGE` describing an edge we hold, with a fresh nonce.
pub fn edge_request(graph: &Graph, id: EdgeId) -> Request {
    let edge = graph.edge(id);
    Request::AddEdge {
        nonce: fresh_nonce(),
        from: graph.node(edge.from).name.clone(),
        to: graph.node(edge.to).name.clone(),
        address: edge.address.ip(),
        port: edge.address.port(),
        options: edge.options,
        weight: edge.weight,
    }
}

/// Everything a freshly activated peer needs to know: all subnets and all
/// edges, or only our own subnets in tunnel-server mode.
pub fn send_everything(graph: &Graph, tunnel_server: bool) -> Vec<Request> {
    let mut requests = Vec::new();

    if tunnel_server {
        let myself = graph.self_id();
        for id in graph.node(myself).subnet_ids() {
            requests.push(Request::AddSubnet {
                nonce: fresh_nonce(),
                owner: graph.node(myself).name.clone(),
                subnet: graph.subnet(id).subnet,
            });
        }
        return requests;
    }

    for node in graph.node_ids() {
        for id in graph.node(node).subnet_ids() {
            requests.push(Request::AddSubnet {
                nonce: fresh_nonce(),
                owner: graph.node(node).name.clone(),
                subnet: graph.subnet(id).subnet,
            });
        }
    }
    for node in graph.node_ids() {
        for id in graph.node(node).edge_ids().collect::<Vec<_>>() {
            requests.push(edge_request(graph, id));
        }
    }

    requests
}
