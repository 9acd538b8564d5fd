//! The daemon event loop.
//!
//! One task owns all routing state. Tunnel readers, the listener, the
//! device pump and hook children run as auxiliary tasks that only pass
//! messages; every mutation of the graph happens here, serialised by the
//! loop. Timers drive tunnel liveness, key rotation, subnet aging and
//! outgoing-connection retry.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tinc_core::{Config, Error, NodeOptions, Result, TimerId, Timers, PROTOCOL_VERSION};
use tinc_proto::{fresh_nonce, Request};
use tinc_routing::{Graph, NodeId, ReachabilityChange, DEFAULT_MTU};
use tinc_tunnel::{
    bind_listener, spawn_listener, tune_stream, Handshaker, PlainHandshaker, Record, RecordCodec,
    Side, Tunnel, TunnelId, TunnelMessage,
};
use tinc_vnd::VndHandle;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::hooks::HookRunner;
use crate::keys::KeyStore;
use crate::peering::{edge_request, send_everything, Action, Origin, Peering};
use crate::route::{Forwarder, PacketIo};
use crate::settings::Settings;

/// Timer payloads dispatched by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TimerKind {
    /// Per-tunnel liveness: ping after silence, kill after more silence.
    PingCheck(TunnelId),
    /// Re-dial a configured outgoing connection.
    RetryOutgoing(String),
    /// Expire learned MAC subnets.
    AgeSubnets,
    /// Purge the duplicate-suppression set.
    SweepSeen,
    /// Rotate our packet key and tell the net.
    RotateKeys,
}

const AGE_INTERVAL: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_STEP: Duration = Duration::from_secs(5);

/// Per-connection state.
struct Peer {
    tunnel: Tunnel,
    /// Set once the ACK exchange completed.
    node: Option<NodeId>,
    active: bool,
    /// `ConnectTo` name when we dialed out.
    outgoing: Option<String>,
    host: Config,
    started: Instant,
    last_heard: Instant,
    ping_outstanding: bool,
    ping_timer: TimerId,
}

/// Retry state for one `ConnectTo` target.
#[derive(Debug, Default)]
struct OutgoingState {
    timeout: Duration,
    connecting: bool,
}

/// Result of an (inbound or outbound) handshake task.
struct HandshakeDone {
    result: Result<(Framed<TcpStream, RecordCodec>, String)>,
    /// Set when this was an outgoing attempt.
    outgoing: Option<String>,
}

pub struct Daemon {
    settings: Settings,
    graph: Graph,
    forwarder: Forwarder,
    peering: Peering,
    hooks: Box<dyn HookRunner>,

    vnd: VndHandle,
    frames: mpsc::Receiver<Bytes>,

    tunnel_events_tx: mpsc::Sender<TunnelMessage>,
    tunnel_events: mpsc::Receiver<TunnelMessage>,
    inbound: mpsc::Receiver<(TcpStream, SocketAddr)>,
    handshakes_tx: mpsc::Sender<HandshakeDone>,
    handshakes: mpsc::Receiver<HandshakeDone>,

    peers: HashMap<TunnelId, Peer>,
    by_node: HashMap<NodeId, TunnelId>,
    outgoing: HashMap<String, OutgoingState>,
    timers: Timers<TimerKind>,
    next_tunnel: u64,
}

/// Packet output paths, resolved per adjacent node.
struct DaemonIo<'a> {
    vnd: &'a VndHandle,
    peers: &'a HashMap<TunnelId, Peer>,
    by_node: &'a HashMap<NodeId, TunnelId>,
}

impl PacketIo for DaemonIo<'_> {
    fn send_to_host(&mut self, frame: &[u8]) {
        let _ = self.vnd.send(Bytes::copy_from_slice(frame));
    }

    fn send_to_node(&mut self, node: NodeId, frame: &[u8], priority: Option<u8>) {
        let Some(peer) = self.by_node.get(&node).and_then(|id| self.peers.get(id)) else {
            warn!("no tunnel for packet destination");
            return;
        };
        if let Some(tos) = priority {
            peer.tunnel.inherit_priority(u32::from(tos));
        }
        if peer.tunnel.send_packet(Bytes::copy_from_slice(frame)).is_err() {
            debug!(peer = peer.tunnel.peer(), "packet dropped on closed tunnel");
        }
    }

    fn node_mtu(&self, node: NodeId) -> u16 {
        self.by_node
            .get(&node)
            .and_then(|id| self.peers.get(id))
            .map(|peer| peer.tunnel.mtu())
            .unwrap_or(DEFAULT_MTU)
    }
}

impl Daemon {
    pub fn new(
        settings: Settings,
        keys: KeyStore,
        vnd: VndHandle,
        frames: mpsc::Receiver<Bytes>,
        hooks: Box<dyn HookRunner>,
    ) -> Daemon {
        let graph = Graph::new(&settings.name);
        let forwarder = Forwarder::new(
            settings.mode,
            settings.mac_expire,
            settings.priority_inheritance,
        );
        let peering = Peering::new(settings.name.clone(), settings.tunnel_server, keys);
        let (tunnel_events_tx, tunnel_events) = mpsc::channel(1024);
        let (handshakes_tx, handshakes) = mpsc::channel(64);
        // Replaced with the listener's channel once `run` binds it.
        let (_, inbound) = mpsc::channel(1);

        Daemon {
            settings,
            graph,
            forwarder,
            peering,
            hooks,
            vnd,
            frames,
            tunnel_events_tx,
            tunnel_events,
            inbound,
            handshakes_tx,
            handshakes,
            peers: HashMap::new(),
            by_node: HashMap::new(),
            outgoing: HashMap::new(),
            timers: Timers::new(),
            next_tunnel: 0,
        }
    }

    /// Bind the listener, open shop and run until a termination signal.
    pub async fn run(mut self) -> Result<()> {
        let bind_ip = self.settings.bind_address.unwrap_or(match self.settings.address_family {
            crate::settings::AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        });
        let listener = bind_listener(
            SocketAddr::new(bind_ip, self.settings.port),
            self.settings.bind_interface.as_deref(),
        )?;
        let (accept_tx, accept_rx) = mpsc::channel(16);
        self.inbound = accept_rx;
        let listener_task = spawn_listener(listener, accept_tx);

        self.startup();

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

        loop {
            let sleep_for = self.timers.timeout_next(Instant::now());

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("termination signal received, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("hangup signal received (configuration reload not supported, ignoring)");
                }
                Some((stream, addr)) = self.inbound.recv() => {
                    self.spawn_inbound_handshake(stream, addr);
                }
                Some(done) = self.handshakes.recv() => {
                    self.handle_handshake(done);
                }
                Some(message) = self.tunnel_events.recv() => {
                    self.handle_tunnel_message(message);
                }
                Some(frame) = self.frames.recv() => {
                    self.route_frame_from_host(&frame);
                }
                () = sleep(sleep_for) => {
                    self.fire_timers();
                }
            }
        }

        self.shutdown();
        listener_task.abort();
        Ok(())
    }

    /// Populate the graph with our configuration and arm the periodic
    /// timers.
    fn startup(&mut self) {
        let myself = self.graph.self_id();
        for subnet in self.settings.subnets.clone() {
            self.graph.subnet_add(myself, subnet, None);
        }
        self.graph.node_mut(myself).options = self.settings.options;

        let now = Instant::now();
        self.timers
            .schedule(now + AGE_INTERVAL, Some(AGE_INTERVAL), TimerKind::AgeSubnets);
        self.timers
            .schedule(now + SWEEP_INTERVAL, Some(SWEEP_INTERVAL), TimerKind::SweepSeen);
        self.timers.schedule(
            now + self.settings.key_expire,
            Some(self.settings.key_expire),
            TimerKind::RotateKeys,
        );

        for name in self.settings.connect_to.clone() {
            self.start_outgoing(&name);
        }

        self.hooks.run("tinc-up", &self.base_hook_env());
        info!(name = %self.settings.name, "daemon up");
    }

    fn shutdown(&mut self) {
        let ids: Vec<TunnelId> = self.peers.keys().copied().collect();
        for id in ids {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.tunnel.close();
            }
        }
        self.hooks.run("tinc-down", &self.base_hook_env());
    }

    fn base_hook_env(&self) -> Vec<(String, String)> {
        vec![
            (
                "NETNAME".to_owned(),
                self.settings.netname.clone().unwrap_or_default(),
            ),
            ("DEVICE".to_owned(), self.vnd.device().to_owned()),
            ("INTERFACE".to_owned(), self.vnd.interface().to_owned()),
        ]
    }

    // --- connection management -----------------------------------------

    fn spawn_inbound_handshake(&mut self, stream: TcpStream, addr: SocketAddr) {
        debug!(%addr, "accepted incoming connection");
        let name = self.settings.name.clone();
        let tx = self.handshakes_tx.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, RecordCodec);
            let result = PlainHandshaker
                .handshake(&mut framed, Side::Accept, &name, None)
                .await
                .map(|peer| (framed, peer));
            let _ = tx.send(HandshakeDone {
                result,
                outgoing: None,
            })
            .await;
        });
    }

    fn start_outgoing(&mut self, name: &str) {
        if name == self.settings.name {
            warn!(name, "cannot connect to ourself");
            return;
        }
        // Already connected (or an attempt is in flight)?
        if let Some(node) = self.graph.node_by_name(name) {
            if self.by_node.contains_key(&node) {
                debug!(name, "already connected");
                return;
            }
        }
        let state = self.outgoing.entry(name.to_owned()).or_default();
        if state.connecting {
            return;
        }
        state.connecting = true;

        let host = match self.settings.host_config(name) {
            Ok(host) => host,
            Err(e) => {
                warn!(name, "cannot read host configuration: {e}");
                if let Some(state) = self.outgoing.get_mut(name) {
                    state.connecting = false;
                }
                self.retry_outgoing(name);
                return;
            }
        };
        let Some(address) = host.get_string("Address", None) else {
            warn!(name, "no Address known for outgoing connection");
            if let Some(state) = self.outgoing.get_mut(name) {
                state.connecting = false;
            }
            self.retry_outgoing(name);
            return;
        };
        let port = host.get_string("Port", Some("655")).unwrap_or_default();
        let family = self.settings.address_family;
        let my_name = self.settings.name.clone();
        let expected = name.to_owned();
        let tx = self.handshakes_tx.clone();

        info!(name, %address, "trying to connect");
        tokio::spawn(async move {
            let result = dial(&address, &port, family, &my_name, &expected).await;
            let _ = tx.send(HandshakeDone {
                result,
                outgoing: Some(expected),
            })
            .await;
        });
    }

    fn retry_outgoing(&mut self, name: &str) {
        let state = self.outgoing.entry(name.to_owned()).or_default();
        state.timeout = (state.timeout + RETRY_STEP).min(self.settings.max_timeout);
        let deadline = Instant::now() + state.timeout;
        info!(
            name,
            after = state.timeout.as_secs(),
            "trying to re-establish outgoing connection"
        );
        self.timers
            .schedule(deadline, None, TimerKind::RetryOutgoing(name.to_owned()));
    }

    fn handle_handshake(&mut self, done: HandshakeDone) {
        if let Some(name) = &done.outgoing {
            if let Some(state) = self.outgoing.get_mut(name) {
                state.connecting = false;
            }
        }

        let (framed, peer_name) = match done.result {
            Ok(ok) => ok,
            Err(e) => {
                warn!("handshake failed: {e}");
                if let Some(name) = done.outgoing {
                    self.retry_outgoing(&name);
                }
                return;
            }
        };

        // The identity must belong to a configured host.
        if !self.settings.knows_host(&peer_name) {
            warn!(peer = %peer_name, "peer has unknown identity");
            if let Some(name) = done.outgoing {
                self.retry_outgoing(&name);
            }
            return;
        }
        let host = match self.settings.host_config(&peer_name) {
            Ok(host) => host,
            Err(e) => {
                warn!(peer = %peer_name, "cannot read host configuration: {e}");
                return;
            }
        };

        self.next_tunnel += 1;
        let id = TunnelId(self.next_tunnel);
        let mut tunnel = Tunnel::start(
            id,
            peer_name.clone(),
            DEFAULT_MTU,
            framed,
            self.tunnel_events_tx.clone(),
        );

        // Clamp the path MTU from configuration, ours and theirs.
        let mut mtu = DEFAULT_MTU;
        if let Some(pmtu) = self.settings.pmtu {
            mtu = mtu.min(pmtu);
        }
        if let Some(Ok(pmtu)) = host.first("PMTU").map(|e| e.as_int()) {
            mtu = mtu.min(pmtu as u16);
        }
        tunnel.set_mtu(mtu);
        // Mirror the clamp on the node's forwarding scratch.
        let node = self.graph.ensure_node(&peer_name);
        let clamped = self.graph.node(node).mtu.min(mtu);
        self.graph.node_mut(node).mtu = clamped;

        let now = Instant::now();
        let ping_timer = self.timers.schedule(
            now + self.settings.ping_timeout,
            Some(self.settings.ping_timeout),
            TimerKind::PingCheck(id),
        );

        let peer = Peer {
            tunnel,
            node: None,
            active: false,
            outgoing: done.outgoing,
            host,
            started: now,
            last_heard: now,
            ping_outstanding: false,
            ping_timer,
        };

        // Identify ourselves; the peer answers with ACK.
        let _ = peer.tunnel.send_meta(Bytes::from(
            Request::Id {
                name: self.settings.name.clone(),
                version: PROTOCOL_VERSION,
            }
            .to_line(),
        ));
        self.peers.insert(id, peer);
    }

    // --- tunnel events -------------------------------------------------

    fn handle_tunnel_message(&mut self, message: TunnelMessage) {
        match message {
            TunnelMessage::Record { tunnel, record } => {
                let Some(peer) = self.peers.get_mut(&tunnel) else {
                    return;
                };
                peer.last_heard = Instant::now();
                peer.ping_outstanding = false;
                let peer_name = peer.tunnel.peer().to_owned();

                match record {
                    Record::Meta(payload) => {
                        let Ok(text) = std::str::from_utf8(&payload) else {
                            warn!(peer = %peer_name, "meta record is not ASCII");
                            self.close_tunnel(tunnel, "protocol error");
                            return;
                        };
                        for line in text.lines().map(str::to_owned).collect::<Vec<_>>() {
                            if line.is_empty() {
                                continue;
                            }
                            if let Err(e) = self.handle_meta_line(tunnel, &line) {
                                warn!(reason = %e, "closing tunnel after protocol error");
                                self.close_tunnel(tunnel, "protocol error");
                                return;
                            }
                        }
                    }
                    Record::Packet(payload) => self.route_frame_from_tunnel(tunnel, &payload),
                    Record::Hello(_) => {
                        self.close_tunnel(tunnel, "unexpected handshake record");
                    }
                }
            }
            TunnelMessage::Closed { tunnel, reason } => self.tunnel_gone(tunnel, &reason),
        }
    }

    fn handle_meta_line(&mut self, tunnel: TunnelId, line: &str) -> Result<()> {
        let request = Request::parse(line)?;
        debug!(%tunnel, %request, "got request");

        let peer = self
            .peers
            .get(&tunnel)
            .ok_or_else(|| Error::protocol("record from unknown tunnel"))?;

        if !peer.active {
            return match request {
                Request::Id { name, version } => self.activate_half(tunnel, name, version),
                Request::Ack {
                    port,
                    weight,
                    options,
                } => self.activate(tunnel, port, weight, options),
                _ => Err(Error::protocol("request before the connection is active")),
            };
        }

        let origin = Origin {
            tunnel,
            node: peer.node.ok_or_else(|| Error::protocol("active peer without node"))?,
        };
        let actions =
            self.peering
                .handle(&mut self.graph, origin, line, request, Instant::now())?;
        self.perform_actions(tunnel, actions);
        Ok(())
    }

    /// Got the peer's `ID`: verify and answer with `ACK`.
    fn activate_half(&mut self, tunnel: TunnelId, name: String, version: u32) -> Result<()> {
        let peer = self
            .peers
            .get_mut(&tunnel)
            .ok_or_else(|| Error::protocol("record from unknown tunnel"))?;

        if version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "peer {name} uses protocol version {version}, expected {PROTOCOL_VERSION}"
            )));
        }
        if name != peer.tunnel.peer() {
            return Err(Error::AuthFailed(format!(
                "peer identified as {name} but authenticated as {}",
                peer.tunnel.peer()
            )));
        }

        // Estimate the link weight from connection setup time, unless the
        // host file pins it.
        let mut weight = peer.started.elapsed().as_millis() as i32;
        if let Some(entry) = peer.host.first("Weight") {
            weight = entry.as_int()? as i32;
        }

        let mut options = self.settings.options;
        if peer.host.get_bool("IndirectData", false).unwrap_or(false) {
            options |= NodeOptions::INDIRECT;
        }
        if peer.host.get_bool("TCPOnly", false).unwrap_or(false) {
            options |= NodeOptions::TCP_ONLY | NodeOptions::INDIRECT;
        }
        if peer.host.get_bool("PMTUDiscovery", false).unwrap_or(false) {
            options |= NodeOptions::PMTU_DISCOVERY;
        }

        let _ = peer.tunnel.send_meta(Bytes::from(
            Request::Ack {
                port: self.settings.port,
                weight,
                options,
            }
            .to_line(),
        ));
        Ok(())
    }

    /// Got the peer's `ACK`: create the edge and go active.
    fn activate(
        &mut self,
        tunnel: TunnelId,
        port: u16,
        weight: i32,
        options: NodeOptions,
    ) -> Result<()> {
        let peer = self
            .peers
            .get_mut(&tunnel)
            .ok_or_else(|| Error::protocol("record from unknown tunnel"))?;
        let peer_name = peer.tunnel.peer().to_owned();
        let node = self.graph.ensure_node(&peer_name);

        // A second connection to the same node supersedes the old one.
        if let Some(&old) = self.by_node.get(&node) {
            if old != tunnel {
                info!(peer = %peer_name, "second connection established, closing the old one");
                self.close_tunnel(old, "superseded");
                self.recalculate();
            }
        }

        let peer = self
            .peers
            .get_mut(&tunnel)
            .ok_or_else(|| Error::protocol("record from unknown tunnel"))?;
        let mut estimate = peer.started.elapsed().as_millis() as i32;
        if let Some(entry) = peer.host.first("Weight") {
            estimate = entry.as_int()? as i32;
        }
        let weight = (weight + estimate) / 2;
        let options = options | self.settings.options;
        let address = SocketAddr::new(peer.tunnel.remote_addr().ip(), port);

        peer.active = true;
        peer.node = Some(node);
        self.by_node.insert(node, tunnel);
        if let Some(name) = peer.outgoing.clone() {
            // Success resets the retry backoff.
            self.outgoing.entry(name).or_default().timeout = Duration::ZERO;
        }
        info!(peer = %peer_name, "connection activated");

        let myself = self.graph.self_id();
        if let Some(stale) = self.graph.edge_between(myself, node) {
            self.graph.edge_del(stale);
        }
        let edge = self.graph.edge_add(myself, node, address, weight, options);

        // Tell the newcomer everything we know, tell everyone about the
        // new edge.
        let catalogue = send_everything(&self.graph, self.peering.tunnel_server);
        if let Some(peer) = self.peers.get(&tunnel) {
            for request in catalogue {
                let _ = peer.tunnel.send_meta(Bytes::from(request.to_line()));
            }
        }
        let announce = edge_request(&self.graph, edge);
        self.broadcast_request(None, &announce);

        self.recalculate();
        Ok(())
    }

    /// Tunnel died underneath us: drop our edge and tell the net.
    fn tunnel_gone(&mut self, tunnel: TunnelId, reason: &str) {
        let Some(peer) = self.peers.remove(&tunnel) else {
            return;
        };
        self.timers.cancel(peer.ping_timer);
        info!(peer = peer.tunnel.peer(), reason, "connection closed");

        if let Some(node) = peer.node {
            if self.by_node.get(&node) == Some(&tunnel) {
                self.by_node.remove(&node);
            }

            let myself = self.graph.self_id();
            if let Some(edge) = self.graph.edge_between(myself, node) {
                self.graph.edge_del(edge);
                let announce = Request::DelEdge {
                    nonce: fresh_nonce(),
                    from: self.settings.name.clone(),
                    to: self.graph.node(node).name.clone(),
                };
                self.broadcast_request(Some(tunnel), &announce);
            }
            self.recalculate();
        }

        if let Some(name) = peer.outgoing {
            self.retry_outgoing(&name);
        }
    }

    fn close_tunnel(&mut self, tunnel: TunnelId, reason: &str) {
        if let Some(peer) = self.peers.get_mut(&tunnel) {
            peer.tunnel.close();
        }
        // The task reports `Closed`, which performs the cleanup; but the
        // edge must go now so routing stops using the tunnel.
        self.tunnel_gone(tunnel, reason);
    }

    // --- request plumbing ----------------------------------------------

    fn perform_actions(&mut self, origin: TunnelId, actions: Vec<Action>) {
        let mut rerun = false;
        for action in actions {
            match action {
                Action::Reply(request) => {
                    if let Some(peer) = self.peers.get(&origin) {
                        let _ = peer.tunnel.send_meta(Bytes::from(request.to_line()));
                    }
                }
                Action::Forward(request) => self.broadcast_request(Some(origin), &request),
                Action::RouteTo { node, request } => self.route_request(&node, &request),
                Action::RunGraph => rerun = true,
            }
        }
        if rerun {
            self.recalculate();
        }
    }

    /// Send to every active connection except `except`.
    fn broadcast_request(&mut self, except: Option<TunnelId>, request: &Request) {
        let line = request.to_line();
        for (id, peer) in &self.peers {
            if Some(*id) == except || !peer.active {
                continue;
            }
            let _ = peer.tunnel.send_meta(Bytes::from(line.clone()));
        }
    }

    /// Send along the unicast nexthop towards a named node.
    fn route_request(&mut self, node: &str, request: &Request) {
        let Some(id) = self.graph.node_by_name(node) else {
            warn!(node, "dropping request for unknown node");
            return;
        };
        let target = &self.graph.node(id);
        if !target.status.reachable {
            warn!(node, "dropping request for unreachable node");
            return;
        }
        let Some(hop) = target.nexthop else {
            return;
        };
        let Some(peer) = self.by_node.get(&hop).and_then(|tid| self.peers.get(tid)) else {
            warn!(node, "no connection towards node");
            return;
        };
        let _ = peer.tunnel.send_meta(Bytes::from(request.to_line()));
    }

    // --- forwarding ----------------------------------------------------

    fn route_frame_from_host(&mut self, frame: &[u8]) {
        let source = self.graph.self_id();
        self.route_frame(source, frame);
    }

    fn route_frame_from_tunnel(&mut self, tunnel: TunnelId, frame: &[u8]) {
        let Some(peer) = self.peers.get(&tunnel) else {
            return;
        };
        let Some(node) = peer.node.filter(|_| peer.active) else {
            debug!("dropping data frame on inactive connection");
            return;
        };
        self.route_frame(node, frame);
    }

    fn route_frame(&mut self, source: NodeId, frame: &[u8]) {
        let Daemon {
            graph,
            forwarder,
            peers,
            by_node,
            vnd,
            ..
        } = &mut *self;
        let mut io = DaemonIo {
            vnd,
            peers,
            by_node,
        };
        let learned = forwarder.route(graph, &mut io, source, frame, Instant::now());

        if let Some(subnet) = learned {
            let announce = Request::AddSubnet {
                nonce: fresh_nonce(),
                owner: self.settings.name.clone(),
                subnet,
            };
            self.broadcast_request(None, &announce);
        }
    }

    // --- derived state -------------------------------------------------

    /// Re-derive MST and BFS state and act on reachability transitions.
    fn recalculate(&mut self) {
        let changes = self.graph.recalculate();
        for change in changes {
            self.apply_reachability_change(change);
        }
    }

    fn apply_reachability_change(&mut self, change: ReachabilityChange) {
        let node = self.graph.node(change.node);
        let name = node.name.clone();
        let address = node.address;
        info!(
            node = %name,
            reachable = change.reachable,
            "node reachability changed"
        );

        let mut env = self.base_hook_env();
        env.push(("NODE".to_owned(), name.clone()));
        if let Some(addr) = address {
            env.push(("REMOTEADDRESS".to_owned(), addr.ip().to_string()));
            env.push(("REMOTEPORT".to_owned(), addr.port().to_string()));
        }
        let script = if change.reachable {
            format!("hosts/{name}-up")
        } else {
            format!("hosts/{name}-down")
        };
        self.hooks.run(&script, &env);

        if change.reachable {
            // Make sure we can address it: ask for its key if we hold none.
            if !self.peering.keys.has_key(&name) {
                let request = Request::ReqKey {
                    from: self.settings.name.clone(),
                    to: name.clone(),
                };
                self.route_request(&name, &request);
            }
        } else {
            self.peering.keys.invalidate(&name);
        }
    }

    // --- timers --------------------------------------------------------

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(expired) = self.timers.pop_due(now) {
            match expired.payload.clone() {
                TimerKind::PingCheck(tunnel) => {
                    if self.ping_check(tunnel, now) {
                        self.timers.requeue(expired);
                    }
                }
                TimerKind::RetryOutgoing(name) => {
                    self.start_outgoing(&name);
                }
                TimerKind::AgeSubnets => {
                    self.age_subnets(now);
                    self.timers.requeue(expired);
                }
                TimerKind::SweepSeen => {
                    self.peering.seen.sweep(now);
                    self.timers.requeue(expired);
                }
                TimerKind::RotateKeys => {
                    self.rotate_keys();
                    self.timers.requeue(expired);
                }
            }
        }
    }

    /// Returns false when the timer should be dropped (tunnel gone).
    fn ping_check(&mut self, tunnel: TunnelId, now: Instant) -> bool {
        let Some(peer) = self.peers.get_mut(&tunnel) else {
            return false;
        };
        if now.duration_since(peer.last_heard) < self.settings.ping_timeout {
            return true;
        }
        if peer.ping_outstanding {
            warn!(peer = peer.tunnel.peer(), "peer did not respond to ping, terminating");
            self.close_tunnel(tunnel, "ping timeout");
            return false;
        }
        peer.ping_outstanding = true;
        let _ = peer.tunnel.send_meta(Bytes::from(Request::Ping.to_line()));
        true
    }

    fn age_subnets(&mut self, now: Instant) {
        let myself = self.graph.self_id();
        for (owner, subnet) in self.graph.age_subnets(now) {
            if owner == myself {
                let announce = Request::DelSubnet {
                    nonce: fresh_nonce(),
                    owner: self.settings.name.clone(),
                    subnet,
                };
                self.broadcast_request(None, &announce);
            }
        }
    }

    fn rotate_keys(&mut self) {
        // Only worth announcing if someone ever asked for our key.
        if !self.peering.keys.my_key_used() {
            return;
        }
        self.peering.keys.regenerate();
        let announce = Request::KeyChanged {
            nonce: fresh_nonce(),
            name: self.settings.name.clone(),
        };
        self.broadcast_request(None, &announce);
    }
}

async fn sleep(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Resolve and dial an outgoing connection, then run the handshake.
async fn dial(
    address: &str,
    port: &str,
    family: crate::settings::AddressFamily,
    my_name: &str,
    expected: &str,
) -> Result<(Framed<TcpStream, RecordCodec>, String)> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((address, port.parse::<u16>()
        .map_err(|_| Error::config(format!("invalid port {port}")))?))
    .await?
    .filter(|addr| family.admits(&addr.ip()))
    .collect();

    if candidates.is_empty() {
        return Err(Error::config(format!("no usable address for {address}")));
    }

    let mut last_error = Error::TunnelClosed;
    for candidate in candidates {
        match TcpStream::connect(candidate).await {
            Ok(stream) => {
                tune_stream(&stream);
                let mut framed = Framed::new(stream, RecordCodec);
                let peer = PlainHandshaker
                    .handshake(&mut framed, Side::Connect, my_name, Some(expected))
                    .await?;
                return Ok((framed, peer));
            }
            Err(e) => {
                debug!(%candidate, "connect failed: {e}");
                last_error = Error::Io(e);
            }
        }
    }
    Err(last_error)
}
