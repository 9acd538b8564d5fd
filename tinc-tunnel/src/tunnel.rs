//! Tunnel handles and their I/O task.
//!
//! Each established tunnel is driven by one task that owns the framed
//! stream. Inbound records are forwarded to the daemon over a shared
//! channel (per-tunnel order preserved); outbound records drain from a
//! bounded per-tunnel queue so a slow peer can never stall the daemon's
//! event loop.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use socket2::SockRef;
use tinc_core::{Error, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::record::{Record, RecordCodec};

/// Identifies one tunnel for the lifetime of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(pub u64);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tnl{}", self.0)
    }
}

/// Tunnel lifecycle. Only `Up` tunnels carry routing traffic; `Down` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Down,
    Connecting,
    Handshake,
    Up,
}

/// Event delivered from a tunnel task to the daemon.
#[derive(Debug)]
pub enum TunnelMessage {
    /// One inbound record; emitted exactly once per record.
    Record { tunnel: TunnelId, record: Record },
    /// The tunnel died (remote close, I/O error, protocol error).
    Closed { tunnel: TunnelId, reason: String },
}

enum Command {
    Send(Record),
    /// Copy a TOS / traffic-class byte onto the transport socket before
    /// the next send (priority inheritance).
    SetTos(u32),
    Shutdown,
}

/// Daemon-side handle to an established tunnel.
pub struct Tunnel {
    id: TunnelId,
    peer: String,
    remote: SocketAddr,
    mtu: u16,
    status: TunnelStatus,
    commands: mpsc::Sender<Command>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("mtu", &self.mtu)
            .field("status", &self.status)
            .finish()
    }
}

impl Tunnel {
    /// Take over an authenticated stream: spawn its I/O task and return
    /// the handle, already in the `Up` state.
    pub fn start(
        id: TunnelId,
        peer: String,
        mtu: u16,
        stream: Framed<TcpStream, RecordCodec>,
        events: mpsc::Sender<TunnelMessage>,
    ) -> Tunnel {
        let (commands, rx) = mpsc::channel(1024);
        let remote = stream
            .get_ref()
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

        tokio::spawn(run_tunnel(id, stream, rx, events));

        Tunnel {
            id,
            peer,
            remote,
            mtu,
            status: TunnelStatus::Up,
            commands,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// The verified identity of the far end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Observed path MTU. May change at any time (e.g. configuration or
    /// future discovery); the forwarding plane reads it per packet.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    pub fn status(&self) -> TunnelStatus {
        self.status
    }

    pub fn is_up(&self) -> bool {
        self.status == TunnelStatus::Up
    }

    /// Queue a meta record. Fails with `TunnelClosed` when the peer is
    /// gone or the send queue is exhausted.
    pub fn send_meta(&self, data: Bytes) -> Result<()> {
        self.enqueue(Record::Meta(data))
    }

    /// Queue a data frame.
    pub fn send_packet(&self, data: Bytes) -> Result<()> {
        self.enqueue(Record::Packet(data))
    }

    /// Request a transport priority change before subsequent packets.
    pub fn inherit_priority(&self, tos: u32) {
        let _ = self.commands.try_send(Command::SetTos(tos));
    }

    /// Begin an orderly shutdown; the task emits `Closed` when done.
    pub fn close(&mut self) {
        self.status = TunnelStatus::Down;
        let _ = self.commands.try_send(Command::Shutdown);
    }

    fn enqueue(&self, record: Record) -> Result<()> {
        if self.status != TunnelStatus::Up {
            return Err(Error::TunnelClosed);
        }
        self.commands
            .try_send(Command::Send(record))
            .map_err(|_| Error::TunnelClosed)
    }
}

async fn run_tunnel(
    id: TunnelId,
    mut stream: Framed<TcpStream, RecordCodec>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<TunnelMessage>,
) {
    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(record)) => {
                    if let Err(e) = stream.send(record).await {
                        break format!("send failed: {e}");
                    }
                }
                Some(Command::SetTos(tos)) => {
                    let sock = SockRef::from(stream.get_ref());
                    if let Err(e) = sock.set_tos(tos) {
                        debug!(%id, "cannot set TOS: {e}");
                    }
                }
                Some(Command::Shutdown) | None => break "closed locally".to_owned(),
            },
            inbound = stream.next() => match inbound {
                Some(Ok(record)) => {
                    if events
                        .send(TunnelMessage::Record { tunnel: id, record })
                        .await
                        .is_err()
                    {
                        return; // daemon is gone
                    }
                }
                Some(Err(e)) => break format!("receive failed: {e}"),
                None => break "connection closed by peer".to_owned(),
            },
        }
    };

    // Flush whatever is still queued before reporting the close.
    while let Ok(Command::Send(record)) = commands.try_recv() {
        if stream.send(record).await.is_err() {
            break;
        }
    }
    let _ = stream.close().await;

    warn!(%id, %reason, "tunnel down");
    let _ = events.send(TunnelMessage::Closed { tunnel: id, reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{Handshaker, PlainHandshaker, Side};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Tunnel, mpsc::Receiver<TunnelMessage>, Tunnel, mpsc::Receiver<TunnelMessage>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) =
            tokio::join!(TcpStream::connect(addr), listener.accept());

        let mut client = Framed::new(client.unwrap(), RecordCodec);
        let mut server = Framed::new(server.unwrap().0, RecordCodec);
        let hs = PlainHandshaker;
        let (peer_of_a, peer_of_b) = tokio::join!(
            hs.handshake(&mut client, Side::Connect, "alpha", Some("beta")),
            hs.handshake(&mut server, Side::Accept, "beta", None),
        );

        let (tx_a, rx_a) = mpsc::channel(64);
        let (tx_b, rx_b) = mpsc::channel(64);
        let a = Tunnel::start(TunnelId(1), peer_of_a.unwrap(), 1500, client, tx_a);
        let b = Tunnel::start(TunnelId(2), peer_of_b.unwrap(), 1500, server, tx_b);
        (a, rx_a, b, rx_b)
    }

    #[tokio::test]
    async fn records_flow_both_ways_in_order() {
        let (a, mut rx_a, b, mut rx_b) = connected_pair().await;
        assert_eq!(a.peer(), "beta");
        assert_eq!(b.peer(), "alpha");

        a.send_meta(Bytes::from_static(b"8\n")).unwrap();
        a.send_packet(Bytes::from_static(&[1, 2, 3])).unwrap();

        match rx_b.recv().await.unwrap() {
            TunnelMessage::Record { record, .. } => {
                assert_eq!(record, Record::Meta(Bytes::from_static(b"8\n")))
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx_b.recv().await.unwrap() {
            TunnelMessage::Record { record, .. } => {
                assert_eq!(record, Record::Packet(Bytes::from_static(&[1, 2, 3])))
            }
            other => panic!("unexpected {other:?}"),
        }

        b.send_meta(Bytes::from_static(b"9\n")).unwrap();
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            TunnelMessage::Record { .. }
        ));
    }

    #[tokio::test]
    async fn close_is_terminal_and_reported() {
        let (mut a, _rx_a, _b, mut rx_b) = connected_pair().await;
        a.close();
        assert!(a.send_meta(Bytes::from_static(b"8\n")).is_err());

        match rx_b.recv().await.unwrap() {
            TunnelMessage::Closed { tunnel, .. } => assert_eq!(tunnel, TunnelId(2)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
