//! Listening endpoint for inbound tunnels.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tinc_core::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// IPTOS_LOWDELAY, applied to meta connections like the original daemons.
const TOS_LOWDELAY: u32 = 0x10;

/// Bind a listening socket with the usual tuning applied; `device`
/// restricts it to one interface where the platform supports that.
pub fn bind_listener(addr: SocketAddr, device: Option<&str>) -> Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if addr.is_ipv4() {
        let _ = socket.set_tos(TOS_LOWDELAY);
    }
    if let Some(device) = device {
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
        socket.bind_device(Some(device.as_bytes()))?;
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
        warn!(device, "binding to an interface is not supported on this platform");
    }
    socket.bind(&addr.into())?;
    socket.listen(3)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!(%addr, "listening for tunnels");
    Ok(listener)
}

/// Per-stream socket tuning shared by inbound and outbound connections.
pub fn tune_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("cannot set TCP_NODELAY: {e}");
    }
    if stream.local_addr().map(|a| a.is_ipv4()).unwrap_or(false) {
        let _ = SockRef::from(stream).set_tos(TOS_LOWDELAY);
    }
}

/// Accept loop: hands each inbound stream to the daemon for its
/// handshake. Accept errors are transient; log and keep listening.
pub fn spawn_listener(
    listener: TcpListener,
    inbound: mpsc::Sender<(TcpStream, SocketAddr)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tune_stream(&stream);
                    if inbound.send((stream, addr)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_and_forwards_streams() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_listener(listener, tx);

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, peer) = rx.recv().await.unwrap();
        assert_eq!(peer.ip(), addr.ip());

        handle.abort();
    }
}
