//! Tunnel handshake seam.
//!
//! The cryptographic handshake is outside the scope of the routing core;
//! what the core needs is a verified peer identity. [`Handshaker`]
//! captures exactly that contract, and [`PlainHandshaker`] implements the
//! identity exchange without cryptography: both ends send a `HELLO`
//! record carrying `name protocol-version` and verify what they read.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tinc_core::{valid_node_name, Error, Result, PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::record::{Record, RecordCodec};

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// We dialed out and know who we expect on the other end.
    Connect,
    /// We accepted the connection.
    Accept,
}

/// Performs the authentication exchange on a fresh connection and yields
/// the verified peer identity.
#[async_trait]
pub trait Handshaker: Send + Sync {
    async fn handshake(
        &self,
        stream: &mut Framed<TcpStream, RecordCodec>,
        side: Side,
        local_name: &str,
        expected_peer: Option<&str>,
    ) -> Result<String>;
}

/// Identity-only handshake. Stands in for a TLS-style handshake; the
/// identity it yields is taken on faith, which is acceptable only inside
/// an administratively trusted deployment.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainHandshaker;

#[async_trait]
impl Handshaker for PlainHandshaker {
    async fn handshake(
        &self,
        stream: &mut Framed<TcpStream, RecordCodec>,
        side: Side,
        local_name: &str,
        expected_peer: Option<&str>,
    ) -> Result<String> {
        let hello = format!("{local_name} {PROTOCOL_VERSION}");
        stream.send(Record::Hello(Bytes::from(hello))).await?;

        let record = stream
            .next()
            .await
            .ok_or(Error::TunnelClosed)?
            .map_err(|e| Error::auth(format!("handshake failed: {e}")))?;

        let Record::Hello(payload) = record else {
            return Err(Error::auth("peer sent data before identifying"));
        };
        let text = std::str::from_utf8(&payload)
            .map_err(|_| Error::auth("handshake payload is not ASCII"))?;

        let mut fields = text.split_ascii_whitespace();
        let name = fields.next().unwrap_or_default();
        let version: u32 = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::auth(format!("malformed hello from {name:?}")))?;

        if !valid_node_name(name) {
            return Err(Error::auth(format!("invalid peer name {name:?}")));
        }
        if version != PROTOCOL_VERSION {
            return Err(Error::auth(format!(
                "peer {name} speaks protocol {version}, we speak {PROTOCOL_VERSION}"
            )));
        }
        if let Some(expected) = expected_peer {
            if name != expected {
                return Err(Error::auth(format!(
                    "peer identifies as {name} instead of {expected}"
                )));
            }
        }

        debug!(peer = name, ?side, "handshake complete");
        Ok(name.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Framed<TcpStream, RecordCodec>, Framed<TcpStream, RecordCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (
            Framed::new(client.unwrap(), RecordCodec),
            Framed::new(server.unwrap().0, RecordCodec),
        )
    }

    #[tokio::test]
    async fn identities_are_exchanged() {
        let (mut client, mut server) = pair().await;
        let hs = PlainHandshaker;
        let (a, b) = tokio::join!(
            hs.handshake(&mut client, Side::Connect, "alpha", Some("beta")),
            hs.handshake(&mut server, Side::Accept, "beta", None),
        );
        assert_eq!(a.unwrap(), "beta");
        assert_eq!(b.unwrap(), "alpha");
    }

    #[tokio::test]
    async fn unexpected_identity_fails() {
        let (mut client, mut server) = pair().await;
        let hs = PlainHandshaker;
        let (a, _) = tokio::join!(
            hs.handshake(&mut client, Side::Connect, "alpha", Some("gamma")),
            hs.handshake(&mut server, Side::Accept, "beta", None),
        );
        assert!(matches!(a, Err(Error::AuthFailed(_))));
    }

    #[tokio::test]
    async fn data_before_hello_fails() {
        let (mut client, mut server) = pair().await;
        client
            .send(Record::Packet(Bytes::from_static(&[0u8; 14])))
            .await
            .unwrap();
        let hs = PlainHandshaker;
        let result = hs
            .handshake(&mut server, Side::Accept, "beta", None)
            .await;
        assert!(matches!(result, Err(Error::AuthFailed(_))));
    }
}
