#![forbid(unsafe_code)]

//! Tunnels: reliable, in-order, authenticated duplex channels carrying
//! length-prefixed records between daemons.
//!
//! A tunnel delivers two kinds of records to the routing core: `PACKET`
//! (opaque data frame) and `META` (control text). A third kind, `HELLO`,
//! is consumed during the handshake and never travels upward. The
//! cryptographic part of the handshake sits behind the [`Handshaker`]
//! seam; the shipped [`PlainHandshaker`] exchanges and checks identities
//! only.

mod handshake;
mod listener;
mod record;
mod tunnel;

pub use handshake::{Handshaker, PlainHandshaker, Side};
pub use listener::{bind_listener, spawn_listener, tune_stream};
pub use record::{Record, RecordCodec, MAX_RECORD_PAYLOAD};
pub use tunnel::{Tunnel, TunnelId, TunnelMessage, TunnelStatus};
