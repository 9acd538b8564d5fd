//! Request grammar.
//!
//! A request is one line of ASCII: a decimal opcode followed by
//! space-separated fields. Integers are decimal; nonces and option masks
//! are hex. Malformed requests are protocol errors and cost the sender its
//! tunnel.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use rand::Rng;
use tinc_core::{valid_node_name, Error, NodeOptions, Result};
use tinc_routing::Subnet;

const ID: u32 = 0;
const ACK: u32 = 4;
const PING: u32 = 8;
const PONG: u32 = 9;
const ADD_SUBNET: u32 = 10;
const DEL_SUBNET: u32 = 11;
const ADD_EDGE: u32 = 12;
const DEL_EDGE: u32 = 13;
const KEY_CHANGED: u32 = 14;
const REQ_KEY: u32 = 15;
const ANS_KEY: u32 = 16;

/// A parsed meta-protocol request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Identify self; sent first on every tunnel.
    Id { name: String, version: u32 },
    /// Finalise peering: the sender's listening port, its weight estimate
    /// for the link, and its option mask.
    Ack {
        port: u16,
        weight: i32,
        options: NodeOptions,
    },
    Ping,
    Pong,
    AddSubnet {
        nonce: u32,
        owner: String,
        subnet: Subnet,
    },
    DelSubnet {
        nonce: u32,
        owner: String,
        subnet: Subnet,
    },
    AddEdge {
        nonce: u32,
        from: String,
        to: String,
        address: IpAddr,
        port: u16,
        options: NodeOptions,
        weight: i32,
    },
    DelEdge {
        nonce: u32,
        from: String,
        to: String,
    },
    /// The named node rotated its keys; cached material is stale.
    KeyChanged { nonce: u32, name: String },
    /// `from` wants `to`'s packet key; routed towards `to`.
    ReqKey { from: String, to: String },
    /// Key material answer, routed towards `to`.
    AnsKey {
        from: String,
        to: String,
        cipher_key: String,
        digest_key: String,
        cipher: i32,
        digest: i32,
        maclength: i32,
        compression: i32,
    },
}

/// A fresh randomised nonce for a mutation message.
pub fn fresh_nonce() -> u32 {
    rand::thread_rng().gen()
}

struct Fields<'a> {
    line: &'a str,
    iter: std::str::SplitAsciiWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn next(&mut self) -> Result<&'a str> {
        self.iter
            .next()
            .ok_or_else(|| Error::protocol(format!("truncated request: {}", self.line)))
    }

    fn name(&mut self) -> Result<String> {
        let field = self.next()?;
        if !valid_node_name(field) {
            return Err(Error::protocol(format!("invalid name in request: {field}")));
        }
        Ok(field.to_owned())
    }

    fn dec<T: FromStr>(&mut self) -> Result<T> {
        let field = self.next()?;
        field
            .parse()
            .map_err(|_| Error::protocol(format!("invalid field in request: {field}")))
    }

    fn hex(&mut self) -> Result<u32> {
        let field = self.next()?;
        u32::from_str_radix(field, 16)
            .map_err(|_| Error::protocol(format!("invalid hex field in request: {field}")))
    }

    fn subnet(&mut self) -> Result<Subnet> {
        let field = self.next()?;
        let subnet: Subnet = field
            .parse()
            .map_err(|_| Error::protocol(format!("invalid subnet in request: {field}")))?;
        if !subnet.is_network_address() {
            return Err(Error::protocol(format!(
                "subnet has bits set past its prefix: {field}"
            )));
        }
        Ok(subnet)
    }

    fn hexstr(&mut self) -> Result<String> {
        let field = self.next()?;
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::protocol(format!("invalid key material: {field}")));
        }
        Ok(field.to_owned())
    }

    fn finish(mut self) -> Result<()> {
        if self.iter.next().is_some() {
            return Err(Error::protocol(format!(
                "trailing fields in request: {}",
                self.line
            )));
        }
        Ok(())
    }
}

impl Request {
    /// Parse one request line (trailing newline tolerated).
    pub fn parse(line: &str) -> Result<Request> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = Fields {
            line,
            iter: line.split_ascii_whitespace(),
        };

        let opcode: u32 = fields.dec()?;
        let request = match opcode {
            ID => Request::Id {
                name: fields.name()?,
                version: fields.dec()?,
            },
            ACK => Request::Ack {
                port: fields.dec()?,
                weight: fields.dec()?,
                options: NodeOptions::from_bits(fields.hex()?),
            },
            PING => Request::Ping,
            PONG => Request::Pong,
            ADD_SUBNET => Request::AddSubnet {
                nonce: fields.hex()?,
                owner: fields.name()?,
                subnet: fields.subnet()?,
            },
            DEL_SUBNET => Request::DelSubnet {
                nonce: fields.hex()?,
                owner: fields.name()?,
                subnet: fields.subnet()?,
            },
            ADD_EDGE => Request::AddEdge {
                nonce: fields.hex()?,
                from: fields.name()?,
                to: fields.name()?,
                address: fields.dec()?,
                port: fields.dec()?,
                options: NodeOptions::from_bits(fields.hex()?),
                weight: fields.dec()?,
            },
            DEL_EDGE => Request::DelEdge {
                nonce: fields.hex()?,
                from: fields.name()?,
                to: fields.name()?,
            },
            KEY_CHANGED => Request::KeyChanged {
                nonce: fields.hex()?,
                name: fields.name()?,
            },
            REQ_KEY => Request::ReqKey {
                from: fields.name()?,
                to: fields.name()?,
            },
            ANS_KEY => Request::AnsKey {
                from: fields.name()?,
                to: fields.name()?,
                cipher_key: fields.hexstr()?,
                digest_key: fields.hexstr()?,
                cipher: fields.dec()?,
                digest: fields.dec()?,
                maclength: fields.dec()?,
                compression: fields.dec()?,
            },
            other => {
                return Err(Error::protocol(format!("unknown request opcode {other}")));
            }
        };

        fields.finish()?;
        Ok(request)
    }

    /// The wire line including its terminating newline.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }

    /// Mutation messages are applied locally and re-broadcast; targeted
    /// and point-to-point messages are not.
    pub fn is_broadcast_mutation(&self) -> bool {
        matches!(
            self,
            Request::AddSubnet { .. }
                | Request::DelSubnet { .. }
                | Request::AddEdge { .. }
                | Request::DelEdge { .. }
                | Request::KeyChanged { .. }
        )
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Id { name, version } => write!(f, "{ID} {name} {version}"),
            Request::Ack {
                port,
                weight,
                options,
            } => write!(f, "{ACK} {port} {weight} {options:x}"),
            Request::Ping => write!(f, "{PING}"),
            Request::Pong => write!(f, "{PONG}"),
            Request::AddSubnet {
                nonce,
                owner,
                subnet,
            } => write!(f, "{ADD_SUBNET} {nonce:x} {owner} {subnet}"),
            Request::DelSubnet {
                nonce,
                owner,
                subnet,
            } => write!(f, "{DEL_SUBNET} {nonce:x} {owner} {subnet}"),
            Request::AddEdge {
                nonce,
                from,
                to,
                address,
                port,
                options,
                weight,
            } => write!(
                f,
                "{ADD_EDGE} {nonce:x} {from} {to} {address} {port} {options:x} {weight}"
            ),
            Request::DelEdge { nonce, from, to } => {
                write!(f, "{DEL_EDGE} {nonce:x} {from} {to}")
            }
            Request::KeyChanged { nonce, name } => {
                write!(f, "{KEY_CHANGED} {nonce:x} {name}")
            }
            Request::ReqKey { from, to } => write!(f, "{REQ_KEY} {from} {to}"),
            Request::AnsKey {
                from,
                to,
                cipher_key,
                digest_key,
                cipher,
                digest,
                maclength,
                compression,
            } => write!(
                f,
                "{ANS_KEY} {from} {to} {cipher_key} {digest_key} {cipher} {digest} {maclength} {compression}"
            ),
        }
    }
}
