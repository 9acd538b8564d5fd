//! Tunnel record framing.
//!
//! On the wire every record is `u16 type, u16 len, u8 data[len]` in
//! network byte order. Reassembly never buffers more than 4 KiB per
//! tunnel; a record that would exceed that, or an unknown type, is a
//! protocol error and terminates the tunnel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tinc_core::Error;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 4;
const MAX_BUFFER: usize = 4096;

/// Largest payload a single record may carry.
pub const MAX_RECORD_PAYLOAD: usize = MAX_BUFFER - HEADER_LEN;

const TYPE_PACKET: u16 = 0;
const TYPE_META: u16 = 1;
const TYPE_HELLO: u16 = 2;

/// One framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// An opaque data frame for the forwarding plane.
    Packet(Bytes),
    /// A line of meta-protocol text.
    Meta(Bytes),
    /// Handshake payload; consumed before a tunnel comes up.
    Hello(Bytes),
}

impl Record {
    fn wire_type(&self) -> u16 {
        match self {
            Record::Packet(_) => TYPE_PACKET,
            Record::Meta(_) => TYPE_META,
            Record::Hello(_) => TYPE_HELLO,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Record::Packet(data) | Record::Meta(data) | Record::Hello(data) => data,
        }
    }
}

/// Codec for the record framing, usable on any byte stream.
#[derive(Debug, Default)]
pub struct RecordCodec;

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let wire_type = u16::from_be_bytes([src[0], src[1]]);
        let len = u16::from_be_bytes([src[2], src[3]]) as usize;

        if len > MAX_RECORD_PAYLOAD {
            return Err(Error::protocol(format!(
                "record of {len} bytes overflows the reassembly buffer"
            )));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(len).freeze();

        match wire_type {
            TYPE_PACKET => Ok(Some(Record::Packet(data))),
            TYPE_META => Ok(Some(Record::Meta(data))),
            TYPE_HELLO => Ok(Some(Record::Hello(data))),
            other => Err(Error::protocol(format!("unknown record type {other}"))),
        }
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = Error;

    fn encode(&mut self, record: Record, dst: &mut BytesMut) -> Result<(), Error> {
        let payload = record.payload();
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(Error::protocol(format!(
                "record payload of {} bytes exceeds the maximum",
                payload.len()
            )));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u16(record.wire_type());
        dst.put_u16(payload.len() as u16);
        dst.extend_from_slice(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_header_in_network_order() {
        let mut codec = RecordCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Record::Meta(Bytes::from_static(b"8\n")), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0, 1, 0, 2, b'8', b'\n']);
    }

    #[test]
    fn decodes_split_deliveries() {
        let mut codec = RecordCodec;
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0, 0, 0, 4, 0xde, 0xad]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&[0xbe, 0xef]);
        let record = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(record, Record::Packet(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_records() {
        let mut codec = RecordCodec;
        let mut buf = BytesMut::new();
        codec.encode(Record::Hello(Bytes::from_static(b"a 17")), &mut buf).unwrap();
        codec.encode(Record::Meta(Bytes::from_static(b"9\n")), &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Record::Hello(Bytes::from_static(b"a 17"))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Record::Meta(Bytes::from_static(b"9\n"))
        );
    }

    #[test]
    fn oversize_and_unknown_types_are_protocol_errors() {
        let mut codec = RecordCodec;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0xff, 0xff]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 9, 0, 0]);
        assert!(codec.decode(&mut buf).is_err());

        let big = Bytes::from(vec![0u8; MAX_RECORD_PAYLOAD + 1]);
        let mut out = BytesMut::new();
        assert!(codec.encode(Record::Packet(big), &mut out).is_err());
    }
}
