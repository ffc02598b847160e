//! Tunnel Packet Parsing and Serialization
//!
//! Every datagram on a tunnel starts with the fixed header below, big-endian
//! on the wire, followed by `len` payload bytes. Hosts convert at this
//! boundary and nowhere else.

use bytes::{BufMut, BytesMut};

use crate::{MAX_PAYLOAD, MsgKind, ProtocolError, Result};

/// Size of the fixed tunnel header in bytes
pub const HEADER_SIZE: usize = 19;

/// Sentinel for an absent `timestamp_reply`
pub const TIMESTAMP_ABSENT: u16 = u16::MAX;

/// Fixed tunnel packet header
///
/// `len` is implied by the payload slice and is only materialized on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message kind
    pub kind: MsgKind,
    /// TCP flow id, 0 for non-flow traffic
    pub flow_id: u32,
    /// Per-flow or per-aggregate sequence number
    pub data_seq: u16,
    /// Per-tunnel sequence number, stamped at send time
    pub tun_seq: u16,
    /// Piggybacked cumulative flow acknowledgment
    pub ack_seq: u16,
    /// Sender's observed inbound loss over the last 64 packets (0..=64,
    /// pinned above 64 to force a lossy verdict)
    pub sent_loss: u8,
    /// Sender wall clock, milliseconds, truncated to 16 bits
    pub timestamp: u16,
    /// Echoed timestamp advanced by hold time, [`TIMESTAMP_ABSENT`] if none
    pub timestamp_reply: u16,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            kind: MsgKind::Data,
            flow_id: 0,
            data_seq: 0,
            tun_seq: 0,
            ack_seq: 0,
            sent_loss: 0,
            timestamp: 0,
            timestamp_reply: TIMESTAMP_ABSENT,
        }
    }
}

impl Header {
    /// Create a header of the given kind with all other fields defaulted
    pub fn new(kind: MsgKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Parse a datagram into its header and payload slice
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::PacketTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let kind = MsgKind::from_wire(u16::from_be_bytes([data[0], data[1]]))?;
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;

        if len > MAX_PAYLOAD || len > data.len() - HEADER_SIZE {
            return Err(ProtocolError::InvalidLength {
                declared: len,
                available: data.len() - HEADER_SIZE,
            });
        }

        let header = Self {
            kind,
            flow_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            data_seq: u16::from_be_bytes([data[8], data[9]]),
            tun_seq: u16::from_be_bytes([data[10], data[11]]),
            ack_seq: u16::from_be_bytes([data[12], data[13]]),
            sent_loss: data[14],
            timestamp: u16::from_be_bytes([data[15], data[16]]),
            timestamp_reply: u16::from_be_bytes([data[17], data[18]]),
        };

        Ok((header, &data[HEADER_SIZE..HEADER_SIZE + len]))
    }

    /// Serialize the header and payload into a wire datagram
    #[inline]
    pub fn serialize(&self, payload: &[u8], buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_u16(self.kind.to_wire());
        buf.put_u16(payload.len() as u16);
        buf.put_u32(self.flow_id);
        buf.put_u16(self.data_seq);
        buf.put_u16(self.tun_seq);
        buf.put_u16(self.ack_seq);
        buf.put_u8(self.sent_loss);
        buf.put_u16(self.timestamp);
        buf.put_u16(self.timestamp_reply);
        buf.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            kind: MsgKind::TcpData,
            flow_id: 7,
            data_seq: 0x1234,
            tun_seq: 0xfffe,
            ack_seq: 0x1230,
            sent_loss: 3,
            timestamp: 41_999,
            timestamp_reply: TIMESTAMP_ABSENT,
        };

        let mut buf = BytesMut::new();
        header.serialize(b"hello", &mut buf);
        assert_eq!(buf.len(), HEADER_SIZE + 5);

        let (parsed, payload) = Header::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = BytesMut::new();
        Header::new(MsgKind::Keepalive).serialize(&[], &mut buf);
        // kind = 3 in the first two big-endian bytes
        assert_eq!(&buf[..2], &[0x00, 0x03]);
    }

    #[test]
    fn test_truncated_rejected() {
        let mut buf = BytesMut::new();
        Header::new(MsgKind::Data).serialize(b"abc", &mut buf);
        assert!(Header::parse(&buf[..HEADER_SIZE + 1]).is_err());
        assert!(Header::parse(&buf[..4]).is_err());
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = BytesMut::new();
        Header::new(MsgKind::Disconnect).serialize(&[], &mut buf);
        let (_, payload) = Header::parse(&buf).unwrap();
        assert!(payload.is_empty());
    }
}
