//! Control payloads
//!
//! Payload encodings for the non-data message kinds: the authentication
//! challenge, the retransmission request, the TCP-open destination address,
//! and the keepalive rate report.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::{PROTOCOL_VERSION, ProtocolError, Result};

/// Fixed width of the password field on the wire
const PASSWORD_FIELD: usize = 64;

/// Challenge direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChallengeKind {
    /// Initial challenge from the connecting side
    Auth = 1,
    /// Acceptance from the answering side
    Ok = 2,
}

/// Authentication payload carried by AUTH and AUTH_OK packets
///
/// The password travels in the clear; this is shared-secret gating, not
/// cryptography.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Challenge direction
    pub kind: ChallengeKind,
    /// Protocol version of the sender
    pub version: u16,
    /// The sender's remaining quota budget in bytes, 0 when unmetered
    pub permitted: u64,
    /// Shared secret
    pub password: String,
}

impl Challenge {
    /// Wire size of an encoded challenge
    pub const SIZE: usize = 1 + 2 + 8 + PASSWORD_FIELD;

    /// Build a challenge at the current protocol version
    pub fn new(kind: ChallengeKind, permitted: u64, password: &str) -> Self {
        Self {
            kind,
            version: PROTOCOL_VERSION,
            permitted,
            password: password.to_owned(),
        }
    }

    /// Encode into a wire payload
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.version);
        buf.put_u64(self.permitted);
        let mut field = [0u8; PASSWORD_FIELD];
        let n = self.password.len().min(PASSWORD_FIELD - 1);
        field[..n].copy_from_slice(&self.password.as_bytes()[..n]);
        buf.put_slice(&field);
    }

    /// Decode from a wire payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::PacketTooShort {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        let kind = match data[0] {
            1 => ChallengeKind::Auth,
            2 => ChallengeKind::Ok,
            other => {
                return Err(ProtocolError::InvalidPayload(format!(
                    "bad challenge kind {other}"
                )));
            }
        };
        let version = u16::from_be_bytes([data[1], data[2]]);
        let permitted = u64::from_be_bytes(data[3..11].try_into().unwrap());
        let field = &data[11..11 + PASSWORD_FIELD];
        let end = field.iter().position(|&b| b == 0).unwrap_or(PASSWORD_FIELD);
        let password = String::from_utf8_lossy(&field[..end]).into_owned();
        Ok(Self {
            kind,
            version,
            permitted,
            password,
        })
    }
}

/// Retransmission request payload
///
/// Asks the peer to replay `len` packets of tunnel `tun_id` starting at
/// tunnel sequence `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendRequest {
    /// Id of the tunnel the loss was observed on
    pub tun_id: u16,
    /// First missing tunnel sequence number
    pub seq: u16,
    /// Number of consecutive sequence numbers requested
    pub len: u16,
}

impl ResendRequest {
    const MAGIC: [u8; 2] = *b"RS";

    /// Wire size of an encoded request
    pub const SIZE: usize = 2 + 2 + 2 + 2;

    /// Encode into a wire payload
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_slice(&Self::MAGIC);
        buf.put_u16(self.seq);
        buf.put_u16(self.tun_id);
        buf.put_u16(self.len);
    }

    /// Decode from a wire payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::PacketTooShort {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[..2] != Self::MAGIC {
            return Err(ProtocolError::InvalidPayload("bad resend magic".into()));
        }
        Ok(Self {
            seq: u16::from_be_bytes([data[2], data[3]]),
            tun_id: u16::from_be_bytes([data[4], data[5]]),
            len: u16::from_be_bytes([data[6], data[7]]),
        })
    }
}

/// Encode the destination address a TCP_OPEN asks the peer to dial
pub fn encode_open_addr(addr: SocketAddr, buf: &mut BytesMut) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_u16(v4.port());
            buf.put_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_u16(v6.port());
            buf.put_slice(&v6.ip().octets());
        }
    }
}

/// Decode the destination address carried by a TCP_OPEN
pub fn decode_open_addr(data: &[u8]) -> Result<SocketAddr> {
    if data.len() < 3 {
        return Err(ProtocolError::PacketTooShort {
            expected: 3,
            got: data.len(),
        });
    }
    let port = u16::from_be_bytes([data[1], data[2]]);
    match data[0] {
        4 => {
            if data.len() < 7 {
                return Err(ProtocolError::PacketTooShort {
                    expected: 7,
                    got: data.len(),
                });
            }
            let octets: [u8; 4] = data[3..7].try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        6 => {
            if data.len() < 19 {
                return Err(ProtocolError::PacketTooShort {
                    expected: 19,
                    got: data.len(),
                });
            }
            let octets: [u8; 16] = data[3..19].try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(ProtocolError::InvalidPayload(format!(
            "bad address family {other}"
        ))),
    }
}

/// Encode the keepalive payload: the measured inbound rate in kbit/s as
/// ASCII decimal.
pub fn encode_keepalive(bandwidth_kbps: u64) -> Vec<u8> {
    bandwidth_kbps.to_string().into_bytes()
}

/// Decode a keepalive payload; returns 0 on garbage rather than erroring,
/// a keepalive is still proof of life.
pub fn decode_keepalive(data: &[u8]) -> u64 {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim_end_matches('\0').parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_roundtrip() {
        let challenge = Challenge::new(ChallengeKind::Auth, 123_456, "hunter2");
        let mut buf = BytesMut::new();
        challenge.encode(&mut buf);
        assert_eq!(buf.len(), Challenge::SIZE);
        assert_eq!(Challenge::decode(&buf).unwrap(), challenge);
    }

    #[test]
    fn test_challenge_password_truncated() {
        let long = "x".repeat(200);
        let challenge = Challenge::new(ChallengeKind::Ok, 0, &long);
        let mut buf = BytesMut::new();
        challenge.encode(&mut buf);
        let decoded = Challenge::decode(&buf).unwrap();
        assert_eq!(decoded.password.len(), 63);
    }

    #[test]
    fn test_resend_request_roundtrip() {
        let req = ResendRequest {
            tun_id: 5000,
            seq: 0xfffd,
            len: 1024,
        };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(ResendRequest::decode(&buf).unwrap(), req);
    }

    #[test]
    fn test_resend_bad_magic() {
        assert!(ResendRequest::decode(b"XX\x00\x01\x00\x02\x00\x03").is_err());
    }

    #[test]
    fn test_open_addr_roundtrip() {
        for addr in ["127.0.0.1:8080", "[::1]:443"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let mut buf = BytesMut::new();
            encode_open_addr(addr, &mut buf);
            assert_eq!(decode_open_addr(&buf).unwrap(), addr);
        }
    }

    #[test]
    fn test_keepalive_payload() {
        assert_eq!(decode_keepalive(&encode_keepalive(18_000)), 18_000);
        assert_eq!(decode_keepalive(b"not a number"), 0);
    }
}
