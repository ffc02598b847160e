//! Tunnel message kinds
//!
//! Defines the packet types carried over a bonded tunnel.

use crate::{ProtocolError, Result};

/// Tunnel packet kind (first header field on the wire)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgKind {
    /// Aggregate IP payload read from the TUN device
    #[default]
    Data = 1,

    /// Aggregate payload retransmitted after a resend request
    DataResend = 2,

    /// Periodic liveness probe carrying the measured receive rate
    Keepalive = 3,

    /// Orderly teardown of one tunnel
    Disconnect = 4,

    /// Request to retransmit a range of tunnel sequence numbers
    Resend = 5,

    /// Authentication challenge
    Auth = 6,

    /// Authentication accepted
    AuthOk = 7,

    /// Open a spliced TCP flow toward the carried address
    TcpOpen = 8,

    /// Close a spliced TCP flow (ordered, consumes a flow sequence number)
    TcpClose = 9,

    /// Payload of a spliced TCP flow
    TcpData = 10,

    /// Bare cumulative acknowledgment for a spliced TCP flow
    TcpAck = 11,
}

impl MsgKind {
    /// Parse a message kind from its wire value
    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            1 => Ok(MsgKind::Data),
            2 => Ok(MsgKind::DataResend),
            3 => Ok(MsgKind::Keepalive),
            4 => Ok(MsgKind::Disconnect),
            5 => Ok(MsgKind::Resend),
            6 => Ok(MsgKind::Auth),
            7 => Ok(MsgKind::AuthOk),
            8 => Ok(MsgKind::TcpOpen),
            9 => Ok(MsgKind::TcpClose),
            10 => Ok(MsgKind::TcpData),
            11 => Ok(MsgKind::TcpAck),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    /// Wire value of this kind
    pub fn to_wire(self) -> u16 {
        self as u16
    }

    /// Aggregate data path (subject to the reorder buffer)
    pub fn is_aggregate(&self) -> bool {
        matches!(self, MsgKind::Data | MsgKind::DataResend)
    }

    /// Belongs to a spliced TCP flow
    pub fn is_flow(&self) -> bool {
        matches!(
            self,
            MsgKind::TcpOpen | MsgKind::TcpClose | MsgKind::TcpData | MsgKind::TcpAck
        )
    }
}

impl std::fmt::Display for MsgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MsgKind::Data => "DATA",
            MsgKind::DataResend => "DATA_RESEND",
            MsgKind::Keepalive => "KEEPALIVE",
            MsgKind::Disconnect => "DISCONNECT",
            MsgKind::Resend => "RESEND",
            MsgKind::Auth => "AUTH",
            MsgKind::AuthOk => "AUTH_OK",
            MsgKind::TcpOpen => "TCP_OPEN",
            MsgKind::TcpClose => "TCP_CLOSE",
            MsgKind::TcpData => "TCP_DATA",
            MsgKind::TcpAck => "TCP_ACK",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            MsgKind::Data,
            MsgKind::DataResend,
            MsgKind::Keepalive,
            MsgKind::Disconnect,
            MsgKind::Resend,
            MsgKind::Auth,
            MsgKind::AuthOk,
            MsgKind::TcpOpen,
            MsgKind::TcpClose,
            MsgKind::TcpData,
            MsgKind::TcpAck,
        ] {
            assert_eq!(MsgKind::from_wire(kind.to_wire()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(MsgKind::from_wire(0).is_err());
        assert!(MsgKind::from_wire(12).is_err());
    }
}
