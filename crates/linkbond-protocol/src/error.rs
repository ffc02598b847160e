//! Protocol error types

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet too short for the structure being decoded
    #[error("packet too short: expected at least {expected}, got {got}")]
    PacketTooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        got: usize,
    },

    /// Unknown message kind
    #[error("unknown message kind: {0}")]
    UnknownKind(u16),

    /// Declared payload length disagrees with the datagram
    #[error("invalid payload length: declared {declared}, available {available}")]
    InvalidLength {
        /// Length field from the header
        declared: usize,
        /// Bytes actually present after the header
        available: usize,
    },

    /// Malformed control payload
    #[error("invalid control payload: {0}")]
    InvalidPayload(String),

    /// Peer speaks a different protocol version
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// Our protocol version
        ours: u16,
        /// The version the peer advertised
        theirs: u16,
    },
}
