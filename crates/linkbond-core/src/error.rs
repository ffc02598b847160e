//! Engine error types

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Engine errors
///
/// Almost everything the engine sees off the wire is logged and dropped
/// rather than raised; the variants here are the few conditions the daemon
/// must act on.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The peer speaks a different protocol version. Misconfiguration, the
    /// daemon cannot proceed safely.
    #[error("protocol error: {0}")]
    Protocol(#[from] linkbond_protocol::ProtocolError),

    /// Too many spliced TCP flows
    #[error("flow limit reached ({0} active)")]
    FlowLimit(usize),
}
