//! Effects the engine asks the driver to perform

use std::net::SocketAddr;

use bytes::Bytes;

/// One effect drained from the engine after feeding it an event.
///
/// The driver performs these in order; none of them may re-enter the engine
/// synchronously.
#[derive(Debug)]
pub enum Output {
    /// Send a datagram on a tunnel's UDP socket
    Transmit {
        /// Engine index of the tunnel
        tunnel: usize,
        /// Destination address
        to: SocketAddr,
        /// Complete wire datagram
        datagram: Bytes,
    },
    /// Write an IP packet to the TUN device
    TunWrite(Bytes),
    /// Stop reading the TUN device (send buffer full)
    TunPause,
    /// Resume reading the TUN device
    TunResume,
    /// Dial the given address for a peer-opened TCP flow
    TcpConnect {
        /// Flow id minted by the peer
        flow: u32,
        /// Address the peer asked us to reach
        to: SocketAddr,
    },
    /// Write ordered payload to a flow's TCP socket; the driver reports
    /// completion via `on_tcp_write_done`
    TcpWrite {
        /// Flow id
        flow: u32,
        /// Payload chunk
        data: Bytes,
    },
    /// Close a flow's TCP socket; the flow no longer exists in the engine
    TcpCloseSocket {
        /// Flow id
        flow: u32,
    },
    /// Stop reading a flow's TCP socket
    TcpPause {
        /// Flow id
        flow: u32,
    },
    /// Resume reading a flow's TCP socket
    TcpResume {
        /// Flow id
        flow: u32,
    },
    /// Run the external hook script
    Hook(HookEvent),
}

/// Link and tunnel state transitions exposed to the hook script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    /// First tunnel authenticated, the virtual link is usable
    TunUp,
    /// Last tunnel lost, the virtual link is down
    TunDown,
    /// One tunnel authenticated
    LinkUp(String),
    /// One tunnel disconnected
    LinkDown(String),
}

impl HookEvent {
    /// Event name passed as the script's second argument
    pub fn event_name(&self) -> &'static str {
        match self {
            HookEvent::TunUp => "tuntap_up",
            HookEvent::TunDown => "tuntap_down",
            HookEvent::LinkUp(_) => "rtun_up",
            HookEvent::LinkDown(_) => "rtun_down",
        }
    }

    /// Tunnel name passed as the script's third argument, when any
    pub fn tunnel(&self) -> Option<&str> {
        match self {
            HookEvent::LinkUp(name) | HookEvent::LinkDown(name) => Some(name),
            _ => None,
        }
    }
}
