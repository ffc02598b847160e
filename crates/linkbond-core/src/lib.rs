//! Linkbond Bonding Engine
//!
//! The engine multiplexes one virtual point-to-point link over several UDP
//! tunnels: it schedules egress across tunnels in proportion to measured
//! capacity, repairs loss with targeted retransmissions, restores aggregate
//! packet order on receive, and carries spliced TCP flows over a per-flow
//! reliable substream.
//!
//! The crate is sans-I/O. [`Engine`] is a plain state machine: the daemon
//! feeds it datagrams, TUN frames, TCP socket events and the current time,
//! and drains an [`Output`] queue of effects to perform. Timers are
//! deadlines the driver sleeps on ([`Engine::poll_timeout`]). This keeps the
//! whole bonding logic on one thread and makes every scenario in the test
//! suite runnable without a socket.

#![warn(rust_2018_idioms)]

mod bandwidth;
mod engine;
mod error;
mod lifecycle;
mod output;
mod pool;
mod reorder;
mod stream;
mod tunnel;

pub use engine::{Engine, EngineConfig};
pub use error::{CoreError, Result};
pub use output::{HookEvent, Output};
pub use pool::{Packet, PacketPool, PacketQueue, Pkt};
pub use reorder::ReorderBuffer;
pub use stream::Stream;
pub use tunnel::{Tunnel, TunnelCfg, TunnelStatus};

use std::time::Duration;

/// Slots in the per-tunnel retransmission ring. Power of two so the
/// `tun_seq` indexing distributes evenly across the wrap.
pub const RESEND_RING_SIZE: usize = 1024;

/// Inbound loss count (out of the last 64 packets) at which a tunnel is
/// treated as lossy.
pub const LOSS_TOLERANCE: u8 = 50;

/// Period of the bandwidth controller tick.
pub const BW_INTERVAL: Duration = Duration::from_millis(100);

/// Slots in the receive-side reorder ring.
pub const REORDER_RING_SIZE: usize = 1024;

/// Smallest window the reorder ring will hold packets for.
pub const REORDER_MIN: usize = 20;

/// How long the reorder ring waits on a missing packet before skipping it.
pub const REORDER_TIMEOUT: Duration = Duration::from_millis(100);

/// Period of the reorder skip timer.
pub const REORDER_TICK: Duration = Duration::from_millis(250);

/// Base interval of per-tunnel housekeeping; checks run at half this.
pub const IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Ceiling on the reconnect backoff.
pub const IO_TIMEOUT_MAX: Duration = Duration::from_secs(60);

/// Packets a flow may have unacknowledged before its socket read pauses.
pub const TCP_MAX_OUTSTANDING: usize = 1024;

/// Ordered-but-unwritten packets at which a flow stalls its ACKs.
pub const DRAIN_STALL: usize = 1000;

/// Ceiling on concurrently spliced TCP flows.
pub const MAX_STREAMS: usize = 10_000;

/// Capacity of the aggregate send buffer.
pub const SEND_BUFFER_CAP: usize = 102_400;

/// Capacity of every other packet queue.
pub const QUEUE_CAP: usize = 1024;

/// Fallback link MTU used for idle-tunnel pacing allowances.
pub const DEFAULT_MTU: usize = 1450;

/// Starting ceiling in kbit/s when a tunnel is configured for automatic
/// bandwidth adjustment. Faster lines grow from here, slower ones drop.
pub const AUTO_BANDWIDTH_START: f64 = 10_000.0;

/// Divisor turning the worst smoothed RTT into the full-round-trip estimate
/// used by stream retransmission, in seconds. Tunable; inherited from the
/// shipping behavior of the protocol.
pub const FULL_RTT_DIVISOR: f64 = 250.0;
