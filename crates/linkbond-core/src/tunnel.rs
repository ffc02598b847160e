//! Per-tunnel state
//!
//! One `Tunnel` is one authenticated UDP association with the peer: its
//! sequence spaces, loss vector, RTT estimator, pacing budget, quota and
//! the ring of recently sent packets kept for retransmission.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use linkbond_protocol::{TIMESTAMP_ABSENT, timestamp16, timestamp16_diff};

use crate::pool::{PacketPool, PacketQueue, Pkt};
use crate::{AUTO_BANDWIDTH_START, DEFAULT_MTU, IO_TIMEOUT, QUEUE_CAP, RESEND_RING_SIZE};

/// Authentication/liveness state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// No usable association
    Disconnected,
    /// Challenge sent, waiting for the peer
    AuthSent,
    /// Authenticated and healthy
    AuthOk,
    /// Authenticated but loss or silence crossed the threshold
    Lossy,
}

impl TunnelStatus {
    /// Authenticated, whether healthy or lossy
    pub fn is_up(self) -> bool {
        matches!(self, TunnelStatus::AuthOk | TunnelStatus::Lossy)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TunnelStatus::Disconnected => "DISCONNECTED",
            TunnelStatus::AuthSent => "AUTHSENT",
            TunnelStatus::AuthOk => "AUTHOK",
            TunnelStatus::Lossy => "LOSSY",
        };
        write!(f, "{name}")
    }
}

/// Static parameters of one tunnel
#[derive(Debug, Clone)]
pub struct TunnelCfg {
    /// Tunnel name from the configuration
    pub name: String,
    /// Id shared with the peer: the port of the server-side socket
    pub id: u16,
    /// Wait for the peer instead of dialing out
    pub server_mode: bool,
    /// Peer address; learned from the first packet in server mode
    pub peer: Option<SocketAddr>,
    /// Declared ceiling in kbit/s, 0 for automatic
    pub bandwidth_max: u32,
    /// Quota credit rate in kbit/s, 0 for unmetered
    pub quota: u32,
    /// Only eligible while no unrestricted tunnel is authenticated
    pub fallback_only: bool,
    /// Silence beyond the lossy allowance that kills the tunnel
    pub timeout: Duration,
}

/// Live state of one tunnel
pub struct Tunnel {
    /// Tunnel name
    pub name: String,
    /// Id shared with the peer
    pub id: u16,
    /// Wait for the peer instead of dialing out
    pub server_mode: bool,
    /// Current peer address
    pub peer: Option<SocketAddr>,
    /// Authentication state
    pub status: TunnelStatus,
    /// Only eligible in fallback mode
    pub fallback_only: bool,
    /// Dead-tunnel timeout
    pub timeout: Duration,
    /// Removed by a config reload; skipped everywhere
    pub retired: bool,

    // sequence spaces and loss
    pub(crate) seq: u16,
    pub(crate) seq_last: u16,
    pub(crate) seq_vect: u64,
    /// Our observed inbound loss over the last 64 packets
    pub loss: u8,
    /// Peer-reported view of our outbound loss (may be pinned above 64)
    pub sent_loss: u8,

    // retransmission ring and queues
    pub(crate) ring: Vec<Option<Pkt>>,
    pub(crate) sbuf: PacketQueue,
    pub(crate) hpsbuf: PacketQueue,

    // RTT estimation
    pub(crate) srtt: f64,
    pub(crate) srtt_av: f64,
    pub(crate) srtt_min: f64,
    pub(crate) srtt_sum: f64,
    pub(crate) srtt_samples: u32,
    pub(crate) srtt_reductions: u64,
    pub(crate) pkts_in_interval: u64,
    pub(crate) saved_timestamp: Option<u16>,
    pub(crate) saved_timestamp_at: u64,

    // bandwidth control
    /// Current ceiling estimate in kbit/s
    pub bandwidth_max: f64,
    /// Peer-reported receive rate in kbit/s
    pub bandwidth_out: u64,
    /// Our measured inbound rate in kbit/s
    pub bandwidth_measured: u64,
    pub(crate) bm_data: u64,
    pub(crate) lossless: bool,

    // scheduling
    /// Share of the demand assigned by the last weight recompute
    pub weight: f64,
    pub(crate) bytes_per_sec: f64,
    pub(crate) bytes_since_adjust: u64,
    pub(crate) last_adjust: Instant,

    // quota
    /// Credit rate in kbit/s, 0 for unmetered
    pub quota: u32,
    /// Remaining byte budget
    pub permitted: u64,

    // housekeeping
    pub(crate) last_activity: Option<Instant>,
    pub(crate) check_at: Instant,
    pub(crate) check_interval: Duration,
    pub(crate) conn_attempts: u32,
    pub(crate) next_send_at: Option<Instant>,

    // stats
    pub(crate) sent_packets: u64,
    pub(crate) sent_bytes: u64,
    pub(crate) recv_packets: u64,
    pub(crate) recv_bytes: u64,
    pub(crate) disconnects: u64,
}

impl Tunnel {
    pub(crate) fn new(cfg: TunnelCfg, now: Instant) -> Self {
        let bandwidth_max = if cfg.bandwidth_max == 0 {
            tracing::warn!(
                tunnel = %cfg.name,
                "no bandwidth ceiling configured, enabling automatic adjustment"
            );
            AUTO_BANDWIDTH_START
        } else {
            cfg.bandwidth_max as f64
        };

        Self {
            name: cfg.name,
            id: cfg.id,
            server_mode: cfg.server_mode,
            peer: cfg.peer,
            status: TunnelStatus::Disconnected,
            fallback_only: cfg.fallback_only,
            timeout: cfg.timeout,
            retired: false,

            seq: 0,
            seq_last: 0,
            seq_vect: u64::MAX,
            loss: 0,
            sent_loss: 0,

            ring: (0..RESEND_RING_SIZE).map(|_| None).collect(),
            sbuf: PacketQueue::new(QUEUE_CAP),
            hpsbuf: PacketQueue::new(QUEUE_CAP),

            srtt: 40.0,
            srtt_av: 40.0,
            srtt_min: 0.0,
            srtt_sum: 0.0,
            srtt_samples: 0,
            srtt_reductions: 0,
            pkts_in_interval: 0,
            saved_timestamp: None,
            saved_timestamp_at: 0,

            bandwidth_max,
            bandwidth_out: 0,
            bandwidth_measured: 0,
            bm_data: 0,
            lossless: false,

            weight: 1.0,
            bytes_per_sec: (DEFAULT_MTU * 2) as f64,
            bytes_since_adjust: 0,
            last_adjust: now,

            quota: cfg.quota,
            permitted: 0,

            last_activity: None,
            check_at: now,
            check_interval: IO_TIMEOUT / 2,
            conn_attempts: 0,
            next_send_at: None,

            sent_packets: 0,
            sent_bytes: 0,
            recv_packets: 0,
            recv_bytes: 0,
            disconnects: 0,
        }
    }

    /// Authenticated, whether healthy or lossy
    pub fn is_up(&self) -> bool {
        self.status.is_up()
    }

    pub(crate) fn tick_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// Update the sliding loss vector with a received tunnel sequence
    /// number. Returns a sequence to request immediately when a fresh hole
    /// is detected three positions back.
    ///
    /// `seq_last` is the anchor of the window and only moves forward: a
    /// late arrival fills its bit but never re-anchors the vector, so the
    /// shift on the next in-order packet counts each position once and
    /// the resend target below is always relative to the newest sequence.
    pub(crate) fn loss_update(&mut self, seq: u16) -> Option<u16> {
        use linkbond_protocol::seq_older;

        if seq_older(self.seq_last, seq) {
            let gap = seq.wrapping_sub(self.seq_last);
            if gap >= 64 {
                // reconnect: assume nothing about the past
                self.seq_vect = u64::MAX;
                self.seq_last = seq;
                self.loss = 0;
                return None;
            }
            self.seq_vect <<= gap;
            self.seq_vect |= 1;
            self.seq_last = seq;
        } else {
            let behind = self.seq_last.wrapping_sub(seq);
            if behind >= 64 {
                // ancient duplicate, outside the window
                return None;
            }
            self.seq_vect |= 1u64 << behind;
        }

        self.loss = loss_from_vect(self.seq_vect);

        // bit 3 clear means the packet three behind the newest never came;
        // ask for it before the window slides further
        if self.seq_vect & 0x8 == 0 {
            Some(self.seq_last.wrapping_sub(3))
        } else {
            None
        }
    }

    /// Record the RTT material carried by a received header
    pub(crate) fn observe_rtt(
        &mut self,
        timestamp: u16,
        timestamp_reply: u16,
        now64: u64,
    ) {
        if timestamp != TIMESTAMP_ABSENT {
            self.saved_timestamp = Some(timestamp);
            self.saved_timestamp_at = now64;
        }
        if timestamp_reply != TIMESTAMP_ABSENT {
            let sample = timestamp16_diff(timestamp16(now64), timestamp_reply);
            // large values are reordered or ancient; not a usable sample
            if sample < 5000 {
                self.srtt_sum += sample as f64;
                self.srtt_samples += 1;
            }
        }
    }

    /// Stamp the outgoing timestamp and, when we hold a recent one from the
    /// peer, the corrected echo.
    pub(crate) fn stamp_timestamps(
        &mut self,
        hdr: &mut linkbond_protocol::Header,
        now64: u64,
    ) {
        hdr.timestamp_reply = match self.saved_timestamp.take() {
            Some(saved) => {
                let held = now64 - self.saved_timestamp_at;
                self.saved_timestamp_at = 0;
                if held < 1000 {
                    // advance by how long we sat on it
                    timestamp16(saved as u64 + held)
                } else {
                    TIMESTAMP_ABSENT
                }
            }
            None => TIMESTAMP_ABSENT,
        };
        hdr.timestamp = timestamp16(now64);
    }

    /// Store a packet in the retransmission ring at the slot its `tun_seq`
    /// will occupy. The previous occupant loses the ring's reference; it
    /// survives only if a stream still holds it.
    pub(crate) fn store_ring(&mut self, pkt: Pkt, pool: &mut PacketPool) {
        let slot = self.seq as usize % RESEND_RING_SIZE;
        if let Some(previous) = self.ring[slot].take() {
            pool.release(previous);
        }
        self.ring[slot] = Some(pkt);
    }

    /// Whether the pacing budget allows another send right now
    pub(crate) fn pacing_allows(&self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_adjust).as_secs_f64();
        (self.bytes_since_adjust as f64) < self.bytes_per_sec * elapsed
    }

    /// Account a completed send and re-arm the pacing timer
    pub(crate) fn after_send(&mut self, wire_len: usize, now: Instant) {
        let cost = wire_len + linkbond_protocol::IP4_UDP_OVERHEAD;
        self.bytes_since_adjust += cost as u64;
        let interval = if self.bytes_per_sec > 0.0 {
            Duration::from_secs_f64(cost as f64 / self.bytes_per_sec)
        } else {
            IO_TIMEOUT / 2
        };
        self.next_send_at = Some(now + interval);
    }

    /// Debit the quota budget for one datagram, when metered
    pub(crate) fn debit_quota(&mut self, wire_len: usize) {
        if self.quota > 0 {
            let cost = (wire_len + linkbond_protocol::IP4_UDP_OVERHEAD) as u64;
            self.permitted = self.permitted.saturating_sub(cost);
        }
    }

    /// Reset the per-association counters on an up transition
    pub(crate) fn reset_on_up(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.saved_timestamp = None;
        self.saved_timestamp_at = 0;
        self.srtt = 40.0;
        self.srtt_sum = 0.0;
        self.srtt_samples = 0;
        self.loss = 0;
        self.bm_data = 0;
        self.check_interval = IO_TIMEOUT / 2;
        self.conn_attempts = 0;
    }

    /// Reset the per-association counters on a down transition
    pub(crate) fn reset_on_down(&mut self) {
        self.disconnects += 1;
        self.srtt = 0.0;
        self.srtt_sum = 0.0;
        self.srtt_samples = 0;
        self.loss = 64;
        self.saved_timestamp = None;
        self.saved_timestamp_at = 0;
    }

    /// Packets sent on this tunnel since creation
    pub fn sent_packets(&self) -> u64 {
        self.sent_packets
    }

    /// Bytes sent on this tunnel since creation
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    /// Packets received on this tunnel since creation
    pub fn recv_packets(&self) -> u64 {
        self.recv_packets
    }

    /// Bytes received on this tunnel since creation
    pub fn recv_bytes(&self) -> u64 {
        self.recv_bytes
    }

    /// Times this tunnel fell back to DISCONNECTED
    pub fn disconnects(&self) -> u64 {
        self.disconnects
    }
}

/// Loss count over the sliding window: the newest two positions are
/// forgiven so light reordering does not read as loss.
pub(crate) fn loss_from_vect(vect: u64) -> u8 {
    let v = (vect | 0x8000_0000_0000_0000) as i64;
    // arithmetic shift keeps the top bits set, matching the forgiveness
    (64 - (v >> 2).count_ones()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel() -> Tunnel {
        Tunnel::new(
            TunnelCfg {
                name: "t0".into(),
                id: 5000,
                server_mode: false,
                peer: None,
                bandwidth_max: 1000,
                quota: 0,
                fallback_only: false,
                timeout: Duration::from_secs(30),
            },
            Instant::now(),
        )
    }

    #[test]
    fn test_loss_zero_in_order() {
        let mut t = tunnel();
        for seq in 1..200u16 {
            t.loss_update(seq);
            assert_eq!(t.loss, 0, "seq {seq}");
        }
    }

    #[test]
    fn test_loss_counts_holes() {
        let mut t = tunnel();
        // every second packet missing: 2, 4, 6, ...
        for seq in (2..130u16).step_by(2) {
            t.loss_update(seq);
        }
        // half the window missing, minus the forgiven head
        assert!(t.loss >= 28 && t.loss <= 32, "loss = {}", t.loss);
    }

    #[test]
    fn test_recent_two_forgiven() {
        let mut t = tunnel();
        for seq in 1..=64u16 {
            t.loss_update(seq);
        }
        // skip 65: the hole sits in the forgiven newest positions
        t.loss_update(66);
        assert_eq!(t.loss, 0);
        // the next arrival pushes the hole past forgiveness
        t.loss_update(67);
        assert_eq!(t.loss, 1);
    }

    #[test]
    fn test_bit3_hole_requests_resend() {
        let mut t = tunnel();
        for seq in 1..=10u16 {
            assert_eq!(t.loss_update(seq), None);
        }
        // skip 11, 12, 13; receiving 14 leaves bit 3 (seq 11) unset
        let req = t.loss_update(14);
        assert_eq!(req, Some(11));
    }

    #[test]
    fn test_gap_resets_vector() {
        let mut t = tunnel();
        for seq in 1..=10u16 {
            t.loss_update(seq);
        }
        t.loss_update(10 + 64);
        assert_eq!(t.loss, 0);
        assert_eq!(t.seq_vect, u64::MAX);
        assert_eq!(t.seq_last, 74);
    }

    #[test]
    fn test_seq_wrap_keeps_ordering() {
        let mut t = tunnel();
        t.seq_last = 0xfffd;
        t.seq_vect = u64::MAX;
        t.loss_update(0xfffe);
        t.loss_update(0xffff);
        t.loss_update(0x0000);
        t.loss_update(0x0001);
        assert_eq!(t.loss, 0);
        assert_eq!(t.seq_last, 1);
    }

    #[test]
    fn test_late_arrival_fills_hole() {
        let mut t = tunnel();
        for seq in 1..=10u16 {
            t.loss_update(seq);
        }
        for seq in 12..=20u16 {
            t.loss_update(seq);
        }
        let with_hole = t.loss;
        t.loss_update(11);
        assert!(t.loss <= with_hole);
        assert_eq!(t.loss, 0);
    }

    #[test]
    fn test_loss_from_vect_bounds() {
        assert_eq!(loss_from_vect(u64::MAX), 0);
        // only the newest packet present: everything older is missing,
        // except the two forgiven positions and the forced top bit
        let only_newest = 1u64;
        assert_eq!(loss_from_vect(only_newest), 61);
        assert!(loss_from_vect(0) <= 64);
    }

    #[test]
    fn test_rtt_sample_window() {
        let mut t = tunnel();
        t.observe_rtt(100, TIMESTAMP_ABSENT, 50_000);
        assert_eq!(t.saved_timestamp, Some(100));
        // reply echoed 40 ms ago
        let now64 = 60_000u64;
        let reply = timestamp16(now64 - 40);
        t.observe_rtt(TIMESTAMP_ABSENT, reply, now64);
        assert_eq!(t.srtt_samples, 1);
        assert_eq!(t.srtt_sum, 40.0);

        // a 6-second-old echo is discarded
        let stale = timestamp16(now64 - 6000);
        t.observe_rtt(TIMESTAMP_ABSENT, stale, now64);
        assert_eq!(t.srtt_samples, 1);
    }

    #[test]
    fn test_timestamp_echo_expires() {
        let mut t = tunnel();
        let mut hdr = linkbond_protocol::Header::default();
        t.observe_rtt(500, TIMESTAMP_ABSENT, 10_000);
        // held for 1.5 s: too stale to echo
        t.stamp_timestamps(&mut hdr, 11_500);
        assert_eq!(hdr.timestamp_reply, TIMESTAMP_ABSENT);

        t.observe_rtt(500, TIMESTAMP_ABSENT, 20_000);
        t.stamp_timestamps(&mut hdr, 20_200);
        assert_eq!(hdr.timestamp_reply, 700);
    }

    #[test]
    fn test_ring_overwrite_respects_sharing() {
        let mut pool = PacketPool::new(0);
        let mut t = tunnel();
        let first = pool.get();
        let held_by_stream = first.clone();
        t.seq = 0;
        t.store_ring(first, &mut pool);
        // one full lap later the slot is reused
        t.seq = 0; // same slot
        let second = pool.get();
        t.store_ring(second, &mut pool);
        // the stream's reference kept the first packet alive
        assert_eq!(pool.outstanding(), 2);
        drop(held_by_stream);
    }

    #[test]
    fn test_pacing_budget() {
        let now = Instant::now();
        let mut t = tunnel();
        t.bytes_per_sec = 1000.0;
        t.last_adjust = now;
        assert!(!t.pacing_allows(now));
        assert!(t.pacing_allows(now + Duration::from_millis(100)));
        t.after_send(72, now + Duration::from_millis(100));
        // 100 bytes of budget spent against 100 ms of credit
        assert!(!t.pacing_allows(now + Duration::from_millis(100)));
        assert!(t.next_send_at.is_some());
    }

    #[test]
    fn test_quota_debit_saturates() {
        let mut t = tunnel();
        t.quota = 100;
        t.permitted = 50;
        t.debit_quota(1000);
        assert_eq!(t.permitted, 0);
    }
}
