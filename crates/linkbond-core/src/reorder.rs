//! Receive-side reorder buffer for aggregate traffic
//!
//! A direct-addressed ring: each packet lands at `data_seq mod ring size`,
//! a cursor walks the ring delivering in order, and a timer bounds how long
//! one missing packet can hold everything back. O(1) per packet, and a
//! lost slot costs at most the skip timeout, which is the right trade when
//! targeted retransmissions are already healing most holes.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::output::Output;
use crate::pool::{PacketPool, Pkt};
use crate::{REORDER_MIN, REORDER_RING_SIZE, REORDER_TIMEOUT};

/// Restores `data_seq` order for packets headed to the TUN device
pub struct ReorderBuffer {
    slots: Vec<Option<Pkt>>,
    next: usize,
    size: usize,
    waiting_since: Option<Instant>,
    span: f64,
}

impl ReorderBuffer {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..REORDER_RING_SIZE).map(|_| None).collect(),
            next: 0,
            size: 0,
            waiting_since: None,
            span: 0.0,
        }
    }

    /// Track the RTT spread across tunnels; the buffer holds at most this
    /// many packets before forcing delivery.
    pub(crate) fn set_span(&mut self, span: f64) {
        self.span = span;
    }

    fn max_size(&self) -> usize {
        (self.span as usize).clamp(REORDER_MIN, REORDER_RING_SIZE)
    }

    /// Occupied slots
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when no packet is waiting
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Place a received aggregate packet. Flow traffic never comes here;
    /// unsequenced packets and stale duplicates are delivered immediately.
    pub(crate) fn insert(
        &mut self,
        pkt: Pkt,
        now: Instant,
        pool: &mut PacketPool,
        out: &mut VecDeque<Output>,
    ) {
        let data_seq = pkt.borrow().hdr.data_seq;
        if data_seq == 0 {
            // not sequenced, nothing to wait for
            Self::inject(&pkt, out);
            pool.release(pkt);
            return;
        }

        let slot = data_seq as usize % REORDER_RING_SIZE;
        if self.slots[slot].is_some() {
            warn!(data_seq, "reorder slot collision, delivering as stale duplicate");
            Self::inject(&pkt, out);
            pool.release(pkt);
            return;
        }

        self.slots[slot] = Some(pkt);
        self.size += 1;

        self.deliver(pool, out);
        self.waiting_since = if self.size > 0 { Some(now) } else { None };
    }

    /// Drain in-order packets, and force progress when the buffer has grown
    /// past its window.
    fn deliver(&mut self, pool: &mut PacketPool, out: &mut VecDeque<Output>) {
        while (self.size > 0 && self.slots[self.next].is_some()) || self.size >= self.max_size() {
            if let Some(pkt) = self.slots[self.next].take() {
                Self::inject(&pkt, out);
                pool.release(pkt);
                self.size -= 1;
            }
            self.next = (self.next + 1) % REORDER_RING_SIZE;
        }
    }

    /// Periodic check: when the head of line has been missing for longer
    /// than the timeout, give up on it and move the cursor forward.
    pub(crate) fn tick(
        &mut self,
        now: Instant,
        pool: &mut PacketPool,
        out: &mut VecDeque<Output>,
    ) {
        let Some(since) = self.waiting_since else {
            return;
        };
        if self.size == 0 || now.duration_since(since) <= REORDER_TIMEOUT {
            return;
        }
        debug!(skipped_at = self.next, "reorder timeout, skipping missing packets");
        while self.slots[self.next].is_none() {
            self.next = (self.next + 1) % REORDER_RING_SIZE;
        }
        self.deliver(pool, out);
        if self.size == 0 {
            self.waiting_since = None;
        }
    }

    /// Drop everything held, releasing packets back to the pool
    pub(crate) fn reset(&mut self, pool: &mut PacketPool) {
        for slot in &mut self.slots {
            if let Some(pkt) = slot.take() {
                pool.release(pkt);
            }
        }
        self.size = 0;
        self.waiting_since = None;
    }

    fn inject(pkt: &Pkt, out: &mut VecDeque<Output>) {
        let p = pkt.borrow();
        out.push_back(Output::TunWrite(Bytes::copy_from_slice(&p.data)));
    }
}
