//! Reusable packet buffers
//!
//! Packets are pool-allocated and shared by reference count: the same
//! buffer can sit in a tunnel's retransmission ring and in a stream's sent
//! list at once, and returns to the pool only when the last holder lets go.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use linkbond_protocol::{HEADER_SIZE, Header};
use tracing::warn;

/// One packet: header plus payload, with the bookkeeping the resend paths
/// need.
#[derive(Debug)]
pub struct Packet {
    /// Tunnel header; fields are stamped progressively on the way out
    pub hdr: Header,
    /// Payload bytes
    pub data: Vec<u8>,
    /// Queued toward a tunnel and not yet on the wire
    pub in_flight: bool,
    /// Engine-clock milliseconds of the last wire transmit
    pub last_sent: u64,
}

impl Packet {
    fn empty() -> Self {
        Self {
            hdr: Header::default(),
            data: Vec::with_capacity(1500),
            in_flight: false,
            last_sent: 0,
        }
    }

    fn reset(&mut self) {
        self.hdr = Header::default();
        self.data.clear();
        self.in_flight = false;
        self.last_sent = 0;
    }

    /// Bytes this packet occupies on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }
}

/// Shared handle to a pooled packet
pub type Pkt = Rc<RefCell<Packet>>;

/// Free list of packet buffers
pub struct PacketPool {
    free: Vec<Packet>,
    outstanding: u64,
}

impl PacketPool {
    /// Create a pool with `prealloc` buffers ready to hand out
    pub fn new(prealloc: usize) -> Self {
        Self {
            free: (0..prealloc).map(|_| Packet::empty()).collect(),
            outstanding: 0,
        }
    }

    /// Take a fresh packet from the pool
    pub fn get(&mut self) -> Pkt {
        let mut packet = self.free.pop().unwrap_or_else(Packet::empty);
        packet.reset();
        self.outstanding += 1;
        Rc::new(RefCell::new(packet))
    }

    /// Take a packet pre-filled with a header and payload
    pub fn get_with(&mut self, hdr: Header, payload: &[u8]) -> Pkt {
        let pkt = self.get();
        {
            let mut p = pkt.borrow_mut();
            p.hdr = hdr;
            p.data.extend_from_slice(payload);
        }
        pkt
    }

    /// Give up one reference to a packet. The buffer is reclaimed only when
    /// this was the last one; a packet still held elsewhere (ring slot,
    /// stream sent list) stays alive.
    pub fn release(&mut self, pkt: Pkt) {
        if let Some(cell) = Rc::into_inner(pkt) {
            let mut packet = cell.into_inner();
            packet.reset();
            self.outstanding -= 1;
            if self.free.len() < 4096 {
                self.free.push(packet);
            }
        }
    }

    /// Packets currently handed out
    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }
}

/// Bounded FIFO of packets with a backpressure watermark
pub struct PacketQueue {
    items: VecDeque<Pkt>,
    max: usize,
}

impl PacketQueue {
    /// Create a queue holding at most `max` packets
    pub fn new(max: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max,
        }
    }

    /// Append a packet. Overflow is logged, not fatal; producers are
    /// expected to respect [`PacketQueue::is_full`].
    pub fn push(&mut self, pkt: Pkt) {
        if self.items.len() >= self.max {
            warn!("packet queue overflow ({} packets)", self.items.len());
        }
        self.items.push_back(pkt);
    }

    /// Take the oldest packet
    pub fn pop(&mut self) -> Option<Pkt> {
        self.items.pop_front()
    }

    /// Queued packet count
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// At or past capacity
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max
    }

    /// Past the point where producers should slow down
    pub fn above_watermark(&self) -> bool {
        self.items.len() >= self.max / 4 * 3
    }

    /// Iterate the queued packets, oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Pkt> {
        self.items.iter()
    }

    /// Release every queued packet back to the pool
    pub fn clear_into(&mut self, pool: &mut PacketPool) {
        while let Some(pkt) = self.items.pop_front() {
            pool.release(pkt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuse() {
        let mut pool = PacketPool::new(0);
        let pkt = pool.get();
        pkt.borrow_mut().data.extend_from_slice(b"abc");
        assert_eq!(pool.outstanding(), 1);
        pool.release(pkt);
        assert_eq!(pool.outstanding(), 0);

        let pkt = pool.get();
        assert!(pkt.borrow().data.is_empty());
    }

    #[test]
    fn test_shared_packet_survives_one_release() {
        let mut pool = PacketPool::new(0);
        let pkt = pool.get();
        let ring_ref = pkt.clone();
        pool.release(pkt);
        // the ring still holds it
        assert_eq!(pool.outstanding(), 1);
        ring_ref.borrow_mut().data.push(1);
        pool.release(ring_ref);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_queue_fifo_and_watermark() {
        let mut pool = PacketPool::new(0);
        let mut queue = PacketQueue::new(4);
        for i in 0..3u8 {
            let pkt = pool.get();
            pkt.borrow_mut().data.push(i);
            queue.push(pkt);
        }
        assert!(queue.above_watermark());
        assert!(!queue.is_full());
        assert_eq!(queue.pop().unwrap().borrow().data[0], 0);
        assert_eq!(queue.len(), 2);
    }
}
