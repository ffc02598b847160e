//! Spliced TCP flows
//!
//! Each TCP connection accepted locally (or dialed on the peer's behalf)
//! becomes a flow: a reliable, in-order substream multiplexed over the
//! bonded transport. Flows keep three queues: `sent` holds packets until
//! the peer's cumulative ACK covers them, `received` holds out-of-order
//! arrivals, and `draining` holds ordered payload waiting for the socket.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use linkbond_protocol::{Header, MsgKind, seq_older, seq_older_eq};
use tracing::{debug, info, warn};

use crate::engine::Ctx;
use crate::output::Output;
use crate::{DRAIN_STALL, TCP_MAX_OUTSTANDING};

/// What the engine must do after feeding a flow a packet
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamEvent {
    /// Nothing beyond the queued outputs
    None,
    /// The flow is finished; tear it down and close the socket
    Closed,
}

/// One spliced TCP flow
pub struct Stream {
    /// Flow id shared with the peer
    pub flow_id: u32,
    pub(crate) data_seq: u16,
    pub(crate) next_seq: u16,
    pub(crate) seq_to_ack: u16,
    pub(crate) sent: VecDeque<crate::Pkt>,
    pub(crate) received: VecDeque<crate::Pkt>,
    pub(crate) draining: VecDeque<crate::Pkt>,
    pub(crate) stall: bool,
    pub(crate) read_paused: bool,
    pub(crate) writing: bool,
    pub(crate) closing: bool,
    pub(crate) pending_connect: bool,
    pub(crate) resend_at: Option<Instant>,
}

impl Stream {
    /// Flow sequence numbers start at 1 and never take the value 0, so an
    /// `ack_seq` of 0 always reads as "nothing acknowledged yet" rather
    /// than as a claim on the first packet.
    pub(crate) fn new(flow_id: u32, pending_connect: bool) -> Self {
        Self {
            flow_id,
            data_seq: 1,
            next_seq: 1,
            seq_to_ack: 0,
            sent: VecDeque::new(),
            received: VecDeque::new(),
            draining: VecDeque::new(),
            stall: false,
            read_paused: false,
            writing: false,
            closing: false,
            pending_connect,
            resend_at: None,
        }
    }

    /// Queue one packet of this flow toward the tunnels. Data and close
    /// packets consume a flow sequence number and wait in `sent` for the
    /// peer's ACK; bare ACKs are fire-and-forget.
    pub(crate) fn send_packet(&mut self, pkt: crate::Pkt, kind: MsgKind, ctx: &mut Ctx<'_>) {
        {
            let mut p = pkt.borrow_mut();
            p.hdr.kind = kind;
            p.hdr.flow_id = self.flow_id;
            p.hdr.data_seq = if kind == MsgKind::TcpAck {
                0
            } else {
                let seq = self.data_seq;
                self.data_seq = self.data_seq.wrapping_add(1);
                if self.data_seq == 0 {
                    self.data_seq = 1;
                }
                seq
            };
            p.hdr.ack_seq = self.seq_to_ack;
            p.in_flight = true;
            p.last_sent = ctx.now64;
        }
        debug!(
            flow = self.flow_id,
            seq = pkt.borrow().hdr.data_seq,
            ack = pkt.borrow().hdr.ack_seq,
            %kind,
            "flow packet queued"
        );
        if kind != MsgKind::TcpAck {
            self.sent.push_back(pkt.clone());
            if self.sent.len() >= TCP_MAX_OUTSTANDING && !self.read_paused {
                self.read_paused = true;
                ctx.out.push_back(Output::TcpPause { flow: self.flow_id });
            }
        }
        ctx.enqueue(pkt);
        if ctx.send_buffer.is_full() {
            warn!(flow = self.flow_id, "send buffer is full");
        }
        self.maybe_resend(ctx);
        if self.resend_at.is_none() && !self.sent.is_empty() {
            self.resend_at = Some(ctx.now + ctx.full_rtt());
        }
    }

    /// Queue an orderly close; the flow survives until the peer ACKs it
    pub(crate) fn send_close(&mut self, ctx: &mut Ctx<'_>) {
        if self.closing {
            return;
        }
        self.closing = true;
        info!(flow = self.flow_id, "closing flow");
        let pkt = ctx.pool.get();
        self.send_packet(pkt, MsgKind::TcpClose, ctx);
    }

    /// Head-of-line retransmission: when the unacknowledged backlog has
    /// outgrown what cross-tunnel reordering explains and the oldest packet
    /// has been quiet for a full round trip, push the same body out again
    /// at high priority.
    pub(crate) fn maybe_resend(&mut self, ctx: &mut Ctx<'_>) {
        if ctx.hpsend_buffer.is_full() {
            warn!(flow = self.flow_id, "high priority buffer full, resend skipped");
            return;
        }
        if self.sent.len() > (ctx.reorder_span * 2.0) as usize {
            if let Some(head) = self.sent.front() {
                let resend = {
                    let mut p = head.borrow_mut();
                    if !p.in_flight && ctx.now64.saturating_sub(p.last_sent) > ctx.full_rtt_ms {
                        p.last_sent = ctx.now64;
                        p.in_flight = true;
                        true
                    } else {
                        false
                    }
                };
                if resend {
                    debug!(
                        flow = self.flow_id,
                        seq = head.borrow().hdr.data_seq,
                        "no ack, resending head of sent list"
                    );
                    let clone = head.clone();
                    ctx.enqueue_hp(clone);
                }
            }
        }
        if self.received.len() > ctx.reorder_span as usize {
            self.stamp(ctx);
        }
    }

    /// Attach the latest cumulative ACK to traffic already queued for this
    /// flow, or emit a bare ACK when none is waiting.
    pub(crate) fn stamp(&mut self, ctx: &mut Ctx<'_>) {
        if self.stall {
            debug!(flow = self.flow_id, backlog = self.draining.len(), "stalling ACKs");
            return;
        }
        for pkt in ctx.send_buffer.iter().rev() {
            let mut p = pkt.borrow_mut();
            if p.hdr.flow_id == self.flow_id
                && matches!(p.hdr.kind, MsgKind::TcpData | MsgKind::TcpAck)
            {
                p.hdr.ack_seq = self.seq_to_ack;
                return;
            }
        }
        let pkt = ctx.pool.get();
        self.send_packet(pkt, MsgKind::TcpAck, ctx);
    }

    fn emit_bare_ack(&mut self, ctx: &mut Ctx<'_>) {
        let pkt = ctx.pool.get();
        self.send_packet(pkt, MsgKind::TcpAck, ctx);
    }

    /// Feed one flow packet received off a tunnel
    pub(crate) fn handle_from_tunnel(
        &mut self,
        hdr: Header,
        payload: &[u8],
        ctx: &mut Ctx<'_>,
    ) -> StreamEvent {
        debug!(
            flow = self.flow_id,
            seq = hdr.data_seq,
            ack = hdr.ack_seq,
            kind = %hdr.kind,
            len = payload.len(),
            "flow packet received"
        );

        // the cumulative ACK frees our sent prefix
        let mut acked = 0;
        let mut close_acked = false;
        while let Some(head) = self.sent.front() {
            let (head_seq, head_kind) = {
                let p = head.borrow();
                (p.hdr.data_seq, p.hdr.kind)
            };
            if !seq_older_eq(head_seq, hdr.ack_seq) {
                if acked == 0 {
                    debug!(
                        flow = self.flow_id,
                        ack = hdr.ack_seq,
                        "ack matches nothing outstanding"
                    );
                    self.maybe_resend(ctx);
                }
                break;
            }
            let head = self.sent.pop_front().expect("front checked above");
            ctx.pool.release(head);
            acked += 1;
            if head_kind == MsgKind::TcpClose {
                close_acked = true;
                break;
            }
            if head_seq == hdr.ack_seq {
                break;
            }
        }
        if close_acked {
            return StreamEvent::Closed;
        }
        if self.read_paused && !ctx.streams_paused && self.sent.len() < TCP_MAX_OUTSTANDING {
            self.read_paused = false;
            ctx.out.push_back(Output::TcpResume { flow: self.flow_id });
        }

        if hdr.kind != MsgKind::TcpAck {
            if seq_older(hdr.data_seq, self.next_seq) {
                // duplicate of something already delivered; re-ack so the
                // peer stops resending it
                self.stamp(ctx);
                return StreamEvent::None;
            }
            let mut insert_at = self.received.len();
            let mut duplicate = false;
            for (i, held) in self.received.iter().enumerate() {
                let held_seq = held.borrow().hdr.data_seq;
                if held_seq == hdr.data_seq {
                    duplicate = true;
                    break;
                }
                if seq_older(hdr.data_seq, held_seq) {
                    insert_at = i;
                    break;
                }
            }
            if duplicate {
                self.stamp(ctx);
                return StreamEvent::None;
            }
            let pkt = ctx.pool.get_with(hdr, payload);
            self.received.insert(insert_at, pkt);
        }

        // pop the contiguous prefix into the drain queue
        let mut drained = 0;
        let mut close_in_order = false;
        while let Some(front) = self.received.front() {
            let (seq, kind, has_payload) = {
                let p = front.borrow();
                (p.hdr.data_seq, p.hdr.kind, !p.data.is_empty())
            };
            if seq != self.next_seq {
                break;
            }
            let pkt = self.received.pop_front().expect("front checked above");
            self.seq_to_ack = seq;
            self.next_seq = seq.wrapping_add(1);
            if self.next_seq == 0 {
                self.next_seq = 1;
            }
            drained += 1;
            if kind == MsgKind::TcpClose {
                ctx.pool.release(pkt);
                close_in_order = true;
                break;
            }
            if has_payload {
                self.draining.push_back(pkt);
            } else {
                ctx.pool.release(pkt);
            }
        }
        if close_in_order {
            // acknowledge the close so the peer can finish tearing down
            self.emit_bare_ack(ctx);
            return StreamEvent::Closed;
        }

        if drained > 0 {
            self.pump_write(ctx);
        }
        if self.draining.len() > DRAIN_STALL {
            debug!(flow = self.flow_id, backlog = self.draining.len(), "drain backlog, stalling");
            self.stall = true;
        }
        if drained > 0 || self.received.len() > ctx.reorder_span as usize {
            self.stamp(ctx);
        }
        StreamEvent::None
    }

    /// Hand the next ordered chunk to the driver, one write at a time.
    /// Nothing is emitted while the peer-side dial is still pending; the
    /// backlog drains once the socket exists.
    pub(crate) fn pump_write(&mut self, ctx: &mut Ctx<'_>) {
        if self.writing || self.pending_connect {
            return;
        }
        if let Some(front) = self.draining.front() {
            let data = bytes::Bytes::copy_from_slice(&front.borrow().data);
            self.writing = true;
            ctx.out.push_back(Output::TcpWrite {
                flow: self.flow_id,
                data,
            });
        }
    }

    /// The driver finished writing the chunk at the head of the drain queue
    pub(crate) fn write_done(&mut self, ctx: &mut Ctx<'_>) {
        self.writing = false;
        if let Some(pkt) = self.draining.pop_front() {
            ctx.pool.release(pkt);
        }
        if self.stall && self.draining.len() < DRAIN_STALL {
            self.stall = false;
        }
        self.pump_write(ctx);
    }

    /// Packets awaiting acknowledgment
    pub fn outstanding(&self) -> usize {
        self.sent.len()
    }
}

/// The set of live flows
pub(crate) struct StreamMap {
    streams: HashMap<u32, Stream>,
    next_flow_id: u32,
}

impl StreamMap {
    /// The accepting sides of the two peers mint from disjoint parity
    /// spaces so simultaneous accepts cannot collide.
    pub(crate) fn new(server: bool) -> Self {
        Self {
            streams: HashMap::new(),
            next_flow_id: if server { 2 } else { 1 },
        }
    }

    pub(crate) fn mint_flow_id(&mut self) -> u32 {
        let id = self.next_flow_id;
        let next = self.next_flow_id.wrapping_add(2);
        // flow id 0 means "no flow" on the wire; skip it across the wrap
        self.next_flow_id = if next < 2 { next.wrapping_add(2) } else { next };
        id
    }

    pub(crate) fn get_mut(&mut self, flow: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&flow)
    }

    pub(crate) fn contains(&self, flow: u32) -> bool {
        self.streams.contains_key(&flow)
    }

    pub(crate) fn insert(&mut self, stream: Stream) {
        self.streams.insert(stream.flow_id, stream);
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Remove a flow and release everything it still holds
    pub(crate) fn teardown(&mut self, flow: u32, ctx: &mut Ctx<'_>) {
        if let Some(mut stream) = self.streams.remove(&flow) {
            info!(flow, "flow torn down");
            for queue in [&mut stream.sent, &mut stream.received, &mut stream.draining] {
                while let Some(pkt) = queue.pop_front() {
                    ctx.pool.release(pkt);
                }
            }
            ctx.out.push_back(Output::TcpCloseSocket { flow });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PacketPool, PacketQueue};
    use std::collections::VecDeque as OutQueue;
    use std::time::Instant;

    struct Fixture {
        pool: PacketPool,
        send_buffer: PacketQueue,
        hpsend_buffer: PacketQueue,
        out: OutQueue<Output>,
        bandwidth_data: u64,
        now: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pool: PacketPool::new(0),
                send_buffer: PacketQueue::new(1024),
                hpsend_buffer: PacketQueue::new(1024),
                out: OutQueue::new(),
                bandwidth_data: 0,
                now: Instant::now(),
            }
        }

        fn ctx(&mut self) -> Ctx<'_> {
            Ctx {
                pool: &mut self.pool,
                send_buffer: &mut self.send_buffer,
                hpsend_buffer: &mut self.hpsend_buffer,
                out: &mut self.out,
                bandwidth_data: &mut self.bandwidth_data,
                reorder_span: 20.0,
                full_rtt_ms: 250,
                streams_paused: false,
                now: self.now,
                now64: 1000,
            }
        }
    }

    fn data_hdr(flow: u32, seq: u16, ack: u16) -> Header {
        let mut hdr = Header::new(MsgKind::TcpData);
        hdr.flow_id = flow;
        hdr.data_seq = seq;
        hdr.ack_seq = ack;
        hdr
    }

    fn queue_data(stream: &mut Stream, fx: &mut Fixture, payload: &[u8]) {
        let pkt = fx.pool.get();
        pkt.borrow_mut().data.extend_from_slice(payload);
        let mut ctx = fx.ctx();
        stream.send_packet(pkt, MsgKind::TcpData, &mut ctx);
    }

    #[test]
    fn test_egress_sequencing() {
        let mut fx = Fixture::new();
        let mut stream = Stream::new(1, false);
        for byte in 0..3u8 {
            queue_data(&mut stream, &mut fx, &[byte]);
        }
        assert_eq!(stream.sent.len(), 3);
        assert_eq!(fx.send_buffer.len(), 3);
        let seqs: Vec<u16> = stream.sent.iter().map(|p| p.borrow().hdr.data_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(stream.resend_at.is_some());
    }

    #[test]
    fn test_cumulative_ack_frees_sent() {
        let mut fx = Fixture::new();
        let mut stream = Stream::new(1, false);
        for byte in 0..5u8 {
            queue_data(&mut stream, &mut fx, &[byte]);
        }
        // ACK covering 1..=3
        let mut ctx = fx.ctx();
        let event = stream.handle_from_tunnel(
            {
                let mut hdr = Header::new(MsgKind::TcpAck);
                hdr.flow_id = 1;
                hdr.ack_seq = 3;
                hdr
            },
            &[],
            &mut ctx,
        );
        assert_eq!(event, StreamEvent::None);
        assert_eq!(stream.sent.len(), 2);
    }

    #[test]
    fn test_reordered_delivery() {
        let mut fx = Fixture::new();
        let mut stream = Stream::new(1, false);

        // "B" overtakes "A" in transit: seq 2 first, then 1
        let mut ctx = fx.ctx();
        stream.handle_from_tunnel(data_hdr(1, 2, 0), b"B", &mut ctx);
        assert!(stream.draining.is_empty());
        assert_eq!(stream.received.len(), 1);

        stream.handle_from_tunnel(data_hdr(1, 1, 0), b"A", &mut ctx);
        // both now ordered and queued for the socket
        assert_eq!(stream.draining.len(), 1);
        assert_eq!(stream.next_seq, 3);
        assert_eq!(stream.seq_to_ack, 2);

        // the first chunk went straight to a write
        let wrote: Vec<u8> = ctx
            .out
            .iter()
            .filter_map(|o| match o {
                Output::TcpWrite { data, .. } => Some(data[0]),
                _ => None,
            })
            .collect();
        assert_eq!(wrote, vec![b'A']);

        // completing the write releases the next chunk
        stream.write_done(&mut ctx);
        let wrote: Vec<u8> = ctx
            .out
            .iter()
            .filter_map(|o| match o {
                Output::TcpWrite { data, .. } => Some(data[0]),
                _ => None,
            })
            .collect();
        assert_eq!(wrote, vec![b'A', b'B']);
    }

    #[test]
    fn test_duplicate_triggers_ack() {
        let mut fx = Fixture::new();
        let mut stream = Stream::new(1, false);
        let mut ctx = fx.ctx();
        stream.handle_from_tunnel(data_hdr(1, 1, 0), b"A", &mut ctx);
        let queued_before = ctx.send_buffer.len();
        // the same packet again: already delivered, must re-ack
        stream.handle_from_tunnel(data_hdr(1, 1, 0), b"A", &mut ctx);
        assert_eq!(stream.received.len(), 0);
        assert!(ctx.send_buffer.len() > queued_before, "expected a bare ACK");
    }

    #[test]
    fn test_close_acked_tears_down() {
        let mut fx = Fixture::new();
        let mut stream = Stream::new(1, false);
        {
            let mut ctx = fx.ctx();
            stream.send_close(&mut ctx);
        }
        assert!(stream.closing);
        // peer ACKs the close
        let mut ctx = fx.ctx();
        let event = stream.handle_from_tunnel(
            {
                let mut hdr = Header::new(MsgKind::TcpAck);
                hdr.flow_id = 1;
                hdr.ack_seq = 1;
                hdr
            },
            &[],
            &mut ctx,
        );
        assert_eq!(event, StreamEvent::Closed);
    }

    #[test]
    fn test_remote_close_in_order() {
        let mut fx = Fixture::new();
        let mut stream = Stream::new(1, false);
        let mut ctx = fx.ctx();
        stream.handle_from_tunnel(data_hdr(1, 1, 0), b"A", &mut ctx);

        let mut close = Header::new(MsgKind::TcpClose);
        close.flow_id = 1;
        close.data_seq = 2;
        let event = stream.handle_from_tunnel(close, &[], &mut ctx);
        assert_eq!(event, StreamEvent::Closed);
        // the close was acknowledged on the way out
        assert!(
            ctx.send_buffer
                .iter()
                .any(|p| p.borrow().hdr.kind == MsgKind::TcpAck
                    && p.borrow().hdr.ack_seq == 2)
        );
    }

    #[test]
    fn test_outstanding_pauses_reads() {
        let mut fx = Fixture::new();
        let mut stream = Stream::new(1, false);
        for _ in 0..TCP_MAX_OUTSTANDING {
            queue_data(&mut stream, &mut fx, b"x");
        }
        assert!(stream.read_paused);
        assert!(
            fx.out
                .iter()
                .any(|o| matches!(o, Output::TcpPause { flow: 1 }))
        );
    }

    #[test]
    fn test_head_resend_after_full_rtt() {
        let mut fx = Fixture::new();
        let mut stream = Stream::new(1, false);
        // backlog past twice the reorder span (span = 20 in the fixture)
        for _ in 0..50 {
            queue_data(&mut stream, &mut fx, b"x");
        }
        // mark everything as transmitted long ago
        for pkt in stream.sent.iter() {
            let mut p = pkt.borrow_mut();
            p.in_flight = false;
            p.last_sent = 0;
        }
        let before = fx.hpsend_buffer.len();
        let mut ctx = fx.ctx();
        stream.maybe_resend(&mut ctx);
        assert_eq!(ctx.hpsend_buffer.len(), before + 1);
        // the head travels again as the same body
        let head = stream.sent.front().unwrap();
        assert!(head.borrow().in_flight);
    }

    #[test]
    fn test_flow_id_minting_parity() {
        let mut client = StreamMap::new(false);
        let mut server = StreamMap::new(true);
        assert_eq!(client.mint_flow_id() % 2, 1);
        assert_eq!(client.mint_flow_id() % 2, 1);
        assert_eq!(server.mint_flow_id() % 2, 0);
        assert_ne!(server.mint_flow_id(), 0);
    }
}
