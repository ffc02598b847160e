//! The bonding engine
//!
//! Owns every shared structure (packet pool, global send buffers, tunnel
//! list, reorder buffer, flow table) and exposes the event-shaped API the
//! daemon drives: datagrams in, effects out, deadlines in between.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use linkbond_protocol::{
    Header, IP4_UDP_OVERHEAD, MsgKind, ResendRequest, decode_keepalive, decode_open_addr,
    encode_open_addr,
};
use tracing::{debug, info, warn};

use crate::output::{HookEvent, Output};
use crate::pool::{PacketPool, PacketQueue, Pkt};
use crate::reorder::ReorderBuffer;
use crate::stream::{Stream, StreamEvent, StreamMap};
use crate::tunnel::{Tunnel, TunnelCfg, TunnelStatus};
use crate::{
    BW_INTERVAL, CoreError, FULL_RTT_DIVISOR, LOSS_TOLERANCE, MAX_STREAMS, QUEUE_CAP,
    REORDER_TICK, RESEND_RING_SIZE, Result, SEND_BUFFER_CAP,
};

/// Link-wide engine parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shared secret both peers must present
    pub password: String,
    /// TUN device MTU; aggregate payloads never exceed this
    pub mtu: usize,
    /// Whether this daemon is the accepting side of the bond
    pub server: bool,
    /// Bring the virtual device up at startup instead of on first tunnel
    pub static_tunnel: bool,
    /// Also service retransmission requests for plain UDP payloads
    pub resend_udp_payloads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            mtu: 1450,
            server: false,
            static_tunnel: false,
            resend_udp_payloads: false,
        }
    }
}

/// Split borrow of the engine's shared structures, handed to flow and
/// reorder code so they can allocate, queue and emit without owning the
/// world.
pub(crate) struct Ctx<'a> {
    pub pool: &'a mut PacketPool,
    pub send_buffer: &'a mut PacketQueue,
    pub hpsend_buffer: &'a mut PacketQueue,
    pub out: &'a mut VecDeque<Output>,
    pub bandwidth_data: &'a mut u64,
    pub reorder_span: f64,
    pub full_rtt_ms: u64,
    pub streams_paused: bool,
    pub now: Instant,
    pub now64: u64,
}

impl Ctx<'_> {
    /// Queue toward the normal send buffer, accounting wire demand
    pub fn enqueue(&mut self, pkt: Pkt) {
        *self.bandwidth_data += (pkt.borrow().wire_len() + IP4_UDP_OVERHEAD) as u64;
        self.send_buffer.push(pkt);
    }

    /// Queue toward the high-priority send buffer, accounting wire demand
    pub fn enqueue_hp(&mut self, pkt: Pkt) {
        *self.bandwidth_data += (pkt.borrow().wire_len() + IP4_UDP_OVERHEAD) as u64;
        self.hpsend_buffer.push(pkt);
    }

    /// Full-round-trip estimate as a duration
    pub fn full_rtt(&self) -> Duration {
        Duration::from_millis(self.full_rtt_ms)
    }
}

/// The bonding engine
pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) epoch: Instant,
    pub(crate) pool: PacketPool,
    pub(crate) send_buffer: PacketQueue,
    pub(crate) hpsend_buffer: PacketQueue,
    pub(crate) tunnels: Vec<Tunnel>,
    pub(crate) streams: StreamMap,
    pub(crate) reorder: ReorderBuffer,
    pub(crate) out: VecDeque<Output>,

    pub(crate) fallback_mode: bool,
    pub(crate) fallback_available: bool,
    pub(crate) connected: usize,
    pub(crate) hooks_initialized: bool,

    pub(crate) bandwidth: f64,
    pub(crate) bandwidth_data: u64,
    pub(crate) srtt_min_global: f64,
    pub(crate) srtt_max_global: f64,
    pub(crate) reorder_span: f64,

    pub(crate) next_data_seq: u16,
    pub(crate) out_resends: u64,
    pub(crate) tun_paused: bool,
    pub(crate) streams_paused: bool,

    pub(crate) bw_tick_at: Instant,
    pub(crate) last_bw_tick: Instant,
    pub(crate) reorder_tick_at: Instant,
}

impl Engine {
    /// Create an engine with no tunnels yet
    pub fn new(cfg: EngineConfig, now: Instant) -> Self {
        let mut engine = Self {
            streams: StreamMap::new(cfg.server),
            cfg,
            epoch: now,
            pool: PacketPool::new(64),
            send_buffer: PacketQueue::new(SEND_BUFFER_CAP),
            hpsend_buffer: PacketQueue::new(QUEUE_CAP),
            tunnels: Vec::new(),
            reorder: ReorderBuffer::new(),
            out: VecDeque::new(),

            fallback_mode: false,
            fallback_available: false,
            connected: 0,
            hooks_initialized: false,

            bandwidth: 0.0,
            bandwidth_data: 0,
            srtt_min_global: 0.0,
            srtt_max_global: 0.0,
            reorder_span: 0.0,

            next_data_seq: 1,
            out_resends: 0,
            tun_paused: false,
            streams_paused: false,

            bw_tick_at: now + BW_INTERVAL,
            last_bw_tick: now,
            reorder_tick_at: now + REORDER_TICK,
        };
        if engine.cfg.static_tunnel {
            engine.hooks_initialized = true;
            engine.out.push_back(Output::Hook(HookEvent::TunUp));
        }
        engine
    }

    /// Register a tunnel; returns the index used by all driver calls
    pub fn add_tunnel(&mut self, cfg: TunnelCfg, now: Instant) -> usize {
        info!(tunnel = %cfg.name, id = cfg.id, "tunnel registered");
        self.tunnels.push(Tunnel::new(cfg, now));
        self.fallback_available = self
            .tunnels
            .iter()
            .any(|t| !t.retired && t.fallback_only);
        self.update_status();
        self.recalc_weight();
        self.tunnels.len() - 1
    }

    /// All registered tunnels, including retired slots
    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    /// Index of the tunnel with the given name
    pub fn find_tunnel(&self, name: &str) -> Option<usize> {
        self.tunnels
            .iter()
            .position(|t| !t.retired && t.name == name)
    }

    /// AUTHOK tunnel count
    pub fn connected(&self) -> usize {
        self.connected
    }

    /// Whether only fallback tunnels are eligible to carry traffic
    pub fn fallback_mode(&self) -> bool {
        self.fallback_mode
    }

    /// Aggregate demand estimate in kbit/s
    pub fn aggregate_bandwidth(&self) -> f64 {
        self.bandwidth
    }

    /// Lowest smoothed RTT seen across all tunnels, in milliseconds
    pub fn srtt_min_ms(&self) -> f64 {
        self.srtt_min_global
    }

    /// Retransmissions requested from the peer since startup
    pub fn requested_resends(&self) -> u64 {
        self.out_resends
    }

    /// Live spliced flows
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Engine clock in milliseconds
    pub(crate) fn now64(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_millis() as u64
    }

    /// Full-round-trip estimate for stream retransmission, in milliseconds
    pub(crate) fn full_rtt_ms(&self) -> u64 {
        if self.srtt_max_global > 0.0 {
            ((self.srtt_max_global / FULL_RTT_DIVISOR) * 1000.0) as u64
        } else {
            250
        }
    }

    /// Drain the next effect to perform
    pub fn poll_output(&mut self) -> Option<Output> {
        self.out.pop_front()
    }

    /// Earliest deadline any internal timer needs servicing at
    pub fn poll_timeout(&self) -> Instant {
        let mut deadline = self.bw_tick_at.min(self.reorder_tick_at);
        for t in &self.tunnels {
            if t.retired {
                continue;
            }
            deadline = deadline.min(t.check_at);
            if let Some(at) = t.next_send_at {
                deadline = deadline.min(at);
            }
        }
        for s in self.streams.iter() {
            if let Some(at) = s.resend_at {
                deadline = deadline.min(at);
            }
        }
        deadline
    }

    /// Service every timer that is due
    pub fn handle_timeout(&mut self, now: Instant) {
        if now >= self.bw_tick_at {
            self.bandwidth_tick(now);
            while self.bw_tick_at <= now {
                self.bw_tick_at += BW_INTERVAL;
            }
        }
        if now >= self.reorder_tick_at {
            let Engine {
                reorder, pool, out, ..
            } = self;
            reorder.tick(now, pool, out);
            while self.reorder_tick_at <= now {
                self.reorder_tick_at += REORDER_TICK;
            }
        }
        for idx in 0..self.tunnels.len() {
            if self.tunnels[idx].retired {
                continue;
            }
            if now >= self.tunnels[idx].check_at {
                self.tick_check(idx, now);
                let t = &mut self.tunnels[idx];
                t.check_at = now + t.check_interval;
            }
            if self.tunnels[idx].next_send_at.is_some_and(|at| now >= at) {
                self.tunnels[idx].next_send_at = None;
                self.pump_tunnel(idx, true, now);
            }
        }
        let due: Vec<u32> = self
            .streams
            .iter()
            .filter(|s| s.resend_at.is_some_and(|at| now >= at))
            .map(|s| s.flow_id)
            .collect();
        for flow in due {
            self.with_streams(now, |streams, ctx| {
                if let Some(s) = streams.get_mut(flow) {
                    if s.sent.is_empty() {
                        s.resend_at = None;
                    } else {
                        s.maybe_resend(ctx);
                        s.resend_at = Some(ctx.now + ctx.full_rtt());
                    }
                }
            });
        }
        self.pump(now);
    }

    /// Feed a datagram received on a tunnel's socket
    pub fn handle_udp(
        &mut self,
        idx: usize,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<()> {
        let now64 = self.now64(now);
        let (hdr, payload) = match Header::parse(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    tunnel = %self.tunnels[idx].name,
                    "dropping invalid packet: {e}"
                );
                return Ok(());
            }
        };

        let mut resend_for = None;
        let mut recalc = false;
        let mut bad_source = false;
        {
            let t = &mut self.tunnels[idx];
            if t.retired {
                return Ok(());
            }
            t.recv_packets += 1;
            t.recv_bytes += datagram.len() as u64;
            t.pkts_in_interval += 1;
            match t.peer {
                Some(peer) if peer == from => {}
                _ => {
                    if t.is_up() {
                        warn!(
                            tunnel = %t.name,
                            %from,
                            "rejecting datagram from unauthenticated source"
                        );
                        bad_source = true;
                    } else {
                        info!(tunnel = %t.name, %from, "new connection");
                        t.peer = Some(from);
                    }
                }
            }
            if !bad_source {
                resend_for = t.loss_update(hdr.tun_seq);
                t.sent_loss = hdr.sent_loss;
                recalc = t.sent_loss as f64 >= LOSS_TOLERANCE as f64 / 4.0;
                t.observe_rtt(hdr.timestamp, hdr.timestamp_reply, now64);
                t.bm_data += payload.len() as u64;
                t.debit_quota(datagram.len());
            }
        }
        if bad_source {
            self.status_down(idx, now);
            return Ok(());
        }
        if let Some(seq) = resend_for {
            self.request_resend(idx, seq, 1);
        }
        if recalc {
            self.recalc_weight();
        }

        if self.tunnels[idx].is_up() {
            match hdr.kind {
                MsgKind::Data | MsgKind::DataResend => {
                    self.tunnels[idx].tick_activity(now);
                    if hdr.flow_id != 0 {
                        warn!("aggregate packet carries a flow id, dropping");
                    } else {
                        let Engine {
                            reorder, pool, out, ..
                        } = self;
                        let pkt = pool.get_with(hdr, payload);
                        reorder.insert(pkt, now, pool, out);
                    }
                }
                MsgKind::Keepalive => {
                    let t = &mut self.tunnels[idx];
                    t.tick_activity(now);
                    let rate = decode_keepalive(payload);
                    if rate > 0 {
                        t.bandwidth_out = rate;
                    }
                    debug!(tunnel = %t.name, rate, "keepalive received");
                }
                MsgKind::Disconnect => {
                    info!(tunnel = %self.tunnels[idx].name, "disconnect received");
                    self.status_down(idx, now);
                }
                MsgKind::Resend => {
                    self.tunnels[idx].tick_activity(now);
                    match ResendRequest::decode(payload) {
                        Ok(req) => self.service_resend(req),
                        Err(e) => warn!("invalid resend request: {e}"),
                    }
                }
                MsgKind::TcpOpen => {
                    self.tunnels[idx].tick_activity(now);
                    self.on_remote_open(hdr.flow_id, payload, now);
                }
                MsgKind::TcpData | MsgKind::TcpClose | MsgKind::TcpAck => {
                    self.tunnels[idx].tick_activity(now);
                    self.stream_ingress(hdr, payload, now);
                }
                MsgKind::Auth => {
                    self.tunnels[idx].tick_activity(now);
                    self.auth_receive(idx, payload, now)?;
                }
                MsgKind::AuthOk => {}
            }
        } else {
            match hdr.kind {
                MsgKind::Auth | MsgKind::AuthOk => self.auth_receive(idx, payload, now)?,
                _ => debug!(
                    tunnel = %self.tunnels[idx].name,
                    kind = %hdr.kind,
                    "ignoring packet before authentication"
                ),
            }
        }
        self.pump(now);
        Ok(())
    }

    /// The driver failed to send on a tunnel's socket (not WouldBlock)
    pub fn on_send_error(&mut self, idx: usize, now: Instant) {
        warn!(tunnel = %self.tunnels[idx].name, "socket write error");
        self.status_down(idx, now);
    }

    /// Feed an IP packet read from the TUN device
    pub fn on_tun_frame(&mut self, frame: &[u8], now: Instant) {
        let mut hdr = Header::new(MsgKind::Data);
        hdr.data_seq = self.next_aggregate_seq();
        let pkt = self.pool.get_with(hdr, frame);
        self.enqueue_global(pkt);
        if self.send_buffer.is_full() && !self.tun_paused {
            warn!("send buffer full, pausing TUN reads");
            self.tun_paused = true;
            self.out.push_back(Output::TunPause);
        }
        self.pump(now);
    }

    /// A local TCP connection was accepted for splicing; `destination` is
    /// the address the peer must dial. Returns the minted flow id.
    pub fn on_tcp_accept(&mut self, destination: SocketAddr, now: Instant) -> Result<u32> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(CoreError::FlowLimit(self.streams.len()));
        }
        if self.hpsend_buffer.is_full() {
            warn!("high priority buffer full while accepting");
        }
        let flow = self.streams.mint_flow_id();
        self.streams.insert(Stream::new(flow, false));

        let mut payload = BytesMut::new();
        encode_open_addr(destination, &mut payload);
        let mut hdr = Header::new(MsgKind::TcpOpen);
        hdr.flow_id = flow;
        let pkt = self.pool.get_with(hdr, &payload);
        self.enqueue_hp_global(pkt);
        info!(flow, %destination, "accepted local connection");
        self.pump(now);
        Ok(flow)
    }

    /// The dial requested by a peer's TCP_OPEN succeeded
    pub fn on_tcp_connected(&mut self, flow: u32, now: Instant) {
        self.with_streams(now, |streams, ctx| {
            if let Some(s) = streams.get_mut(flow) {
                s.pending_connect = false;
                s.pump_write(ctx);
            }
        });
    }

    /// The dial requested by a peer's TCP_OPEN failed; close the flow so
    /// the peer is not left resending into the void
    pub fn on_tcp_connect_failed(&mut self, flow: u32, now: Instant) {
        warn!(flow, "dial failed, closing flow");
        self.close_flow(flow, now);
    }

    /// Bytes read from a flow's TCP socket
    pub fn on_tcp_read(&mut self, flow: u32, data: &[u8], now: Instant) {
        self.with_streams(now, |streams, ctx| {
            if let Some(s) = streams.get_mut(flow) {
                let pkt = ctx.pool.get();
                pkt.borrow_mut().data.extend_from_slice(data);
                s.send_packet(pkt, MsgKind::TcpData, ctx);
            }
        });
        if self.send_buffer.above_watermark() && !self.streams_paused {
            self.pause_streams();
        }
        self.pump(now);
    }

    /// A flow's TCP socket reached EOF
    pub fn on_tcp_read_closed(&mut self, flow: u32, now: Instant) {
        self.close_flow(flow, now);
    }

    /// The chunk handed out via [`Output::TcpWrite`] was fully written
    pub fn on_tcp_write_done(&mut self, flow: u32, now: Instant) {
        self.with_streams(now, |streams, ctx| {
            if let Some(s) = streams.get_mut(flow) {
                s.write_done(ctx);
            }
        });
        self.pump(now);
    }

    /// Writing to a flow's TCP socket failed
    pub fn on_tcp_write_error(&mut self, flow: u32, now: Instant) {
        warn!(flow, "socket write error, closing flow");
        self.close_flow(flow, now);
    }

    /// Reset every metered tunnel's remaining budget to zero
    pub fn reset_quotas(&mut self) {
        for t in &mut self.tunnels {
            if t.quota > 0 {
                info!(tunnel = %t.name, "quota reset to 0");
                t.permitted = 0;
            }
        }
    }

    /// Preset a metered tunnel's budget, as the CLI allows at startup
    pub fn preset_quota(&mut self, name: &str, bytes: u64) -> bool {
        let mut found = false;
        for t in &mut self.tunnels {
            if t.name == name && t.quota > 0 {
                t.permitted = bytes;
                found = true;
            }
        }
        found
    }

    /// Broadcast DISCONNECT on every authenticated tunnel before exit
    pub fn shutdown(&mut self, now: Instant) {
        info!("shutting down, broadcasting disconnect");
        for idx in 0..self.tunnels.len() {
            if self.tunnels[idx].retired || !self.tunnels[idx].is_up() {
                continue;
            }
            let pkt = self.pool.get_with(Header::new(MsgKind::Disconnect), &[]);
            self.transmit_now(idx, pkt, now);
        }
    }

    /// Apply changed settings to an existing tunnel (config reload)
    pub fn update_tunnel(&mut self, idx: usize, cfg: &TunnelCfg) {
        {
            let t = &mut self.tunnels[idx];
            t.bandwidth_max = if cfg.bandwidth_max == 0 {
                crate::AUTO_BANDWIDTH_START
            } else {
                cfg.bandwidth_max as f64
            };
            t.quota = cfg.quota;
            t.fallback_only = cfg.fallback_only;
            t.timeout = cfg.timeout;
            if cfg.peer.is_some() {
                t.peer = cfg.peer;
            }
        }
        self.fallback_available = self
            .tunnels
            .iter()
            .any(|t| !t.retired && t.fallback_only);
        self.update_status();
        self.recalc_weight();
    }

    /// Remove a tunnel (config reload); the slot index stays valid but
    /// inert
    pub fn retire_tunnel(&mut self, idx: usize, now: Instant) {
        if self.tunnels[idx].retired {
            return;
        }
        info!(tunnel = %self.tunnels[idx].name, "tunnel removed");
        if self.tunnels[idx].is_up() {
            let pkt = self.pool.get_with(Header::new(MsgKind::Disconnect), &[]);
            self.transmit_now(idx, pkt, now);
        }
        self.status_down(idx, now);
        self.tunnels[idx].retired = true;
        {
            let Engine { tunnels, pool, .. } = self;
            let t = &mut tunnels[idx];
            for slot in &mut t.ring {
                if let Some(pkt) = slot.take() {
                    pool.release(pkt);
                }
            }
        }
        self.fallback_available = self
            .tunnels
            .iter()
            .any(|t| !t.retired && t.fallback_only);
        self.update_status();
        self.recalc_weight();
    }

    // ---- internals ----------------------------------------------------

    pub(crate) fn with_streams<R>(
        &mut self,
        now: Instant,
        f: impl FnOnce(&mut StreamMap, &mut Ctx<'_>) -> R,
    ) -> R {
        let now64 = now.duration_since(self.epoch).as_millis() as u64;
        let full_rtt_ms = self.full_rtt_ms();
        let Engine {
            pool,
            send_buffer,
            hpsend_buffer,
            out,
            bandwidth_data,
            streams,
            reorder_span,
            streams_paused,
            ..
        } = self;
        let mut ctx = Ctx {
            pool,
            send_buffer,
            hpsend_buffer,
            out,
            bandwidth_data,
            reorder_span: *reorder_span,
            full_rtt_ms,
            streams_paused: *streams_paused,
            now,
            now64,
        };
        f(streams, &mut ctx)
    }

    fn next_aggregate_seq(&mut self) -> u16 {
        let seq = self.next_data_seq;
        self.next_data_seq = self.next_data_seq.wrapping_add(1);
        if self.next_data_seq == 0 {
            // 0 marks a packet as unsequenced
            self.next_data_seq = 1;
        }
        seq
    }

    pub(crate) fn enqueue_global(&mut self, pkt: Pkt) {
        self.bandwidth_data += (pkt.borrow().wire_len() + IP4_UDP_OVERHEAD) as u64;
        self.send_buffer.push(pkt);
    }

    pub(crate) fn enqueue_hp_global(&mut self, pkt: Pkt) {
        self.bandwidth_data += (pkt.borrow().wire_len() + IP4_UDP_OVERHEAD) as u64;
        self.hpsend_buffer.push(pkt);
    }

    fn stream_ingress(&mut self, hdr: Header, payload: &[u8], now: Instant) {
        let flow = hdr.flow_id;
        let mut closed = false;
        self.with_streams(now, |streams, ctx| {
            let Some(s) = streams.get_mut(flow) else {
                debug!(flow, "packet for unknown flow");
                return;
            };
            if s.handle_from_tunnel(hdr, payload, ctx) == StreamEvent::Closed {
                closed = true;
            }
        });
        if closed {
            self.teardown_stream(flow, now);
        }
    }

    fn teardown_stream(&mut self, flow: u32, now: Instant) {
        self.with_streams(now, |streams, ctx| streams.teardown(flow, ctx));
    }

    fn close_flow(&mut self, flow: u32, now: Instant) {
        self.with_streams(now, |streams, ctx| {
            if let Some(s) = streams.get_mut(flow) {
                s.send_close(ctx);
            }
        });
        self.pump(now);
    }

    fn on_remote_open(&mut self, flow: u32, payload: &[u8], now: Instant) {
        let addr = match decode_open_addr(payload) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("invalid open payload: {e}");
                return;
            }
        };
        if flow == 0 || self.streams.contains(flow) {
            debug!(flow, "duplicate or invalid open");
            return;
        }
        if self.streams.len() >= MAX_STREAMS {
            warn!(flow, "flow limit reached, ignoring open");
            return;
        }
        self.streams.insert(Stream::new(flow, true));
        info!(flow, %addr, "peer opened flow");
        self.out.push_back(Output::TcpConnect { flow, to: addr });
    }

    /// Build a RESEND request for packets lost on tunnel `idx` and queue it
    /// at high priority on whatever tunnel picks it up first.
    pub(crate) fn request_resend(&mut self, idx: usize, seq: u16, len: u16) {
        let req = ResendRequest {
            tun_id: self.tunnels[idx].id,
            seq,
            len,
        };
        let mut payload = BytesMut::new();
        req.encode(&mut payload);
        let pkt = self.pool.get_with(Header::new(MsgKind::Resend), &payload);
        self.out_resends += len as u64;
        self.enqueue_hp_global(pkt);
        debug!(tunnel = %self.tunnels[idx].name, seq, len, "requesting resend");
    }

    /// Service a peer's RESEND request from the retransmission ring
    fn service_resend(&mut self, req: ResendRequest) {
        let Some(idx) = self
            .tunnels
            .iter()
            .position(|t| !t.retired && t.id == req.tun_id)
        else {
            return;
        };
        if req.len as usize > RESEND_RING_SIZE / 4 {
            // a request this large is itself evidence of severe loss
            let t = &mut self.tunnels[idx];
            if t.is_up() {
                info!(
                    tunnel = %t.name,
                    len = req.len,
                    "resend request above threshold, marking lossy"
                );
                t.status = TunnelStatus::Lossy;
                t.sent_loss = 100;
            }
        }
        let resend_udp = self.cfg.resend_udp_payloads;
        let Engine {
            tunnels,
            hpsend_buffer,
            bandwidth_data,
            ..
        } = self;
        let t = &mut tunnels[idx];
        for i in 0..req.len {
            let seq = req.seq.wrapping_add(i);
            let slot = seq as usize % RESEND_RING_SIZE;
            let Some(pkt) = t.ring[slot].take() else {
                debug!(seq, "resend miss: empty slot");
                continue;
            };
            if pkt.borrow().hdr.tun_seq != seq {
                // the ring lapped this sequence already
                debug!(seq, "resend miss: slot reused");
                t.ring[slot] = Some(pkt);
                continue;
            }
            let eligible = {
                let p = pkt.borrow();
                // UDP payloads are skipped: doubling traffic on a lossy
                // path hurts more than the application-level retry does
                p.hdr.kind != MsgKind::Data || resend_udp || is_tcp_payload(&p.data)
            };
            if !eligible {
                t.ring[slot] = Some(pkt);
                continue;
            }
            {
                let mut p = pkt.borrow_mut();
                if p.hdr.kind == MsgKind::Data {
                    p.hdr.kind = MsgKind::DataResend;
                }
            }
            debug!(seq, tunnel = %t.name, "resending from ring");
            *bandwidth_data += (pkt.borrow().wire_len() + IP4_UDP_OVERHEAD) as u64;
            hpsend_buffer.push(pkt);
        }
    }

    /// Give every tunnel a chance to move queued packets to the wire
    pub(crate) fn pump(&mut self, now: Instant) {
        for idx in 0..self.tunnels.len() {
            self.pump_tunnel(idx, false, now);
        }
    }

    /// Send on one tunnel while its pacing budget (or a timer fire) allows
    pub(crate) fn pump_tunnel(&mut self, idx: usize, timed: bool, now: Instant) {
        let mut forced = timed;
        loop {
            {
                let t = &self.tunnels[idx];
                if t.retired || t.peer.is_none() {
                    return;
                }
                if !forced && !t.pacing_allows(now) {
                    if self.tunnel_has_work(idx) && self.tunnels[idx].next_send_at.is_none() {
                        self.tunnels[idx].next_send_at = Some(now + Duration::from_millis(10));
                    }
                    return;
                }
            }
            match self.next_packet_for(idx) {
                Some(pkt) => {
                    self.transmit_now(idx, pkt, now);
                    forced = false;
                }
                None => return,
            }
        }
    }

    fn tunnel_has_work(&self, idx: usize) -> bool {
        let t = &self.tunnels[idx];
        if !t.hpsbuf.is_empty() || !t.sbuf.is_empty() {
            return true;
        }
        if t.status != TunnelStatus::AuthOk {
            return false;
        }
        if t.quota > 0 && t.permitted < (2 * self.cfg.mtu) as u64 {
            return false;
        }
        if self.fallback_mode != t.fallback_only {
            return false;
        }
        (!self.hpsend_buffer.is_empty() && t.sent_loss <= LOSS_TOLERANCE / 4)
            || !self.send_buffer.is_empty()
    }

    /// The lazy scheduler: a tunnel ready to send takes its own queues
    /// first, then pulls from the shared buffers if it is eligible.
    fn next_packet_for(&mut self, idx: usize) -> Option<Pkt> {
        if let Some(pkt) = self.tunnels[idx].hpsbuf.pop() {
            return Some(pkt);
        }
        if let Some(pkt) = self.tunnels[idx].sbuf.pop() {
            return Some(pkt);
        }
        {
            let t = &self.tunnels[idx];
            if t.status != TunnelStatus::AuthOk {
                return None;
            }
            if t.quota > 0 && t.permitted < (2 * self.cfg.mtu) as u64 {
                return None;
            }
            if self.fallback_mode != t.fallback_only {
                return None;
            }
        }
        let take_hp = !self.hpsend_buffer.is_empty()
            && self.tunnels[idx].sent_loss <= LOSS_TOLERANCE / 4;
        let pkt = if take_hp {
            self.hpsend_buffer.pop()
        } else {
            self.send_buffer.pop()
        }?;
        self.after_global_pull();
        Some(pkt)
    }

    /// The shared buffers drained below their marks; wake the producers
    fn after_global_pull(&mut self) {
        if self.tun_paused && !self.send_buffer.is_full() {
            self.tun_paused = false;
            self.out.push_back(Output::TunResume);
        }
        if self.streams_paused && !self.send_buffer.above_watermark() {
            self.streams_paused = false;
            let Engine { streams, out, .. } = self;
            for s in streams.iter_mut() {
                if s.read_paused && s.sent.len() < crate::TCP_MAX_OUTSTANDING {
                    s.read_paused = false;
                    out.push_back(Output::TcpResume { flow: s.flow_id });
                }
            }
        }
    }

    fn pause_streams(&mut self) {
        debug!("send buffer above watermark, pausing stream reads");
        self.streams_paused = true;
        let Engine { streams, out, .. } = self;
        for s in streams.iter_mut() {
            if !s.read_paused {
                s.read_paused = true;
                out.push_back(Output::TcpPause { flow: s.flow_id });
            }
        }
    }

    /// Put one packet on the wire: ring it, stamp it, serialize it
    pub(crate) fn transmit_now(&mut self, idx: usize, pkt: Pkt, now: Instant) {
        let now64 = self.now64(now);
        let Engine {
            tunnels, pool, out, ..
        } = self;
        let t = &mut tunnels[idx];
        let Some(peer) = t.peer else {
            pool.release(pkt);
            return;
        };

        t.store_ring(pkt.clone(), pool);
        let datagram = {
            let mut p = pkt.borrow_mut();
            p.hdr.tun_seq = t.seq;
            p.hdr.sent_loss = t.loss;
            t.stamp_timestamps(&mut p.hdr, now64);
            p.in_flight = false;
            p.last_sent = now64;
            let mut buf = BytesMut::with_capacity(p.wire_len());
            p.hdr.serialize(&p.data, &mut buf);
            buf.freeze()
        };
        t.seq = t.seq.wrapping_add(1);

        let wire = datagram.len();
        t.sent_packets += 1;
        t.sent_bytes += wire as u64;
        t.debit_quota(wire);
        t.after_send(wire, now);
        debug!(
            tunnel = %t.name,
            bytes = wire,
            seq = t.seq.wrapping_sub(1),
            "datagram out"
        );
        out.push_back(Output::Transmit {
            tunnel: idx,
            to: peer,
            datagram,
        });
        // our handle is done; the ring (and possibly a stream) keep it
        pool.release(pkt);
    }
}

/// Aggregate payload carrying TCP (IPv4 protocol field)
fn is_tcp_payload(data: &[u8]) -> bool {
    data.len() > 9 && data[9] == 6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_seq_skips_zero() {
        let mut engine = Engine::new(EngineConfig::default(), Instant::now());
        engine.next_data_seq = 0xffff;
        assert_eq!(engine.next_aggregate_seq(), 0xffff);
        assert_eq!(engine.next_aggregate_seq(), 1);
    }

    #[test]
    fn test_is_tcp_payload() {
        let mut ip = [0u8; 20];
        ip[9] = 6;
        assert!(is_tcp_payload(&ip));
        ip[9] = 17;
        assert!(!is_tcp_payload(&ip));
        assert!(!is_tcp_payload(&[0u8; 4]));
    }
}
