//! Tunnel lifecycle
//!
//! Authentication, keepalive, and the DISCONNECTED → AUTHSENT → AUTHOK ⇄
//! LOSSY → DISCONNECTED transitions, with their side effects: weight
//! recomputation, mass resend requests, hook invocations and the
//! normal/fallback mode of the whole link.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use linkbond_protocol::{
    Challenge, ChallengeKind, Header, MsgKind, PROTOCOL_VERSION, ProtocolError, encode_keepalive,
};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::output::{HookEvent, Output};
use crate::tunnel::TunnelStatus;
use crate::{IO_TIMEOUT, IO_TIMEOUT_MAX, LOSS_TOLERANCE, RESEND_RING_SIZE, Result};

fn dur_from_ms(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}

impl Engine {
    /// Per-tunnel housekeeping, run every half [`IO_TIMEOUT`]: demote or
    /// recover lossy tunnels, retry authentication, send keepalives.
    pub(crate) fn tick_check(&mut self, idx: usize, now: Instant) {
        self.check_lossy(idx, now);

        let expired = {
            let t = &self.tunnels[idx];
            t.status == TunnelStatus::Lossy
                && t.last_activity.is_some_and(|last| {
                    last + t.timeout + IO_TIMEOUT * 2 + dur_from_ms(t.srtt_av * 2.0) < now
                })
        };
        if expired {
            info!(tunnel = %self.tunnels[idx].name, "timeout");
            self.status_down(idx, now);
        }

        match self.tunnels[idx].status {
            TunnelStatus::Disconnected | TunnelStatus::AuthSent => self.tick_connect(idx, now),
            TunnelStatus::AuthOk | TunnelStatus::Lossy => self.send_keepalive(idx, now),
        }
    }

    /// Loss- and silence-driven transitions between AUTHOK and LOSSY
    pub(crate) fn check_lossy(&mut self, idx: usize, now: Instant) {
        let (status, loss, keepalive_ok, seq_last) = {
            let t = &self.tunnels[idx];
            let allowance = IO_TIMEOUT * 2 + dur_from_ms(t.srtt_av * 2.0);
            let keepalive_ok = t.last_activity.is_none_or(|last| last + allowance > now);
            (t.status, t.sent_loss, keepalive_ok, t.seq_last)
        };

        let mut changed = false;
        if !keepalive_ok && status == TunnelStatus::AuthOk {
            info!(tunnel = %self.tunnels[idx].name, "keepalive silence, marking lossy");
            self.tunnels[idx].status = TunnelStatus::Lossy;
            // fear the worst: ask for everything still in the peer's ring
            // while the tunnel may yet come back
            self.request_resend(idx, seq_last, RESEND_RING_SIZE as u16);
            changed = true;
        } else if loss >= LOSS_TOLERANCE && status == TunnelStatus::AuthOk {
            info!(
                tunnel = %self.tunnels[idx].name,
                loss,
                "packet loss above tolerance"
            );
        } else if keepalive_ok && loss < LOSS_TOLERANCE && status == TunnelStatus::Lossy {
            info!(
                tunnel = %self.tunnels[idx].name,
                loss,
                "packet loss acceptable again"
            );
            self.tunnels[idx].status = TunnelStatus::AuthOk;
            changed = true;
        }
        if changed {
            self.update_status();
            self.recalc_weight();
        }
    }

    /// Client-side reconnect: send a challenge and wait. The server side
    /// stays quiet until a challenge arrives.
    fn tick_connect(&mut self, idx: usize, now: Instant) {
        if self.tunnels[idx].server_mode {
            return;
        }
        {
            let t = &mut self.tunnels[idx];
            t.conn_attempts += 1;
            if t.conn_attempts > 3 && t.check_interval < IO_TIMEOUT_MAX {
                t.check_interval = (t.check_interval * 3 / 2).min(IO_TIMEOUT_MAX);
            }
            t.status = TunnelStatus::AuthSent;
        }
        debug!(tunnel = %self.tunnels[idx].name, "sending challenge");
        self.queue_auth(idx, ChallengeKind::Auth, now);
    }

    /// Keepalive payload is our measured receive rate; the peer folds it
    /// into its bandwidth hunt as `bandwidth_out`.
    fn send_keepalive(&mut self, idx: usize, now: Instant) {
        if self.tunnels[idx].hpsbuf.is_full() {
            warn!(tunnel = %self.tunnels[idx].name, "high priority buffer overflow");
            return;
        }
        let payload = encode_keepalive(self.tunnels[idx].bandwidth_measured);
        let pkt = self.pool.get_with(Header::new(MsgKind::Keepalive), &payload);
        debug!(tunnel = %self.tunnels[idx].name, "sending keepalive");
        self.tunnels[idx].hpsbuf.push(pkt);
        self.pump_tunnel(idx, false, now);
    }

    /// Process an AUTH or AUTH_OK challenge payload
    pub(crate) fn auth_receive(&mut self, idx: usize, payload: &[u8], now: Instant) -> Result<()> {
        let challenge = match Challenge::decode(payload) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(tunnel = %self.tunnels[idx].name, "malformed challenge: {e}");
                return Ok(());
            }
        };
        if challenge.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: challenge.version,
            }
            .into());
        }
        if challenge.password != self.cfg.password {
            warn!(tunnel = %self.tunnels[idx].name, "invalid password");
            return Ok(());
        }
        {
            let t = &mut self.tunnels[idx];
            t.tick_activity(now);
            // both sides may advertise a quota budget; the larger one wins
            if challenge.permitted > t.permitted {
                t.permitted = challenge.permitted;
            }
        }

        let server = self.tunnels[idx].server_mode;
        match challenge.kind {
            ChallengeKind::Auth if server => {
                info!(tunnel = %self.tunnels[idx].name, "authenticated");
                // mark up before queueing anything on it
                self.status_up(idx, now);
                self.queue_auth(idx, ChallengeKind::Ok, now);
            }
            ChallengeKind::Ok if !server => {
                if self.tunnels[idx].status == TunnelStatus::AuthSent {
                    info!(tunnel = %self.tunnels[idx].name, "authenticated");
                    self.status_up(idx, now);
                }
            }
            _ => debug!(tunnel = %self.tunnels[idx].name, "challenge in unexpected direction"),
        }
        Ok(())
    }

    fn queue_auth(&mut self, idx: usize, kind: ChallengeKind, now: Instant) {
        let challenge = {
            let t = &self.tunnels[idx];
            let permitted = if t.quota > 0 { t.permitted } else { 0 };
            Challenge::new(kind, permitted, &self.cfg.password)
        };
        let mut payload = BytesMut::new();
        challenge.encode(&mut payload);
        let msg = match kind {
            ChallengeKind::Auth => MsgKind::Auth,
            ChallengeKind::Ok => MsgKind::AuthOk,
        };
        if self.tunnels[idx].hpsbuf.is_full() {
            warn!(tunnel = %self.tunnels[idx].name, "high priority buffer overflow");
        }
        let pkt = self.pool.get_with(Header::new(msg), &payload);
        self.tunnels[idx].hpsbuf.push(pkt);
        self.pump_tunnel(idx, false, now);
    }

    /// Transition a tunnel to AUTHOK
    pub(crate) fn status_up(&mut self, idx: usize, now: Instant) {
        let was_up = {
            let t = &mut self.tunnels[idx];
            let was_up = t.is_up();
            t.status = TunnelStatus::AuthOk;
            t.reset_on_up(now);
            was_up
        };
        self.update_status();
        self.recalc_weight();
        if !was_up {
            let name = self.tunnels[idx].name.clone();
            self.out.push_back(Output::Hook(HookEvent::LinkUp(name)));
            self.tuntap_up();
        }
        // stale queued traffic belongs to the previous association
        let Engine { tunnels, pool, .. } = self;
        let t = &mut tunnels[idx];
        t.sbuf.clear_into(pool);
        t.hpsbuf.clear_into(pool);
    }

    /// Transition a tunnel to DISCONNECTED
    pub(crate) fn status_down(&mut self, idx: usize, _now: Instant) {
        let (was_up, seq_last) = {
            let Engine { tunnels, pool, .. } = self;
            let t = &mut tunnels[idx];
            let was_up = t.is_up();
            t.status = TunnelStatus::Disconnected;
            t.reset_on_down();
            // hpsbuf holds tunnel-specific traffic, useless now; sbuf the
            // peer will re-request what actually mattered
            t.hpsbuf.clear_into(pool);
            t.sbuf.clear_into(pool);
            (was_up, t.seq_last)
        };
        // everything possibly in flight toward us is suspect
        self.request_resend(idx, seq_last, RESEND_RING_SIZE as u16);
        self.update_status();
        self.recalc_weight();
        if was_up {
            let name = self.tunnels[idx].name.clone();
            self.out.push_back(Output::Hook(HookEvent::LinkDown(name)));
            if self.connected == 0 && self.hooks_initialized && !self.cfg.static_tunnel {
                self.hooks_initialized = false;
                self.out.push_back(Output::Hook(HookEvent::TunDown));
            }
        }
    }

    fn tuntap_up(&mut self) {
        if self.connected > 0 && !self.hooks_initialized {
            self.hooks_initialized = true;
            self.out.push_back(Output::Hook(HookEvent::TunUp));
        }
    }

    /// Recompute the connected count and normal/fallback mode
    pub(crate) fn update_status(&mut self) {
        let mut fallback = self.fallback_available;
        let mut connected = 0;
        for t in &self.tunnels {
            if t.retired {
                continue;
            }
            if t.status == TunnelStatus::AuthOk {
                if !t.fallback_only {
                    fallback = false;
                }
                connected += 1;
            }
        }
        if self.fallback_mode != fallback || self.connected != connected {
            self.fallback_mode = fallback;
            self.connected = connected;
            if fallback || connected == 0 {
                if self.fallback_available {
                    info!("all primary tunnels down or lossy, switching to fallback mode");
                } else {
                    info!("all tunnels down or lossy, fallback not available");
                }
            } else {
                info!(connected, "tunnels up, normal mode");
            }
        }
    }
}
