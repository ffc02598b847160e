//! Bandwidth controller and weight scheduler
//!
//! Every 100 ms: drain the RTT accumulators, credit quotas, measure
//! inbound throughput, hunt each tunnel's ceiling with a slow-drift
//! high-watermark probe, then split the aggregate demand across tunnels as
//! pacing weights shaped by loss and RTT penalties.

use std::time::Instant;

use tracing::debug;

use crate::engine::Engine;
use crate::tunnel::TunnelStatus;
use crate::{BW_INTERVAL, DEFAULT_MTU, LOSS_TOLERANCE};

impl Engine {
    /// The 100 ms controller tick
    pub(crate) fn bandwidth_tick(&mut self, now: Instant) {
        // use the measured interval when it is sane, the nominal one when
        // the loop stalled or fired early
        let nominal = BW_INTERVAL.as_secs_f64();
        let measured = now.duration_since(self.last_bw_tick).as_secs_f64();
        let diff = if measured > nominal / 2.0 && measured < nominal * 2.0 {
            measured
        } else {
            nominal
        };
        self.last_bw_tick = now;

        // aggregate demand in kbit/s, smoothed
        self.bandwidth =
            (self.bandwidth * 9.0 + (self.bandwidth_data as f64 / 128.0) / diff) / 10.0;
        self.bandwidth_data = 0;

        let mut max_srtt = 0.0f64;
        let mut min_srtt = 0.0f64;

        for t in &mut self.tunnels {
            if t.retired {
                continue;
            }
            if t.is_up() {
                // quota is configured in kbit/s; permitted is bytes
                if t.quota > 0 {
                    t.permitted += (t.quota as f64 * diff * 128.0) as u64;
                }

                if t.srtt_samples > 2 {
                    t.srtt = t.srtt_sum / t.srtt_samples as f64;
                    if t.srtt_min <= 0.0 || t.srtt < t.srtt_min {
                        t.srtt_min = t.srtt;
                    }
                    if self.srtt_min_global <= 0.0 || t.srtt < self.srtt_min_global {
                        self.srtt_min_global = t.srtt;
                    }
                    t.srtt_sum = 0.0;
                    t.srtt_samples = 0;
                } else {
                    t.srtt = t.srtt_min;
                }
                t.srtt_av = (t.srtt_av * 9.0 + t.srtt) / 10.0;

                if min_srtt <= 0.0 || t.srtt_av < min_srtt {
                    min_srtt = t.srtt_av;
                }
                if max_srtt <= 0.0 || t.srtt_av > max_srtt {
                    max_srtt = t.srtt_av;
                }

                // inbound rate over this interval, kbit/s
                t.bandwidth_measured = (t.bm_data / 128) * 10;
                t.bm_data = 0;

                let bw_sent = (t.bytes_since_adjust as f64 / 128.0) / diff;
                let reductions = if t.pkts_in_interval < 10 {
                    0.0
                } else {
                    (t.srtt_reductions as f64 / t.pkts_in_interval as f64) * 100.0
                };
                t.pkts_in_interval = 0;
                t.srtt_reductions = 0;

                if bw_sent > t.bandwidth_max / 2.0 {
                    // probing regime: we pushed enough to learn something
                    let mut new_bwm = t.bandwidth_max;
                    if (t.sent_loss as f64) < LOSS_TOLERANCE as f64 / 4.0
                        && t.srtt < 3.0 * t.srtt_min
                    {
                        if t.sent_loss == 0
                            && (t.bandwidth_out as f64) > t.bandwidth_max * 0.80
                        {
                            if t.lossless {
                                // two clean intervals in a row: fast growth
                                new_bwm *= 1.01;
                            } else {
                                t.lossless = true;
                            }
                        } else {
                            if t.sent_loss != 0 && t.lossless {
                                // walk back the previous fast growth
                                new_bwm *= 0.99;
                            }
                            t.lossless = false;
                        }
                        if (t.bandwidth_out as f64) > t.bandwidth_max {
                            // the peer is receiving more than we thought
                            // possible; follow it up
                            new_bwm = (new_bwm * 9.0 + t.bandwidth_out as f64) / 10.0;
                        }
                    } else {
                        if t.lossless {
                            new_bwm *= 0.99;
                        }
                        if t.srtt > 3.0 * t.srtt_min {
                            new_bwm *= 0.99;
                        }
                        t.lossless = false;
                        if (t.bandwidth_out as f64) < bw_sent {
                            new_bwm *= 0.995;
                        }
                        if new_bwm < 100.0 {
                            new_bwm = 100.0;
                        }
                    }
                    t.bandwidth_max = new_bwm;
                } else {
                    if reductions > 50.0 {
                        t.bandwidth_max *= 0.99;
                    }
                    if t.bandwidth_max < 100.0 {
                        t.bandwidth_max = 100.0;
                    }
                    t.lossless = false;
                }
            }
            t.bytes_since_adjust = 0;
            t.last_adjust = now;
        }

        if min_srtt > 0.0 && max_srtt > 0.0 {
            self.reorder_span = max_srtt / min_srtt;
            self.reorder.set_span(self.reorder_span);
        }
        if max_srtt > 0.0 {
            self.srtt_max_global = max_srtt;
        }

        self.recalc_weight();
    }

    /// Split the demand across eligible tunnels.
    ///
    /// A tunnel's share starts from its `bandwidth_max`, shrinks with the
    /// loss the peer reports back and with RTT inflation, and the demand
    /// grows to compensate so healthier tunnels absorb the shifted load.
    pub(crate) fn recalc_weight(&mut self) {
        let mut bwneeded = (self.bandwidth * 2.0).max(1000.0);
        let mut bwavailable = 0.0;
        let fallback = self.fallback_mode;

        let mut total = 0.0;
        let mut tuns = 0;
        for t in &mut self.tunnels {
            if t.retired {
                continue;
            }
            let eligible = (t.quota == 0
                || (t.permitted as f64) > t.bandwidth_max * 128.0 * 0.1)
                && t.status == TunnelStatus::AuthOk
                && fallback == t.fallback_only;
            if eligible {
                t.weight = bwneeded / 50.0;
                total += t.bandwidth_max;
            } else {
                t.weight = 0.0;
            }
            tuns += 1;
        }

        if bwneeded < total / 4.0 {
            bwneeded = total / 4.0;
        }
        if self.send_buffer.len() > tuns * 2 {
            // backlog: stop rationing, use everything the tunnels declare
            bwneeded = total;
        }

        for t in &mut self.tunnels {
            if t.retired {
                continue;
            }
            if t.status != TunnelStatus::AuthOk || fallback != t.fallback_only {
                continue;
            }
            if t.quota != 0 && (t.permitted as f64) <= t.bandwidth_max * 128.0 * 0.1 {
                continue;
            }

            let mut part = 1.0f64;
            let lt = LOSS_TOLERANCE as f64 / 2.0;
            if t.sent_loss as f64 >= lt {
                part = 1.0 - ((t.sent_loss as f64 - lt) / lt);
                if part <= 0.2 {
                    part = 0.2;
                    t.srtt_reductions += 1;
                }
            }
            // an inflated RTT does not slow this link by itself, it routes
            // the surplus to the others
            if t.srtt > t.srtt_min * 2.0 {
                part *= (t.srtt_min * 2.0) / t.srtt;
                if part <= 0.2 {
                    part = 0.2;
                }
            }

            let bw = bwneeded - bwavailable;
            if bw > 0.0 {
                if t.quota != 0 && t.bandwidth_max * part > bw {
                    // let the metered link soak up what remains
                    t.weight = bw * part;
                    bwavailable += bw * part;
                } else if t.bandwidth_max * part < bw {
                    t.weight = t.bandwidth_max * part;
                    bwavailable += t.bandwidth_max * part;
                    bwneeded += t.bandwidth_max * (1.0 - part);
                } else {
                    t.weight = bw * part;
                    bwavailable += bw * part;
                    bwneeded += bw * (1.0 - part);
                }
            }
        }

        for t in &mut self.tunnels {
            if t.retired {
                continue;
            }
            if t.weight > 0.0 {
                t.bytes_per_sec = t.weight * 128.0;
            } else {
                // enough allowance for keepalives and reconnect traffic
                t.bytes_per_sec = (DEFAULT_MTU * 2) as f64;
            }
            debug!(
                tunnel = %t.name,
                weight = t.weight,
                bytes_per_sec = t.bytes_per_sec,
                "weight recomputed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::tunnel::TunnelCfg;
    use std::time::Duration;

    fn engine_with(tunnels: Vec<TunnelCfg>) -> Engine {
        let now = Instant::now();
        let mut engine = Engine::new(
            EngineConfig {
                password: "pw".into(),
                ..EngineConfig::default()
            },
            now,
        );
        for cfg in tunnels {
            engine.add_tunnel(cfg, now);
        }
        engine
    }

    fn cfg(name: &str, bandwidth_max: u32) -> TunnelCfg {
        TunnelCfg {
            name: name.into(),
            id: 5000,
            server_mode: false,
            peer: Some("127.0.0.1:5000".parse().unwrap()),
            bandwidth_max,
            quota: 0,
            fallback_only: false,
            timeout: Duration::from_secs(30),
        }
    }

    fn force_up(engine: &mut Engine, idx: usize) {
        engine.tunnels[idx].status = TunnelStatus::AuthOk;
        engine.tunnels[idx].srtt = 40.0;
        engine.tunnels[idx].srtt_min = 40.0;
        engine.update_status();
    }

    #[test]
    fn test_equal_tunnels_get_equal_weight() {
        let mut engine = engine_with(vec![cfg("a", 1000), cfg("b", 1000)]);
        force_up(&mut engine, 0);
        force_up(&mut engine, 1);
        // saturating demand: both ceilings are needed in full
        engine.bandwidth = 1000.0;
        engine.recalc_weight();
        let a = engine.tunnels[0].weight;
        let b = engine.tunnels[1].weight;
        assert!(a > 0.0 && b > 0.0);
        assert!((a - b).abs() < f64::EPSILON, "a={a} b={b}");
        assert_eq!(
            engine.tunnels[0].bytes_per_sec,
            engine.tunnels[0].weight * 128.0
        );
    }

    #[test]
    fn test_lossy_tunnel_weight_clipped() {
        let mut engine = engine_with(vec![cfg("a", 1000), cfg("b", 1000)]);
        force_up(&mut engine, 0);
        force_up(&mut engine, 1);
        engine.bandwidth = 1000.0;
        // peer reports heavy loss on b: penalty clips at 0.2
        engine.tunnels[1].sent_loss = 50;
        engine.recalc_weight();
        let a = engine.tunnels[0].weight;
        let b = engine.tunnels[1].weight;
        assert!(b < a);
        assert!(b >= a * 0.19, "clip floor holds: a={a} b={b}");
    }

    #[test]
    fn test_down_tunnel_gets_idle_allowance() {
        let mut engine = engine_with(vec![cfg("a", 1000)]);
        engine.recalc_weight();
        assert_eq!(engine.tunnels[0].weight, 0.0);
        assert_eq!(engine.tunnels[0].bytes_per_sec, (DEFAULT_MTU * 2) as f64);
    }

    #[test]
    fn test_quota_without_budget_excluded() {
        let mut engine = engine_with(vec![cfg("a", 1000)]);
        force_up(&mut engine, 0);
        engine.tunnels[0].quota = 100;
        engine.tunnels[0].permitted = 0;
        engine.recalc_weight();
        assert_eq!(engine.tunnels[0].weight, 0.0);

        // the 100 ms tick credits quota * diff * 128 bytes
        engine.tunnels[0].permitted = (1000.0 * 128.0 * 0.1) as u64 + 1;
        engine.recalc_weight();
        assert!(engine.tunnels[0].weight > 0.0);
    }

    #[test]
    fn test_fallback_only_excluded_in_normal_mode() {
        let mut engine = engine_with(vec![cfg("a", 1000)]);
        let mut fb = cfg("fb", 1000);
        fb.fallback_only = true;
        let now = Instant::now();
        engine.add_tunnel(fb, now);
        force_up(&mut engine, 0);
        force_up(&mut engine, 1);
        engine.recalc_weight();
        assert!(engine.tunnels[0].weight > 0.0);
        assert_eq!(engine.tunnels[1].weight, 0.0);
        assert!(!engine.fallback_mode());
    }

    #[test]
    fn test_fallback_mode_flips_eligibility() {
        let mut engine = engine_with(vec![cfg("a", 1000)]);
        let mut fb = cfg("fb", 1000);
        fb.fallback_only = true;
        let now = Instant::now();
        engine.add_tunnel(fb, now);
        // only the fallback tunnel is up
        force_up(&mut engine, 1);
        assert!(engine.fallback_mode());
        engine.recalc_weight();
        assert_eq!(engine.tunnels[0].weight, 0.0);
        assert!(engine.tunnels[1].weight > 0.0);
    }

    #[test]
    fn test_probe_grows_on_clean_interval() {
        let mut engine = engine_with(vec![cfg("a", 1000)]);
        force_up(&mut engine, 0);
        let now = Instant::now();
        engine.tunnels[0].last_adjust = now;
        engine.tunnels[0].bandwidth_out = 900; // peer receives > 80% of max
        engine.tunnels[0].sent_loss = 0;

        // push enough traffic to count as probing
        let later = now + BW_INTERVAL;
        engine.tunnels[0].bytes_since_adjust = 8000; // 625 kbit/s > max/2
        engine.last_bw_tick = now;
        engine.bandwidth_tick(later);
        assert!(engine.tunnels[0].lossless);
        let before = engine.tunnels[0].bandwidth_max;

        engine.tunnels[0].bytes_since_adjust = 8000;
        engine.bandwidth_tick(later + BW_INTERVAL);
        assert!(engine.tunnels[0].bandwidth_max > before, "fast growth");
    }

    #[test]
    fn test_probe_backs_off_on_rtt_inflation() {
        let mut engine = engine_with(vec![cfg("a", 1000)]);
        force_up(&mut engine, 0);
        let now = Instant::now();
        // three 200 ms samples this interval against a 40 ms floor
        engine.tunnels[0].srtt_sum = 600.0;
        engine.tunnels[0].srtt_samples = 3;
        engine.tunnels[0].srtt_min = 40.0;
        engine.tunnels[0].bytes_since_adjust = 8000;
        engine.tunnels[0].bandwidth_out = 2000;
        engine.last_bw_tick = now;
        let before = engine.tunnels[0].bandwidth_max;
        engine.bandwidth_tick(now + BW_INTERVAL);
        assert!(engine.tunnels[0].bandwidth_max < before);
    }

    #[test]
    fn test_quota_credit_rate() {
        let mut engine = engine_with(vec![cfg("a", 1000)]);
        force_up(&mut engine, 0);
        engine.tunnels[0].quota = 100; // kbit/s
        let now = Instant::now();
        engine.last_bw_tick = now;
        engine.bandwidth_tick(now + BW_INTERVAL);
        // 100 kbit/s for 100 ms = 1280 bytes
        assert_eq!(engine.tunnels[0].permitted, 1280);
    }

    #[test]
    fn test_ceiling_floor() {
        let mut engine = engine_with(vec![cfg("a", 1000)]);
        force_up(&mut engine, 0);
        engine.tunnels[0].bandwidth_max = 90.0;
        let now = Instant::now();
        engine.last_bw_tick = now;
        engine.bandwidth_tick(now + BW_INTERVAL);
        assert!(engine.tunnels[0].bandwidth_max >= 100.0);
    }
}
