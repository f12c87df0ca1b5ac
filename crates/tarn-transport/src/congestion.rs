//! # Congestion Control
//!
//! Two interchangeable controllers behind one dispatch enum; a session picks
//! one at start. Both expose the window in bytes and an optional pacing
//! delay to the retransmission engine.
//!
//! ## CUBIC (RFC 8312)
//!
//! ```text
//!           cwnd ≥ ssthresh            3 dup ACKs
//!  SLOW_START ─────────▶ CONGESTION_AVOIDANCE ─────────▶ FAST_RECOVERY
//!      ▲                        ▲                             │
//!      │                        └── ACK ≥ recovery_point ─────┘
//!      └──────────────── RTO expiry (from any phase)
//! ```
//!
//! The cubic curve is computed in packets and converted to bytes at the
//! boundary. A TCP-friendly floor (`tcp_cwnd`) guarantees the window never
//! falls below what standard TCP would achieve.
//!
//! ## BBR
//!
//! ```text
//!  STARTUP ──bw plateau (3 rounds)──▶ DRAIN ──inflight ≤ BDP──▶ PROBE_BW
//!                                                 ▲                │
//!                                                 └── 200 ms ── PROBE_RTT
//!                                                      (rt_prop stale 10 s)
//! ```
//!
//! Model-based: bottleneck bandwidth is the max of a 10-sample delivery-rate
//! filter, `rt_prop` the min RTT over a 10-second expiry window. The window
//! is `cwnd_gain · BtlBw · RTprop`, loss does not collapse it.

use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use quanta::Instant;
use tracing::debug;

use crate::wire::MSS;

const MSS_F: f64 = MSS as f64;

// ─── Algorithm Selection ─────────────────────────────────────────────────────

/// Which congestion controller a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Cubic,
    Bbr,
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cubic" => Ok(Algorithm::Cubic),
            "bbr" => Ok(Algorithm::Bbr),
            other => Err(format!("unknown congestion algorithm '{other}'")),
        }
    }
}

// ─── CUBIC ───────────────────────────────────────────────────────────────────

/// CUBIC phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubicPhase {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

const CUBIC_C: f64 = 0.4;
const CUBIC_BETA: f64 = 0.7;
/// Initial slow-start threshold in packets.
const INITIAL_SSTHRESH: f64 = 64.0;

/// CUBIC congestion controller. All window state in packets (f64).
pub struct CubicController {
    phase: CubicPhase,
    /// Congestion window, packets.
    cwnd: f64,
    /// Slow-start threshold, packets.
    ssthresh: f64,
    /// Window at the last congestion event — the saddle of the cubic curve.
    w_max: f64,
    /// Previous `w_max`, for fast convergence.
    w_last_max: f64,
    /// Start of the current congestion-avoidance epoch.
    epoch_start: Option<Instant>,
    /// Seconds for the cubic curve to return to `w_max`.
    k: f64,
    /// TCP-friendly window estimate (Reno-equivalent growth).
    tcp_cwnd: f64,
    /// Sequence that must be cumulatively acked to leave fast recovery.
    recovery_point: u32,
}

impl CubicController {
    pub fn new() -> Self {
        CubicController {
            phase: CubicPhase::SlowStart,
            cwnd: 1.0,
            ssthresh: INITIAL_SSTHRESH,
            w_max: 0.0,
            w_last_max: 0.0,
            epoch_start: None,
            k: 0.0,
            tcp_cwnd: 1.0,
            recovery_point: 0,
        }
    }

    pub fn cwnd_bytes(&self) -> u64 {
        (self.cwnd * MSS_F) as u64
    }

    pub fn ssthresh_bytes(&self) -> u64 {
        (self.ssthresh * MSS_F) as u64
    }

    pub fn phase(&self) -> CubicPhase {
        self.phase
    }

    /// A new cumulative ACK arrived.
    pub fn on_new_ack(&mut self, bytes_acked: u64, cum_ack: u32, srtt: Duration, now: Instant) {
        let acked = bytes_acked as f64 / MSS_F;

        if self.phase == CubicPhase::FastRecovery {
            if cum_ack >= self.recovery_point {
                self.cwnd = self.ssthresh;
                self.tcp_cwnd = self.ssthresh;
                self.phase = CubicPhase::CongestionAvoidance;
                self.epoch_start = None;
                debug!(cwnd_pkts = self.cwnd, "left fast recovery");
            }
            // Partial ACKs during recovery do not grow the window.
            return;
        }

        match self.phase {
            CubicPhase::SlowStart => {
                self.cwnd += acked;
                self.tcp_cwnd = self.cwnd;
                if self.cwnd >= self.ssthresh {
                    self.phase = CubicPhase::CongestionAvoidance;
                    self.w_max = self.cwnd;
                    self.epoch_start = Some(now);
                    self.k = 0.0;
                    debug!(cwnd_pkts = self.cwnd, "slow start → congestion avoidance");
                }
            }
            CubicPhase::CongestionAvoidance => self.cubic_update(acked, srtt, now),
            CubicPhase::FastRecovery => unreachable!("handled above"),
        }
    }

    /// RFC 8312 window growth during congestion avoidance.
    fn cubic_update(&mut self, acked: f64, srtt: Duration, now: Instant) {
        let epoch = match self.epoch_start {
            Some(epoch) => epoch,
            None => {
                self.k = if self.cwnd < self.w_max {
                    ((self.w_max * (1.0 - CUBIC_BETA)) / CUBIC_C).max(0.0).cbrt()
                } else {
                    0.0
                };
                self.epoch_start = Some(now);
                now
            }
        };

        let t = now.duration_since(epoch).as_secs_f64();
        let rtt = srtt.as_secs_f64();
        let w_cubic = CUBIC_C * (t - self.k).powi(3) + self.w_max;

        self.tcp_cwnd += acked / self.tcp_cwnd;

        if w_cubic < self.tcp_cwnd {
            // TCP-friendly region: never slower than Reno.
            self.cwnd = self.cwnd.max(self.tcp_cwnd.min(self.cwnd + acked));
        } else {
            let w_target = CUBIC_C * (t + rtt - self.k).powi(3) + self.w_max;
            let per_packet = if w_target > self.cwnd {
                // Concave/convex growth toward the target, at most one
                // packet of growth per packet acked.
                ((w_target - self.cwnd) / self.cwnd).min(1.0)
            } else {
                // At or past the saddle with a flat target: minimal growth.
                1.0 / self.cwnd
            };
            self.cwnd += per_packet * acked;
        }
        self.cwnd = self.cwnd.max(1.0);
    }

    /// Third duplicate ACK for the current base: fast retransmit was issued,
    /// enter fast recovery.
    pub fn on_triple_dup_ack(&mut self, next_seq: u32) {
        let before = self.cwnd;
        self.apply_fast_convergence();
        self.ssthresh = (self.cwnd * CUBIC_BETA).max(2.0);
        // Inflate by the three segments known to have left the network, but
        // never grow the window across a congestion event.
        self.cwnd = (self.ssthresh + 3.0).min(before);
        self.tcp_cwnd = self.ssthresh;
        self.phase = CubicPhase::FastRecovery;
        self.recovery_point = next_seq;
        self.epoch_start = None;
        debug!(
            cwnd_pkts = self.cwnd,
            ssthresh_pkts = self.ssthresh,
            recovery_point = next_seq,
            "entering fast recovery"
        );
    }

    /// Duplicate ACK beyond the third while in fast recovery.
    pub fn on_dup_ack(&mut self) {
        if self.phase == CubicPhase::FastRecovery {
            self.cwnd += 1.0;
        }
    }

    /// Retransmission timer expired.
    pub fn on_timeout(&mut self) {
        self.apply_fast_convergence();
        self.ssthresh = (self.cwnd * CUBIC_BETA).max(2.0);
        self.cwnd = 1.0;
        self.tcp_cwnd = 1.0;
        self.phase = CubicPhase::SlowStart;
        self.epoch_start = None;
        debug!(ssthresh_pkts = self.ssthresh, "timeout — window collapsed");
    }

    /// Release the saddle point early when losses come before the previous
    /// `w_max` was reached, so competing flows converge faster.
    fn apply_fast_convergence(&mut self) {
        if self.cwnd < self.w_last_max {
            self.w_max = self.cwnd * (1.0 + CUBIC_BETA) / 2.0;
        } else {
            self.w_max = self.cwnd;
        }
        self.w_last_max = self.w_max;
    }
}

impl Default for CubicController {
    fn default() -> Self {
        Self::new()
    }
}

// ─── BBR ─────────────────────────────────────────────────────────────────────

/// BBR mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrMode {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

const STARTUP_GAIN: f64 = 2.77;
const DRAIN_GAIN: f64 = 1.0 / 2.77;
const PROBE_BW_GAINS: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
const PROBE_BW_CWND_GAIN: f64 = 2.0;
const BW_FILTER_LEN: usize = 10;
const RT_PROP_EXPIRY: Duration = Duration::from_secs(10);
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);
const STARTUP_GROWTH: f64 = 1.25;
const STARTUP_PLATEAU_ROUNDS: u32 = 3;
/// Window floor and ProbeRtt cap, packets.
const MIN_CWND_PKTS: f64 = 4.0;
/// Round length fallback before the first RTT sample.
const DEFAULT_ROUND: Duration = Duration::from_millis(100);

/// BBR congestion controller.
pub struct BbrController {
    mode: BbrMode,
    /// Delivery-rate samples, bytes/sec. BtlBw is the max of this window.
    bw_samples: VecDeque<f64>,
    btl_bw: f64,
    /// Minimum RTT over the expiry window.
    rt_prop: Option<Duration>,
    rt_prop_stamp: Instant,
    probe_rtt_since: Option<Instant>,
    pacing_gain: f64,
    cwnd_gain: f64,
    /// Position in the PROBE_BW gain cycle.
    cycle_index: usize,
    /// Start of the current round (one RTprop).
    round_stamp: Instant,
    /// Best bandwidth seen; plateau detection for leaving STARTUP.
    full_bw: f64,
    full_bw_rounds: u32,
    last_ack_at: Option<Instant>,
}

impl BbrController {
    pub fn new(now: Instant) -> Self {
        BbrController {
            mode: BbrMode::Startup,
            bw_samples: VecDeque::with_capacity(BW_FILTER_LEN),
            btl_bw: 0.0,
            rt_prop: None,
            rt_prop_stamp: now,
            probe_rtt_since: None,
            pacing_gain: STARTUP_GAIN,
            cwnd_gain: STARTUP_GAIN,
            cycle_index: 0,
            round_stamp: now,
            full_bw: 0.0,
            full_bw_rounds: 0,
            last_ack_at: None,
        }
    }

    pub fn mode(&self) -> BbrMode {
        self.mode
    }

    /// Estimated bottleneck bandwidth, bytes/sec.
    pub fn btl_bw(&self) -> f64 {
        self.btl_bw
    }

    /// Minimum RTT estimate.
    pub fn rt_prop(&self) -> Option<Duration> {
        self.rt_prop
    }

    /// Bandwidth-delay product, bytes.
    fn bdp_bytes(&self) -> f64 {
        match self.rt_prop {
            Some(rtt) => self.btl_bw * rtt.as_secs_f64(),
            None => 0.0,
        }
    }

    pub fn cwnd_bytes(&self) -> u64 {
        let floor = MIN_CWND_PKTS * MSS_F;
        if self.mode == BbrMode::ProbeRtt {
            return floor as u64;
        }
        (self.cwnd_gain * self.bdp_bytes()).max(floor) as u64
    }

    /// Inter-send gap that realizes `pacing_gain · BtlBw`.
    pub fn pacing_delay(&self) -> Option<Duration> {
        if self.btl_bw <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            MSS_F / (self.pacing_gain * self.btl_bw),
        ))
    }

    /// Feed one acknowledgment: delivered bytes, an optional clean RTT
    /// sample, and the in-flight level after the ACK was applied.
    pub fn on_ack(
        &mut self,
        bytes_delivered: u64,
        rtt_sample: Option<Duration>,
        in_flight: u64,
        now: Instant,
    ) {
        // Delivery-rate sample over the inter-ACK interval.
        if let Some(last) = self.last_ack_at {
            let interval = now.duration_since(last).as_secs_f64();
            if interval > 0.0 {
                let bw = bytes_delivered as f64 / interval;
                if self.bw_samples.len() == BW_FILTER_LEN {
                    self.bw_samples.pop_front();
                }
                self.bw_samples.push_back(bw);
                self.btl_bw = self.bw_samples.iter().cloned().fold(0.0, f64::max);
            }
        }
        self.last_ack_at = Some(now);

        // RTprop: windowed min with expiry. Staleness is judged before the
        // filter refresh so it can still trigger a ProbeRtt entry below.
        let rt_prop_stale = now.duration_since(self.rt_prop_stamp) > RT_PROP_EXPIRY;
        if let Some(rtt) = rtt_sample {
            if rt_prop_stale || self.rt_prop.map_or(true, |cur| rtt <= cur) {
                self.rt_prop = Some(rtt);
                self.rt_prop_stamp = now;
            }
        }

        // Round boundary bookkeeping.
        let round = self.rt_prop.unwrap_or(DEFAULT_ROUND);
        if now.duration_since(self.round_stamp) >= round {
            self.round_stamp = now;
            self.on_round();
        }

        self.advance_mode(in_flight, rt_prop_stale, now);
    }

    /// Loss feedback: BBR does not collapse the window; it only resets the
    /// delivery-rate interval so the gap does not skew the next sample.
    pub fn on_timeout(&mut self) {
        self.last_ack_at = None;
    }

    /// Once-per-RTprop housekeeping.
    fn on_round(&mut self) {
        match self.mode {
            BbrMode::Startup => {
                if self.btl_bw > self.full_bw * STARTUP_GROWTH {
                    self.full_bw = self.btl_bw;
                    self.full_bw_rounds = 0;
                } else if self.btl_bw > 0.0 {
                    self.full_bw_rounds += 1;
                    if self.full_bw_rounds >= STARTUP_PLATEAU_ROUNDS {
                        self.mode = BbrMode::Drain;
                        self.pacing_gain = DRAIN_GAIN;
                        debug!(btl_bw = self.btl_bw, "startup plateau — draining");
                    }
                }
            }
            BbrMode::ProbeBw => {
                self.cycle_index = (self.cycle_index + 1) % PROBE_BW_GAINS.len();
                self.pacing_gain = PROBE_BW_GAINS[self.cycle_index];
            }
            _ => {}
        }
    }

    fn advance_mode(&mut self, in_flight: u64, rt_prop_stale: bool, now: Instant) {
        // RTprop staleness forces a floor probe.
        if self.mode == BbrMode::ProbeBw && rt_prop_stale {
            self.mode = BbrMode::ProbeRtt;
            self.probe_rtt_since = Some(now);
            self.pacing_gain = 1.0;
            debug!("rt_prop stale — probing RTT");
        }

        match self.mode {
            BbrMode::Drain => {
                if (in_flight as f64) <= self.bdp_bytes() {
                    self.enter_probe_bw(now);
                }
            }
            BbrMode::ProbeRtt => {
                let since = self.probe_rtt_since.unwrap_or(now);
                if now.duration_since(since) >= PROBE_RTT_DURATION {
                    self.rt_prop_stamp = now;
                    self.probe_rtt_since = None;
                    self.enter_probe_bw(now);
                }
            }
            _ => {}
        }
    }

    fn enter_probe_bw(&mut self, now: Instant) {
        self.mode = BbrMode::ProbeBw;
        self.cwnd_gain = PROBE_BW_CWND_GAIN;
        // Start on a neutral gain; the cycle advances once per RTprop.
        self.cycle_index = 2;
        self.pacing_gain = PROBE_BW_GAINS[self.cycle_index];
        self.round_stamp = now;
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

/// The controller a session runs, selected at start.
pub enum CongestionControl {
    Cubic(CubicController),
    Bbr(BbrController),
}

impl CongestionControl {
    pub fn new(algorithm: Algorithm, now: Instant) -> Self {
        match algorithm {
            Algorithm::Cubic => CongestionControl::Cubic(CubicController::new()),
            Algorithm::Bbr => CongestionControl::Bbr(BbrController::new(now)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CongestionControl::Cubic(_) => "cubic",
            CongestionControl::Bbr(_) => "bbr",
        }
    }

    /// Allowed in-flight budget in bytes.
    pub fn cwnd_bytes(&self) -> u64 {
        match self {
            CongestionControl::Cubic(c) => c.cwnd_bytes(),
            CongestionControl::Bbr(b) => b.cwnd_bytes(),
        }
    }

    /// Inter-send gap, when the controller paces.
    pub fn pacing_delay(&self) -> Option<Duration> {
        match self {
            CongestionControl::Cubic(_) => None,
            CongestionControl::Bbr(b) => b.pacing_delay(),
        }
    }

    /// A new cumulative ACK advanced the window base.
    pub fn on_new_ack(
        &mut self,
        bytes_acked: u64,
        cum_ack: u32,
        rtt_sample: Option<Duration>,
        srtt: Duration,
        in_flight: u64,
        now: Instant,
    ) {
        match self {
            CongestionControl::Cubic(c) => c.on_new_ack(bytes_acked, cum_ack, srtt, now),
            CongestionControl::Bbr(b) => b.on_ack(bytes_acked, rtt_sample, in_flight, now),
        }
    }

    /// Duplicate cumulative ACK beyond the third.
    pub fn on_dup_ack(&mut self) {
        if let CongestionControl::Cubic(c) = self {
            c.on_dup_ack();
        }
    }

    /// Third duplicate ACK — fast retransmit fired.
    pub fn on_triple_dup_ack(&mut self, next_seq: u32) {
        if let CongestionControl::Cubic(c) = self {
            c.on_triple_dup_ack(next_seq);
        }
    }

    /// Retransmission timer expired.
    pub fn on_timeout(&mut self) {
        match self {
            CongestionControl::Cubic(c) => c.on_timeout(),
            CongestionControl::Bbr(b) => b.on_timeout(),
        }
    }
}
