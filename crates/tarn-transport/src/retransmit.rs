//! # Retransmission Engine
//!
//! Sender window management: dispatch under the congestion window, a single
//! base timer, triple-dup-ACK fast retransmit, SACK ingestion, and RTT
//! sampling under Karn's rule. Pure logic — the sender daemon moves the
//! returned frames onto the socket.
//!
//! ## Key design decisions
//!
//! - **Single base timer**: one stamp, re-armed on every cumulative advance
//!   and on base retransmission. O(1) per tick.
//! - **Selective repeat**: an RTO expiry retransmits only the base segment;
//!   SACK state already says what survived above it.
//! - **Karn's rule**: RTT samples come only from segments that were never
//!   retransmitted, measured against their first transmission.
//! - **Pacing**: when the controller reports an inter-send gap (BBR),
//!   consecutive first transmissions are spaced by it.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, trace, warn};

use crate::congestion::CongestionControl;
use crate::pool::{SegmentContext, SegmentHandle, SegmentPool, SequenceGenerator};
use crate::rtt::RttEstimator;
use crate::stats::SenderStats;
use crate::wire::{DataFrame, SackRange, MSS};

/// Duplicate cumulative ACKs that trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on the effective window in bytes (CLI `window_bytes`).
    pub window_limit: Option<u64>,
    /// Segment pool capacity.
    pub pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            window_limit: None,
            pool_capacity: 4096,
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct RetransmitEngine {
    /// Pre-chunked source segments, indexed by sequence.
    segments: Vec<Bytes>,
    /// Lowest sequence not yet cumulatively acknowledged.
    base: u32,
    /// Next sequence to transmit for the first time.
    seq_gen: SequenceGenerator,
    pool: SegmentPool,
    seq_to_handle: HashMap<u32, SegmentHandle>,
    /// Individually acknowledged sequences above `base` (via SACK), with
    /// their payload lengths for later cumulative-ACK byte accounting.
    sacked: BTreeMap<u32, u32>,
    /// Duplicate cumulative ACKs seen for the current `base`.
    dup_ack_count: u32,
    /// Payload bytes currently unacknowledged.
    in_flight: u64,
    /// Single base timer, re-armed on cumulative advance and retransmit.
    base_timer: Option<Instant>,
    /// Pool-full throttling has been logged once.
    warned_pool_bound: bool,
    /// Earliest instant the next paced send may go out.
    next_send_at: Option<Instant>,
    rtt: RttEstimator,
    cc: CongestionControl,
    stats: SenderStats,
    window_limit: Option<u64>,
}

impl RetransmitEngine {
    pub fn new(cc: CongestionControl, config: EngineConfig) -> Self {
        RetransmitEngine {
            segments: Vec::new(),
            base: 0,
            seq_gen: SequenceGenerator::new(),
            pool: SegmentPool::new(config.pool_capacity),
            seq_to_handle: HashMap::new(),
            sacked: BTreeMap::new(),
            dup_ack_count: 0,
            in_flight: 0,
            base_timer: None,
            warned_pool_bound: false,
            next_send_at: None,
            rtt: RttEstimator::new(),
            cc,
            stats: SenderStats::default(),
            window_limit: config.window_limit,
        }
    }

    /// Load the chunked source. Fixes `total_segments` for the session.
    pub fn start(&mut self, segments: Vec<Bytes>) {
        debug_assert!(segments.iter().all(|s| s.len() <= MSS));
        let bytes: usize = segments.iter().map(Bytes::len).sum();
        debug!(segments = segments.len(), bytes, "transfer loaded");
        self.segments = segments;
    }

    pub fn total_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Lowest unacknowledged sequence.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Next sequence that will be assigned.
    pub fn next_seq(&self) -> u32 {
        self.seq_gen.current()
    }

    /// Whether every segment has been cumulatively acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base as usize >= self.segments.len()
    }

    /// Unacknowledged payload bytes.
    pub fn in_flight_bytes(&self) -> u64 {
        self.in_flight
    }

    /// The controller's window, clamped to the configured hard cap.
    pub fn cwnd_bytes(&self) -> u64 {
        let cwnd = self.cc.cwnd_bytes();
        match self.window_limit {
            Some(limit) => cwnd.min(limit),
            None => cwnd,
        }
    }

    pub fn rto(&self) -> std::time::Duration {
        self.rtt.rto()
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    pub fn congestion(&self) -> &CongestionControl {
        &self.cc
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Transmit new segments while the window and pacing budget allow.
    /// Returns encoded frames in send order.
    pub fn try_send(&mut self, now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();
        let cwnd = self.cwnd_bytes();

        while (self.seq_gen.current() as usize) < self.segments.len()
            && self.in_flight + MSS as u64 <= cwnd
        {
            if self.pool.len() == self.pool.capacity() {
                // The window still has budget but the slab is full: the
                // pool was sized below the effective window.
                if !self.warned_pool_bound {
                    self.warned_pool_bound = true;
                    warn!(
                        capacity = self.pool.capacity(),
                        cwnd, "segment pool full — dispatch throttled below the window"
                    );
                }
                break;
            }
            if let Some(at) = self.next_send_at {
                if now < at {
                    break;
                }
            }

            let seq = self.seq_gen.next();
            let payload = self.segments[seq as usize].clone();
            let frame = DataFrame::Segment {
                seq,
                payload: payload.clone(),
            }
            .encode();

            let handle = self
                .pool
                .insert(SegmentContext::new(seq, now), payload.clone())
                .expect("pool capacity checked above");
            self.seq_to_handle.insert(seq, handle);
            self.in_flight += payload.len() as u64;
            if self.base_timer.is_none() {
                self.base_timer = Some(now);
            }
            if let Some(gap) = self.cc.pacing_delay() {
                self.next_send_at = Some(now + gap);
            }

            trace!(seq, in_flight = self.in_flight, cwnd, "segment sent");
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += payload.len() as u64;
            out.push(frame);
        }
        out
    }

    // ─── ACK ingestion ──────────────────────────────────────────────────

    /// Process one acknowledgment. Returns frames to transmit immediately
    /// (a fast retransmission of the base segment, when triggered).
    pub fn on_ack(&mut self, cum_ack: u32, sacks: &[SackRange], now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();

        if cum_ack > self.base && cum_ack <= self.seq_gen.current() {
            let mut bytes_acked = 0u64;
            let mut rtt_sample = None;

            for seq in self.base..cum_ack {
                if let Some(handle) = self.seq_to_handle.remove(&seq) {
                    if let Some(entry) = self.pool.remove(handle) {
                        self.in_flight -= entry.payload.len() as u64;
                        bytes_acked += entry.payload.len() as u64;
                        self.stats.packets_acked += 1;
                        // Karn: only never-retransmitted segments are
                        // eligible RTT samples.
                        if entry.context.retransmit_count == 0 {
                            let sample = now.duration_since(entry.context.first_send);
                            self.rtt.on_sample(sample);
                            self.stats.last_rtt_us = sample.as_micros() as u64;
                            rtt_sample = Some(sample);
                        }
                    }
                } else if let Some(len) = self.sacked.remove(&seq) {
                    // Already counted out of flight when the SACK landed.
                    bytes_acked += len as u64;
                }
            }

            self.base = cum_ack;
            self.dup_ack_count = 0;
            // Re-arm the base timer for the segment that is now oldest.
            self.base_timer = Some(now);

            self.cc.on_new_ack(
                bytes_acked,
                cum_ack,
                rtt_sample,
                self.rtt.srtt(),
                self.in_flight,
                now,
            );
            trace!(
                cum_ack,
                in_flight = self.in_flight,
                cwnd = self.cwnd_bytes(),
                "window advanced"
            );
        } else if cum_ack == self.base && self.seq_gen.current() > self.base {
            // Duplicate cumulative ACK while data is outstanding.
            self.dup_ack_count += 1;
            if self.dup_ack_count == DUP_ACK_THRESHOLD {
                debug!(seq = self.base, "triple duplicate ACK — fast retransmit");
                self.cc.on_triple_dup_ack(self.seq_gen.current());
                self.stats.fast_retransmits += 1;
                out.extend(self.retransmit(self.base, now));
            } else if self.dup_ack_count > DUP_ACK_THRESHOLD {
                self.cc.on_dup_ack();
            }
        }

        for range in sacks {
            for seq in range.start..range.end() {
                if seq < self.base {
                    continue;
                }
                if let Some(handle) = self.seq_to_handle.remove(&seq) {
                    if let Some(entry) = self.pool.remove(handle) {
                        self.in_flight -= entry.payload.len() as u64;
                        self.stats.packets_acked += 1;
                        self.sacked.insert(seq, entry.payload.len() as u32);
                        trace!(seq, "segment selectively acknowledged");
                    }
                }
            }
        }

        out
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Check the base timer. On expiry: congestion timeout, retransmit the
    /// base segment only, exponential RTO backoff.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Bytes> {
        let Some(armed) = self.base_timer else {
            return Vec::new();
        };
        if self.pool.is_empty() || now.duration_since(armed) <= self.rtt.rto() {
            return Vec::new();
        }

        warn!(
            seq = self.base,
            rto_ms = self.rtt.rto().as_millis() as u64,
            "retransmission timeout"
        );
        self.cc.on_timeout();
        self.rtt.backoff();
        self.dup_ack_count = 0;
        self.base_timer = Some(now);
        self.stats.timeouts += 1;
        self.retransmit(self.base, now)
    }

    /// The next instant timer or pacing work becomes due. The cooperative
    /// loop uses this as its socket deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timer = if self.pool.is_empty() {
            None
        } else {
            self.base_timer.map(|armed| armed + self.rtt.rto())
        };
        let pacing = if (self.seq_gen.current() as usize) < self.segments.len() {
            self.next_send_at
        } else {
            None
        };
        match (timer, pacing) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn retransmit(&mut self, seq: u32, now: Instant) -> Vec<Bytes> {
        let Some(&handle) = self.seq_to_handle.get(&seq) else {
            return Vec::new();
        };
        let Some(entry) = self.pool.get_mut(handle) else {
            return Vec::new();
        };
        entry.context.retransmit_count += 1;
        entry.context.last_send = now;
        self.stats.packets_sent += 1;
        self.stats.retransmissions += 1;
        vec![DataFrame::Segment {
            seq,
            payload: entry.payload.clone(),
        }
        .encode()]
    }
}
