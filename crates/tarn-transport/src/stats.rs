//! # Transport Statistics
//!
//! Sender- and receiver-side counters, designed for JSON serialization in
//! the end-of-session summary.

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sender-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Total data frames sent (including retransmissions).
    pub packets_sent: u64,
    /// Total payload bytes sent (first transmissions only).
    pub bytes_sent: u64,
    /// Segments acknowledged (cumulative + SACK).
    pub packets_acked: u64,
    /// Total retransmissions (timer and fast retransmit).
    pub retransmissions: u64,
    /// Retransmissions triggered by triple duplicate ACKs.
    pub fast_retransmits: u64,
    /// Retransmission timer expiries.
    pub timeouts: u64,
    /// Last clean RTT sample in microseconds.
    pub last_rtt_us: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimated loss rate: frames sent that were never acknowledged.
    pub fn loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            let unacked = self.packets_sent.saturating_sub(self.packets_acked);
            unacked as f64 / self.packets_sent as f64
        }
    }

    /// Retransmission overhead ratio.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.packets_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiver-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Total data frames received (including duplicates).
    pub packets_received: u64,
    /// Total payload bytes received (including duplicates).
    pub bytes_received: u64,
    /// Segments delivered to the sink (unique, in order).
    pub packets_delivered: u64,
    /// Duplicate segments (below the delivery point or already buffered).
    pub duplicates: u64,
    /// Segments that arrived above the delivery point.
    pub out_of_order: u64,
    /// Acknowledgment frames emitted.
    pub acks_sent: u64,
    /// EOF frames observed.
    pub eof_frames_seen: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique deliveries vs. total received.
    pub fn goodput_ratio(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.packets_delivered as f64 / self.packets_received as f64
        }
    }

    /// Duplicate fraction — a proxy for the sender's observed loss.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.packets_received as f64
        }
    }
}
