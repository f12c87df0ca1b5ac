//! # Reassembly Buffer
//!
//! Receiver-side gap tracking and in-order delivery. Pure logic — the
//! receiver daemon feeds it decoded frames and drains events.
//!
//! ## Responsibilities
//!
//! 1. **In-order delivery**: emit payloads to the sink strictly by
//!    increasing sequence, each segment at most once
//! 2. **Out-of-order buffering**: hold future segments until the gap fills
//! 3. **ACK generation**: cumulative ACK plus up to four SACK ranges over
//!    the buffered runs
//! 4. **EOF handling**: mark stream completion, answer every EOF with an
//!    EOF-ACK
//!
//! In-order bulk arrival rate-limits ACKs to one per [`ACK_RATE_LIMIT`];
//! duplicates and out-of-order arrivals always ACK immediately, because
//! those duplicate cumulative ACKs are what drive the sender's fast
//! retransmit.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, trace};

use crate::stats::ReceiverStats;
use crate::wire::{AckFrame, DataFrame, SackRange, MAX_SACK_RANGES};

/// Minimum spacing between ACKs during bulk in-order arrival.
pub const ACK_RATE_LIMIT: Duration = Duration::from_millis(10);

// ─── Events ──────────────────────────────────────────────────────────────────

/// Events the buffer generates for the receiver daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// An in-order payload, ready to append to the sink.
    Deliver(Bytes),
    /// An acknowledgment frame to transmit.
    SendAck(AckFrame),
    /// An EOF confirmation to transmit.
    SendEofAck,
}

// ─── ReassemblyBuffer ────────────────────────────────────────────────────────

pub struct ReassemblyBuffer {
    /// Smallest sequence not yet delivered to the sink.
    expected_seq: u32,
    /// Out-of-order segments above `expected_seq`.
    pending: BTreeMap<u32, Bytes>,
    /// Highest sequence observed.
    max_seen_seq: Option<u32>,
    /// Set once the first EOF frame arrives.
    file_complete: bool,
    last_ack_at: Option<Instant>,
    events: Vec<ReceiverEvent>,
    stats: ReceiverStats,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        ReassemblyBuffer {
            expected_seq: 0,
            pending: BTreeMap::new(),
            max_seen_seq: None,
            file_complete: false,
            last_ack_at: None,
            events: Vec::new(),
            stats: ReceiverStats::default(),
        }
    }

    /// Process one decoded inbound frame.
    pub fn on_data(&mut self, frame: DataFrame, now: Instant) {
        match frame {
            DataFrame::Eof => {
                self.stats.eof_frames_seen += 1;
                if !self.file_complete {
                    self.file_complete = true;
                    debug!(
                        delivered = self.expected_seq,
                        pending = self.pending.len(),
                        "end of stream"
                    );
                }
                // Every EOF, first or duplicate, is confirmed.
                self.events.push(ReceiverEvent::SendEofAck);
            }
            DataFrame::Segment { seq, payload } => self.on_segment(seq, payload, now),
        }
    }

    fn on_segment(&mut self, seq: u32, payload: Bytes, now: Instant) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += payload.len() as u64;
        self.note_seen(seq);

        if seq < self.expected_seq {
            // Late retransmission of something already delivered.
            trace!(seq, expected = self.expected_seq, "duplicate segment");
            self.stats.duplicates += 1;
            self.emit_ack(now, true);
        } else if seq == self.expected_seq {
            self.events.push(ReceiverEvent::Deliver(payload));
            self.expected_seq += 1;
            self.stats.packets_delivered += 1;
            // Drain everything the gap was holding back.
            while let Some(buffered) = self.pending.remove(&self.expected_seq) {
                self.events.push(ReceiverEvent::Deliver(buffered));
                self.expected_seq += 1;
                self.stats.packets_delivered += 1;
            }
            self.emit_ack(now, false);
        } else {
            // Future segment: a gap exists below it.
            if self.pending.contains_key(&seq) {
                self.stats.duplicates += 1;
            } else {
                trace!(seq, expected = self.expected_seq, "out-of-order segment");
                self.pending.insert(seq, payload);
                self.stats.out_of_order += 1;
            }
            // Out-of-order arrivals always ACK: the duplicate cumulative
            // ACKs trigger the sender's fast retransmit.
            self.emit_ack(now, true);
        }
    }

    /// Emit the current ACK regardless of rate limiting. The daemon calls
    /// this on every receive timeout.
    pub fn force_ack(&mut self, now: Instant) {
        self.emit_ack(now, true);
    }

    fn emit_ack(&mut self, now: Instant, force: bool) {
        if !force {
            if let Some(last) = self.last_ack_at {
                if now.duration_since(last) < ACK_RATE_LIMIT {
                    return;
                }
            }
        }
        let ack = self.current_ack();
        self.last_ack_at = Some(now);
        self.stats.acks_sent += 1;
        self.events.push(ReceiverEvent::SendAck(ack));
    }

    /// Cumulative ACK plus up to four SACK ranges over the buffered runs,
    /// earliest first.
    pub fn current_ack(&self) -> AckFrame {
        let mut sacks: Vec<SackRange> = Vec::new();
        for &seq in self.pending.keys() {
            match sacks.last_mut() {
                Some(last) if last.end() == seq && last.len < u16::MAX => last.len += 1,
                _ => {
                    if sacks.len() == MAX_SACK_RANGES {
                        break;
                    }
                    sacks.push(SackRange { start: seq, len: 1 });
                }
            }
        }
        AckFrame::Ack {
            cum_ack: self.expected_seq,
            sacks,
        }
    }

    /// Drain accumulated events in order.
    pub fn drain_events(&mut self) -> impl Iterator<Item = ReceiverEvent> + '_ {
        self.events.drain(..)
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Smallest sequence not yet delivered to the sink.
    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Number of buffered out-of-order segments.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether all received data is contiguous with the delivery point.
    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Highest sequence observed so far.
    pub fn max_seen_seq(&self) -> Option<u32> {
        self.max_seen_seq
    }

    /// Whether the EOF frame has been seen.
    pub fn file_complete(&self) -> bool {
        self.file_complete
    }

    /// How many EOF frames have been seen.
    pub fn eof_frames_seen(&self) -> u64 {
        self.stats.eof_frames_seen
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    fn note_seen(&mut self, seq: u32) {
        if self.max_seen_seq.map_or(true, |m| seq > m) {
            self.max_seen_seq = Some(seq);
        }
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}
