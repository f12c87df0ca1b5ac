//! # Segment Pool
//!
//! Slab-backed storage for in-flight segments: O(1) insert/remove with no
//! heap churn on the hot path once the slab has grown to capacity. The
//! retransmission engine keys segments by a `seq → handle` index on top of
//! this pool.

use bytes::Bytes;
use quanta::Instant;
use slab::Slab;

// ─── SegmentContext ──────────────────────────────────────────────────────────

/// Metadata tracked for each unacknowledged segment.
#[derive(Debug, Clone)]
pub struct SegmentContext {
    /// Sequence number of the segment.
    pub seq: u32,
    /// When the segment was first transmitted. RTT samples measure against
    /// this, and only while `retransmit_count == 0` (Karn's rule).
    pub first_send: Instant,
    /// When the segment was last (re)transmitted.
    pub last_send: Instant,
    /// How many times the segment has been retransmitted.
    pub retransmit_count: u32,
}

impl SegmentContext {
    pub fn new(seq: u32, now: Instant) -> Self {
        SegmentContext {
            seq,
            first_send: now,
            last_send: now,
            retransmit_count: 0,
        }
    }
}

// ─── SegmentEntry ────────────────────────────────────────────────────────────

/// A pooled segment: payload plus metadata.
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    pub context: SegmentContext,
    pub payload: Bytes,
}

// ─── SegmentPool ─────────────────────────────────────────────────────────────

/// Handle to a segment in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(usize);

/// Slab-based pre-allocated segment pool.
pub struct SegmentPool {
    entries: Slab<SegmentEntry>,
    capacity: usize,
}

impl SegmentPool {
    /// Create a pool with the given capacity. The slab pre-allocates.
    pub fn new(capacity: usize) -> Self {
        SegmentPool {
            entries: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a segment. Returns `None` if the pool is full.
    pub fn insert(&mut self, context: SegmentContext, payload: Bytes) -> Option<SegmentHandle> {
        if self.entries.len() >= self.capacity {
            return None;
        }
        let key = self.entries.insert(SegmentEntry { context, payload });
        Some(SegmentHandle(key))
    }

    pub fn get(&self, handle: SegmentHandle) -> Option<&SegmentEntry> {
        self.entries.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: SegmentHandle) -> Option<&mut SegmentEntry> {
        self.entries.get_mut(handle.0)
    }

    /// Remove a segment from the pool, returning it.
    pub fn remove(&mut self, handle: SegmentHandle) -> Option<SegmentEntry> {
        if self.entries.contains(handle.0) {
            Some(self.entries.remove(handle.0))
        } else {
            None
        }
    }

    /// Number of segments currently pooled.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ─── SequenceGenerator ───────────────────────────────────────────────────────

/// Monotonic sequence number source, starting at 0.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: u32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        SequenceGenerator { next: 0 }
    }

    /// Take the next sequence number.
    pub fn next(&mut self) -> u32 {
        let seq = self.next;
        self.next += 1;
        seq
    }

    /// The next sequence number that will be assigned.
    pub fn current(&self) -> u32 {
        self.next
    }
}
