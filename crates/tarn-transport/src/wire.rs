//! # Tarn Wire Format
//!
//! Fixed 20-byte header on every datagram, big-endian throughout.
//!
//! ## Data frame
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Sequence Number (32)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Reserved (16 bytes, zero)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Payload (≤ MSS bytes)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## ACK frame
//!
//! The reserved bytes carry up to four SACK ranges as `(start:u16, len:u16)`
//! tuples, all-zero when unused. Two sequence numbers are reserved as
//! sentinels: `0xFFFF_FFFF` marks end-of-stream (payload is ASCII `"EOF"`),
//! `0xFFFF_FFFE` in the ACK position confirms it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum segment size: payload bytes per data frame.
pub const MSS: usize = 1180;

/// Fixed header length for every frame.
pub const HEADER_LEN: usize = 20;

/// Largest datagram either side will ever emit or accept.
pub const MAX_DATAGRAM: usize = HEADER_LEN + MSS;

/// Sentinel sequence marking end-of-stream.
pub const EOF_SEQ: u32 = 0xFFFF_FFFF;

/// Sentinel acknowledgment confirming end-of-stream.
pub const EOF_ACK_SEQ: u32 = 0xFFFF_FFFE;

/// Payload carried by the EOF frame.
pub const EOF_PAYLOAD: &[u8] = b"EOF";

/// Maximum SACK ranges per ACK frame (16 reserved bytes / 4 bytes per tuple).
pub const MAX_SACK_RANGES: usize = 4;

/// Body of the receiver's one-byte session request.
pub const SESSION_REQUEST: u8 = b'G';

/// The one-byte datagram that opens a session.
pub fn session_request() -> Bytes {
    Bytes::from_static(&[SESSION_REQUEST])
}

// ─── SACK Range ──────────────────────────────────────────────────────────────

/// A contiguous run of received sequence numbers above the cumulative ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackRange {
    /// First sequence in the run.
    pub start: u32,
    /// Number of sequences in the run (> 0 for a meaningful range).
    pub len: u16,
}

impl SackRange {
    /// One past the last sequence in the run.
    pub fn end(&self) -> u32 {
        self.start + self.len as u32
    }

    /// Whether `seq` falls inside this range.
    pub fn contains(&self, seq: u32) -> bool {
        seq >= self.start && seq < self.end()
    }

    /// Whether this range can be carried in the u16-pair wire encoding.
    fn encodable(&self) -> bool {
        self.len > 0 && self.start <= u16::MAX as u32
    }
}

// ─── Data Frames (sender → receiver) ────────────────────────────────────────

/// A frame on the data direction: a file segment or the EOF marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    /// A chunk of the file, at most [`MSS`] bytes.
    Segment { seq: u32, payload: Bytes },
    /// End-of-stream marker.
    Eof,
}

impl DataFrame {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        match self {
            DataFrame::Segment { seq, payload } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
                buf.put_u32(*seq);
                buf.put_bytes(0, HEADER_LEN - 4);
                buf.extend_from_slice(payload);
                buf.freeze()
            }
            DataFrame::Eof => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + EOF_PAYLOAD.len());
                buf.put_u32(EOF_SEQ);
                buf.put_bytes(0, HEADER_LEN - 4);
                buf.extend_from_slice(EOF_PAYLOAD);
                buf.freeze()
            }
        }
    }

    /// Parse a datagram received on the data direction.
    pub fn decode(mut raw: Bytes) -> Result<Self, TransportError> {
        if raw.len() < HEADER_LEN {
            return Err(TransportError::MalformedFrame { len: raw.len() });
        }
        let total = raw.len();
        let seq = raw.get_u32();
        raw.advance(HEADER_LEN - 4);

        match seq {
            EOF_SEQ => {
                if raw.as_ref() != EOF_PAYLOAD {
                    return Err(TransportError::MalformedFrame { len: total });
                }
                Ok(DataFrame::Eof)
            }
            // The EOF-ACK sentinel never appears on the data direction.
            EOF_ACK_SEQ => Err(TransportError::MalformedFrame { len: total }),
            _ => {
                if raw.len() > MSS {
                    return Err(TransportError::MalformedFrame { len: total });
                }
                Ok(DataFrame::Segment { seq, payload: raw })
            }
        }
    }
}

// ─── ACK Frames (receiver → sender) ─────────────────────────────────────────

/// A frame on the acknowledgment direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckFrame {
    /// Cumulative acknowledgment plus up to four SACK ranges.
    Ack { cum_ack: u32, sacks: Vec<SackRange> },
    /// Confirmation of the EOF frame.
    EofAck,
}

impl AckFrame {
    /// Serialize to wire bytes. SACK ranges beyond the first four, and
    /// ranges whose start exceeds `u16::MAX`, are omitted — the cumulative
    /// ACK alone still guarantees correctness.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        match self {
            AckFrame::Ack { cum_ack, sacks } => {
                buf.put_u32(*cum_ack);
                let mut written = 0;
                for range in sacks.iter().filter(|r| r.encodable()) {
                    if written == MAX_SACK_RANGES {
                        break;
                    }
                    buf.put_u16(range.start as u16);
                    buf.put_u16(range.len);
                    written += 1;
                }
                buf.put_bytes(0, (MAX_SACK_RANGES - written) * 4);
            }
            AckFrame::EofAck => {
                buf.put_u32(EOF_ACK_SEQ);
                buf.put_bytes(0, HEADER_LEN - 4);
            }
        }
        buf.freeze()
    }

    /// Parse a datagram received on the acknowledgment direction.
    ///
    /// Rejects short frames and inconsistent SACK bodies (unordered,
    /// overlapping, or not strictly above the cumulative ACK).
    pub fn decode(mut raw: Bytes) -> Result<Self, TransportError> {
        if raw.len() < HEADER_LEN {
            return Err(TransportError::MalformedFrame { len: raw.len() });
        }
        let total = raw.len();
        let cum_ack = raw.get_u32();

        if cum_ack == EOF_ACK_SEQ {
            return Ok(AckFrame::EofAck);
        }
        if cum_ack == EOF_SEQ {
            return Err(TransportError::MalformedFrame { len: total });
        }

        let mut sacks: Vec<SackRange> = Vec::new();
        for _ in 0..MAX_SACK_RANGES {
            let start = raw.get_u16() as u32;
            let len = raw.get_u16();
            if len == 0 {
                if start != 0 {
                    return Err(TransportError::MalformedFrame { len: total });
                }
                continue; // unused tuple
            }
            let range = SackRange { start, len };
            if range.start <= cum_ack {
                return Err(TransportError::MalformedFrame { len: total });
            }
            if let Some(prev) = sacks.last() {
                if range.start < prev.end() {
                    return Err(TransportError::MalformedFrame { len: total });
                }
            }
            sacks.push(range);
        }

        Ok(AckFrame::Ack { cum_ack, sacks })
    }
}
