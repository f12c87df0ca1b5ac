//! # tarn-transport
//!
//! Tarn pure-Rust reliable file transport.
//!
//! One-shot, unidirectional file transfer over an unreliable datagram
//! substrate: fixed 20-byte wire format, cumulative + selective
//! acknowledgments, a single-base-timer retransmission engine, and
//! pluggable congestion control (CUBIC or BBR).
//!
//! ## Crate structure
//!
//! - [`wire`] — 20-byte header codec, data/ACK/EOF frames, SACK ranges
//! - [`error`] — transport error taxonomy
//! - [`rtt`] — smoothed RTT and deviation, bounded RTO (RFC 6298)
//! - [`pool`] — slab-based in-flight segment pool
//! - [`reassembly`] — receiver-side gap tracking, in-order delivery, SACK
//! - [`retransmit`] — sender window, timers, fast retransmit, SACK ingestion
//! - [`congestion`] — CUBIC (RFC 8312) and BBR congestion controllers
//! - [`session`] — start handshake and EOF/EOF-ACK teardown state machines
//! - [`stats`] — sender/receiver statistics
//!
//! All modules are pure logic — socket I/O lives in the daemon binaries.

pub mod congestion;
pub mod error;
pub mod pool;
pub mod reassembly;
pub mod retransmit;
pub mod rtt;
pub mod session;
pub mod stats;
pub mod wire;
