//! # Session Control
//!
//! Start handshake and end-of-stream teardown, as two pure state machines
//! the daemons drive around their socket loops.
//!
//! ```text
//!  sender:   AwaitingRequest ──request──▶ Transferring ──source done──▶
//!            EofHandshake ──EOF-ACK──▶ Closed
//!                  │ (EOF every 200 ms, ≤ 10 tries)
//!
//!  receiver: Requesting ──first data──▶ Receiving ──EOF──▶ Draining ──▶ Closed
//!                │ ('G' every 2 s, ≤ 5 tries)        (3 EOFs + no gaps,
//!                                                     or 15 s idle)
//! ```
//!
//! There is no three-way handshake: the receiver's one-byte request opens
//! the session and the first data frame acknowledges it. The EOF exchange is
//! informational — a receiver still missing segments keeps answering with
//! SACK instead of terminating.

use std::time::Duration;

use quanta::Instant;
use tracing::{debug, warn};

use crate::error::TransportError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How many times the sender retransmits the EOF frame.
pub const EOF_RETRIES: u32 = 10;

/// Spacing between EOF retransmissions.
pub const EOF_INTERVAL: Duration = Duration::from_millis(200);

/// How many times the receiver retries the session request.
pub const REQUEST_RETRIES: u32 = 5;

/// How long the receiver waits for the first data frame per attempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Receiver inactivity horizon.
pub const RECV_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);

/// Sender inactivity horizon after the last ACK.
pub const SEND_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// EOF frames the receiver wants to see (and confirm) before closing
/// immediately.
pub const EOF_FRAMES_TO_CLOSE: u64 = 3;

/// Quiet interval after which a receiver with nothing missing closes. The
/// sender retransmits EOF until its EOF-ACK lands, so one silent grace
/// period means the handshake settled.
pub const DRAIN_GRACE: Duration = Duration::from_secs(1);

// ─── Sender Session ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderPhase {
    /// Blocking on the socket for the receiver's request.
    AwaitingRequest,
    /// Streaming segments, window-governed.
    Transferring,
    /// Source exhausted; exchanging EOF / EOF-ACK.
    EofHandshake,
    Closed,
}

/// What the sender daemon should do next.
#[derive(Debug)]
pub enum SenderAction {
    None,
    /// Transmit (or retransmit) the EOF frame.
    SendEof,
    /// Terminate the session with an error.
    Fail(TransportError),
}

pub struct SenderSession {
    phase: SenderPhase,
    eof_attempts: u32,
    last_eof_at: Option<Instant>,
    last_activity: Instant,
    clean_close: bool,
}

impl SenderSession {
    pub fn new(now: Instant) -> Self {
        SenderSession {
            phase: SenderPhase::AwaitingRequest,
            eof_attempts: 0,
            last_eof_at: None,
            last_activity: now,
            clean_close: false,
        }
    }

    pub fn phase(&self) -> SenderPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SenderPhase::Closed
    }

    /// Whether the session ended with a confirmed EOF handshake.
    pub fn clean_close(&self) -> bool {
        self.clean_close
    }

    pub fn eof_attempts(&self) -> u32 {
        self.eof_attempts
    }

    /// The first datagram from the peer arrived; the peer is pinned.
    pub fn on_request(&mut self, now: Instant) {
        if self.phase == SenderPhase::AwaitingRequest {
            self.phase = SenderPhase::Transferring;
            self.last_activity = now;
            debug!("session request received");
        }
    }

    /// Any ACK traffic from the peer.
    pub fn on_peer_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Every segment is acknowledged: start the EOF handshake.
    pub fn on_transfer_complete(&mut self, now: Instant) -> SenderAction {
        if self.phase != SenderPhase::Transferring {
            return SenderAction::None;
        }
        self.phase = SenderPhase::EofHandshake;
        self.eof_attempts = 1;
        self.last_eof_at = Some(now);
        debug!("transfer complete — sending EOF");
        SenderAction::SendEof
    }

    /// The receiver confirmed the EOF frame.
    pub fn on_eof_ack(&mut self) {
        if self.phase == SenderPhase::EofHandshake {
            self.phase = SenderPhase::Closed;
            self.clean_close = true;
            debug!(attempts = self.eof_attempts, "EOF acknowledged");
        }
    }

    /// Timer-driven work: EOF retransmission and inactivity tracking.
    pub fn poll(&mut self, now: Instant) -> SenderAction {
        match self.phase {
            SenderPhase::Transferring => {
                let idle = now.duration_since(self.last_activity);
                if idle > SEND_INACTIVITY_TIMEOUT {
                    self.phase = SenderPhase::Closed;
                    warn!(?idle, "no ACKs from peer — giving up");
                    return SenderAction::Fail(TransportError::InactivityTimeout { idle });
                }
                SenderAction::None
            }
            SenderPhase::EofHandshake => {
                let last = self.last_eof_at.unwrap_or(now);
                if now.duration_since(last) < EOF_INTERVAL {
                    return SenderAction::None;
                }
                if self.eof_attempts >= EOF_RETRIES {
                    self.phase = SenderPhase::Closed;
                    warn!(attempts = self.eof_attempts, "EOF never acknowledged");
                    return SenderAction::Fail(TransportError::InactivityTimeout {
                        idle: now.duration_since(self.last_activity),
                    });
                }
                self.eof_attempts += 1;
                self.last_eof_at = Some(now);
                SenderAction::SendEof
            }
            SenderPhase::AwaitingRequest | SenderPhase::Closed => SenderAction::None,
        }
    }

    /// The next instant `poll` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            SenderPhase::Transferring => Some(self.last_activity + SEND_INACTIVITY_TIMEOUT),
            SenderPhase::EofHandshake => self.last_eof_at.map(|t| t + EOF_INTERVAL),
            _ => None,
        }
    }
}

// ─── Receiver Session ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverPhase {
    /// Sending the one-byte request, waiting for the first data frame.
    Requesting,
    /// Receiving the stream.
    Receiving,
    /// EOF seen; still answering stragglers and duplicate EOFs.
    Draining,
    Closed,
}

/// What the receiver daemon should do next.
#[derive(Debug)]
pub enum ReceiverAction {
    None,
    /// Transmit (or retransmit) the one-byte session request.
    SendRequest,
    /// The session is over; flush and exit cleanly.
    Close,
    /// Terminate the session with an error (output retained, labeled
    /// partial).
    Fail(TransportError),
}

pub struct ReceiverSession {
    phase: ReceiverPhase,
    request_attempts: u32,
    last_request_at: Option<Instant>,
    last_activity: Instant,
    clean_close: bool,
}

impl ReceiverSession {
    pub fn new(now: Instant) -> Self {
        ReceiverSession {
            phase: ReceiverPhase::Requesting,
            request_attempts: 0,
            last_request_at: None,
            last_activity: now,
            clean_close: false,
        }
    }

    pub fn phase(&self) -> ReceiverPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ReceiverPhase::Closed
    }

    /// Whether the session ended with the file fully reassembled.
    pub fn clean_close(&self) -> bool {
        self.clean_close
    }

    pub fn request_attempts(&self) -> u32 {
        self.request_attempts
    }

    /// Drive the request retry loop. Returns `SendRequest` when a(nother)
    /// request should go out, `Fail` when the retry budget is exhausted.
    pub fn poll_request(&mut self, now: Instant) -> ReceiverAction {
        if self.phase != ReceiverPhase::Requesting {
            return ReceiverAction::None;
        }
        let due = match self.last_request_at {
            None => true,
            Some(last) => now.duration_since(last) >= REQUEST_TIMEOUT,
        };
        if !due {
            return ReceiverAction::None;
        }
        if self.request_attempts >= REQUEST_RETRIES {
            self.phase = ReceiverPhase::Closed;
            warn!(attempts = self.request_attempts, "server never answered");
            return ReceiverAction::Fail(TransportError::PeerUnreachable {
                attempts: self.request_attempts,
            });
        }
        self.request_attempts += 1;
        self.last_request_at = Some(now);
        debug!(
            attempt = self.request_attempts,
            max = REQUEST_RETRIES,
            "sending session request"
        );
        ReceiverAction::SendRequest
    }

    /// Any frame from the sender.
    pub fn on_peer_activity(&mut self, now: Instant) {
        if self.phase == ReceiverPhase::Requesting {
            self.phase = ReceiverPhase::Receiving;
            debug!("first frame received — transfer started");
        }
        self.last_activity = now;
    }

    /// The reassembly buffer saw the first EOF.
    pub fn on_file_complete(&mut self) {
        if self.phase == ReceiverPhase::Receiving {
            self.phase = ReceiverPhase::Draining;
        }
    }

    /// Termination logic, fed with the reassembly buffer's view.
    pub fn poll(&mut self, eof_frames_seen: u64, pending_empty: bool, now: Instant) -> ReceiverAction {
        match self.phase {
            ReceiverPhase::Receiving | ReceiverPhase::Draining => {
                if self.phase == ReceiverPhase::Draining && pending_empty {
                    let settled = eof_frames_seen >= EOF_FRAMES_TO_CLOSE
                        || now.duration_since(self.last_activity) > DRAIN_GRACE;
                    if settled {
                        self.phase = ReceiverPhase::Closed;
                        self.clean_close = true;
                        debug!("EOF handshake complete");
                        return ReceiverAction::Close;
                    }
                }
                let idle = now.duration_since(self.last_activity);
                if idle > RECV_INACTIVITY_TIMEOUT {
                    self.phase = ReceiverPhase::Closed;
                    // Idle with nothing missing after EOF still counts as a
                    // complete file; idle with gaps is a partial transfer.
                    if eof_frames_seen > 0 && pending_empty {
                        self.clean_close = true;
                        return ReceiverAction::Close;
                    }
                    warn!(?idle, "transfer stalled");
                    return ReceiverAction::Fail(TransportError::InactivityTimeout { idle });
                }
                ReceiverAction::None
            }
            ReceiverPhase::Requesting | ReceiverPhase::Closed => ReceiverAction::None,
        }
    }

    /// The next instant `poll` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            ReceiverPhase::Requesting => self.last_request_at.map(|t| t + REQUEST_TIMEOUT),
            ReceiverPhase::Receiving | ReceiverPhase::Draining => {
                Some(self.last_activity + RECV_INACTIVITY_TIMEOUT)
            }
            ReceiverPhase::Closed => None,
        }
    }
}
