//! Transport error taxonomy.
//!
//! Errors inside the codec and state machines are classified here and either
//! recovered locally (malformed frames are dropped, deadline expiries fall
//! through to the timer path) or escalated to the session layer, which
//! decides the session's fate.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Frame shorter than the fixed header, or with an inconsistent body.
    /// Dropped silently at the call site.
    #[error("malformed frame ({len} bytes)")]
    MalformedFrame { len: usize },

    /// No peer activity within the session inactivity horizon. The session
    /// terminates and reports partial completion.
    #[error("session inactive for {idle:?}")]
    InactivityTimeout { idle: Duration },

    /// The peer never answered the session request.
    #[error("peer unreachable after {attempts} request attempts")]
    PeerUnreachable { attempts: u32 },

    /// The source file could not be opened or read.
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[source] std::io::Error),

    /// The sink file could not be created or written.
    #[error("sink unwritable: {0}")]
    SinkUnwritable(#[source] std::io::Error),
}
