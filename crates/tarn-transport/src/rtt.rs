//! RTT estimation and retransmission timeout (RFC 6298).
//!
//! `srtt` and `rttvar` are updated from clean samples only — the caller
//! enforces Karn's rule by never sampling a retransmitted segment. The RTO
//! doubles on each timer expiry ([`RttEstimator::backoff`]) and the next
//! accepted sample recomputes it from the estimator state, ending the
//! backoff.

use std::time::Duration;

/// Lower bound on the retransmission timeout.
pub const RTO_MIN: Duration = Duration::from_millis(200);

/// Upper bound on the retransmission timeout.
pub const RTO_MAX: Duration = Duration::from_millis(2500);

/// Initial RTO before the first sample.
pub const RTO_INITIAL: Duration = Duration::from_secs(1);

/// Smoothed-RTT fallback before the first sample.
const SRTT_INITIAL: Duration = Duration::from_millis(500);

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: RTO_INITIAL,
        }
    }

    /// Feed one clean RTT sample (from a never-retransmitted segment).
    pub fn on_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let err = if sample > srtt {
                    sample - srtt
                } else {
                    srtt - sample
                };
                self.rttvar = Duration::from_secs_f64(
                    (1.0 - BETA) * self.rttvar.as_secs_f64() + BETA * err.as_secs_f64(),
                );
                self.srtt = Some(Duration::from_secs_f64(
                    (1.0 - ALPHA) * srtt.as_secs_f64() + ALPHA * sample.as_secs_f64(),
                ));
            }
        }
        let srtt = self.srtt.unwrap_or(sample);
        self.rto = (srtt + 4 * self.rttvar).clamp(RTO_MIN, RTO_MAX);
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT, or a conservative default before the first sample.
    pub fn srtt(&self) -> Duration {
        self.srtt.unwrap_or(SRTT_INITIAL)
    }

    /// Whether at least one sample has been taken.
    pub fn has_sample(&self) -> bool {
        self.srtt.is_some()
    }

    /// Exponential backoff after a timer expiry.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(RTO_MAX);
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
