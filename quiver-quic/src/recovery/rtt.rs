//! # RTT Estimation (RFC 9002 Section 5)
//!
//! Smoothed RTT and variance with the ack-delay subtraction rule: the
//! reported ack delay is removed from a sample only when doing so cannot
//! push the sample below the minimum RTT, except for the very first sample.

#![forbid(unsafe_code)]

use core::time::Duration;

/// Sentinel for "no RTT sample taken yet".
pub const DEFAULT_MIN_RTT: Duration = Duration::MAX;

/// EWMA weight for smoothed RTT: srtt = srtt * 7/8 + sample / 8.
pub const RTT_ALPHA: u32 = 8;

/// EWMA weight for RTT variance: rttvar = rttvar * 3/4 + |srtt - sample| / 4.
pub const RTT_BETA: u32 = 4;

/// Connection-wide RTT state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttState {
    /// Minimum RTT observed, over raw samples (ack delay not removed).
    pub mrtt: Duration,
    /// Latest RTT sample, after ack-delay adjustment.
    pub lrtt: Duration,
    /// Smoothed RTT.
    pub srtt: Duration,
    /// RTT variance.
    pub rttvar: Duration,
    /// Largest ack delay the peer has ever reported.
    pub max_ack_delay: Duration,
}

impl Default for RttState {
    fn default() -> Self {
        Self {
            mrtt: DEFAULT_MIN_RTT,
            lrtt: Duration::ZERO,
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            max_ack_delay: Duration::ZERO,
        }
    }
}

impl RttState {
    /// Reset to the never-sampled state, e.g. after a path change.
    pub fn reset(&mut self) {
        *self = RttState::default();
    }

    pub fn has_sample(&self) -> bool {
        self.srtt != Duration::ZERO
    }
}

/// Apply one RTT sample.
pub fn update_rtt(rtt: &mut RttState, sample: Duration, ack_delay: Duration) {
    let min_rtt = rtt.mrtt.min(sample);
    rtt.max_ack_delay = rtt.max_ack_delay.max(ack_delay);

    let use_ack_delay = sample > ack_delay
        && (rtt.mrtt == DEFAULT_MIN_RTT
            || min_rtt
                .checked_add(ack_delay)
                .is_some_and(|thresh| sample > thresh));
    // The adjusted sample never goes below the minimum; min_rtt here is
    // already folded over this sample, so it is always finite.
    let adjusted = if use_ack_delay {
        (sample - ack_delay).max(min_rtt)
    } else {
        sample
    };

    // mrtt ignores ack delay, per the recovery draft.
    rtt.mrtt = min_rtt;
    rtt.lrtt = adjusted;
    if rtt.srtt == Duration::ZERO {
        rtt.srtt = adjusted;
        rtt.rttvar = adjusted / 2;
    } else {
        let deviation = if rtt.srtt > adjusted {
            rtt.srtt - adjusted
        } else {
            adjusted - rtt.srtt
        };
        rtt.rttvar = rtt.rttvar * (RTT_BETA - 1) / RTT_BETA + deviation / RTT_BETA;
        rtt.srtt = rtt.srtt * (RTT_ALPHA - 1) / RTT_ALPHA + adjusted / RTT_ALPHA;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_first_sample_seeds_estimator() {
        let mut rtt = RttState::default();
        update_rtt(&mut rtt, 100 * MS, Duration::ZERO);
        assert_eq!(rtt.srtt, 100 * MS);
        assert_eq!(rtt.rttvar, 50 * MS);
        assert_eq!(rtt.mrtt, 100 * MS);
        assert_eq!(rtt.lrtt, 100 * MS);
    }

    #[test]
    fn test_first_sample_ack_delay_clamped_to_min() {
        // The first raw sample defines the minimum, so subtracting the ack
        // delay cannot take the sample below it.
        let mut rtt = RttState::default();
        update_rtt(&mut rtt, 100 * MS, 20 * MS);
        assert_eq!(rtt.lrtt, 100 * MS);
        assert_eq!(rtt.mrtt, 100 * MS);
    }

    #[test]
    fn test_ewma_weights() {
        let mut rtt = RttState::default();
        update_rtt(&mut rtt, 100 * MS, Duration::ZERO);
        update_rtt(&mut rtt, 200 * MS, Duration::ZERO);
        // srtt = 100 * 7/8 + 200 / 8 = 112.5ms
        assert_eq!(rtt.srtt, Duration::from_micros(112_500));
        // rttvar = 50 * 3/4 + |100 - 200| / 4 = 62.5ms
        assert_eq!(rtt.rttvar, Duration::from_micros(62_500));
        assert_eq!(rtt.mrtt, 100 * MS);
    }

    #[test]
    fn test_ack_delay_not_subtracted_when_it_would_cross_min() {
        let mut rtt = RttState::default();
        update_rtt(&mut rtt, 100 * MS, Duration::ZERO);
        // 105ms sample with 10ms ack delay: subtracting would land below
        // minRTT + ackDelay, so the raw sample is used.
        update_rtt(&mut rtt, 105 * MS, 10 * MS);
        assert_eq!(rtt.lrtt, 105 * MS);
    }

    #[test]
    fn test_ack_delay_subtracted_when_safe() {
        let mut rtt = RttState::default();
        update_rtt(&mut rtt, 100 * MS, Duration::ZERO);
        update_rtt(&mut rtt, 150 * MS, 10 * MS);
        assert_eq!(rtt.lrtt, 140 * MS);
    }

    #[test]
    fn test_max_ack_delay_tracks_maximum() {
        let mut rtt = RttState::default();
        update_rtt(&mut rtt, 100 * MS, 5 * MS);
        update_rtt(&mut rtt, 100 * MS, 25 * MS);
        update_rtt(&mut rtt, 100 * MS, 10 * MS);
        assert_eq!(rtt.max_ack_delay, 25 * MS);
    }

    #[test]
    fn test_min_rtt_bounds_smoothed_rtt() {
        // Quantified invariant: after any valid sample, mrtt <= srtt.
        let mut rtt = RttState::default();
        let samples = [
            (100 * MS, 30 * MS),
            (80 * MS, 80 * MS),
            (300 * MS, 250 * MS),
            (81 * MS, 1 * MS),
        ];
        for (sample, delay) in samples {
            update_rtt(&mut rtt, sample, delay);
            assert!(rtt.mrtt <= rtt.srtt, "mrtt {:?} > srtt {:?}", rtt.mrtt, rtt.srtt);
        }
    }

    #[test]
    fn test_reset_returns_to_default() {
        let mut rtt = RttState::default();
        update_rtt(&mut rtt, 100 * MS, Duration::ZERO);
        rtt.reset();
        assert_eq!(rtt.mrtt, DEFAULT_MIN_RTT);
        assert!(!rtt.has_sample());
    }
}
