// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Empirical decode rate estimation.
//!
//! Decode durations are accumulated over two sliding windows. The short window reacts quickly to
//! changes of content complexity, the long one is sized after the depth of the output pipeline
//! and tells how fast decoding can sustainably run. Both are published as maximum frame rates
//! for the trick mode policy.

use crate::config::CODEC_MAX_DECODE_BUFFERS;
use crate::Rational;

/// Upper bound of the long integration window.
pub const MAX_LONG_INTEGRATION_PERIOD: usize = 2 * CODEC_MAX_DECODE_BUFFERS;

const MICROSECONDS_PER_SECOND: u64 = 1_000_000;

/// Maximum frame rates published after a completion. A figure is `None` while its window has
/// not accumulated any time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeRates {
    pub short_integration: Option<Rational>,
    pub long_integration: Option<Rational>,
}

#[derive(Clone, Debug)]
pub struct DecodeRateEstimator {
    short_period: usize,
    long_period: usize,
    decode_times: Vec<u64>,
    next: usize,
    last_completion: Option<u64>,
    short_total: u64,
    long_total: u64,
}

impl DecodeRateEstimator {
    /// Creates an estimator over windows of `short_period` and `long_period` decodes. The long
    /// window is clamped to [`MAX_LONG_INTEGRATION_PERIOD`] and the short one to the long one.
    pub fn new(short_period: usize, long_period: usize) -> Self {
        let long_period = long_period.clamp(1, MAX_LONG_INTEGRATION_PERIOD);
        let short_period = short_period.clamp(1, long_period);

        Self {
            short_period,
            long_period,
            decode_times: vec![0; long_period],
            next: 0,
            last_completion: None,
            short_total: 0,
            long_total: 0,
        }
    }

    pub fn short_period(&self) -> usize {
        self.short_period
    }

    pub fn long_period(&self) -> usize {
        self.long_period
    }

    /// Accounts for a decode sent at `commence` and completed at `now`, both in microseconds.
    pub fn record(&mut self, commence: u64, now: u64, field_decode: bool) -> DecodeRates {
        // A decode may have been queued behind a slower predecessor, in which case the time since
        // the previous completion is the better measure of its own duration.
        let mut decode_time = now.saturating_sub(commence);
        if let Some(last) = self.last_completion {
            decode_time = decode_time.min(now.saturating_sub(last));
        }
        self.last_completion = Some(now);

        if field_decode {
            decode_time *= 2;
        }

        let short_expired =
            (self.next + self.long_period - self.short_period) % self.long_period;
        self.short_total -= self.decode_times[short_expired];
        self.long_total -= self.decode_times[self.next];

        self.decode_times[self.next] = decode_time;
        self.next = (self.next + 1) % self.long_period;

        self.short_total += decode_time;
        self.long_total += decode_time;

        DecodeRates {
            short_integration: Rational::checked_new(
                MICROSECONDS_PER_SECOND * self.short_period as u64,
                self.short_total,
            ),
            long_integration: Rational::checked_new(
                MICROSECONDS_PER_SECOND * self.long_period as u64,
                self.long_total,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds `count` back to back decodes of `duration` microseconds each.
    fn feed_constant(
        estimator: &mut DecodeRateEstimator,
        clock: &mut u64,
        duration: u64,
        count: usize,
    ) -> DecodeRates {
        let mut rates = DecodeRates::default();
        for _ in 0..count {
            rates = estimator.record(*clock, *clock + duration, false);
            *clock += duration;
        }
        rates
    }

    #[test]
    fn test_constant_rate_converges() {
        let mut estimator = DecodeRateEstimator::new(4, 8);
        let mut clock = 1_000;
        // 20ms per decode, i.e. 50 decodes per second.
        let rates = feed_constant(&mut estimator, &mut clock, 20_000, 8);

        assert_eq!(rates.short_integration.unwrap().integer_part(), 50);
        assert_eq!(rates.long_integration.unwrap().integer_part(), 50);
        assert_eq!(
            rates.long_integration.unwrap(),
            Rational::new(8_000_000, 160_000)
        );

        // Still stable once the windows start wrapping.
        let rates = feed_constant(&mut estimator, &mut clock, 20_000, 13);
        assert_eq!(rates.short_integration.unwrap().integer_part(), 50);
        assert_eq!(rates.long_integration.unwrap().integer_part(), 50);
    }

    #[test]
    fn test_short_window_follows_change() {
        let mut estimator = DecodeRateEstimator::new(2, 8);
        let mut clock = 0;
        feed_constant(&mut estimator, &mut clock, 10_000, 8);
        let rates = feed_constant(&mut estimator, &mut clock, 40_000, 2);

        // The short window only saw the slow decodes, the long one still remembers fast ones.
        assert_eq!(rates.short_integration.unwrap().integer_part(), 25);
        assert_eq!(
            rates.long_integration.unwrap(),
            Rational::new(8_000_000, 6 * 10_000 + 2 * 40_000)
        );
    }

    #[test]
    fn test_queued_decode_uses_completion_interval() {
        let mut estimator = DecodeRateEstimator::new(1, 1);
        estimator.record(0, 10_000, false);
        // Sent long ago but only 10ms after the previous completion.
        let rates = estimator.record(0, 20_000, false);
        assert_eq!(rates.long_integration, Some(Rational::new(1_000_000, 10_000)));
    }

    #[test]
    fn test_field_decode_doubles_time() {
        let mut estimator = DecodeRateEstimator::new(1, 1);
        let rates = estimator.record(0, 10_000, true);
        assert_eq!(rates.short_integration, Some(Rational::new(1_000_000, 20_000)));
    }

    #[test]
    fn test_zero_duration() {
        let mut estimator = DecodeRateEstimator::new(1, 2);
        let rates = estimator.record(5, 5, false);
        assert_eq!(rates, DecodeRates::default());
    }

    #[test]
    fn test_periods_are_clamped() {
        let estimator = DecodeRateEstimator::new(10, 0);
        assert_eq!(estimator.long_period(), 1);
        assert_eq!(estimator.short_period(), 1);

        let estimator = DecodeRateEstimator::new(4, 1000);
        assert_eq!(estimator.long_period(), MAX_LONG_INTEGRATION_PERIOD);
    }
}
