//! Dual-weighted moving average over a bounded ring of timestamped samples.
//!
//! Two independent weight sources combine multiplicatively:
//!
//! - a **position weight** `α(1-α)^i` where `i = 0` is the newest sample, so
//!   recency dominates regardless of wall-clock spacing;
//! - an **age weight** `exp(-age_hours / 168)` (one-week half-life scale)
//!   recomputed against the `now` passed at query time — never frozen at
//!   insertion, so a window that sits idle for a month fades uniformly.
//!
//! The output is Σ(vᵢ·wᵢ·aᵢ) / Σ(wᵢ·aᵢ): a convex combination of the buffered
//! values, hence always within their min/max.  An empty window reads 0.0.
//!
//! `now` is an explicit argument everywhere; this type never reads a clock.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Hours over which the age weight decays by `1/e`.
const AGE_DECAY_HOURS: f64 = 168.0;

/// Exponentially position-weighted, age-discounted moving average.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WeightedMovingAverage {
    window_size: usize,
    alpha: f64,
    // Oldest first, newest last.
    samples: VecDeque<(f64, DateTime<Utc>)>,
}

impl Default for WeightedMovingAverage {
    fn default() -> Self {
        Self::new(20, 0.3)
    }
}

impl WeightedMovingAverage {
    /// Create a window holding at most `window_size` samples with smoothing
    /// factor `alpha` in `(0, 1)`.
    ///
    /// Out-of-range inputs are clamped rather than rejected: a degenerate
    /// window is never worth failing an interaction over.
    pub fn new(window_size: usize, alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(1e-6, 1.0 - 1e-6)
        } else {
            0.3
        };
        Self {
            window_size: window_size.max(1),
            alpha,
            samples: VecDeque::with_capacity(window_size.max(1)),
        }
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Push a sample and return the smoothed value as of `now`.
    ///
    /// Non-finite values are ignored (the previous average is returned); on
    /// overflow the oldest sample is evicted.
    pub fn update(&mut self, value: f64, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        if value.is_finite() {
            if self.samples.len() == self.window_size {
                self.samples.pop_front();
            }
            self.samples.push_back((value, timestamp));
        }
        self.average_at(now)
    }

    /// Smoothed value as of `now` without inserting anything.
    #[must_use]
    pub fn average_at(&self, now: DateTime<Utc>) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let n = self.samples.len();
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;

        for (i, &(value, ts)) in self.samples.iter().enumerate() {
            // Newest sample sits at the back; distance from the back drives the position weight.
            let recency = (n - 1 - i) as i32;
            let position_weight = self.alpha * (1.0 - self.alpha).powi(recency);
            let weight = position_weight * age_weight(ts, now);
            weighted_sum += value * weight;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        }
    }
}

/// `exp(-age_hours / 168)`, clamped so samples from the future weigh 1.0.
fn age_weight(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_hours = (now - timestamp).num_seconds() as f64 / 3600.0;
    (-age_hours.max(0.0) / AGE_DECAY_HOURS).exp()
}
