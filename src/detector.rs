//! Statistical change detection: CUSUM, Page–Hinkley, multivariate outliers.
//!
//! Three independent tests, each fail-open: when a test cannot run (no
//! history, too few samples, singular covariance) it reports a
//! [`SkipReason`] instead of erroring, and the caller simply collects no
//! signal from it.
//!
//! CUSUM accumulators are **per-user state** ([`CusumState`], owned by the
//! user's profile) — the detector itself holds configuration only, so one
//! detector instance can serve every user without cross-contamination.

use chrono::{Datelike, Timelike};

use crate::error::SkipReason;
use crate::geo::{haversine_km, GeoPoint};
use crate::{Decision, Interaction};

// ============================================================================
// CUSUM over decision ordinals
// ============================================================================

/// CUSUM tuning.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CusumConfig {
    /// Target shift `s`; each step subtracts `s/2` from the accumulators.
    pub sensitivity: f64,
    /// Alarm when either accumulator exceeds this.
    pub decision_limit: f64,
}

impl Default for CusumConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.5,
            decision_limit: 3.0,
        }
    }
}

/// Cross-call CUSUM accumulators, scoped to one user.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CusumState {
    pub pos: f64,
    pub neg: f64,
}

impl CusumState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Which side of the mean the accumulated shift points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShiftDirection {
    Increase,
    Decrease,
}

/// One CUSUM step's outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CusumReport {
    pub change_detected: bool,
    /// `max(pos, neg)` after the update.
    pub magnitude: f64,
    pub direction: ShiftDirection,
    /// `min(1, magnitude / decision_limit)`.
    pub confidence: f64,
}

// ============================================================================
// Page–Hinkley
// ============================================================================

/// Page–Hinkley tuning.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageHinkleyConfig {
    /// Magnitude tolerance subtracted from every sample.
    pub delta: f64,
    /// Detection threshold λ.
    pub lambda: f64,
}

impl Default for PageHinkleyConfig {
    fn default() -> Self {
        Self {
            delta: 0.1,
            lambda: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShiftKind {
    UpwardShift,
    DownwardShift,
}

/// A change point found in a numeric series.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChangePoint {
    /// Index into the input series where the alarm fired.
    pub index: usize,
    pub kind: ShiftKind,
    pub magnitude: f64,
    pub confidence: f64,
}

/// Batch Page–Hinkley result.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageHinkleyReport {
    pub change_points: Vec<ChangePoint>,
}

impl PageHinkleyReport {
    pub fn changes_detected(&self) -> bool {
        !self.change_points.is_empty()
    }

    pub fn most_recent_change(&self) -> Option<&ChangePoint> {
        self.change_points.last()
    }
}

// ============================================================================
// Multivariate outliers (Mahalanobis)
// ============================================================================

/// Multivariate outlier tuning.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutlierConfig {
    /// Minimum historical interactions before the test runs at all.
    pub min_history: usize,
    /// At most this many of the most recent interactions feed the estimate.
    pub max_history: usize,
    /// Mahalanobis alarm threshold; default is the χ² 95% quantile for 6
    /// degrees of freedom.
    pub threshold: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            min_history: 10,
            max_history: 50,
            threshold: 12.59,
        }
    }
}

/// Outcome of the Mahalanobis test.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutlierReport {
    pub is_outlier: bool,
    pub distance: f64,
    pub threshold: f64,
    /// `min(1, distance / threshold)`.
    pub confidence: f64,
}

const FEATURE_DIM: usize = 6;

// ============================================================================
// Detector
// ============================================================================

/// Change-detection battery: CUSUM, Page–Hinkley, and Mahalanobis outliers.
///
/// Holds configuration only; per-user accumulation lives in [`CusumState`].
#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    pub cusum: CusumConfig,
    pub page_hinkley: PageHinkleyConfig,
    pub outlier: OutlierConfig,
}

impl DriftDetector {
    /// CUSUM step over the user's decision stream.
    ///
    /// Decisions map to ordinals (ahorro=1, equilibrio=2, conveniencia=3);
    /// the deviation of the new decision from the historical mean feeds two
    /// one-sided accumulators in `state`, which persist across calls for the
    /// same user.  An empty history is a skip, not an error.
    pub fn cusum_test(
        &self,
        state: &mut CusumState,
        history: &[Decision],
        new_decision: Decision,
    ) -> Result<CusumReport, SkipReason> {
        if history.is_empty() {
            return Err(SkipReason::NoHistory);
        }

        let mean =
            history.iter().map(|d| d.ordinal()).sum::<f64>() / history.len() as f64;
        let deviation = new_decision.ordinal() - mean;
        let half_shift = self.cusum.sensitivity / 2.0;

        state.pos = (state.pos + deviation - half_shift).max(0.0);
        state.neg = (state.neg - deviation - half_shift).max(0.0);

        let magnitude = state.pos.max(state.neg);
        Ok(CusumReport {
            change_detected: state.pos > self.cusum.decision_limit
                || state.neg > self.cusum.decision_limit,
            magnitude,
            direction: if state.pos > state.neg {
                ShiftDirection::Increase
            } else {
                ShiftDirection::Decrease
            },
            confidence: (magnitude / self.cusum.decision_limit).min(1.0),
        })
    }

    /// Batch Page–Hinkley scan of a numeric series.
    ///
    /// Tracks the running cumulative sum of `(v - delta)` with its running
    /// min and max; emits a change point and resets all running state when
    /// the sum climbs more than λ above its minimum (upward shift) or falls
    /// more than λ below its maximum (downward shift).
    #[must_use]
    pub fn page_hinkley_test(&self, series: &[f64]) -> PageHinkleyReport {
        let delta = self.page_hinkley.delta;
        let lambda = self.page_hinkley.lambda;

        let mut change_points = Vec::new();
        let mut cumsum = 0.0_f64;
        let mut running_min = 0.0_f64;
        let mut running_max = 0.0_f64;

        for (i, &value) in series.iter().enumerate() {
            cumsum += value - delta;
            running_min = running_min.min(cumsum);
            running_max = running_max.max(cumsum);

            if cumsum - running_min > lambda {
                let magnitude = cumsum - running_min;
                change_points.push(ChangePoint {
                    index: i,
                    kind: ShiftKind::UpwardShift,
                    magnitude,
                    confidence: (magnitude / lambda).min(1.0),
                });
                cumsum = 0.0;
                running_min = 0.0;
                running_max = 0.0;
            } else if running_max - cumsum > lambda {
                let magnitude = running_max - cumsum;
                change_points.push(ChangePoint {
                    index: i,
                    kind: ShiftKind::DownwardShift,
                    magnitude,
                    confidence: (magnitude / lambda).min(1.0),
                });
                cumsum = 0.0;
                running_min = 0.0;
                running_max = 0.0;
            }
        }

        PageHinkleyReport { change_points }
    }

    /// Mahalanobis-distance outlier test of one interaction against history.
    ///
    /// Needs at least `min_history` historical interactions; uses the most
    /// recent `max_history` to estimate a 6-feature mean and covariance.
    /// A singular covariance is a skip (not an outlier, not an error).
    pub fn detect_multivariate_outliers(
        &self,
        new_interaction: &Interaction,
        history: &[Interaction],
        home: GeoPoint,
    ) -> Result<OutlierReport, SkipReason> {
        if history.len() < self.outlier.min_history {
            return Err(SkipReason::InsufficientData);
        }

        let start = history.len().saturating_sub(self.outlier.max_history);
        let rows: Vec<[f64; FEATURE_DIM]> = history[start..]
            .iter()
            .map(|i| feature_vector(i, home))
            .collect();

        let mean = column_means(&rows);
        let cov = sample_covariance(&rows, &mean);
        let inv = invert(&cov, FEATURE_DIM).ok_or(SkipReason::SingularCovariance)?;

        let x = feature_vector(new_interaction, home);
        let mut diff = [0.0_f64; FEATURE_DIM];
        for j in 0..FEATURE_DIM {
            diff[j] = x[j] - mean[j];
        }

        // d² = diffᵀ Σ⁻¹ diff
        let mut d2 = 0.0_f64;
        for r in 0..FEATURE_DIM {
            let mut row_dot = 0.0;
            for c in 0..FEATURE_DIM {
                row_dot += inv[r * FEATURE_DIM + c] * diff[c];
            }
            d2 += diff[r] * row_dot;
        }
        let distance = d2.max(0.0).sqrt();

        Ok(OutlierReport {
            is_outlier: distance > self.outlier.threshold,
            distance,
            threshold: self.outlier.threshold,
            confidence: (distance / self.outlier.threshold).min(1.0),
        })
    }
}

/// 6-feature encoding of one interaction: km from home, satisfaction,
/// product count, hour of day, weekday, decision ordinal.
fn feature_vector(interaction: &Interaction, home: GeoPoint) -> [f64; FEATURE_DIM] {
    [
        haversine_km(home, interaction.location),
        interaction.satisfaction,
        interaction.products.len() as f64,
        interaction.timestamp.hour() as f64,
        interaction.timestamp.weekday().num_days_from_monday() as f64,
        interaction.decision.ordinal(),
    ]
}

fn column_means(rows: &[[f64; FEATURE_DIM]]) -> [f64; FEATURE_DIM] {
    let mut mean = [0.0_f64; FEATURE_DIM];
    for row in rows {
        for j in 0..FEATURE_DIM {
            mean[j] += row[j];
        }
    }
    let n = rows.len() as f64;
    for m in &mut mean {
        *m /= n;
    }
    mean
}

/// Sample covariance (n-1 denominator), row-major flat matrix.
fn sample_covariance(rows: &[[f64; FEATURE_DIM]], mean: &[f64; FEATURE_DIM]) -> Vec<f64> {
    let mut cov = vec![0.0_f64; FEATURE_DIM * FEATURE_DIM];
    if rows.len() < 2 {
        return cov;
    }
    let denom = (rows.len() - 1) as f64;
    for row in rows {
        for r in 0..FEATURE_DIM {
            let dr = row[r] - mean[r];
            for c in 0..FEATURE_DIM {
                cov[r * FEATURE_DIM + c] += dr * (row[c] - mean[c]);
            }
        }
    }
    for v in &mut cov {
        *v /= denom;
    }
    cov
}

/// Invert a `dim × dim` row-major matrix by Gauss–Jordan elimination with
/// partial pivoting.  Returns `None` when a pivot is (numerically) zero.
fn invert(matrix: &[f64], dim: usize) -> Option<Vec<f64>> {
    const PIVOT_EPS: f64 = 1e-10;

    let mut a = matrix.to_vec();
    let mut inv = vec![0.0_f64; dim * dim];
    for i in 0..dim {
        inv[i * dim + i] = 1.0;
    }

    for col in 0..dim {
        // Partial pivot: largest-magnitude entry at or below the diagonal.
        let mut pivot_row = col;
        let mut pivot_abs = a[col * dim + col].abs();
        for r in (col + 1)..dim {
            let v = a[r * dim + col].abs();
            if v > pivot_abs {
                pivot_row = r;
                pivot_abs = v;
            }
        }
        if pivot_abs < PIVOT_EPS || !pivot_abs.is_finite() {
            return None;
        }
        if pivot_row != col {
            for c in 0..dim {
                a.swap(col * dim + c, pivot_row * dim + c);
                inv.swap(col * dim + c, pivot_row * dim + c);
            }
        }

        let pivot = a[col * dim + col];
        for c in 0..dim {
            a[col * dim + c] /= pivot;
            inv[col * dim + c] /= pivot;
        }

        for r in 0..dim {
            if r == col {
                continue;
            }
            let factor = a[r * dim + col];
            if factor == 0.0 {
                continue;
            }
            for c in 0..dim {
                a[r * dim + c] -= factor * a[col * dim + c];
                inv[r * dim + c] -= factor * inv[col * dim + c];
            }
        }
    }

    Some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn detector() -> DriftDetector {
        DriftDetector::default()
    }

    #[test]
    fn cusum_accumulates_across_calls() {
        // Five thrifty decisions (ordinal 1, mean 1), then convenience twice
        // (ordinal 3): deviations of 2 accumulate 1.75 then 3.5.
        let det = detector();
        let mut state = CusumState::default();
        let history = vec![Decision::Ahorro; 5];

        let first = det
            .cusum_test(&mut state, &history, Decision::Conveniencia)
            .unwrap();
        assert!(!first.change_detected);
        assert!((state.pos - 1.75).abs() < 1e-12, "pos = {}", state.pos);

        let second = det
            .cusum_test(&mut state, &history, Decision::Conveniencia)
            .unwrap();
        assert!(second.change_detected);
        assert!((state.pos - 3.5).abs() < 1e-12, "pos = {}", state.pos);
        assert_eq!(second.confidence, 1.0);
        assert_eq!(second.direction, ShiftDirection::Increase);
    }

    #[test]
    fn cusum_empty_history_is_a_skip() {
        let det = detector();
        let mut state = CusumState::default();
        let r = det.cusum_test(&mut state, &[], Decision::Ahorro);
        assert_eq!(r.unwrap_err(), SkipReason::NoHistory);
        assert_eq!(state, CusumState::default());
    }

    #[test]
    fn cusum_consistent_behavior_stays_quiet() {
        let det = detector();
        let mut state = CusumState::default();
        let history = vec![Decision::Equilibrio; 10];
        for _ in 0..20 {
            let r = det
                .cusum_test(&mut state, &history, Decision::Equilibrio)
                .unwrap();
            assert!(!r.change_detected);
        }
        // Zero deviation minus the drift allowance keeps both sides at zero.
        assert_eq!(state.pos, 0.0);
        assert_eq!(state.neg, 0.0);
    }

    #[test]
    fn page_hinkley_flags_upward_shift_and_resets() {
        let det = detector();
        let mut series = vec![0.0_f64; 20];
        series.extend(std::iter::repeat(2.0).take(10));
        let report = det.page_hinkley_test(&series);
        assert!(report.changes_detected());
        let cp = report.change_points[0];
        assert_eq!(cp.kind, ShiftKind::UpwardShift);
        assert!(cp.index >= 20, "fired too early at {}", cp.index);
    }

    #[test]
    fn page_hinkley_flags_downward_shift() {
        let det = detector();
        let mut series = vec![0.2_f64; 20];
        series.extend(std::iter::repeat(-2.0).take(10));
        let report = det.page_hinkley_test(&series);
        assert!(report
            .change_points
            .iter()
            .any(|cp| cp.kind == ShiftKind::DownwardShift));
    }

    #[test]
    fn page_hinkley_quiet_on_flat_series() {
        let det = detector();
        let series = vec![0.1_f64; 100];
        assert!(!det.page_hinkley_test(&series).changes_detected());
    }

    fn interaction_at(
        day: u32,
        hour: u32,
        lat: f64,
        lon: f64,
        sat: f64,
        n_products: usize,
        decision: Decision,
    ) -> Interaction {
        Interaction {
            id: uuid::Uuid::new_v4(),
            user_id: "u".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap(),
            products: (0..n_products).map(|i| format!("p{i}")).collect(),
            location: GeoPoint::new(lat, lon),
            decision,
            stores_visited: vec![],
            satisfaction: sat,
            context_data: Default::default(),
        }
    }

    /// Routine with variance in every feature so the covariance is invertible.
    fn routine_history(n: usize) -> Vec<Interaction> {
        (0..n)
            .map(|i| {
                let decision = match i % 3 {
                    0 => Decision::Ahorro,
                    1 => Decision::Equilibrio,
                    _ => Decision::Conveniencia,
                };
                interaction_at(
                    1 + (i % 14) as u32,
                    9 + (i % 4) as u32,
                    -33.45 + 0.002 * (i % 5) as f64,
                    -70.66 + 0.002 * (i % 7) as f64,
                    2.5 + 0.15 * (i % 11) as f64,
                    4 + (i % 6),
                    decision,
                )
            })
            .collect()
    }

    #[test]
    fn outlier_test_skips_below_min_history() {
        let det = detector();
        let home = GeoPoint::new(-33.45, -70.66);
        let history = routine_history(9);
        let probe = interaction_at(15, 11, -33.45, -70.66, 3.5, 5, Decision::Equilibrio);
        let r = det.detect_multivariate_outliers(&probe, &history, home);
        assert_eq!(r.unwrap_err(), SkipReason::InsufficientData);
    }

    #[test]
    fn outlier_test_skips_on_singular_covariance() {
        // Identical rows give a zero covariance matrix.
        let det = detector();
        let home = GeoPoint::new(-33.45, -70.66);
        let history: Vec<Interaction> = (0..15)
            .map(|_| interaction_at(2, 10, -33.45, -70.66, 3.5, 5, Decision::Equilibrio))
            .collect();
        let probe = interaction_at(20, 22, -33.0, -71.5, 1.0, 30, Decision::Ahorro);
        let r = det.detect_multivariate_outliers(&probe, &history, home);
        assert_eq!(r.unwrap_err(), SkipReason::SingularCovariance);
    }

    #[test]
    fn far_from_pattern_interaction_is_an_outlier() {
        let det = detector();
        let home = GeoPoint::new(-33.45, -70.66);
        let history = routine_history(30);

        let typical = interaction_at(16, 10, -33.451, -70.661, 3.2, 5, Decision::Equilibrio);
        let r = det
            .detect_multivariate_outliers(&typical, &history, home)
            .unwrap();
        assert!(!r.is_outlier, "distance {}", r.distance);

        // Midnight, 300+ km away, terrible satisfaction, huge basket.
        let weird = interaction_at(16, 23, -36.8, -73.0, 1.0, 40, Decision::Conveniencia);
        let r = det
            .detect_multivariate_outliers(&weird, &history, home)
            .unwrap();
        assert!(r.is_outlier, "distance {}", r.distance);
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn invert_recovers_identity() {
        let dim = 3;
        let m = vec![2.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 8.0];
        let inv = invert(&m, dim).unwrap();
        for r in 0..dim {
            for c in 0..dim {
                let mut s = 0.0;
                for k in 0..dim {
                    s += m[r * dim + k] * inv[k * dim + c];
                }
                let want = if r == c { 1.0 } else { 0.0 };
                assert!((s - want).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn invert_rejects_singular() {
        let m = vec![1.0, 2.0, 2.0, 4.0];
        assert!(invert(&m, 2).is_none());
    }
}
