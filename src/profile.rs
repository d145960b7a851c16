//! Per-user profile state: anchors, bounded interaction history, behavioral
//! moving averages, and the per-user CUSUM accumulator.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::anchor::{AnchorName, ContextualAnchor};
use crate::detector::CusumState;
use crate::wma::WeightedMovingAverage;
use crate::Interaction;

/// Recent interactions retained per profile.
const RECENT_CAP: usize = 50;

/// All mutable state the engine keeps for one user.
///
/// Temporary (anonymous-session) profiles carry an expiry and are swept by
/// the engine's cleanup pass; everything else lives until explicitly removed.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserProfile {
    pub user_id: String,
    pub is_temporary: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_decayed_at: Option<DateTime<Utc>>,
    pub anchors: BTreeMap<AnchorName, ContextualAnchor>,
    recent: VecDeque<Interaction>,
    /// Smoothed satisfaction on the 1–5 scale.
    pub satisfaction: WeightedMovingAverage,
    /// Smoothed decision-consistency signal (1 = always the same priority).
    pub decision_consistency: WeightedMovingAverage,
    /// Smoothed closeness-to-home signal.
    pub location_stability: WeightedMovingAverage,
    /// Smoothed shopping-hour signal.
    pub temporal_patterns: WeightedMovingAverage,
    pub cusum: CusumState,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            is_temporary: false,
            expires_at: None,
            created_at: now,
            last_decayed_at: None,
            anchors: BTreeMap::new(),
            recent: VecDeque::new(),
            satisfaction: WeightedMovingAverage::new(20, 0.3),
            decision_consistency: WeightedMovingAverage::new(15, 0.4),
            location_stability: WeightedMovingAverage::new(25, 0.2),
            temporal_patterns: WeightedMovingAverage::new(30, 0.25),
            cusum: CusumState::default(),
        }
    }

    /// A session-scoped profile that expires after `ttl_hours`.
    pub fn temporary(user_id: impl Into<String>, ttl_hours: i64, now: DateTime<Utc>) -> Self {
        let mut profile = Self::new(user_id, now);
        profile.is_temporary = true;
        profile.expires_at = Some(now + chrono::Duration::hours(ttl_hours));
        profile
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if now >= expiry)
    }

    /// Get or lazily create an anchor from the canonical table.
    pub fn anchor_mut(&mut self, name: AnchorName) -> &mut ContextualAnchor {
        self.anchors.entry(name).or_insert_with(|| ContextualAnchor::new(name))
    }

    pub fn anchor(&self, name: AnchorName) -> Option<&ContextualAnchor> {
        self.anchors.get(&name)
    }

    pub fn recent(&self) -> &VecDeque<Interaction> {
        &self.recent
    }

    /// Record an interaction, evicting the oldest beyond the cap.
    pub fn push_interaction(&mut self, interaction: Interaction) {
        if self.recent.len() == RECENT_CAP {
            self.recent.pop_front();
        }
        self.recent.push_back(interaction);
    }

    /// Decision sequence of the retained history, oldest first.
    pub fn decision_history(&self) -> Vec<crate::Decision> {
        self.recent.iter().map(|i| i.decision).collect()
    }

    /// Weighted mean of stable-anchor confidences, 0 when none are stable.
    #[must_use]
    pub fn stable_confidence(&self) -> f64 {
        let stable: Vec<&ContextualAnchor> =
            self.anchors.values().filter(|a| a.is_stable()).collect();
        if stable.is_empty() {
            return 0.0;
        }
        let weight_sum: f64 = stable.iter().map(|a| a.weight).sum();
        if weight_sum == 0.0 {
            return 0.0;
        }
        stable.iter().map(|a| a.weight * a.confidence()).sum::<f64>() / weight_sum
    }

    /// Apply per-anchor temporal decay for `days` elapsed days.
    pub fn decay(&mut self, days: u32, now: DateTime<Utc>) {
        for anchor in self.anchors.values_mut() {
            anchor.apply_temporal_decay(days);
        }
        self.last_decayed_at = Some(now);
    }
}
