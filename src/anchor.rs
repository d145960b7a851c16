//! Contextual anchors: named, confidence-scored, slowly-adapting profile
//! dimensions.
//!
//! An anchor tracks one stable fact about a user (home location, price
//! sensitivity, shopping hours, preferred brands, allergies, dietary
//! restrictions).  It learns slowly — blending rather than overwriting —
//! and only counts as a trusted baseline ([`ContextualAnchor::is_stable`])
//! after enough confirming observations.  Stability is cleared exclusively
//! by temporal decay, never by ordinary updates.
//!
//! The anchor vocabulary is closed: every anchor is created from the
//! canonical [`AnchorConfig`] table, and unknown names are rejected with
//! [`EngineError::InvalidAnchorName`].

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};

use crate::error::{EngineError, SkipReason};
use crate::geo::{haversine_km, GeoPoint};
use crate::Interaction;

/// Most recent anchor values kept for drift analysis.
const HISTORY_CAP: usize = 50;
/// Most recent drift alerts kept per anchor.
const ALERT_CAP: usize = 10;

// ============================================================================
// Vocabulary and canonical configuration
// ============================================================================

/// The closed anchor vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AnchorName {
    HomeLocation,
    PricePreference,
    TemporalPatterns,
    PreferredBrands,
    Allergies,
    DietaryRestrictions,
}

impl AnchorName {
    /// Every anchor in the vocabulary, in declaration order.
    pub const ALL: [AnchorName; 6] = [
        AnchorName::HomeLocation,
        AnchorName::PricePreference,
        AnchorName::TemporalPatterns,
        AnchorName::PreferredBrands,
        AnchorName::Allergies,
        AnchorName::DietaryRestrictions,
    ];

    /// Canonical storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            AnchorName::HomeLocation => "ubicacion_hogar",
            AnchorName::PricePreference => "preferencias_precio",
            AnchorName::TemporalPatterns => "patrones_temporales",
            AnchorName::PreferredBrands => "marcas_preferidas",
            AnchorName::Allergies => "allergies",
            AnchorName::DietaryRestrictions => "dietary_restrictions",
        }
    }

    /// Canonical per-anchor configuration.
    ///
    /// Single source of truth for every anchor creation path.
    pub fn config(self) -> AnchorConfig {
        match self {
            AnchorName::HomeLocation => AnchorConfig {
                weight: 0.35,
                stability_threshold: 0.80,
                blend_rate: 0.02,
                ..AnchorConfig::BASE
            },
            AnchorName::PricePreference => AnchorConfig {
                weight: 0.25,
                stability_threshold: 0.70,
                blend_rate: 0.05,
                ..AnchorConfig::BASE
            },
            AnchorName::TemporalPatterns => AnchorConfig {
                weight: 0.20,
                stability_threshold: 0.60,
                blend_rate: 0.08,
                ..AnchorConfig::BASE
            },
            AnchorName::PreferredBrands => AnchorConfig {
                weight: 0.20,
                stability_threshold: 0.75,
                blend_rate: 0.03,
                ..AnchorConfig::BASE
            },
            AnchorName::Allergies => AnchorConfig {
                weight: 0.15,
                stability_threshold: 0.90,
                blend_rate: 0.01,
                ..AnchorConfig::BASE
            },
            AnchorName::DietaryRestrictions => AnchorConfig {
                weight: 0.15,
                stability_threshold: 0.90,
                blend_rate: 0.01,
                ..AnchorConfig::BASE
            },
        }
    }
}

impl FromStr for AnchorName {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnchorName::ALL
            .into_iter()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| EngineError::InvalidAnchorName(s.to_string()))
    }
}

/// Per-anchor tuning; see the canonical table in [`AnchorName::config`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnchorConfig {
    /// Relative importance when aggregating profile-level confidence.
    pub weight: f64,
    /// Deviation tolerated before an observation counts as a drift signal;
    /// also the confidence level required for stability.
    pub stability_threshold: f64,
    /// Blend ratio used for no-drift updates on the engine path.
    pub blend_rate: f64,
    /// Per-update blend strength for [`ContextualAnchor::update_value`].
    pub learning_rate: f64,
    /// Daily confidence decay factor applied by the out-of-band decay pass.
    pub decay_rate: f64,
}

impl AnchorConfig {
    const BASE: AnchorConfig = AnchorConfig {
        weight: 0.25,
        stability_threshold: 0.7,
        blend_rate: 0.05,
        learning_rate: 0.1,
        decay_rate: 0.95,
    };
}

// ============================================================================
// Polymorphic anchor values
// ============================================================================

/// An anchor's value: scalar, label, label set, or keyed mapping.
///
/// Blending is dispatched explicitly per variant pair — numbers interpolate,
/// maps blend key-by-key, everything else is replaced.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AnchorValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
    Map(BTreeMap<String, AnchorValue>),
}

impl AnchorValue {
    pub fn map_from(entries: impl IntoIterator<Item = (&'static str, AnchorValue)>) -> Self {
        AnchorValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AnchorValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            AnchorValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Read a `{lat, lon}` map as a coordinate.
    pub fn as_point(&self) -> Option<GeoPoint> {
        match self {
            AnchorValue::Map(m) => {
                let lat = m.get("lat")?.as_number()?;
                let lon = m.get("lon")?.as_number()?;
                Some(GeoPoint::new(lat, lon))
            }
            _ => None,
        }
    }

    /// Blend on the learning path: numbers lerp with `alpha`, map numeric
    /// sub-fields lerp, every other sub-field takes the new value, and any
    /// other pairing is replaced outright.
    #[must_use]
    fn learned_with(&self, new: &AnchorValue, alpha: f64) -> AnchorValue {
        let alpha = alpha.clamp(0.0, 1.0);
        match (self, new) {
            (AnchorValue::Number(old), AnchorValue::Number(n)) => {
                AnchorValue::Number(old * (1.0 - alpha) + n * alpha)
            }
            (AnchorValue::Map(old), AnchorValue::Map(n)) => {
                let mut blended = old.clone();
                for (key, new_val) in n {
                    match (old.get(key), new_val) {
                        (Some(AnchorValue::Number(o)), AnchorValue::Number(nn)) => {
                            blended.insert(
                                key.clone(),
                                AnchorValue::Number(o * (1.0 - alpha) + nn * alpha),
                            );
                        }
                        _ => {
                            blended.insert(key.clone(), new_val.clone());
                        }
                    }
                }
                AnchorValue::Map(blended)
            }
            (_, n) => n.clone(),
        }
    }

    /// Blend `new` into `self` with the given ratio (1.0 = take new).
    ///
    /// Numbers lerp; maps blend key-by-key (numeric sub-fields lerped, list
    /// sub-fields unioned, other sub-fields replaced); incompatible variants
    /// are replaced outright when the ratio favors the new value.
    #[must_use]
    pub fn blended_with(&self, new: &AnchorValue, ratio: f64) -> AnchorValue {
        let ratio = ratio.clamp(0.0, 1.0);
        match (self, new) {
            (AnchorValue::Number(old), AnchorValue::Number(n)) => {
                AnchorValue::Number(old * (1.0 - ratio) + n * ratio)
            }
            (AnchorValue::Map(old), AnchorValue::Map(n)) => {
                let mut blended = old.clone();
                for (key, new_val) in n {
                    match old.get(key) {
                        Some(AnchorValue::Number(o)) => {
                            if let AnchorValue::Number(nn) = new_val {
                                blended.insert(
                                    key.clone(),
                                    AnchorValue::Number(o * (1.0 - ratio) + nn * ratio),
                                );
                            } else {
                                blended.insert(key.clone(), new_val.clone());
                            }
                        }
                        Some(AnchorValue::List(o)) => {
                            if let AnchorValue::List(nn) = new_val {
                                let mut merged = o.clone();
                                for item in nn {
                                    if !merged.contains(item) {
                                        merged.push(item.clone());
                                    }
                                }
                                blended.insert(key.clone(), AnchorValue::List(merged));
                            } else {
                                blended.insert(key.clone(), new_val.clone());
                            }
                        }
                        Some(_) => {
                            if ratio > 0.5 {
                                blended.insert(key.clone(), new_val.clone());
                            }
                        }
                        None => {
                            blended.insert(key.clone(), new_val.clone());
                        }
                    }
                }
                AnchorValue::Map(blended)
            }
            (AnchorValue::List(old), AnchorValue::List(n)) => {
                if ratio > 0.5 {
                    let mut merged = old.clone();
                    for item in n {
                        if !merged.contains(item) {
                            merged.push(item.clone());
                        }
                    }
                    AnchorValue::List(merged)
                } else {
                    AnchorValue::List(old.clone())
                }
            }
            (old, n) => {
                if ratio > 0.5 {
                    n.clone()
                } else {
                    old.clone()
                }
            }
        }
    }

    /// Type-specific distance in `[0, 1]` used for drift checks.
    ///
    /// Maps: mean relative per-key delta over the key union, missing key = 1.
    /// Numbers: relative delta.  Lists: Jaccard distance.  Anything else:
    /// exact match (0) or not (1).
    #[must_use]
    pub fn drift_distance(&self, new: &AnchorValue) -> f64 {
        match (self, new) {
            (AnchorValue::Map(old), AnchorValue::Map(n)) => {
                let keys: std::collections::BTreeSet<&String> =
                    old.keys().chain(n.keys()).collect();
                if keys.is_empty() {
                    return 0.0;
                }
                let mut total = 0.0;
                for key in &keys {
                    total += match (old.get(*key), n.get(*key)) {
                        (Some(AnchorValue::Number(o)), Some(AnchorValue::Number(nn))) => {
                            relative_delta(*o, *nn)
                        }
                        (Some(o), Some(nn)) => {
                            if o == nn {
                                0.0
                            } else {
                                1.0
                            }
                        }
                        _ => 1.0,
                    };
                }
                total / keys.len() as f64
            }
            (AnchorValue::Number(old), AnchorValue::Number(n)) => relative_delta(*old, *n),
            (AnchorValue::List(old), AnchorValue::List(n)) => jaccard_distance(old, n),
            (old, n) => {
                if old == n {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }
}

fn relative_delta(old: f64, new: f64) -> f64 {
    if old != 0.0 {
        (new - old).abs() / old.abs()
    } else if new != 0.0 {
        1.0
    } else {
        0.0
    }
}

fn jaccard_distance(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    if a.is_empty() || b.is_empty() {
        return 1.0;
    }
    let sa: std::collections::BTreeSet<&String> = a.iter().collect();
    let sb: std::collections::BTreeSet<&String> = b.iter().collect();
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    1.0 - intersection / union
}

/// Brands the engine can recognize inside free-form product names.
pub(crate) const KNOWN_BRANDS: [&str; 6] =
    ["soprole", "ideal", "carozzi", "lider", "jumbo", "tottus"];

/// Extract known brand names mentioned in a product list (deduplicated,
/// first-mention order).
pub(crate) fn brands_in(products: &[String]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for product in products {
        let lower = product.to_lowercase();
        for brand in KNOWN_BRANDS {
            if lower.contains(brand) && !found.iter().any(|b| b == brand) {
                found.push(brand.to_string());
            }
        }
    }
    found
}

// ============================================================================
// Anchor state machine
// ============================================================================

/// One recorded anchor update.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HistoryEntry {
    pub value: AnchorValue,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
}

/// One recorded drift alert.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriftAlert {
    pub timestamp: DateTime<Utc>,
    pub new_value: AnchorValue,
    pub old_value: AnchorValue,
    pub drift_score: f64,
    pub confidence_at_detection: f64,
}

/// Outcome of an anchor-level drift check.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnchorDriftCheck {
    pub drift_detected: bool,
    pub drift_score: f64,
    pub threshold_used: f64,
    pub confidence: f64,
    /// Set when the check was skipped rather than run.
    pub skipped: Option<SkipReason>,
}

/// A single named, confidence-scored, slowly-adapting profile dimension.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextualAnchor {
    name: AnchorName,
    pub current_value: Option<AnchorValue>,
    confidence: f64,
    pub weight: f64,
    pub stability_threshold: f64,
    pub blend_rate: f64,
    pub learning_rate: f64,
    pub decay_rate: f64,
    pub update_count: u64,
    is_stable: bool,
    pub last_updated: Option<DateTime<Utc>>,
    history: VecDeque<HistoryEntry>,
    drift_alerts: VecDeque<DriftAlert>,
}

impl ContextualAnchor {
    /// Create an empty anchor from the canonical configuration table.
    pub fn new(name: AnchorName) -> Self {
        let cfg = name.config();
        Self {
            name,
            current_value: None,
            confidence: 0.0,
            weight: cfg.weight,
            stability_threshold: cfg.stability_threshold,
            blend_rate: cfg.blend_rate,
            learning_rate: cfg.learning_rate,
            decay_rate: cfg.decay_rate,
            update_count: 0,
            is_stable: false,
            last_updated: None,
            history: VecDeque::new(),
            drift_alerts: VecDeque::new(),
        }
    }

    pub fn name(&self) -> AnchorName {
        self.name
    }

    /// Confidence in `[0, 1]`; clamped on every write.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Stable once confidence has met the threshold over at least 5 updates;
    /// cleared only by [`apply_temporal_decay`](Self::apply_temporal_decay).
    pub fn is_stable(&self) -> bool {
        self.is_stable
    }

    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    pub fn drift_alerts(&self) -> &VecDeque<DriftAlert> {
        &self.drift_alerts
    }

    /// Force confidence to a specific level (drift-strategy resets).
    pub(crate) fn set_confidence(&mut self, confidence: f64) {
        self.confidence = confidence.clamp(0.0, 1.0);
    }

    /// Semantic deviation of an interaction from this anchor, in `[0, 1]`.
    ///
    /// Home: haversine distance normalized by 10 km.  Price: priority
    /// mismatch scores 0.5.  Temporal: circular hour distance normalized by
    /// 12 h.  Brands: `1 - |preferred ∩ observed| / |preferred|`.  An anchor
    /// with no value deviates by 0.
    #[must_use]
    pub fn deviation(&self, interaction: &Interaction) -> f64 {
        let Some(value) = &self.current_value else {
            return 0.0;
        };

        match self.name {
            AnchorName::HomeLocation => match value.as_point() {
                Some(home) => (haversine_km(home, interaction.location) / 10.0).min(1.0),
                None => 0.0,
            },
            AnchorName::PricePreference => {
                let priority = match value {
                    AnchorValue::Map(m) => m.get("prioridad"),
                    _ => None,
                };
                match priority {
                    Some(AnchorValue::Text(p)) if p == interaction.decision.as_str() => 0.0,
                    Some(_) => 0.5,
                    None => 0.0,
                }
            }
            AnchorName::TemporalPatterns => {
                let preferred = match value {
                    AnchorValue::Map(m) => m.get("horario_preferido").and_then(|v| v.as_number()),
                    _ => None,
                };
                match preferred {
                    Some(hour) => {
                        let diff = (interaction.timestamp.hour() as f64 - hour).abs();
                        let circular = diff.min(24.0 - diff);
                        (circular / 12.0).min(1.0)
                    }
                    None => 0.0,
                }
            }
            AnchorName::PreferredBrands => {
                let preferred = match value {
                    AnchorValue::Map(m) => m.get("marcas").and_then(|v| v.as_list()),
                    _ => None,
                };
                let observed = brands_in(&interaction.products);
                match preferred {
                    Some(preferred) if !preferred.is_empty() && !observed.is_empty() => {
                        let overlap = preferred
                            .iter()
                            .filter(|b| observed.contains(b))
                            .count() as f64;
                        1.0 - overlap / preferred.len() as f64
                    }
                    _ => 0.0,
                }
            }
            // Hard facts: an interaction itself never contradicts them.
            AnchorName::Allergies | AnchorName::DietaryRestrictions => 0.0,
        }
    }

    /// Learn a new observation.
    ///
    /// First write sets the value and confidence `min(0.3 + boost, 1)`.
    /// Later writes blend with `alpha = learning_rate · (1 + boost)` (numbers
    /// lerped, non-numeric sub-fields and mismatched types replaced) and
    /// raise confidence by `learning_rate · 0.1 + boost`, clamped.  Stability
    /// is (re)checked but never cleared here.
    pub fn update_value(&mut self, new_value: AnchorValue, confidence_boost: f64, now: DateTime<Utc>) {
        match &self.current_value {
            None => {
                self.current_value = Some(new_value.clone());
                self.confidence = (0.3 + confidence_boost).clamp(0.0, 1.0);
            }
            Some(old) => {
                let alpha = (self.learning_rate * (1.0 + confidence_boost)).clamp(0.0, 1.0);
                self.current_value = Some(old.learned_with(&new_value, alpha));
                let increase = self.learning_rate * 0.1 + confidence_boost;
                self.confidence = (self.confidence + increase).clamp(0.0, 1.0);
            }
        }

        self.update_count += 1;
        self.last_updated = Some(now);

        if self.confidence >= self.stability_threshold && self.update_count >= 5 {
            self.is_stable = true;
        }

        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            value: new_value,
            timestamp: now,
            confidence: self.confidence,
        });
    }

    /// Blend toward a new value on the engine's update path, leaving the
    /// confidence bookkeeping to the caller's strategy.
    pub(crate) fn blend_value(&mut self, new_value: &AnchorValue, ratio: f64, now: DateTime<Utc>) {
        self.current_value = Some(match &self.current_value {
            Some(old) => old.blended_with(new_value, ratio),
            None => new_value.clone(),
        });
        self.update_count += 1;
        self.last_updated = Some(now);
        if self.confidence >= self.stability_threshold && self.update_count >= 5 {
            self.is_stable = true;
        }
    }

    /// Check whether `new_value` represents drift from this anchor's baseline.
    ///
    /// Only meaningful once the anchor is stable; otherwise the check is
    /// skipped with [`SkipReason::AnchorNotStable`].  A detected drift is
    /// recorded in the bounded alert log.
    pub fn detect_drift(
        &mut self,
        new_value: &AnchorValue,
        threshold_multiplier: f64,
        now: DateTime<Utc>,
    ) -> AnchorDriftCheck {
        let Some(current) = self.current_value.clone() else {
            return AnchorDriftCheck {
                drift_detected: false,
                drift_score: 0.0,
                threshold_used: 0.0,
                confidence: 0.0,
                skipped: Some(SkipReason::AnchorNotStable),
            };
        };
        if !self.is_stable {
            return AnchorDriftCheck {
                drift_detected: false,
                drift_score: 0.0,
                threshold_used: 0.0,
                confidence: 0.0,
                skipped: Some(SkipReason::AnchorNotStable),
            };
        }

        let drift_score = current.drift_distance(new_value);
        let threshold_used = self.stability_threshold * threshold_multiplier;
        let drift_detected = drift_score > threshold_used;

        if drift_detected {
            if self.drift_alerts.len() == ALERT_CAP {
                self.drift_alerts.pop_front();
            }
            self.drift_alerts.push_back(DriftAlert {
                timestamp: now,
                new_value: new_value.clone(),
                old_value: current,
                drift_score,
                confidence_at_detection: self.confidence,
            });
        }

        AnchorDriftCheck {
            drift_detected,
            drift_score,
            threshold_used,
            confidence: self.confidence,
            skipped: None,
        }
    }

    /// Decay confidence by `decay_rate^days`; below half the stability
    /// threshold the anchor loses its stable status.
    ///
    /// Driven by the out-of-band decay pass, never by the interaction path.
    pub fn apply_temporal_decay(&mut self, days: u32) {
        if days == 0 {
            return;
        }
        self.confidence =
            (self.confidence * self.decay_rate.powi(days as i32)).clamp(0.0, 1.0);
        if self.confidence < self.stability_threshold * 0.5 {
            self.is_stable = false;
        }
    }
}
