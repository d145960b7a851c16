//! The profile engine: loads a user's anchors, runs the detector battery and
//! the seasonal disambiguator, aggregates their signals into a drift verdict,
//! applies the matching anchor-update strategy, and builds the caller-facing
//! response.
//!
//! Error policy is fail-open: a detector that cannot run is skipped (the
//! reason is surfaced in the verdict), and store failures on the interaction
//! path are logged and suppressed.  Drift detection never blocks the primary
//! user-facing action.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::anchor::{brands_in, AnchorName, AnchorValue, ContextualAnchor};
use crate::anonymize::{LocationAnonymizer, Precision, RegionCode};
use crate::cache::CacheSignature;
use crate::detector::DriftDetector;
use crate::error::{EngineError, SkipReason};
use crate::geo::{haversine_km, GeoPoint};
use crate::profile::UserProfile;
use crate::seasonal::{Observation, SeasonalAnalyzer, SeasonalKind};
use crate::store::{CacheStore, InteractionLog, InteractionRecord, ProfileStore};
use crate::{Decision, Interaction};

/// Anonymous-session profiles live this long without renewal.
const TEMPORARY_TTL_HOURS: i64 = 12;
/// Decisions fed to the CUSUM step.
const CUSUM_WINDOW: usize = 10;
/// How close to the series tail a Page–Hinkley change point must fall to
/// still count as a signal; older ones are stale, not news.
const PH_RECENCY: usize = 3;
/// Keywords marking a product as premium.
const PREMIUM_KEYWORDS: [&str; 4] = ["premium", "gourmet", "importado", "orgánico"];

// ============================================================================
// Verdict types
// ============================================================================

/// Kind of context change a verdict reports.  Declaration order is the final
/// tie-breaker when signal kinds are equally frequent and equally severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DriftType {
    LocationDrift,
    PreferenceShift,
    TemporalChange,
    SatisfactionDecline,
    SeasonalChange,
    ErraticBehavior,
}

impl DriftType {
    pub fn as_str(self) -> &'static str {
        match self {
            DriftType::LocationDrift => "location_drift",
            DriftType::PreferenceShift => "preference_shift",
            DriftType::TemporalChange => "temporal_change",
            DriftType::SatisfactionDecline => "satisfaction_decline",
            DriftType::SeasonalChange => "seasonal_change",
            DriftType::ErraticBehavior => "erratic_behavior",
        }
    }
}

/// Which test produced a signal (or carried the verdict).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DetectionAlgorithm {
    AnchorDeviation,
    Cusum,
    PageHinkley,
    Mahalanobis,
    SeasonalCalendar,
}

/// What produced a drift signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SignalSource {
    Anchor(AnchorName),
    DecisionPattern,
    SatisfactionSeries,
    MultivariateOutlier,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Signal {
    source: SignalSource,
    kind: DriftType,
    algorithm: DetectionAlgorithm,
    severity: f64,
    confidence: f64,
}

/// What the engine should do about a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RecommendedAction {
    ContinueNormalOperation,
    IncreaseMonitoring,
    GradualAdaptation,
    ImmediateContextReset,
    AdjustSeasonalExpectations,
}

/// Aggregated outcome of one interaction's drift analysis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriftVerdict {
    pub has_drift: bool,
    pub drift_type: Option<DriftType>,
    pub confidence: f64,
    pub magnitude: f64,
    pub affected_anchors: Vec<AnchorName>,
    pub algorithm: DetectionAlgorithm,
    pub recommended_action: RecommendedAction,
    /// Tests that could not run this round.
    pub skipped: Vec<SkipReason>,
}

impl DriftVerdict {
    fn no_drift(skipped: Vec<SkipReason>) -> Self {
        Self {
            has_drift: false,
            drift_type: None,
            confidence: 0.0,
            magnitude: 0.0,
            affected_anchors: Vec::new(),
            algorithm: DetectionAlgorithm::Cusum,
            recommended_action: RecommendedAction::ContinueNormalOperation,
            skipped,
        }
    }
}

/// `(blend_ratio, learning-rate multiplier, confidence after reset)` applied
/// to affected anchors, keyed by drift type.
#[derive(Debug, Clone, Copy, PartialEq)]
struct UpdateStrategy {
    blend_ratio: f64,
    learning_rate_multiplier: f64,
    confidence_after: f64,
}

fn strategy_for(kind: DriftType) -> UpdateStrategy {
    match kind {
        DriftType::LocationDrift => UpdateStrategy {
            blend_ratio: 0.8,
            learning_rate_multiplier: 2.0,
            confidence_after: 0.3,
        },
        DriftType::TemporalChange => UpdateStrategy {
            blend_ratio: 0.4,
            learning_rate_multiplier: 1.3,
            confidence_after: 0.6,
        },
        DriftType::ErraticBehavior => UpdateStrategy {
            blend_ratio: 0.1,
            learning_rate_multiplier: 0.8,
            confidence_after: 0.8,
        },
        // Preference shift is also the fallback for kinds without a
        // dedicated strategy.
        _ => UpdateStrategy {
            blend_ratio: 0.6,
            learning_rate_multiplier: 1.5,
            confidence_after: 0.5,
        },
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProfileStrength {
    Strong,
    Moderate,
    Weak,
}

/// Coarse location surfaced to callers; never carries raw coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionSummary {
    pub region: RegionCode,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PreferenceProfile {
    pub optimization_priority: Decision,
    pub satisfaction_level: f64,
    pub allergies: Vec<String>,
    pub dietary_restrictions: Vec<String>,
    pub confidence: f64,
}

impl Default for PreferenceProfile {
    fn default() -> Self {
        Self {
            optimization_priority: Decision::Equilibrio,
            satisfaction_level: 3.0,
            allergies: Vec::new(),
            dietary_restrictions: Vec::new(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TemporalPattern {
    pub preferred_hour: f64,
    pub preferred_weekday: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BrandPattern {
    pub preferred_brands: Vec<String>,
    pub preferred_stores: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BehavioralPatterns {
    pub temporal: Option<TemporalPattern>,
    pub brands: Option<BrandPattern>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextSummary {
    pub profile_strength: ProfileStrength,
    pub primary_location: Option<RegionSummary>,
    pub preference_profile: PreferenceProfile,
    pub behavioral_patterns: BehavioralPatterns,
    /// Weight-averaged anchor confidence.
    pub confidence_level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RecommendationKind {
    LocationBased,
    OptimizationPreference,
    StorePreference,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriftInfo {
    pub drift_detected: bool,
    pub drift_type: Option<DriftType>,
    pub confidence: f64,
    pub recommended_action: RecommendedAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConversationTone {
    Helpful,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PersonalizationLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ContextAction {
    ConfirmLocationChange,
    ConfirmPreferenceChange,
    GatherBasicPreferences,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConversationGuidance {
    pub tone: ConversationTone,
    pub personalization: PersonalizationLevel,
    pub suggested_questions: Vec<String>,
    pub context_actions: Vec<ContextAction>,
}

/// Full payload returned to the caller after an interaction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineResponse {
    pub user_id: String,
    pub context_summary: ContextSummary,
    pub recommendations: Vec<Recommendation>,
    pub drift_info: DriftInfo,
    pub conversation_guidance: ConversationGuidance,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub profiles_removed: usize,
    pub cache_entries_removed: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// Orchestrates anchors, detectors, the seasonal analyzer, and the stores.
///
/// Constructed explicitly with its dependencies; holds no global state.
pub struct ProfileEngine<P, L, C> {
    profiles: P,
    log: L,
    cache: C,
    detector: DriftDetector,
    seasonal: SeasonalAnalyzer,
    anonymizer: LocationAnonymizer,
}

impl<P: ProfileStore, L: InteractionLog, C: CacheStore> ProfileEngine<P, L, C> {
    pub fn new(profiles: P, log: L, cache: C) -> Self {
        Self {
            profiles,
            log,
            cache,
            detector: DriftDetector::default(),
            seasonal: SeasonalAnalyzer::default(),
            anonymizer: LocationAnonymizer,
        }
    }

    pub fn with_seasonal(mut self, seasonal: SeasonalAnalyzer) -> Self {
        self.seasonal = seasonal;
        self
    }

    pub fn with_detector(mut self, detector: DriftDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn profiles(&self) -> &P {
        &self.profiles
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Process one interaction end to end: score it against the profile,
    /// update anchors and moving averages, persist, and build the response.
    pub fn process_interaction(
        &mut self,
        interaction: &Interaction,
        now: DateTime<Utc>,
    ) -> EngineResponse {
        let mut profile = self.load_or_create(&interaction.user_id, now);

        let verdict = self.analyze(&mut profile, interaction);
        if verdict.has_drift {
            info!(
                user = %profile.user_id,
                drift_type = verdict.drift_type.map(DriftType::as_str).unwrap_or("unknown"),
                confidence = verdict.confidence,
                "context drift detected"
            );
        }

        self.update_profile(&mut profile, interaction, &verdict, now);
        profile.push_interaction(interaction.clone());
        self.persist(&profile, interaction, now);

        let summary = self.summarize(&profile);
        let recommendations = self.recommend(&profile);
        let guidance = self.guide(&profile, &verdict);

        EngineResponse {
            user_id: profile.user_id.clone(),
            context_summary: summary,
            recommendations,
            drift_info: DriftInfo {
                drift_detected: verdict.has_drift,
                drift_type: verdict.drift_type,
                confidence: verdict.confidence,
                recommended_action: verdict.recommended_action,
            },
            conversation_guidance: guidance,
            timestamp: now,
        }
    }

    /// Context summary without processing an interaction; `None` for a user
    /// the engine has never seen.
    pub fn context_summary(&self, user_id: &str) -> Result<Option<ContextSummary>, EngineError> {
        Ok(self.profiles.load(user_id)?.map(|p| self.summarize(&p)))
    }

    /// Record an explicitly stated fact (allergies, dietary restrictions)
    /// that interactions cannot surface on their own.
    pub fn observe_anchor_fact(
        &mut self,
        user_id: &str,
        name: AnchorName,
        value: AnchorValue,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut profile = self.load_or_create(user_id, now);
        // Stated facts are high-signal compared to inferred ones.
        profile.anchor_mut(name).update_value(value, 0.2, now);
        self.profiles.save(&profile)
    }

    /// Out-of-band temporal decay over every stored profile; idempotent for
    /// a fixed `now`.  Returns how many profiles were touched.
    pub fn run_decay(&mut self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut touched = 0;
        for user_id in self.profiles.all_ids()? {
            let Some(mut profile) = self.profiles.load(&user_id)? else {
                continue;
            };
            let since = profile.last_decayed_at.unwrap_or(profile.created_at);
            let days = (now - since).num_days().max(0) as u32;
            if days == 0 {
                continue;
            }
            profile.decay(days, now);
            self.profiles.save(&profile)?;
            touched += 1;
        }
        debug!(profiles = touched, "temporal decay pass complete");
        Ok(touched)
    }

    /// Drop expired temporary profiles and expired cache entries.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> Result<CleanupReport, EngineError> {
        let mut report = CleanupReport::default();
        for user_id in self.profiles.expired_ids(now)? {
            self.profiles.remove(&user_id)?;
            report.profiles_removed += 1;
        }
        report.cache_entries_removed = self.cache.purge_expired(now)?;
        info!(
            profiles = report.profiles_removed,
            cache_entries = report.cache_entries_removed,
            "expired data cleanup complete"
        );
        Ok(report)
    }

    /// Delete a user's profile, anchors included, regardless of expiry.
    pub fn erase_user(&mut self, user_id: &str) -> Result<(), EngineError> {
        info!(user = user_id, "erasing profile on request");
        self.profiles.remove(user_id)
    }

    // ------------------------------------------------------------------
    // Interaction pipeline
    // ------------------------------------------------------------------

    fn load_or_create(&self, user_id: &str, now: DateTime<Utc>) -> UserProfile {
        match self.profiles.load(user_id) {
            Ok(Some(profile)) if !profile.is_expired(now) => profile,
            Ok(Some(_)) => {
                debug!(user = user_id, "temporary profile expired, starting fresh");
                self.fresh_profile(user_id, now)
            }
            Ok(None) => self.fresh_profile(user_id, now),
            Err(err) => {
                warn!(user = user_id, error = %err, "profile load failed, starting fresh");
                self.fresh_profile(user_id, now)
            }
        }
    }

    fn fresh_profile(&self, user_id: &str, now: DateTime<Utc>) -> UserProfile {
        if user_id.starts_with("persistent_") {
            UserProfile::new(user_id, now)
        } else {
            UserProfile::temporary(user_id, TEMPORARY_TTL_HOURS, now)
        }
    }

    /// Run all detectors against the pre-interaction profile state and
    /// aggregate their signals into a verdict.
    fn analyze(&self, profile: &mut UserProfile, interaction: &Interaction) -> DriftVerdict {
        let mut signals: Vec<Signal> = Vec::new();
        let mut skipped: Vec<SkipReason> = Vec::new();

        // Anchor deviations.
        for anchor in profile.anchors.values() {
            if anchor.current_value.is_none() {
                continue;
            }
            let deviation = anchor.deviation(interaction);
            if deviation > anchor.stability_threshold {
                signals.push(Signal {
                    source: SignalSource::Anchor(anchor.name()),
                    kind: drift_kind_for_anchor(anchor.name()),
                    algorithm: DetectionAlgorithm::AnchorDeviation,
                    severity: deviation,
                    confidence: (deviation / anchor.stability_threshold).min(1.0),
                });
            }
        }

        // CUSUM over the decision stream.
        if profile.recent().len() >= 5 {
            let history = profile.decision_history();
            let start = history.len().saturating_sub(CUSUM_WINDOW);
            match self.detector.cusum_test(
                &mut profile.cusum,
                &history[start..],
                interaction.decision,
            ) {
                Ok(report) if report.change_detected => signals.push(Signal {
                    source: SignalSource::DecisionPattern,
                    kind: DriftType::PreferenceShift,
                    algorithm: DetectionAlgorithm::Cusum,
                    severity: report.magnitude,
                    confidence: report.confidence,
                }),
                Ok(_) => {}
                Err(reason) => skipped.push(reason),
            }

            // Page–Hinkley over the mean-centered satisfaction series; the
            // test looks for shifts, so the level itself is removed first.
            let mut series: Vec<f64> =
                profile.recent().iter().map(|i| i.satisfaction).collect();
            series.push(interaction.satisfaction);
            let mean = series.iter().sum::<f64>() / series.len() as f64;
            for v in &mut series {
                *v -= mean;
            }
            let report = self.detector.page_hinkley_test(&series);
            let fresh_change = report
                .most_recent_change()
                .filter(|change| change.index + PH_RECENCY >= series.len());
            if let Some(change) = fresh_change {
                signals.push(Signal {
                    source: SignalSource::SatisfactionSeries,
                    kind: match change.kind {
                        crate::detector::ShiftKind::DownwardShift => {
                            DriftType::SatisfactionDecline
                        }
                        crate::detector::ShiftKind::UpwardShift => DriftType::PreferenceShift,
                    },
                    algorithm: DetectionAlgorithm::PageHinkley,
                    severity: change.magnitude / self.detector.page_hinkley.lambda,
                    confidence: change.confidence,
                });
            }
        }

        // Multivariate outlier test.
        if profile.recent().len() >= self.detector.outlier.min_history {
            let home = profile
                .anchor(AnchorName::HomeLocation)
                .and_then(|a| a.current_value.as_ref())
                .and_then(AnchorValue::as_point)
                .unwrap_or_default();
            let history: Vec<Interaction> = profile.recent().iter().cloned().collect();
            match self
                .detector
                .detect_multivariate_outliers(interaction, &history, home)
            {
                Ok(report) if report.is_outlier => signals.push(Signal {
                    source: SignalSource::MultivariateOutlier,
                    kind: DriftType::ErraticBehavior,
                    algorithm: DetectionAlgorithm::Mahalanobis,
                    severity: report.confidence,
                    confidence: report.confidence,
                }),
                Ok(_) => {}
                Err(reason) => skipped.push(reason),
            }
        }

        // Seasonal disambiguation.
        let behavior = behavior_metrics(interaction, profile);
        let seasonal = self.seasonal.classify(&behavior, interaction.timestamp);
        if seasonal.kind == SeasonalKind::SeasonalChange {
            // Calendar explains the change; suppress the drift signals.
            return DriftVerdict {
                has_drift: false,
                drift_type: Some(DriftType::SeasonalChange),
                confidence: seasonal.confidence,
                magnitude: 0.0,
                affected_anchors: Vec::new(),
                algorithm: DetectionAlgorithm::SeasonalCalendar,
                recommended_action: RecommendedAction::AdjustSeasonalExpectations,
                skipped,
            };
        }

        if signals.len() < 2 {
            if !signals.is_empty() {
                debug!(
                    user = %profile.user_id,
                    signals = signals.len(),
                    "single drift signal, below the corroboration threshold"
                );
            }
            return DriftVerdict::no_drift(skipped);
        }

        let confidence =
            signals.iter().map(|s| s.confidence).sum::<f64>() / signals.len() as f64;
        let magnitude = signals
            .iter()
            .map(|s| s.severity)
            .fold(0.0_f64, f64::max);
        let drift_type = dominant_kind(&signals);
        let affected_anchors: Vec<AnchorName> = signals
            .iter()
            .filter_map(|s| match s.source {
                SignalSource::Anchor(name) => Some(name),
                _ => None,
            })
            .collect();
        let algorithm = signals
            .iter()
            .find(|s| s.kind == drift_type)
            .map(|s| s.algorithm)
            .unwrap_or(DetectionAlgorithm::Cusum);

        let recommended_action = if confidence > 0.8 && magnitude > 0.7 {
            RecommendedAction::ImmediateContextReset
        } else if confidence > 0.6 {
            RecommendedAction::GradualAdaptation
        } else {
            RecommendedAction::IncreaseMonitoring
        };

        DriftVerdict {
            has_drift: true,
            drift_type: Some(drift_type),
            confidence,
            magnitude,
            affected_anchors,
            algorithm,
            recommended_action,
            skipped,
        }
    }

    /// Apply the verdict: moving averages always, anchors by strategy.
    fn update_profile(
        &self,
        profile: &mut UserProfile,
        interaction: &Interaction,
        verdict: &DriftVerdict,
        now: DateTime<Utc>,
    ) {
        let ts = interaction.timestamp;
        profile.satisfaction.update(interaction.satisfaction, ts, now);
        profile
            .decision_consistency
            .update(interaction.decision.ordinal(), ts, now);
        let home = profile
            .anchor(AnchorName::HomeLocation)
            .and_then(|a| a.current_value.as_ref())
            .and_then(AnchorValue::as_point)
            .unwrap_or(interaction.location);
        profile.location_stability.update(
            (haversine_km(home, interaction.location) / 10.0).min(1.0),
            ts,
            now,
        );
        profile
            .temporal_patterns
            .update(ts.hour() as f64, ts, now);

        if verdict.has_drift {
            let kind = verdict.drift_type.unwrap_or(DriftType::PreferenceShift);
            let strategy = strategy_for(kind);
            for name in &verdict.affected_anchors {
                let Some(new_value) = extract_anchor_value(interaction, *name) else {
                    continue;
                };
                let anchor = profile.anchor_mut(*name);
                anchor.blend_value(&new_value, strategy.blend_ratio, now);
                anchor.set_confidence(strategy.confidence_after);
                // Relearn faster (or slower) until the next drift-free update.
                anchor.learning_rate = (name.config().learning_rate
                    * strategy.learning_rate_multiplier)
                    .min(1.0);
            }
        } else {
            for name in AnchorName::ALL {
                let Some(new_value) = extract_anchor_value(interaction, name) else {
                    continue;
                };
                let anchor = profile.anchor_mut(name);
                anchor.learning_rate = name.config().learning_rate;
                if anchor.current_value.is_some() {
                    let ratio = anchor.blend_rate;
                    anchor.blend_value(&new_value, ratio, now);
                    let bumped = anchor.confidence() + 0.01;
                    anchor.set_confidence(bumped);
                } else {
                    anchor.blend_value(&new_value, 1.0, now);
                    anchor.set_confidence(0.5);
                }
            }
        }
    }

    /// Side effects: profile upsert, anonymized log append, cache touch.
    /// All failures are logged and suppressed.
    fn persist(&mut self, profile: &UserProfile, interaction: &Interaction, now: DateTime<Utc>) {
        if let Err(err) = self.profiles.save(profile) {
            warn!(user = %profile.user_id, error = %err, "profile save failed");
        }

        let location = self
            .anonymizer
            .hash(interaction.location, Precision::Medium);
        let record = InteractionRecord::anonymized(interaction, location);
        if let Err(err) = self.log.append(record) {
            warn!(user = %profile.user_id, error = %err, "interaction log append failed");
        }

        let signature = CacheSignature::from_interaction(interaction);
        if let Err(err) = self
            .cache
            .touch(&signature, &interaction.stores_visited, now)
        {
            warn!(error = %err, "anonymous cache update failed");
        }
    }

    // ------------------------------------------------------------------
    // Response building
    // ------------------------------------------------------------------

    fn summarize(&self, profile: &UserProfile) -> ContextSummary {
        let primary_location = profile
            .anchor(AnchorName::HomeLocation)
            .filter(|a| a.confidence() > 0.3)
            .and_then(|a| {
                let point = a.current_value.as_ref().and_then(AnchorValue::as_point)?;
                Some(RegionSummary {
                    region: self.anonymizer.hash(point, Precision::Low).region_code,
                    confidence: a.confidence(),
                })
            });

        let mut preference_profile = PreferenceProfile {
            allergies: anchor_list(profile, AnchorName::Allergies),
            dietary_restrictions: anchor_list(profile, AnchorName::DietaryRestrictions),
            ..PreferenceProfile::default()
        };
        if let Some(anchor) = profile
            .anchor(AnchorName::PricePreference)
            .filter(|a| a.confidence() > 0.3)
        {
            if let Some(AnchorValue::Map(m)) = &anchor.current_value {
                if let Some(AnchorValue::Text(p)) = m.get("prioridad") {
                    if let Ok(decision) = p.parse::<Decision>() {
                        preference_profile.optimization_priority = decision;
                    }
                }
                if let Some(level) = m.get("satisfaccion_promedio").and_then(|v| v.as_number())
                {
                    preference_profile.satisfaction_level = level;
                }
                preference_profile.confidence = anchor.confidence();
            }
        }

        let temporal = profile
            .anchor(AnchorName::TemporalPatterns)
            .filter(|a| a.confidence() > 0.3)
            .and_then(|a| match &a.current_value {
                Some(AnchorValue::Map(m)) => Some(TemporalPattern {
                    preferred_hour: m.get("horario_preferido").and_then(|v| v.as_number())?,
                    preferred_weekday: m
                        .get("dia_semana_preferido")
                        .and_then(|v| v.as_number())
                        .unwrap_or(0.0),
                    confidence: a.confidence(),
                }),
                _ => None,
            });
        let brands = profile
            .anchor(AnchorName::PreferredBrands)
            .filter(|a| a.confidence() > 0.3)
            .and_then(|a| match &a.current_value {
                Some(AnchorValue::Map(m)) => Some(BrandPattern {
                    preferred_brands: m
                        .get("marcas")
                        .and_then(AnchorValue::as_list)
                        .map(<[String]>::to_vec)
                        .unwrap_or_default(),
                    preferred_stores: m
                        .get("supermercados")
                        .and_then(AnchorValue::as_list)
                        .map(<[String]>::to_vec)
                        .unwrap_or_default(),
                    confidence: a.confidence(),
                }),
                _ => None,
            });

        ContextSummary {
            profile_strength: profile_strength(profile),
            primary_location,
            preference_profile,
            behavioral_patterns: BehavioralPatterns { temporal, brands },
            confidence_level: overall_confidence(profile),
        }
    }

    fn recommend(&self, profile: &UserProfile) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        if let Some(anchor) = profile
            .anchor(AnchorName::HomeLocation)
            .filter(|a| a.confidence() > 0.5)
        {
            recommendations.push(Recommendation {
                kind: RecommendationKind::LocationBased,
                message: "Basado en tu ubicación habitual, te sugiero considerar supermercados cercanos"
                    .to_string(),
                confidence: anchor.confidence(),
            });
        }

        if let Some(anchor) = profile
            .anchor(AnchorName::PricePreference)
            .filter(|a| a.confidence() > 0.5)
        {
            let priority = match &anchor.current_value {
                Some(AnchorValue::Map(m)) => match m.get("prioridad") {
                    Some(AnchorValue::Text(p)) => p.parse::<Decision>().ok(),
                    _ => None,
                },
                _ => None,
            };
            match priority {
                Some(Decision::Ahorro) => recommendations.push(Recommendation {
                    kind: RecommendationKind::OptimizationPreference,
                    message:
                        "Dado que priorizas el ahorro, te sugiero comparar precios en múltiples tiendas"
                            .to_string(),
                    confidence: anchor.confidence(),
                }),
                Some(Decision::Conveniencia) => recommendations.push(Recommendation {
                    kind: RecommendationKind::OptimizationPreference,
                    message:
                        "Como prefieres la conveniencia, te sugiero una tienda que tenga la mayoría de productos"
                            .to_string(),
                    confidence: anchor.confidence(),
                }),
                _ => {}
            }
        }

        if let Some(anchor) = profile
            .anchor(AnchorName::PreferredBrands)
            .filter(|a| a.confidence() > 0.4)
        {
            let stores = match &anchor.current_value {
                Some(AnchorValue::Map(m)) => m
                    .get("supermercados")
                    .and_then(AnchorValue::as_list)
                    .unwrap_or(&[]),
                _ => &[],
            };
            if !stores.is_empty() {
                let listed = stores
                    .iter()
                    .take(2)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                recommendations.push(Recommendation {
                    kind: RecommendationKind::StorePreference,
                    message: format!("Considerando tu historial, podrías preferir: {listed}"),
                    confidence: anchor.confidence(),
                });
            }
        }

        recommendations
    }

    fn guide(&self, profile: &UserProfile, verdict: &DriftVerdict) -> ConversationGuidance {
        let mut guidance = ConversationGuidance {
            tone: ConversationTone::Helpful,
            personalization: personalization_level(profile),
            suggested_questions: Vec::new(),
            context_actions: Vec::new(),
        };

        if verdict.has_drift {
            match verdict.drift_type {
                Some(DriftType::LocationDrift) => {
                    guidance.suggested_questions.push(
                        "¿Te has mudado recientemente o estás en una ubicación diferente?"
                            .to_string(),
                    );
                    guidance
                        .context_actions
                        .push(ContextAction::ConfirmLocationChange);
                }
                Some(DriftType::PreferenceShift) => {
                    guidance.suggested_questions.push(
                        "¿Han cambiado tus prioridades de compra últimamente?".to_string(),
                    );
                    guidance
                        .context_actions
                        .push(ContextAction::ConfirmPreferenceChange);
                }
                _ => {}
            }
            guidance.tone = ConversationTone::Adaptive;
        }

        if profile_strength(profile) == ProfileStrength::Weak {
            guidance.suggested_questions.extend([
                "¿Cuáles son tus supermercados preferidos?".to_string(),
                "¿Qué es más importante para ti: ahorrar dinero o ahorrar tiempo?".to_string(),
            ]);
            guidance
                .context_actions
                .push(ContextAction::GatherBasicPreferences);
        }

        guidance
    }
}

// ============================================================================
// Free helpers
// ============================================================================

fn drift_kind_for_anchor(name: AnchorName) -> DriftType {
    match name {
        AnchorName::HomeLocation => DriftType::LocationDrift,
        AnchorName::TemporalPatterns => DriftType::TemporalChange,
        _ => DriftType::PreferenceShift,
    }
}

/// Most frequent signal kind; ties broken by the highest severity among the
/// tied kinds, then by declaration order.
fn dominant_kind(signals: &[Signal]) -> DriftType {
    let mut tally: BTreeMap<DriftType, (usize, f64)> = BTreeMap::new();
    for signal in signals {
        let entry = tally.entry(signal.kind).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 = entry.1.max(signal.severity);
    }
    let mut best = DriftType::PreferenceShift;
    let mut best_count = 0;
    let mut best_severity = f64::NEG_INFINITY;
    for (kind, (count, severity)) in tally {
        if count > best_count || (count == best_count && severity > best_severity) {
            best = kind;
            best_count = count;
            best_severity = severity;
        }
    }
    best
}

/// What an interaction says about each anchor.  Allergies and dietary
/// restrictions cannot be inferred from a shopping trip and yield `None`.
fn extract_anchor_value(interaction: &Interaction, name: AnchorName) -> Option<AnchorValue> {
    match name {
        AnchorName::HomeLocation => Some(AnchorValue::map_from([
            ("lat", AnchorValue::Number(interaction.location.lat)),
            ("lon", AnchorValue::Number(interaction.location.lon)),
        ])),
        AnchorName::PricePreference => Some(AnchorValue::map_from([
            (
                "prioridad",
                AnchorValue::Text(interaction.decision.as_str().to_string()),
            ),
            (
                "satisfaccion_promedio",
                AnchorValue::Number(interaction.satisfaction),
            ),
        ])),
        AnchorName::TemporalPatterns => Some(AnchorValue::map_from([
            (
                "horario_preferido",
                AnchorValue::Number(interaction.timestamp.hour() as f64),
            ),
            (
                "dia_semana_preferido",
                AnchorValue::Number(
                    interaction.timestamp.weekday().num_days_from_monday() as f64
                ),
            ),
            ("frecuencia_semanal", AnchorValue::Number(1.0)),
        ])),
        AnchorName::PreferredBrands => Some(AnchorValue::map_from([
            (
                "marcas",
                AnchorValue::List(brands_in(&interaction.products)),
            ),
            (
                "supermercados",
                AnchorValue::List(interaction.stores_visited.clone()),
            ),
        ])),
        AnchorName::Allergies | AnchorName::DietaryRestrictions => None,
    }
}

/// Behavior-delta vector fed to the seasonal analyzer.  Empty when the user
/// has no history to compare against.
fn behavior_metrics(
    interaction: &Interaction,
    profile: &UserProfile,
) -> BTreeMap<String, Observation> {
    let recent = profile.recent();
    if recent.is_empty() {
        return BTreeMap::new();
    }

    let last5: Vec<&Interaction> = recent.iter().rev().take(5).collect();
    let satisfaction_trend =
        last5.iter().map(|i| i.satisfaction).sum::<f64>() / last5.len() as f64 - 3.0;
    let distinct_decisions = last5
        .iter()
        .map(|i| i.decision)
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    let decision_consistency = distinct_decisions as f64 / last5.len() as f64;

    let premium = premium_fraction(&interaction.products);
    let frequency = recent.len() as f64 / 30.0;

    // Estimated basket cost relative to the recent mean.
    let estimate = interaction.products.len() as f64 * 2000.0;
    let mean_estimate = recent
        .iter()
        .map(|i| i.products.len() as f64 * 2000.0)
        .sum::<f64>()
        / recent.len() as f64;
    let budget_delta = (estimate - mean_estimate) / mean_estimate.max(1.0);

    BTreeMap::from([
        (
            "satisfaction_trend".to_string(),
            Observation::Number(satisfaction_trend),
        ),
        (
            "decision_consistency".to_string(),
            Observation::Number(decision_consistency),
        ),
        (
            "productos_premium".to_string(),
            Observation::Number(premium),
        ),
        (
            "frecuencia_compras".to_string(),
            Observation::Number(frequency),
        ),
        ("presupuesto".to_string(), Observation::Number(budget_delta)),
    ])
}

fn premium_fraction(products: &[String]) -> f64 {
    if products.is_empty() {
        return 0.0;
    }
    let count = products
        .iter()
        .filter(|p| {
            let lower = p.to_lowercase();
            PREMIUM_KEYWORDS.iter().any(|kw| lower.contains(kw))
        })
        .count();
    count as f64 / products.len() as f64
}

fn anchor_list(profile: &UserProfile, name: AnchorName) -> Vec<String> {
    profile
        .anchor(name)
        .and_then(|a| a.current_value.as_ref())
        .and_then(AnchorValue::as_list)
        .map(<[String]>::to_vec)
        .unwrap_or_default()
}

/// Mean anchor confidence, unweighted.
fn profile_strength(profile: &UserProfile) -> ProfileStrength {
    if profile.anchors.is_empty() {
        return ProfileStrength::Weak;
    }
    let avg = profile
        .anchors
        .values()
        .map(ContextualAnchor::confidence)
        .sum::<f64>()
        / profile.anchors.len() as f64;
    if avg > 0.8 {
        ProfileStrength::Strong
    } else if avg > 0.5 {
        ProfileStrength::Moderate
    } else {
        ProfileStrength::Weak
    }
}

/// Weight-averaged anchor confidence.
fn overall_confidence(profile: &UserProfile) -> f64 {
    let total_weight: f64 = profile.anchors.values().map(|a| a.weight).sum();
    if total_weight == 0.0 {
        return 0.0;
    }
    profile
        .anchors
        .values()
        .map(|a| a.confidence() * a.weight)
        .sum::<f64>()
        / total_weight
}

fn personalization_level(profile: &UserProfile) -> PersonalizationLevel {
    let confidence = overall_confidence(profile);
    if confidence > 0.7 {
        PersonalizationLevel::High
    } else if confidence > 0.4 {
        PersonalizationLevel::Medium
    } else {
        PersonalizationLevel::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCacheStore, MemoryInteractionLog, MemoryProfileStore};
    use chrono::TimeZone;

    type Engine = ProfileEngine<MemoryProfileStore, MemoryInteractionLog, MemoryCacheStore>;

    fn engine() -> Engine {
        ProfileEngine::new(
            MemoryProfileStore::new(),
            MemoryInteractionLog::new(),
            MemoryCacheStore::new(),
        )
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap()
    }

    fn interaction(
        user: &str,
        day: u32,
        hour: u32,
        location: GeoPoint,
        decision: Decision,
        satisfaction: f64,
    ) -> Interaction {
        Interaction {
            id: uuid::Uuid::new_v4(),
            user_id: user.to_string(),
            timestamp: at(day, hour),
            products: vec!["leche soprole".to_string(), "pan ideal".to_string()],
            location,
            decision,
            stores_visited: vec!["lider".to_string()],
            satisfaction,
            context_data: Default::default(),
        }
    }

    const SANTIAGO: GeoPoint = GeoPoint {
        lat: -33.45,
        lon: -70.66,
    };

    #[test]
    fn first_interaction_creates_profile_and_seeds_anchors() {
        let mut engine = engine();
        let event = interaction("persistent_alice", 1, 10, SANTIAGO, Decision::Ahorro, 4.0);
        let response = engine.process_interaction(&event, at(1, 10));

        assert!(!response.drift_info.drift_detected);
        assert_eq!(
            response.drift_info.recommended_action,
            RecommendedAction::ContinueNormalOperation
        );

        let profile = engine.profiles().load("persistent_alice").unwrap().unwrap();
        assert!(!profile.is_temporary);
        assert_eq!(profile.recent().len(), 1);
        // First values arrive at confidence 0.5; hard-fact anchors stay empty.
        let home = profile.anchor(AnchorName::HomeLocation).unwrap();
        assert!((home.confidence() - 0.5).abs() < 1e-12);
        assert!(profile.anchor(AnchorName::Allergies).is_none());
        assert_eq!(engine.log().records().len(), 1);
        assert_eq!(engine.cache().len(), 1);
    }

    #[test]
    fn anonymous_users_get_temporary_profiles() {
        let mut engine = engine();
        let event = interaction("session-42", 1, 10, SANTIAGO, Decision::Ahorro, 4.0);
        engine.process_interaction(&event, at(1, 10));

        let profile = engine.profiles().load("session-42").unwrap().unwrap();
        assert!(profile.is_temporary);
        assert!(profile.expires_at.is_some());

        let report = engine
            .cleanup_expired(at(2, 10))
            .unwrap();
        assert_eq!(report.profiles_removed, 1);
        assert!(engine.profiles().load("session-42").unwrap().is_none());
    }

    #[test]
    fn single_signal_never_declares_drift() {
        let mut engine = engine();
        // Build a stable home anchor far from where the next trip happens.
        for day in 1..=9 {
            let event = interaction(
                "persistent_bob",
                day,
                10,
                SANTIAGO,
                Decision::Ahorro,
                4.0,
            );
            engine.process_interaction(&event, at(day, 10));
        }
        // Force home-anchor stability so its deviation can count as a signal.
        let mut profile = engine.profiles().load("persistent_bob").unwrap().unwrap();
        let home = profile.anchor_mut(AnchorName::HomeLocation);
        home.set_confidence(0.9);
        for _ in 0..5 {
            home.update_value(
                AnchorValue::map_from([
                    ("lat", AnchorValue::Number(SANTIAGO.lat)),
                    ("lon", AnchorValue::Number(SANTIAGO.lon)),
                ]),
                0.1,
                at(9, 11),
            );
        }
        engine.profiles.save(&profile).unwrap();

        // Same decision and satisfaction, only the location jumps (~112 km).
        let far = GeoPoint::new(-34.45, -70.66);
        let event = interaction("persistent_bob", 10, 10, far, Decision::Ahorro, 4.0);
        let response = engine.process_interaction(&event, at(10, 10));
        assert!(!response.drift_info.drift_detected);
    }

    #[test]
    fn corroborated_signals_declare_drift_and_reset_anchors() {
        let mut engine = engine();
        // Consistent budget shopper near home.
        for day in 1..=12 {
            let event = interaction(
                "persistent_carla",
                day,
                10,
                SANTIAGO,
                Decision::Ahorro,
                4.0,
            );
            engine.process_interaction(&event, at(day, 10));
        }
        let mut profile = engine.profiles().load("persistent_carla").unwrap().unwrap();
        for name in [AnchorName::HomeLocation, AnchorName::PricePreference] {
            let anchor = profile.anchor_mut(name);
            for _ in 0..5 {
                let value = extract_anchor_value(
                    &interaction("persistent_carla", 12, 10, SANTIAGO, Decision::Ahorro, 4.0),
                    name,
                )
                .unwrap();
                anchor.update_value(value, 0.15, at(12, 11));
            }
            assert!(anchor.is_stable());
        }
        engine.profiles.save(&profile).unwrap();

        // Relocated and flipped priorities: home deviation fires, and the
        // repeated conveniencia decisions accumulate in CUSUM.
        let far = GeoPoint::new(-34.6, -70.66);
        let mut drift_seen = None;
        for day in 13..=16 {
            let event = interaction(
                "persistent_carla",
                day,
                10,
                far,
                Decision::Conveniencia,
                4.0,
            );
            let response = engine.process_interaction(&event, at(day, 10));
            if response.drift_info.drift_detected {
                drift_seen = Some(response);
                break;
            }
        }
        let response = drift_seen.expect("drift should be declared within a few trips");
        assert!(response.drift_info.drift_type.is_some());
        assert_ne!(
            response.drift_info.recommended_action,
            RecommendedAction::ContinueNormalOperation
        );
        assert_eq!(response.conversation_guidance.tone, ConversationTone::Adaptive);

        // Affected anchors were pulled toward the new observation and their
        // confidence reset by the strategy.
        let profile = engine.profiles().load("persistent_carla").unwrap().unwrap();
        let home = profile.anchor(AnchorName::HomeLocation).unwrap();
        let point = home.current_value.as_ref().unwrap().as_point().unwrap();
        assert!(point.lat < -33.5, "home anchor should move toward the new area");
        assert!(home.confidence() <= 0.6);
    }

    #[test]
    fn seasonal_match_suppresses_drift() {
        let mut engine = engine();
        // December history, then a premium-heavy basket matching "navidad".
        for day in 1..=8 {
            let event = Interaction {
                timestamp: Utc.with_ymd_and_hms(2025, 12, day, 11, 0, 0).unwrap(),
                ..interaction("persistent_dana", 1, 11, SANTIAGO, Decision::Equilibrio, 3.5)
            };
            engine.process_interaction(&event, event.timestamp);
        }

        // 1 premium product out of 3 ≈ the navidad premium delta; 8 recent
        // trips put frecuencia well within range of the expected 0.5; four
        // extra products push the budget delta toward +0.4.
        let event = Interaction {
            timestamp: Utc.with_ymd_and_hms(2025, 12, 20, 11, 0, 0).unwrap(),
            products: vec![
                "pan de pascua gourmet".to_string(),
                "leche".to_string(),
                "arroz".to_string(),
            ],
            ..interaction("persistent_dana", 1, 11, SANTIAGO, Decision::Equilibrio, 3.5)
        };
        let response = engine.process_interaction(&event, event.timestamp);

        if response.drift_info.drift_type == Some(DriftType::SeasonalChange) {
            assert!(!response.drift_info.drift_detected);
            assert_eq!(
                response.drift_info.recommended_action,
                RecommendedAction::AdjustSeasonalExpectations
            );
        } else {
            // Even if the score misses the seasonal cut, a calendar-plausible
            // basket must not be declared drift.
            assert!(!response.drift_info.drift_detected);
        }
    }

    #[test]
    fn dominant_kind_prefers_frequency_then_severity() {
        let signal = |kind, severity| Signal {
            source: SignalSource::DecisionPattern,
            kind,
            algorithm: DetectionAlgorithm::Cusum,
            severity,
            confidence: 0.5,
        };
        // Frequency wins.
        assert_eq!(
            dominant_kind(&[
                signal(DriftType::LocationDrift, 0.9),
                signal(DriftType::PreferenceShift, 0.2),
                signal(DriftType::PreferenceShift, 0.3),
            ]),
            DriftType::PreferenceShift
        );
        // Tied frequency: higher severity wins.
        assert_eq!(
            dominant_kind(&[
                signal(DriftType::LocationDrift, 0.4),
                signal(DriftType::TemporalChange, 0.9),
            ]),
            DriftType::TemporalChange
        );
        // Full tie: declaration order wins.
        assert_eq!(
            dominant_kind(&[
                signal(DriftType::TemporalChange, 0.5),
                signal(DriftType::LocationDrift, 0.5),
            ]),
            DriftType::LocationDrift
        );
    }

    #[test]
    fn observe_anchor_fact_reaches_hard_fact_anchors() {
        let mut engine = engine();
        engine
            .observe_anchor_fact(
                "persistent_eva",
                AnchorName::Allergies,
                AnchorValue::List(vec!["mani".to_string()]),
                at(1, 9),
            )
            .unwrap();

        let summary = engine.context_summary("persistent_eva").unwrap().unwrap();
        assert_eq!(summary.preference_profile.allergies, vec!["mani".to_string()]);
    }

    #[test]
    fn run_decay_is_idempotent_for_a_fixed_instant() {
        let mut engine = engine();
        let event = interaction("persistent_fede", 1, 10, SANTIAGO, Decision::Ahorro, 4.0);
        engine.process_interaction(&event, at(1, 10));

        assert_eq!(engine.run_decay(at(20, 10)).unwrap(), 1);
        let conf_after_first = engine
            .profiles()
            .load("persistent_fede")
            .unwrap()
            .unwrap()
            .anchor(AnchorName::HomeLocation)
            .unwrap()
            .confidence();

        // Same instant: zero elapsed days, nothing changes.
        assert_eq!(engine.run_decay(at(20, 10)).unwrap(), 0);
        let conf_after_second = engine
            .profiles()
            .load("persistent_fede")
            .unwrap()
            .unwrap()
            .anchor(AnchorName::HomeLocation)
            .unwrap()
            .confidence();
        assert!((conf_after_first - conf_after_second).abs() < 1e-12);
        assert!(conf_after_first < 0.5);
    }

    #[test]
    fn expired_session_profile_is_recreated_on_next_interaction() {
        let mut engine = engine();
        let first = interaction("session-77", 1, 10, SANTIAGO, Decision::Ahorro, 4.0);
        engine.process_interaction(&first, at(1, 10));

        // 20 h later, well past the 12 h session TTL.
        let second = interaction("session-77", 2, 6, SANTIAGO, Decision::Ahorro, 4.0);
        engine.process_interaction(&second, at(2, 6));

        let profile = engine.profiles().load("session-77").unwrap().unwrap();
        assert_eq!(profile.recent().len(), 1, "expired profile was reused");
        assert!(profile.expires_at.unwrap() > at(2, 6));
    }

    #[test]
    fn restated_allergies_replace_the_old_list() {
        let mut engine = engine();
        engine
            .observe_anchor_fact(
                "persistent_hana",
                AnchorName::Allergies,
                AnchorValue::List(vec!["mani".to_string()]),
                at(1, 9),
            )
            .unwrap();
        engine
            .observe_anchor_fact(
                "persistent_hana",
                AnchorName::Allergies,
                AnchorValue::List(vec!["mani".to_string(), "mariscos".to_string()]),
                at(2, 9),
            )
            .unwrap();

        let summary = engine.context_summary("persistent_hana").unwrap().unwrap();
        assert_eq!(
            summary.preference_profile.allergies,
            vec!["mani".to_string(), "mariscos".to_string()]
        );
    }

    #[test]
    fn stale_satisfaction_dip_no_longer_corroborates_drift() {
        let engine = engine();

        // A dip four trips back, fully recovered since.
        let mut profile = UserProfile::new("persistent_ines", at(6, 10));
        let sats = [4.5, 4.5, 1.0, 1.0, 4.2, 4.2, 4.2, 4.2];
        for (i, sat) in sats.into_iter().enumerate() {
            profile.push_interaction(interaction(
                "persistent_ines",
                6 + i as u32,
                10,
                SANTIAGO,
                Decision::Ahorro,
                sat,
            ));
        }
        // Primed so the probe's decision flip alarms the CUSUM on its own.
        profile.cusum.pos = 1.5;

        let probe = interaction("persistent_ines", 14, 10, SANTIAGO, Decision::Conveniencia, 4.2);
        let verdict = engine.analyze(&mut profile, &probe);
        assert!(
            !verdict.has_drift,
            "old change point corroborated an unrelated decision flip"
        );

        // Same setup with the dip at the tail still declares drift.
        let mut profile = UserProfile::new("persistent_ines", at(6, 10));
        let sats = [4.5, 4.5, 4.5, 4.5, 4.5, 4.5, 1.0, 1.0];
        for (i, sat) in sats.into_iter().enumerate() {
            profile.push_interaction(interaction(
                "persistent_ines",
                6 + i as u32,
                10,
                SANTIAGO,
                Decision::Ahorro,
                sat,
            ));
        }
        profile.cusum.pos = 1.5;

        let probe = interaction("persistent_ines", 14, 10, SANTIAGO, Decision::Conveniencia, 1.0);
        let verdict = engine.analyze(&mut profile, &probe);
        assert!(verdict.has_drift);
    }

    #[test]
    fn erase_user_removes_profile_and_anchors() {
        let mut engine = engine();
        let event = interaction("persistent_gus", 1, 10, SANTIAGO, Decision::Ahorro, 4.0);
        engine.process_interaction(&event, at(1, 10));
        assert!(engine.context_summary("persistent_gus").unwrap().is_some());

        engine.erase_user("persistent_gus").unwrap();
        assert!(engine.context_summary("persistent_gus").unwrap().is_none());
    }
}
