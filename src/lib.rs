//! `ancla`: adaptive user-context engine for a supermarket price-comparison
//! service.
//!
//! A user's profile is a set of *contextual anchors*: named, confidence-scored
//! facts (home location, price sensitivity, shopping hours, preferred brands)
//! that are learned slowly and trusted only once stable.  Every interaction is
//! scored against the profile by a battery of change detectors (CUSUM over the
//! decision stream, Page–Hinkley over satisfaction, Mahalanobis outliers over
//! a six-feature encoding) and a calendar-pattern disambiguator that separates
//! seasonal variation from genuine context drift.  The [`engine::ProfileEngine`]
//! aggregates those signals into a verdict, applies the matching anchor-update
//! strategy, and emits a recommendation/guidance payload for the caller.
//!
//! **Design rules:**
//! - **Deterministic**: no clocks are read anywhere; `now` is an explicit
//!   argument on every time-dependent operation.
//! - **Fail-open**: a detector that cannot run is skipped with a reason, and
//!   store failures on the interaction path are logged and suppressed.  Drift
//!   detection never blocks the primary user-facing action.
//! - **Privacy boundary**: raw coordinates never leave the engine; summaries
//!   and logs carry only grid-hashed locations and coarse region codes
//!   ([`anonymize`]).
//!
//! **Non-goals:**
//! - Not a web service: no transport, routing, or request validation.
//! - Not a persistence layer: storage is behind the [`store`] traits; the
//!   bundled backends are in-memory.
//!
//! ```
//! use ancla::engine::ProfileEngine;
//! use ancla::store::{MemoryCacheStore, MemoryInteractionLog, MemoryProfileStore};
//! use ancla::{Decision, GeoPoint, Interaction};
//! use chrono::{TimeZone, Utc};
//!
//! let mut engine = ProfileEngine::new(
//!     MemoryProfileStore::new(),
//!     MemoryInteractionLog::new(),
//!     MemoryCacheStore::new(),
//! );
//!
//! let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
//! let interaction = Interaction {
//!     id: uuid::Uuid::new_v4(),
//!     user_id: "persistent_demo".to_string(),
//!     timestamp: now,
//!     products: vec!["leche soprole".to_string(), "pan ideal".to_string()],
//!     location: GeoPoint::new(-33.4489, -70.6693),
//!     decision: Decision::Equilibrio,
//!     stores_visited: vec!["jumbo".to_string()],
//!     satisfaction: 4.2,
//!     context_data: Default::default(),
//! };
//!
//! let response = engine.process_interaction(&interaction, now);
//! assert!(!response.drift_info.drift_detected);
//! ```

pub mod anchor;
pub mod anonymize;
pub mod cache;
pub mod detector;
pub mod engine;
pub mod error;
pub mod geo;
pub mod profile;
pub mod seasonal;
pub mod store;
pub mod wma;

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};

pub use anchor::{AnchorName, AnchorValue, ContextualAnchor};
pub use engine::{DriftType, EngineResponse, ProfileEngine, RecommendedAction};
pub use error::{EngineError, SkipReason};
pub use geo::GeoPoint;
pub use profile::UserProfile;

/// How the user resolved the price/convenience trade-off on one trip.
///
/// The ordinal encoding (ahorro=1, equilibrio=2, conveniencia=3) feeds the
/// change detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Decision {
    Ahorro,
    Equilibrio,
    Conveniencia,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Ahorro => "ahorro",
            Decision::Equilibrio => "equilibrio",
            Decision::Conveniencia => "conveniencia",
        }
    }

    /// Position on the savings-to-convenience axis.
    #[must_use]
    pub fn ordinal(self) -> f64 {
        match self {
            Decision::Ahorro => 1.0,
            Decision::Equilibrio => 2.0,
            Decision::Conveniencia => 3.0,
        }
    }
}

impl FromStr for Decision {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ahorro" => Ok(Decision::Ahorro),
            "equilibrio" => Ok(Decision::Equilibrio),
            "conveniencia" => Ok(Decision::Conveniencia),
            other => Err(EngineError::InvalidDecision(other.to_string())),
        }
    }
}

/// One immutable shopping event as reported by the surrounding service.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interaction {
    pub id: uuid::Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub products: Vec<String>,
    pub location: GeoPoint,
    pub decision: Decision,
    pub stores_visited: Vec<String>,
    /// Reported satisfaction on a 1-5 scale.
    pub satisfaction: f64,
    /// Free-form session metadata; carried through, never interpreted.
    pub context_data: BTreeMap<String, String>,
}
