//! Calendar-pattern disambiguation: seasonal variation vs. genuine drift.
//!
//! A small table of named calendar patterns (holiday season, summer,
//! start/end of month) describes how behavior is *expected* to move while the
//! pattern is active.  When the detectors see a delta, [`SeasonalAnalyzer`]
//! scores how well the observed behavior matches the active patterns'
//! expectations; a strong match means the change is seasonal noise, not a
//! context change worth resetting anchors over.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};

/// An expected change for one behavior field while a pattern is active.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expectation {
    /// Expected numeric delta (e.g. premium-product share up by 0.3).
    Delta(f64),
    /// Observed label must be one of these.
    OneOf(Vec<String>),
    /// Observed boolean must equal this.
    Flag(bool),
}

/// One observed behavior field, as extracted from recent interactions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Observation {
    Number(f64),
    Label(String),
    Flag(bool),
}

/// When a calendar pattern is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ActivePeriod {
    /// Inclusive month-day range; wraps over year-end when start > end
    /// (e.g. Dec 21 – Mar 20).
    MonthDay {
        start: (u32, u32),
        end: (u32, u32),
    },
    /// Inclusive day-of-month range, any month (e.g. days 25–31).
    DayOfMonth { start: u32, end: u32 },
}

impl ActivePeriod {
    fn contains(&self, date: DateTime<Utc>) -> bool {
        match *self {
            ActivePeriod::MonthDay { start, end } => {
                let md = (date.month(), date.day());
                if start <= end {
                    start <= md && md <= end
                } else {
                    // Wraps year-end.
                    md >= start || md <= end
                }
            }
            ActivePeriod::DayOfMonth { start, end } => {
                let d = date.day();
                start <= d && d <= end
            }
        }
    }
}

/// A named calendar pattern with its expected behavior changes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SeasonalPattern {
    pub name: String,
    pub period: ActivePeriod,
    pub expected: BTreeMap<String, Expectation>,
}

/// Classification of an observed behavior delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SeasonalKind {
    /// Well explained by an active calendar pattern; not drift.
    SeasonalChange,
    /// Partially explained; keep watching before acting.
    MixedSeasonalDrift,
    /// No calendar pattern explains this; treat as a real context change.
    ContextDrift,
}

/// Suggested follow-up for a seasonal classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SeasonalAction {
    AdjustExpectationsTemporarily,
    MonitorClosely,
    InitiateContextReset,
}

/// Output of [`SeasonalAnalyzer::classify`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SeasonalVerdict {
    pub kind: SeasonalKind,
    /// Names of the active patterns considered.
    pub active_patterns: Vec<String>,
    /// Match confidence for seasonal kinds; `1 - score` for context drift.
    pub confidence: f64,
    pub action: SeasonalAction,
}

/// Explains behavior deltas via known calendar patterns.
#[derive(Debug, Clone)]
pub struct SeasonalAnalyzer {
    patterns: Vec<SeasonalPattern>,
}

impl Default for SeasonalAnalyzer {
    fn default() -> Self {
        Self::new(default_patterns())
    }
}

impl SeasonalAnalyzer {
    pub fn new(patterns: Vec<SeasonalPattern>) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &[SeasonalPattern] {
        &self.patterns
    }

    /// Score `behavior` against every pattern active at `date` and classify.
    ///
    /// Cuts: score `> 0.7` → seasonal change; `> 0.4` → mixed; otherwise
    /// context drift with confidence `1 - score`.
    #[must_use]
    pub fn classify(
        &self,
        behavior: &BTreeMap<String, Observation>,
        date: DateTime<Utc>,
    ) -> SeasonalVerdict {
        let active: Vec<&SeasonalPattern> = self
            .patterns
            .iter()
            .filter(|p| p.period.contains(date))
            .collect();

        let mut best_score = 0.0_f64;
        for pattern in &active {
            best_score = best_score.max(pattern_match_score(behavior, &pattern.expected));
        }

        let active_patterns: Vec<String> = active.iter().map(|p| p.name.clone()).collect();

        if best_score > 0.7 {
            SeasonalVerdict {
                kind: SeasonalKind::SeasonalChange,
                active_patterns,
                confidence: best_score,
                action: SeasonalAction::AdjustExpectationsTemporarily,
            }
        } else if best_score > 0.4 {
            SeasonalVerdict {
                kind: SeasonalKind::MixedSeasonalDrift,
                active_patterns,
                confidence: best_score,
                action: SeasonalAction::MonitorClosely,
            }
        } else {
            SeasonalVerdict {
                kind: SeasonalKind::ContextDrift,
                active_patterns,
                confidence: 1.0 - best_score,
                action: SeasonalAction::InitiateContextReset,
            }
        }
    }
}

/// Mean per-field match score over the expectation fields present in `behavior`.
///
/// Numeric fields score `max(0, 1 - |actual-expected|/max(|expected|, 1))`;
/// list fields score 1 iff the label is a member; boolean fields score 1 on
/// equality.  Fields absent from `behavior` contribute nothing.
fn pattern_match_score(
    behavior: &BTreeMap<String, Observation>,
    expected: &BTreeMap<String, Expectation>,
) -> f64 {
    let mut scores: Vec<f64> = Vec::new();

    for (field, expectation) in expected {
        let Some(observed) = behavior.get(field) else {
            continue;
        };
        match (expectation, observed) {
            (Expectation::Delta(want), Observation::Number(got)) => {
                let similarity = 1.0 - (got - want).abs() / want.abs().max(1.0);
                scores.push(similarity.max(0.0));
            }
            (Expectation::OneOf(labels), Observation::Label(got)) => {
                scores.push(if labels.iter().any(|l| l == got) { 1.0 } else { 0.0 });
            }
            (Expectation::Flag(want), Observation::Flag(got)) => {
                scores.push(if want == got { 1.0 } else { 0.0 });
            }
            _ => {}
        }
    }

    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Built-in pattern table for the Chilean retail calendar.
pub fn default_patterns() -> Vec<SeasonalPattern> {
    fn delta(v: f64) -> Expectation {
        Expectation::Delta(v)
    }

    vec![
        SeasonalPattern {
            name: "navidad".to_string(),
            period: ActivePeriod::MonthDay {
                start: (12, 15),
                end: (12, 31),
            },
            expected: BTreeMap::from([
                ("productos_premium".to_string(), delta(0.3)),
                ("frecuencia_compras".to_string(), delta(0.5)),
                ("presupuesto".to_string(), delta(0.4)),
                (
                    "marcas_especiales".to_string(),
                    Expectation::OneOf(vec!["premium".to_string(), "importadas".to_string()]),
                ),
            ]),
        },
        SeasonalPattern {
            name: "verano".to_string(),
            period: ActivePeriod::MonthDay {
                start: (12, 21),
                end: (3, 20),
            },
            expected: BTreeMap::from([
                ("productos_frescos".to_string(), delta(0.6)),
                ("ubicacion_variabilidad".to_string(), delta(0.4)),
                (
                    "horarios_compra".to_string(),
                    Expectation::OneOf(vec!["flexible".to_string()]),
                ),
                ("supermercados_turisticos".to_string(), Expectation::Flag(true)),
            ]),
        },
        SeasonalPattern {
            name: "inicio_mes".to_string(),
            period: ActivePeriod::DayOfMonth { start: 1, end: 5 },
            expected: BTreeMap::from([
                ("presupuesto".to_string(), delta(0.2)),
                ("compras_volumen".to_string(), delta(0.3)),
                ("productos_durables".to_string(), delta(0.4)),
            ]),
        },
        SeasonalPattern {
            name: "fin_mes".to_string(),
            period: ActivePeriod::DayOfMonth { start: 25, end: 31 },
            expected: BTreeMap::from([
                ("presupuesto".to_string(), delta(-0.3)),
                ("marcas_economicas".to_string(), delta(0.5)),
                ("productos_basicos".to_string(), delta(0.4)),
            ]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    #[test]
    fn wrapping_period_spans_year_end() {
        let verano = ActivePeriod::MonthDay {
            start: (12, 21),
            end: (3, 20),
        };
        assert!(verano.contains(at(2025, 12, 25)));
        assert!(verano.contains(at(2026, 1, 15)));
        assert!(verano.contains(at(2026, 3, 20)));
        assert!(!verano.contains(at(2026, 3, 21)));
        assert!(!verano.contains(at(2025, 7, 1)));
    }

    #[test]
    fn perfect_match_in_december_is_seasonal() {
        let analyzer = SeasonalAnalyzer::default();
        let behavior = BTreeMap::from([
            ("productos_premium".to_string(), Observation::Number(0.3)),
            ("frecuencia_compras".to_string(), Observation::Number(0.5)),
            ("presupuesto".to_string(), Observation::Number(0.4)),
        ]);
        let v = analyzer.classify(&behavior, at(2025, 12, 20));
        assert_eq!(v.kind, SeasonalKind::SeasonalChange);
        assert!(v.active_patterns.contains(&"navidad".to_string()));
        assert!(v.confidence > 0.99);
    }

    #[test]
    fn off_calendar_delta_is_context_drift() {
        let analyzer = SeasonalAnalyzer::default();
        let behavior = BTreeMap::from([
            ("productos_premium".to_string(), Observation::Number(0.9)),
        ]);
        // Mid-July: no pattern active at all.
        let v = analyzer.classify(&behavior, at(2025, 7, 10));
        assert_eq!(v.kind, SeasonalKind::ContextDrift);
        assert_eq!(v.confidence, 1.0);
        assert_eq!(v.action, SeasonalAction::InitiateContextReset);
    }

    #[test]
    fn boundary_just_above_cut_is_seasonal_just_below_is_mixed() {
        // Single-pattern, single-field analyzer so the score is exact.
        let pattern = SeasonalPattern {
            name: "p".to_string(),
            period: ActivePeriod::DayOfMonth { start: 1, end: 31 },
            expected: BTreeMap::from([("x".to_string(), Expectation::Delta(1.0))]),
        };
        let analyzer = SeasonalAnalyzer::new(vec![pattern]);

        // |actual - 1.0| = 0.29 → score 0.71.
        let high = BTreeMap::from([("x".to_string(), Observation::Number(1.29))]);
        let v = analyzer.classify(&high, at(2025, 7, 10));
        assert_eq!(v.kind, SeasonalKind::SeasonalChange);

        // |actual - 1.0| = 0.31 → score 0.69: inside the mixed band.
        let low = BTreeMap::from([("x".to_string(), Observation::Number(1.31))]);
        let v = analyzer.classify(&low, at(2025, 7, 10));
        assert_eq!(v.kind, SeasonalKind::MixedSeasonalDrift);
        assert_eq!(v.action, SeasonalAction::MonitorClosely);
    }

    #[test]
    fn mismatched_field_types_contribute_nothing() {
        let pattern = SeasonalPattern {
            name: "p".to_string(),
            period: ActivePeriod::DayOfMonth { start: 1, end: 31 },
            expected: BTreeMap::from([("x".to_string(), Expectation::Flag(true))]),
        };
        let analyzer = SeasonalAnalyzer::new(vec![pattern]);
        let behavior = BTreeMap::from([("x".to_string(), Observation::Number(1.0))]);
        let v = analyzer.classify(&behavior, at(2025, 7, 10));
        assert_eq!(v.kind, SeasonalKind::ContextDrift);
    }
}
