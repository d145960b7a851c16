//! End-to-end scenarios against the in-memory stores, driven by a seeded RNG.

use ancla::engine::{ProfileEngine, RecommendedAction};
use ancla::store::{MemoryCacheStore, MemoryInteractionLog, MemoryProfileStore, ProfileStore};
use ancla::{Decision, GeoPoint, Interaction};
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type Engine = ProfileEngine<MemoryProfileStore, MemoryInteractionLog, MemoryCacheStore>;

fn engine() -> Engine {
    ProfileEngine::new(
        MemoryProfileStore::new(),
        MemoryInteractionLog::new(),
        MemoryCacheStore::new(),
    )
}

const HOME: GeoPoint = GeoPoint {
    lat: -33.4489,
    lon: -70.6693,
};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap()
}

/// A routine trip near home with mild, seeded jitter.
fn routine_trip(rng: &mut StdRng, user: &str, day: u32) -> Interaction {
    let hour = rng.gen_range(9..13);
    let products: Vec<String> = ["leche soprole", "pan ideal", "arroz", "tomate", "detergente"]
        .iter()
        .take(rng.gen_range(2..=5))
        .map(|p| p.to_string())
        .collect();
    let decision = if rng.gen_bool(0.2) {
        Decision::Equilibrio
    } else {
        Decision::Ahorro
    };
    Interaction {
        id: uuid::Uuid::new_v4(),
        user_id: user.to_string(),
        timestamp: at(day, hour),
        products,
        location: GeoPoint::new(
            HOME.lat + rng.gen_range(-0.002..0.002),
            HOME.lon + rng.gen_range(-0.002..0.002),
        ),
        decision,
        stores_visited: vec!["lider".to_string()],
        satisfaction: rng.gen_range(3.8..4.2),
        context_data: Default::default(),
    }
}

#[test]
fn routine_behavior_never_declares_drift() {
    let mut engine = engine();
    let mut rng = StdRng::seed_from_u64(7);

    for day in 6..=24 {
        let event = routine_trip(&mut rng, "persistent_ana", day);
        let response = engine.process_interaction(&event, event.timestamp);
        assert!(
            !response.drift_info.drift_detected,
            "spurious drift on day {day}: {:?}",
            response.drift_info
        );
    }

    // The profile accumulated normally.
    let profile = engine.profiles().load("persistent_ana").unwrap().unwrap();
    assert_eq!(profile.recent().len(), 19);
    assert!(profile.satisfaction.average_at(at(24, 12)) > 3.5);
}

#[test]
fn relocation_with_preference_flip_is_declared_within_days() {
    let mut engine = engine();
    let mut rng = StdRng::seed_from_u64(11);

    for day in 6..=20 {
        let event = routine_trip(&mut rng, "persistent_beto", day);
        let response = engine.process_interaction(&event, event.timestamp);
        assert!(!response.drift_info.drift_detected);
    }

    // Moved ~130 km south and started optimizing for convenience.
    let new_home = GeoPoint::new(-34.6, -70.67);
    let mut declared = None;
    for day in 21..=24 {
        let event = Interaction {
            id: uuid::Uuid::new_v4(),
            user_id: "persistent_beto".to_string(),
            timestamp: at(day, 10),
            products: vec!["leche soprole".to_string(), "pan ideal".to_string()],
            location: new_home,
            decision: Decision::Conveniencia,
            stores_visited: vec!["jumbo".to_string()],
            satisfaction: 4.0,
            context_data: Default::default(),
        };
        let response = engine.process_interaction(&event, event.timestamp);
        if response.drift_info.drift_detected {
            declared = Some((day, response));
            break;
        }
    }

    let (day, response) = declared.expect("relocation plus priority flip must be declared");
    assert!(day <= 24, "declared too late: day {day}");
    assert!(response.drift_info.drift_type.is_some());
    assert!(matches!(
        response.drift_info.recommended_action,
        RecommendedAction::IncreaseMonitoring
            | RecommendedAction::GradualAdaptation
            | RecommendedAction::ImmediateContextReset
    ));
}

#[test]
fn repeated_similar_baskets_share_one_cache_entry() {
    let mut engine = engine();

    for day in 6..=10 {
        // Same basket, same decision, same region, same satisfaction bucket.
        let event = Interaction {
            id: uuid::Uuid::new_v4(),
            user_id: format!("persistent_user{day}"),
            timestamp: at(day, 10),
            products: vec!["leche".to_string(), "pan".to_string()],
            location: GeoPoint::new(HOME.lat + day as f64 * 1e-4, HOME.lon),
            decision: Decision::Ahorro,
            stores_visited: vec!["lider".to_string()],
            satisfaction: 4.0,
            context_data: Default::default(),
        };
        engine.process_interaction(&event, event.timestamp);
    }

    // Five different users, one anonymized signature.
    assert_eq!(engine.cache().len(), 1);
    assert_eq!(engine.log().records().len(), 5);
    // The log never carries raw coordinates.
    for record in engine.log().records() {
        assert_eq!(record.location.hash.len(), 16);
    }
}

#[test]
fn anonymous_profiles_are_swept_but_persistent_ones_survive() {
    let mut engine = engine();
    let mut rng = StdRng::seed_from_u64(3);

    let anon = routine_trip(&mut rng, "session-abc", 6);
    let persistent = routine_trip(&mut rng, "persistent_carla", 6);
    engine.process_interaction(&anon, anon.timestamp);
    engine.process_interaction(&persistent, persistent.timestamp);
    assert_eq!(engine.profiles().len(), 2);

    // Temporary profiles expire after 12 hours.
    let report = engine.cleanup_expired(at(7, 6)).unwrap();
    assert_eq!(report.profiles_removed, 1);
    assert!(engine.profiles().load("session-abc").unwrap().is_none());
    assert!(engine.profiles().load("persistent_carla").unwrap().is_some());
}
