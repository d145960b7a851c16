//! Storage seams: profile persistence, the anonymized interaction log, and
//! the shared anonymous cache.
//!
//! The engine talks to these through traits so the in-memory backends here
//! can be swapped for real stores.  Store failures on the interaction path
//! are advisory; the engine logs and continues (fail-open).

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::anonymize::LocationHash;
use crate::cache::{CacheSignature, SatisfactionBucket};
use crate::error::EngineError;
use crate::profile::UserProfile;
use crate::{Decision, Interaction};

/// Cache entries slide their expiry forward this many days on each hit.
const CACHE_TTL_DAYS: i64 = 30;

/// One anonymized interaction row.  Raw coordinates are replaced by the
/// location hash before the record leaves the engine.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InteractionRecord {
    pub id: uuid::Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub products: Vec<String>,
    pub decision: Decision,
    pub stores_visited: Vec<String>,
    pub satisfaction: f64,
    pub location: LocationHash,
}

impl InteractionRecord {
    pub fn anonymized(interaction: &Interaction, location: LocationHash) -> Self {
        Self {
            id: interaction.id,
            user_id: interaction.user_id.clone(),
            timestamp: interaction.timestamp,
            products: interaction.products.clone(),
            decision: interaction.decision,
            stores_visited: interaction.stores_visited.clone(),
            satisfaction: interaction.satisfaction,
            location,
        }
    }
}

/// One shared anonymous-cache entry.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheEntry {
    pub signature_key: String,
    pub suggested_stores: Vec<String>,
    pub satisfaction_outcome: SatisfactionBucket,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Profile persistence.
pub trait ProfileStore {
    fn load(&self, user_id: &str) -> Result<Option<UserProfile>, EngineError>;
    fn save(&mut self, profile: &UserProfile) -> Result<(), EngineError>;
    fn remove(&mut self, user_id: &str) -> Result<(), EngineError>;
    /// User ids of temporary profiles expired at `now`.
    fn expired_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>, EngineError>;
    /// Every stored user id (decay sweeps).
    fn all_ids(&self) -> Result<Vec<String>, EngineError>;
}

/// Append-only anonymized interaction log.
pub trait InteractionLog {
    fn append(&mut self, record: InteractionRecord) -> Result<(), EngineError>;
}

/// Shared anonymous cache keyed by [`CacheSignature`].
pub trait CacheStore {
    /// Insert or bump the entry for `signature`, sliding its expiry forward.
    /// Returns the usage count after the touch.
    fn touch(
        &mut self,
        signature: &CacheSignature,
        suggested_stores: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError>;

    fn get(&self, signature: &CacheSignature) -> Result<Option<CacheEntry>, EngineError>;

    /// Drop entries whose expiry has passed; returns how many were removed.
    fn purge_expired(&mut self, now: DateTime<Utc>) -> Result<usize, EngineError>;
}

// ============================================================================
// In-memory backends
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: BTreeMap<String, UserProfile>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn load(&self, user_id: &str) -> Result<Option<UserProfile>, EngineError> {
        Ok(self.profiles.get(user_id).cloned())
    }

    fn save(&mut self, profile: &UserProfile) -> Result<(), EngineError> {
        self.profiles.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    fn remove(&mut self, user_id: &str) -> Result<(), EngineError> {
        self.profiles.remove(user_id);
        Ok(())
    }

    fn expired_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
        Ok(self
            .profiles
            .values()
            .filter(|p| p.is_expired(now))
            .map(|p| p.user_id.clone())
            .collect())
    }

    fn all_ids(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.profiles.keys().cloned().collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryInteractionLog {
    records: Vec<InteractionRecord>,
}

impl MemoryInteractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[InteractionRecord] {
        &self.records
    }
}

impl InteractionLog for MemoryInteractionLog {
    fn append(&mut self, record: InteractionRecord) -> Result<(), EngineError> {
        self.records.push(record);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: BTreeMap<String, CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for MemoryCacheStore {
    fn touch(
        &mut self,
        signature: &CacheSignature,
        suggested_stores: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        let key = signature.key();
        let expires_at = now + Duration::days(CACHE_TTL_DAYS);
        let entry = self
            .entries
            .entry(key.clone())
            .and_modify(|e| {
                e.usage_count += 1;
                e.expires_at = expires_at;
            })
            .or_insert_with(|| CacheEntry {
                signature_key: key,
                suggested_stores: suggested_stores.to_vec(),
                satisfaction_outcome: signature.satisfaction,
                usage_count: 1,
                created_at: now,
                expires_at,
            });
        Ok(entry.usage_count)
    }

    fn get(&self, signature: &CacheSignature) -> Result<Option<CacheEntry>, EngineError> {
        Ok(self.entries.get(&signature.key()).cloned())
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        Ok(before - self.entries.len())
    }
}
