//! Deterministic cohort assignment for weighted prompt variants.
//!
//! A user id hashes to a bucket in `0..100`; the bucket is then mapped onto
//! the cumulative weights of the configured variants. The same id always
//! lands in the same bucket, so a user keeps one variant across sessions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const BUCKET_COUNT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortAssignment {
    pub user_id: String,
    pub bucket_value: u32,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVariant {
    pub id: String,
    pub weight: u32,
    pub prompt: String,
}

/// FNV-1a over the UTF-8 bytes followed by a murmur3 finaliser so that
/// sequential ids spread evenly over the buckets.
pub fn bucket_for(user_id: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash % BUCKET_COUNT
}

#[derive(Debug, Clone)]
pub struct CohortCacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for CohortCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            capacity: 10_000,
        }
    }
}

#[derive(Debug)]
struct CacheSlot {
    assignment: CohortAssignment,
    inserted: Instant,
}

/// Bucket assigner with a bounded TTL cache in front of the hash.
#[derive(Debug, Default)]
pub struct CohortAssigner {
    config: CohortCacheConfig,
    cache: Mutex<HashMap<String, CacheSlot>>,
}

impl CohortAssigner {
    pub fn new() -> Self {
        Self::with_config(CohortCacheConfig::default())
    }

    pub fn with_config(config: CohortCacheConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn assign(&self, user_id: &str) -> CohortAssignment {
        let mut cache = self.cache.lock();

        if let Some(slot) = cache.get(user_id) {
            if slot.inserted.elapsed() < self.config.ttl {
                return slot.assignment.clone();
            }
        }

        let assignment = CohortAssignment {
            user_id: user_id.to_string(),
            bucket_value: bucket_for(user_id),
            computed_at: Utc::now(),
        };

        if self.config.capacity == 0 {
            return assignment;
        }
        if cache.len() >= self.config.capacity && !cache.contains_key(user_id) {
            Self::evict(&mut cache, self.config.ttl, self.config.capacity);
        }
        cache.insert(
            user_id.to_string(),
            CacheSlot {
                assignment: assignment.clone(),
                inserted: Instant::now(),
            },
        );
        assignment
    }

    /// Drops expired entries, then the oldest ones until there is room.
    fn evict(cache: &mut HashMap<String, CacheSlot>, ttl: Duration, capacity: usize) {
        cache.retain(|_, slot| slot.inserted.elapsed() < ttl);
        if cache.len() < capacity {
            return;
        }
        let mut by_age: Vec<(Instant, String)> = cache
            .iter()
            .map(|(id, slot)| (slot.inserted, id.clone()))
            .collect();
        by_age.sort();
        let excess = cache.len() + 1 - capacity;
        for (_, id) in by_age.into_iter().take(excess) {
            cache.remove(&id);
        }
        debug!(evicted = excess, "Cohort cache evicted oldest entries");
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Picks the variant whose cumulative weight range contains the user's
    /// bucket. Weights are normalised, so they need not sum to 100.
    pub fn select_prompt_for_user<'a>(
        &self,
        user_id: &str,
        variants: &'a [PromptVariant],
    ) -> Option<&'a PromptVariant> {
        let total: u64 = variants.iter().map(|v| u64::from(v.weight)).sum();
        if total == 0 {
            return variants.first();
        }

        let bucket = u64::from(self.assign(user_id).bucket_value);
        let mut cumulative = 0u64;
        for variant in variants {
            cumulative += u64::from(variant.weight);
            // Upper bound of this variant's range on the 0..100 scale
            if bucket * total < cumulative * u64::from(BUCKET_COUNT) {
                return Some(variant);
            }
        }
        variants.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variants() -> Vec<PromptVariant> {
        [("a", 50), ("b", 30), ("c", 20)]
            .into_iter()
            .map(|(id, weight)| PromptVariant {
                id: id.to_string(),
                weight,
                prompt: format!("prompt {id}"),
            })
            .collect()
    }

    #[test]
    fn test_bucket_is_deterministic_and_in_range() {
        for id in ["user-1", "user-2", "", "üñíçødé"] {
            let b = bucket_for(id);
            assert!(b < BUCKET_COUNT);
            assert_eq!(b, bucket_for(id));
        }
    }

    #[test]
    fn test_cached_and_cold_agree() {
        let assigner = CohortAssigner::new();
        let warm1 = assigner.assign("user-42");
        let warm2 = assigner.assign("user-42");
        let cold = CohortAssigner::new().assign("user-42");
        assert_eq!(warm1.bucket_value, warm2.bucket_value);
        assert_eq!(warm1.bucket_value, cold.bucket_value);
        assert_eq!(warm1.computed_at, warm2.computed_at);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let assigner = CohortAssigner::with_config(CohortCacheConfig {
            capacity: 5,
            ..Default::default()
        });
        for i in 0..20 {
            assigner.assign(&format!("u{i}"));
        }
        assert!(assigner.cached_len() <= 5);
    }

    #[test]
    fn test_distribution_matches_weights() {
        let assigner = CohortAssigner::new();
        let variants = variants();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for i in 0..1000 {
            let v = assigner
                .select_prompt_for_user(&format!("synthetic-user-{i}"), &variants)
                .unwrap();
            *counts.entry(v.id.as_str()).or_default() += 1;
        }
        for (id, expected) in [("a", 500.0), ("b", 300.0), ("c", 200.0)] {
            let got = *counts.get(id).unwrap_or(&0) as f64;
            assert!((got - expected).abs() <= 50.0, "{id}: {got}");
        }
    }

    #[test]
    fn test_empty_and_zero_weights() {
        let assigner = CohortAssigner::new();
        assert!(assigner.select_prompt_for_user("u", &[]).is_none());

        let zero = vec![PromptVariant {
            id: "only".to_string(),
            weight: 0,
            prompt: String::new(),
        }];
        assert_eq!(assigner.select_prompt_for_user("u", &zero).unwrap().id, "only");
    }
}
