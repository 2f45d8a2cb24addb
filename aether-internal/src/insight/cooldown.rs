use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

use crate::config_parser::CooldownsConfig;
use crate::error::{Error, ErrorDetails};
use crate::insight::InsightCategory;

/// Last-generation state for one (user, category) pair.
///
/// Overwritten on each generation; never appended, never expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub category: InsightCategory,
    pub last_generated_at: DateTime<Utc>,
    pub data_fingerprint: String,
}

/// Whether a regeneration request may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Allow,
    Blocked { remaining: Duration },
}

impl CooldownDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CooldownDecision::Allow)
    }
}

/// Persistence for cooldown records, keyed by (user, category).
///
/// `save` is an atomic upsert that replaces prior state.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn load(
        &self,
        user_id: &str,
        category: InsightCategory,
    ) -> Result<Option<CooldownRecord>, Error>;

    async fn save(&self, user_id: &str, record: &CooldownRecord) -> Result<(), Error>;
}

fn storage_key(user_id: &str, category: InsightCategory) -> String {
    format!("insight_cooldown:{user_id}:{category}")
}

/// Redis-backed cooldown store. Records are stored as JSON documents; the
/// single-key SET makes the upsert atomic across instances.
pub struct RedisCooldownStore {
    conn: MultiplexedConnection,
    op_timeout: tokio::time::Duration,
}

impl RedisCooldownStore {
    pub async fn connect(url: &str, op_timeout_ms: u64) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;
        Ok(Self {
            conn,
            op_timeout: tokio::time::Duration::from_millis(op_timeout_ms),
        })
    }
}

#[async_trait]
impl CooldownStore for RedisCooldownStore {
    async fn load(
        &self,
        user_id: &str,
        category: InsightCategory,
    ) -> Result<Option<CooldownRecord>, Error> {
        let mut conn = self.conn.clone();
        let key = storage_key(user_id, category);

        let data = timeout(self.op_timeout, conn.get::<_, Option<String>>(&key))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StoreTimeout {
                    operation: "cooldown_load".to_string(),
                    timeout_ms: self.op_timeout.as_millis() as u64,
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::Store {
                    message: format!("Redis cooldown load failed: {e}"),
                })
            })?;

        match data {
            Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                Error::new(ErrorDetails::Serialization {
                    message: format!("Failed to parse cooldown record for key {key}: {e}"),
                })
            }),
            None => Ok(None),
        }
    }

    async fn save(&self, user_id: &str, record: &CooldownRecord) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = storage_key(user_id, record.category);
        let json = serde_json::to_string(record).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize cooldown record: {e}"),
            })
        })?;

        let result: Result<(), redis::RedisError> =
            timeout(self.op_timeout, conn.set(&key, json))
                .await
                .map_err(|_| {
                    Error::new(ErrorDetails::StoreTimeout {
                        operation: "cooldown_save".to_string(),
                        timeout_ms: self.op_timeout.as_millis() as u64,
                    })
                })?;
        result.map_err(|e| {
            Error::new(ErrorDetails::Store {
                message: format!("Redis cooldown save failed: {e}"),
            })
        })
    }
}

/// In-memory cooldown store for tests and Redis-less deployments.
#[derive(Default)]
pub struct InMemoryCooldownStore {
    records: DashMap<String, CooldownRecord>,
}

impl InMemoryCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CooldownStore for InMemoryCooldownStore {
    async fn load(
        &self,
        user_id: &str,
        category: InsightCategory,
    ) -> Result<Option<CooldownRecord>, Error> {
        Ok(self
            .records
            .get(&storage_key(user_id, category))
            .map(|r| r.clone()))
    }

    async fn save(&self, user_id: &str, record: &CooldownRecord) -> Result<(), Error> {
        self.records
            .insert(storage_key(user_id, record.category), record.clone());
        Ok(())
    }
}

/// Gates insight regeneration per (user, category).
///
/// Regeneration is allowed when no record exists, the cooldown window has
/// elapsed, or the candidate fingerprint differs from the stored one (the
/// data changed enough that a fresh insight is warranted even inside the
/// window). Forced generation bypasses the check but still records, which
/// re-arms the window.
pub struct CooldownTracker {
    store: std::sync::Arc<dyn CooldownStore>,
    config: CooldownsConfig,
}

impl CooldownTracker {
    pub fn new(store: std::sync::Arc<dyn CooldownStore>, config: CooldownsConfig) -> Self {
        Self { store, config }
    }

    pub async fn can_generate(
        &self,
        user_id: &str,
        category: InsightCategory,
        candidate_fingerprint: &str,
    ) -> Result<CooldownDecision, Error> {
        self.can_generate_at(user_id, category, candidate_fingerprint, Utc::now())
            .await
    }

    /// `can_generate` at an explicit instant
    pub async fn can_generate_at(
        &self,
        user_id: &str,
        category: InsightCategory,
        candidate_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<CooldownDecision, Error> {
        let Some(record) = self.store.load(user_id, category).await? else {
            return Ok(CooldownDecision::Allow);
        };

        let window = self.config.duration_for(category);
        let elapsed = now - record.last_generated_at;
        if elapsed >= window {
            return Ok(CooldownDecision::Allow);
        }

        if record.data_fingerprint != candidate_fingerprint {
            debug!(
                user_id = user_id,
                category = %category,
                "Fingerprint changed within cooldown window, allowing regeneration"
            );
            return Ok(CooldownDecision::Allow);
        }

        Ok(CooldownDecision::Blocked {
            remaining: window - elapsed,
        })
    }

    pub async fn record_generation(
        &self,
        user_id: &str,
        category: InsightCategory,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.store
            .save(
                user_id,
                &CooldownRecord {
                    category,
                    last_generated_at: at,
                    data_fingerprint: fingerprint.to_string(),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker() -> CooldownTracker {
        CooldownTracker::new(
            Arc::new(InMemoryCooldownStore::new()),
            CooldownsConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_first_generation_allowed() {
        let tracker = tracker();
        let decision = tracker
            .can_generate("user-1", InsightCategory::Communication, "fp-1")
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_blocked_within_window_with_same_fingerprint() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker
            .record_generation("user-1", InsightCategory::Communication, "fp-1", t0)
            .await
            .unwrap();

        // Default window is 30 minutes; 29 minutes in we are still blocked
        let decision = tracker
            .can_generate_at(
                "user-1",
                InsightCategory::Communication,
                "fp-1",
                t0 + Duration::minutes(29),
            )
            .await
            .unwrap();
        match decision {
            CooldownDecision::Blocked { remaining } => {
                assert_eq!(remaining, Duration::minutes(1));
            }
            CooldownDecision::Allow => panic!("expected block"),
        }
    }

    #[tokio::test]
    async fn test_allowed_after_window_elapses() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker
            .record_generation("user-1", InsightCategory::Personality, "fp-1", t0)
            .await
            .unwrap();

        let decision = tracker
            .can_generate_at(
                "user-1",
                InsightCategory::Personality,
                "fp-1",
                t0 + Duration::minutes(31),
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_changed_fingerprint_bypasses_window() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker
            .record_generation("user-1", InsightCategory::Emotional, "fp-1", t0)
            .await
            .unwrap();

        let decision = tracker
            .can_generate_at(
                "user-1",
                InsightCategory::Emotional,
                "fp-2",
                t0 + Duration::minutes(5),
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_recording_rearms_the_window() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker
            .record_generation("user-1", InsightCategory::Growth, "fp-1", t0)
            .await
            .unwrap();

        // Forced regeneration at t0+5min records a fresh timestamp
        tracker
            .record_generation(
                "user-1",
                InsightCategory::Growth,
                "fp-1",
                t0 + Duration::minutes(5),
            )
            .await
            .unwrap();

        // 31 minutes after the original generation is only 26 after the
        // forced one, so the same fingerprint is still blocked
        let decision = tracker
            .can_generate_at(
                "user-1",
                InsightCategory::Growth,
                "fp-1",
                t0 + Duration::minutes(31),
            )
            .await
            .unwrap();
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker
            .record_generation("user-1", InsightCategory::Communication, "fp-1", t0)
            .await
            .unwrap();

        let decision = tracker
            .can_generate_at(
                "user-1",
                InsightCategory::Behavioral,
                "fp-1",
                t0 + Duration::minutes(1),
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }
}
