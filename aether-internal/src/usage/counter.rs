use chrono::{DateTime, NaiveDate, Utc};
use moka::future::Cache;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config_parser::UsageConfig;
use crate::error::Error;
use crate::tier::{ResourceKind, Tier, TierPolicy};
use crate::usage::period::period_for;
use crate::usage::store::{UsageKey, UsageStore};
use crate::usage::{DenialReason, UsageCounterMetrics, UsageDecision, UsageInfo};

/// Per-user, per-resource-kind quota counter.
///
/// Consumption always goes through the store's atomic conditional increment;
/// the moka cache only serves read-side `get_usage_info` snapshots and is
/// invalidated on every consumption.
pub struct UsageCounter {
    store: Arc<dyn UsageStore>,
    policy: TierPolicy,
    response_period_days: u32,
    epoch: NaiveDate,
    fail_open: bool,
    cache: Cache<String, UsageInfo>,
    metrics: Arc<UsageCounterMetrics>,
}

impl UsageCounter {
    pub fn new(store: Arc<dyn UsageStore>, policy: TierPolicy, config: &UsageConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_cache_size)
            .time_to_live(Duration::from_millis(config.cache_ttl_ms))
            .build();
        Self {
            store,
            policy,
            response_period_days: config.response_period_days,
            epoch: config.epoch,
            fail_open: config.fail_open,
            cache,
            metrics: Arc::new(UsageCounterMetrics::default()),
        }
    }

    /// Attempt to consume one unit of `kind` for `user_id`.
    ///
    /// Quota exhaustion is a normal return value, not an error. Store
    /// failures are reported as a denial with an at-the-limit snapshot
    /// (fail-closed) unless `fail_open` is configured.
    pub async fn try_consume(&self, user_id: &str, tier: Tier, kind: ResourceKind) -> UsageDecision {
        self.try_consume_at(user_id, tier, kind, Utc::now()).await
    }

    /// `try_consume` at an explicit instant. The period is derived from
    /// `now`, so tests can walk the clock across bucket boundaries.
    pub async fn try_consume_at(
        &self,
        user_id: &str,
        tier: Tier,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> UsageDecision {
        let period = period_for(kind, now, self.response_period_days, self.epoch);
        let limit = self.policy.limit_for(tier, kind);
        let key = UsageKey::new(user_id, kind);

        match self
            .store
            .consume_if_allowed(&key, &period, limit.as_u32(), now)
            .await
        {
            Ok(outcome) => {
                // The cached read snapshot is stale after any consumption
                self.cache.invalidate(&cache_key(&key)).await;

                let usage = UsageInfo::new(
                    tier,
                    kind,
                    limit,
                    outcome.period_count,
                    outcome.total_count,
                    &period,
                );
                if outcome.allowed {
                    self.metrics.record_allowed();
                    UsageDecision::Allowed { usage }
                } else {
                    self.metrics.record_denied();
                    debug!(
                        user_id = user_id,
                        kind = %kind,
                        used = outcome.period_count,
                        "Quota exhausted for period"
                    );
                    UsageDecision::Denied {
                        reason: DenialReason::PeriodLimitReached,
                        usage,
                    }
                }
            }
            Err(e) => {
                self.metrics.record_store_error();
                if self.fail_open {
                    warn!(
                        user_id = user_id,
                        kind = %kind,
                        error = %e,
                        "Usage store unavailable, allowing request (fail_open)"
                    );
                    self.metrics.record_allowed();
                    let usage = UsageInfo::new(tier, kind, limit, 0, 0, &period);
                    UsageDecision::Allowed { usage }
                } else {
                    warn!(
                        user_id = user_id,
                        kind = %kind,
                        error = %e,
                        "Usage store unavailable, denying request (fail-closed)"
                    );
                    self.metrics.record_denied();
                    UsageDecision::Denied {
                        reason: DenialReason::UsageUnavailable,
                        usage: UsageInfo::exhausted(tier, kind, limit, &period),
                    }
                }
            }
        }
    }

    /// Read the current usage snapshot, applying lazy rollover in the store.
    pub async fn get_usage_info(
        &self,
        user_id: &str,
        tier: Tier,
        kind: ResourceKind,
    ) -> Result<UsageInfo, Error> {
        self.get_usage_info_at(user_id, tier, kind, Utc::now()).await
    }

    pub async fn get_usage_info_at(
        &self,
        user_id: &str,
        tier: Tier,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<UsageInfo, Error> {
        let period = period_for(kind, now, self.response_period_days, self.epoch);
        let key = UsageKey::new(user_id, kind);

        if let Some(cached) = self.cache.get(&cache_key(&key)).await {
            // Cache entries carry their period; discard across a rollover
            if cached.period_key == period.key && cached.tier == tier {
                self.metrics.record_cache_hit();
                return Ok(cached);
            }
        }
        self.metrics.record_cache_miss();

        let limit = self.policy.limit_for(tier, kind);
        let snapshot = self.store.read_usage(&key, &period, now).await?;
        let usage = UsageInfo::new(
            tier,
            kind,
            limit,
            snapshot.period_count,
            snapshot.total_count,
            &period,
        );
        self.cache.insert(cache_key(&key), usage.clone()).await;
        Ok(usage)
    }

    pub fn metrics(&self) -> Arc<UsageCounterMetrics> {
        Arc::clone(&self.metrics)
    }
}

fn cache_key(key: &UsageKey) -> String {
    format!("{}:{}", key.user_id, key.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorDetails};
    use crate::usage::store::{ConsumeOutcome, InMemoryUsageStore, UsageKey, UsageSnapshot};
    use crate::usage::Period;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tracing_test::traced_test;

    /// Store that always fails, for exercising the fail-closed path
    struct FailingUsageStore;

    #[async_trait]
    impl crate::usage::store::UsageStore for FailingUsageStore {
        async fn consume_if_allowed(
            &self,
            _key: &UsageKey,
            _period: &Period,
            _limit: Option<u32>,
            _now: DateTime<Utc>,
        ) -> Result<ConsumeOutcome, Error> {
            Err(Error::new_without_logging(ErrorDetails::Store {
                message: "synthetic store failure".to_string(),
            }))
        }

        async fn read_usage(
            &self,
            _key: &UsageKey,
            _period: &Period,
            _now: DateTime<Utc>,
        ) -> Result<UsageSnapshot, Error> {
            Err(Error::new_without_logging(ErrorDetails::Store {
                message: "synthetic store failure".to_string(),
            }))
        }
    }

    fn counter() -> UsageCounter {
        counter_with_policy(TierPolicy::default())
    }

    fn counter_with_policy(policy: TierPolicy) -> UsageCounter {
        UsageCounter::new(
            Arc::new(InMemoryUsageStore::new()),
            policy,
            &UsageConfig::default(),
        )
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_consume_and_report() {
        let counter = counter();
        let decision = counter
            .try_consume_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
            .await;
        assert!(decision.is_allowed());
        assert_eq!(decision.usage().used, 1);
        assert_eq!(decision.usage().remaining, Some(149));
    }

    #[tokio::test]
    async fn test_denial_at_limit() {
        let policy = TierPolicy {
            standard: crate::tier::TierLimits {
                responses_per_period: Some(2),
                premium_calls_per_month: Some(1),
            },
            ..TierPolicy::default()
        };
        let counter = counter_with_policy(policy);

        for _ in 0..2 {
            assert!(
                counter
                    .try_consume_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
                    .await
                    .is_allowed()
            );
        }

        let decision = counter
            .try_consume_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
            .await;
        match decision {
            UsageDecision::Denied { reason, usage } => {
                assert_eq!(reason, DenialReason::PeriodLimitReached);
                assert_eq!(usage.used, 2);
                assert_eq!(usage.remaining, Some(0));
            }
            UsageDecision::Allowed { .. } => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn test_unlimited_tier_always_allowed() {
        let counter = counter();
        for _ in 0..200 {
            let decision = counter
                .try_consume_at("vip-user", Tier::Vip, ResourceKind::Response, day(3))
                .await;
            assert!(decision.is_allowed());
            assert!(decision.usage().is_unlimited);
            assert_eq!(decision.usage().remaining, None);
        }
    }

    #[tokio::test]
    async fn test_rollover_resets_usage_on_read() {
        let policy = TierPolicy {
            standard: crate::tier::TierLimits {
                responses_per_period: Some(150),
                premium_calls_per_month: Some(10),
            },
            ..TierPolicy::default()
        };
        let counter = counter_with_policy(policy);

        // Exhaust nothing, just consume some on day 10 of the first window
        for _ in 0..5 {
            counter
                .try_consume_at("user-1", Tier::Standard, ResourceKind::Response, day(10))
                .await;
        }
        let info = counter
            .get_usage_info_at("user-1", Tier::Standard, ResourceKind::Response, day(10))
            .await
            .unwrap();
        assert_eq!(info.used, 5);

        // Day 15 falls in the next bi-weekly window: usage reads as zero
        let info = counter
            .get_usage_info_at("user-1", Tier::Standard, ResourceKind::Response, day(15))
            .await
            .unwrap();
        assert_eq!(info.used, 0);
        assert_eq!(info.remaining, Some(150));
        assert_eq!(info.total_used, 5);
    }

    #[tokio::test]
    async fn test_premium_calls_use_monthly_bucket() {
        let counter = counter();
        let decision = counter
            .try_consume_at("user-1", Tier::Standard, ResourceKind::PremiumCall, day(20))
            .await;
        assert!(decision.is_allowed());
        assert_eq!(decision.usage().period_key, "2024-01");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_failure_fails_closed() {
        let counter = UsageCounter::new(
            Arc::new(FailingUsageStore),
            TierPolicy::default(),
            &UsageConfig::default(),
        );

        let decision = counter
            .try_consume_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
            .await;
        match decision {
            UsageDecision::Denied { reason, usage } => {
                assert_eq!(reason, DenialReason::UsageUnavailable);
                // Reported as if at the limit
                assert_eq!(usage.remaining, Some(0));
            }
            UsageDecision::Allowed { .. } => panic!("store failures must deny by default"),
        }
        assert!(logs_contain("Usage store unavailable"));
    }

    #[tokio::test]
    async fn test_store_failure_with_fail_open_allows() {
        let config = UsageConfig {
            fail_open: true,
            ..UsageConfig::default()
        };
        let counter = UsageCounter::new(Arc::new(FailingUsageStore), TierPolicy::default(), &config);

        let decision = counter
            .try_consume_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
            .await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_cache_serves_reads_and_invalidates_on_consume() {
        let counter = counter();
        let _ = counter
            .get_usage_info_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
            .await
            .unwrap();
        let _ = counter
            .get_usage_info_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
            .await
            .unwrap();
        assert!(
            counter
                .metrics()
                .cache_hits
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 1
        );

        counter
            .try_consume_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
            .await;
        let info = counter
            .get_usage_info_at("user-1", Tier::Standard, ResourceKind::Response, day(3))
            .await
            .unwrap();
        assert_eq!(info.used, 1);
    }
}
