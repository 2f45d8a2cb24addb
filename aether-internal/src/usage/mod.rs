pub mod counter;
pub mod middleware;
pub mod period;
pub mod store;

pub use counter::UsageCounter;
pub use middleware::{quota_middleware, QuotaError};
pub use period::{calendar_month_period, period_for, rolling_period, Period};
pub use store::{InMemoryUsageStore, RedisUsageStore, UsageStore};

use axum::http::{HeaderMap, HeaderValue};
use chrono::NaiveDate;
use serde::Serialize;

use crate::tier::{QuotaLimit, ResourceKind, Tier};

/// Snapshot of one user's usage for one resource kind, after lazy rollover.
#[derive(Debug, Clone, Serialize)]
pub struct UsageInfo {
    pub tier: Tier,
    pub kind: ResourceKind,
    /// `None` for unlimited tiers
    pub limit: Option<u32>,
    pub used: u64,
    /// `None` for unlimited tiers
    pub remaining: Option<u64>,
    pub is_unlimited: bool,
    pub total_used: u64,
    pub period_key: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

impl UsageInfo {
    pub(crate) fn new(
        tier: Tier,
        kind: ResourceKind,
        limit: QuotaLimit,
        used: u64,
        total_used: u64,
        period: &Period,
    ) -> Self {
        let limit_n = limit.as_u32();
        Self {
            tier,
            kind,
            limit: limit_n,
            used,
            remaining: limit_n.map(|l| u64::from(l).saturating_sub(used)),
            is_unlimited: limit.is_unlimited(),
            total_used,
            period_key: period.key.clone(),
            period_start: period.start,
            period_end: period.end,
        }
    }

    /// Snapshot reported when usage state cannot be read: the user is
    /// treated as if already at the limit (fail-closed).
    pub(crate) fn exhausted(tier: Tier, kind: ResourceKind, limit: QuotaLimit, period: &Period) -> Self {
        let used = limit.as_u32().map(u64::from).unwrap_or(0);
        Self::new(tier, kind, limit, used, used, period)
    }

    /// Quota headers advertised on gated responses
    pub fn to_headers(&self, retry_after: Option<u64>) -> QuotaHeaders {
        QuotaHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset: Period {
                key: self.period_key.clone(),
                start: self.period_start,
                end: self.period_end,
            }
            .reset_timestamp(),
            retry_after,
        }
    }
}

/// Reason a consumption attempt was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    PeriodLimitReached,
    UsageUnavailable,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::PeriodLimitReached => "period_limit_reached",
            DenialReason::UsageUnavailable => "usage_unavailable",
        }
    }
}

/// Result of a consumption attempt. Denials are ordinary values with the
/// usage snapshot attached, never errors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum UsageDecision {
    Allowed {
        usage: UsageInfo,
    },
    Denied {
        reason: DenialReason,
        usage: UsageInfo,
    },
}

impl UsageDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, UsageDecision::Allowed { .. })
    }

    pub fn usage(&self) -> &UsageInfo {
        match self {
            UsageDecision::Allowed { usage } | UsageDecision::Denied { usage, .. } => usage,
        }
    }
}

/// Headers returned with quota information
#[derive(Debug, Clone)]
pub struct QuotaHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u64>,
    pub reset: i64,                // Unix timestamp
    pub retry_after: Option<u64>,  // Seconds
}

impl QuotaHeaders {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // These conversions are safe because we're converting numbers to strings.
        // Numbers always produce valid header values.
        let limit_value = match self.limit {
            Some(limit) => limit.to_string(),
            None => "unlimited".to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&limit_value) {
            headers.insert("X-RateLimit-Limit", value);
        }

        let remaining_value = match self.remaining {
            Some(remaining) => remaining.to_string(),
            None => "unlimited".to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&remaining_value) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Metrics for usage counter performance monitoring
#[derive(Debug, Default)]
pub struct UsageCounterMetrics {
    pub allowed: std::sync::atomic::AtomicU64,
    pub denied: std::sync::atomic::AtomicU64,
    pub store_errors: std::sync::atomic::AtomicU64,
    pub cache_hits: std::sync::atomic::AtomicU64,
    pub cache_misses: std::sync::atomic::AtomicU64,
}

impl UsageCounterMetrics {
    pub fn record_allowed(&self) {
        self.allowed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
