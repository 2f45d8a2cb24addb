use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::error::{Error, ErrorDetails};
use crate::tier::ResourceKind;
use crate::usage::period::Period;

/// Key addressing one user's counter for one resource kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub user_id: String,
    pub kind: ResourceKind,
}

impl UsageKey {
    pub fn new(user_id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
        }
    }

    fn storage_key(&self) -> String {
        format!("usage:{}:{}", self.user_id, self.kind)
    }
}

/// Result of an atomic conditional increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub period_count: u64,
    pub total_count: u64,
}

/// Counter state after lazy rollover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub period_count: u64,
    pub total_count: u64,
}

/// Persistence for per-user usage counters.
///
/// Both operations perform lazy rollover: when the stored period key differs
/// from the one passed in, the period count is reset to zero before anything
/// else happens. `consume_if_allowed` must be a single atomic
/// check-and-increment on the storage side; callers never issue a separate
/// read followed by a write, as that sequence loses updates under
/// concurrent requests for the same user.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Increment the period and lifetime counters by one if the period count
    /// is below `limit` (or `limit` is `None`, meaning unlimited). Returns
    /// the outcome with post-operation counts; on a denial the counters are
    /// untouched.
    async fn consume_if_allowed(
        &self,
        key: &UsageKey,
        period: &Period,
        limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, Error>;

    /// Read the current counters, applying rollover as a side effect.
    async fn read_usage(
        &self,
        key: &UsageKey,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error>;
}

/// Redis-backed usage store.
///
/// The conditional increment runs as one Lua script so rollover, the limit
/// guard, and the increment are a single atomic step on the server. A
/// read-modify-write from the client would let two concurrent requests both
/// observe `limit - 1` and both consume.
pub struct RedisUsageStore {
    conn: MultiplexedConnection,
    consume_script: Script,
    read_script: Script,
    op_timeout: Duration,
}

impl RedisUsageStore {
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

        let consume_script = Script::new(
            r#"
            local key = KEYS[1]
            local period_key = ARGV[1]
            local limit = tonumber(ARGV[2])
            local now = ARGV[3]

            -- Lazy rollover: reset the period counter when the bucket changed
            local stored = redis.call('HGET', key, 'period_key')
            if stored ~= period_key then
                redis.call('HSET', key, 'period_key', period_key, 'period_count', 0, 'last_reset', now)
            end

            local count = tonumber(redis.call('HGET', key, 'period_count')) or 0
            if limit >= 0 and count >= limit then
                local total = tonumber(redis.call('HGET', key, 'total_count')) or 0
                return {0, count, total}
            end

            local new_count = redis.call('HINCRBY', key, 'period_count', 1)
            local total = redis.call('HINCRBY', key, 'total_count', 1)
            return {1, new_count, total}
            "#,
        );

        let read_script = Script::new(
            r#"
            local key = KEYS[1]
            local period_key = ARGV[1]
            local now = ARGV[2]

            local stored = redis.call('HGET', key, 'period_key')
            if stored ~= period_key then
                redis.call('HSET', key, 'period_key', period_key, 'period_count', 0, 'last_reset', now)
            end

            local count = tonumber(redis.call('HGET', key, 'period_count')) or 0
            local total = tonumber(redis.call('HGET', key, 'total_count')) or 0
            return {count, total}
            "#,
        );

        Ok(Self {
            conn,
            consume_script,
            read_script,
            op_timeout: Duration::from_millis(op_timeout_ms),
        })
    }

    async fn run_script(
        &self,
        script: &Script,
        operation: &str,
        key: &UsageKey,
        args: &[String],
    ) -> Result<Vec<i64>, Error> {
        let mut conn = self.conn.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(key.storage_key());
        for arg in args {
            invocation.arg(arg);
        }

        let result: Vec<i64> = timeout(self.op_timeout, invocation.invoke_async(&mut conn))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StoreTimeout {
                    operation: operation.to_string(),
                    timeout_ms: self.op_timeout.as_millis() as u64,
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::Store {
                    message: format!("Redis {operation} failed: {e}"),
                })
            })?;

        Ok(result)
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn consume_if_allowed(
        &self,
        key: &UsageKey,
        period: &Period,
        limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, Error> {
        let limit_arg = limit.map_or(-1i64, i64::from);
        let result = self
            .run_script(
                &self.consume_script,
                "consume_if_allowed",
                key,
                &[
                    period.key.clone(),
                    limit_arg.to_string(),
                    now.to_rfc3339(),
                ],
            )
            .await?;

        if result.len() != 3 {
            return Err(Error::new(ErrorDetails::Store {
                message: format!(
                    "Unexpected consume script reply length: {}",
                    result.len()
                ),
            }));
        }

        let outcome = ConsumeOutcome {
            allowed: result[0] == 1,
            period_count: u64::try_from(result[1]).unwrap_or(0),
            total_count: u64::try_from(result[2]).unwrap_or(0),
        };
        debug!(
            user_id = key.user_id,
            kind = %key.kind,
            allowed = outcome.allowed,
            period_count = outcome.period_count,
            "Consumed usage via Redis"
        );
        Ok(outcome)
    }

    async fn read_usage(
        &self,
        key: &UsageKey,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        let result = self
            .run_script(
                &self.read_script,
                "read_usage",
                key,
                &[period.key.clone(), now.to_rfc3339()],
            )
            .await?;

        if result.len() != 2 {
            return Err(Error::new(ErrorDetails::Store {
                message: format!("Unexpected read script reply length: {}", result.len()),
            }));
        }

        Ok(UsageSnapshot {
            period_count: u64::try_from(result[0]).unwrap_or(0),
            total_count: u64::try_from(result[1]).unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Default)]
struct UsageRecord {
    period_key: String,
    period_count: u64,
    total_count: u64,
    last_reset: Option<DateTime<Utc>>,
}

impl UsageRecord {
    fn roll_over_if_stale(&mut self, period: &Period, now: DateTime<Utc>) {
        if self.period_key != period.key {
            self.period_key = period.key.clone();
            self.period_count = 0;
            self.last_reset = Some(now);
        }
    }
}

/// In-memory usage store for tests and Redis-less deployments.
///
/// The DashMap entry guard is held for the whole read-modify-write, which
/// serializes concurrent consumption for the same key.
#[derive(Default)]
pub struct InMemoryUsageStore {
    records: DashMap<String, UsageRecord>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn consume_if_allowed(
        &self,
        key: &UsageKey,
        period: &Period,
        limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, Error> {
        let mut record = self.records.entry(key.storage_key()).or_default();
        record.roll_over_if_stale(period, now);

        if let Some(limit) = limit {
            if record.period_count >= u64::from(limit) {
                return Ok(ConsumeOutcome {
                    allowed: false,
                    period_count: record.period_count,
                    total_count: record.total_count,
                });
            }
        }

        record.period_count += 1;
        record.total_count += 1;
        Ok(ConsumeOutcome {
            allowed: true,
            period_count: record.period_count,
            total_count: record.total_count,
        })
    }

    async fn read_usage(
        &self,
        key: &UsageKey,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        let mut record = self.records.entry(key.storage_key()).or_default();
        record.roll_over_if_stale(period, now);
        Ok(UsageSnapshot {
            period_count: record.period_count,
            total_count: record.total_count,
        })
    }
}
