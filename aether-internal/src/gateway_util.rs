use std::sync::Arc;
use tracing::{info, warn};

use crate::config_parser::Config;
use crate::error::Error;
use crate::insight::cooldown::{
    CooldownStore, CooldownTracker, InMemoryCooldownStore, RedisCooldownStore,
};
use crate::insight::generator::InsightGenerator;
use crate::insight::InsightMetrics;
use crate::usage::counter::UsageCounter;
use crate::usage::store::{InMemoryUsageStore, RedisUsageStore, UsageStore};

/// Shared application state for handlers and middleware.
///
/// Cheap to clone: everything heavy is behind an `Arc`.
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub usage_counter: Arc<UsageCounter>,
    pub cooldown_tracker: Arc<CooldownTracker>,
    pub insight_generator: Arc<InsightGenerator>,
    pub insight_metrics: Arc<InsightMetrics>,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let http_client = reqwest::Client::new();

        let (usage_store, cooldown_store): (Arc<dyn UsageStore>, Arc<dyn CooldownStore>) =
            match &config.redis.url {
                Some(url) => {
                    info!("Connecting to Redis for usage and cooldown state");
                    (
                        Arc::new(RedisUsageStore::connect(url, config.redis.timeout_ms).await?),
                        Arc::new(RedisCooldownStore::connect(url, config.redis.timeout_ms).await?),
                    )
                }
                None => {
                    warn!(
                        "No Redis URL configured; usage and cooldown state is in-memory and will \
                        not survive restarts or coordinate across instances"
                    );
                    (
                        Arc::new(InMemoryUsageStore::new()),
                        Arc::new(InMemoryCooldownStore::new()),
                    )
                }
            };

        let usage_counter = Arc::new(UsageCounter::new(
            usage_store,
            config.tiers,
            &config.usage,
        ));
        let cooldown_tracker = Arc::new(CooldownTracker::new(
            cooldown_store,
            config.cooldowns.clone(),
        ));
        let insight_generator = Arc::new(InsightGenerator::new(
            http_client.clone(),
            config.generator.clone(),
        )?);

        Ok(Self {
            config,
            http_client,
            usage_counter,
            cooldown_tracker,
            insight_generator,
            insight_metrics: Arc::new(InsightMetrics::default()),
        })
    }
}
