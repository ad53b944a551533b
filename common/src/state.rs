use crate::model::config::Config;

use cacheable::CacheService;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use utils::connector::{create_redis_pool, postgres_connection};
use utils::redis_lock::DistributedLockManager;

/// Process-wide shared handles. Built once at startup; everything here is
/// cheap to clone.
#[derive(Clone)]
pub struct State {
    pub db: Arc<sea_orm::DatabaseConnection>,
    pub config: Arc<RwLock<Config>>,
    pub cache: Arc<CacheService>,
    pub locker: Arc<DistributedLockManager>,
    /// Pool handed to the queue backend; `None` falls back to local-only
    /// coordination (tests, single-node dev).
    pub queue_pool: Option<Arc<deadpool_redis::Pool>>,
}

impl State {
    pub async fn new(path: &str) -> Self {
        let config = Config::load(path).expect("failed to parse config.toml");
        Self::from_config(config).await
    }

    pub async fn from_config(config: Config) -> Self {
        let db = Arc::new(
            postgres_connection(
                &config.db.database_host,
                config.db.database_port,
                &config.db.database_name,
                &config.db.database_schema,
                &config.db.database_user,
                &config.db.database_password,
            )
            .await
            .expect("Failed to connect to postgres"),
        );
        info!("postgres connected");

        let cache_pool = config.redis.as_ref().and_then(|redis| {
            create_redis_pool(
                &redis.redis_host,
                redis.redis_port,
                redis.redis_db,
                &redis.redis_username,
                &redis.redis_password,
                redis.pool_size,
            )
        });
        if config.redis.is_some() && cache_pool.is_none() {
            panic!("Failed to connect cache redis");
        }

        let locker_pool = cache_pool.clone().map(Arc::new);
        let queue_pool = cache_pool.clone().map(Arc::new);

        let cache = Arc::new(CacheService::new(
            cache_pool,
            config.name.clone(),
            Some(Duration::from_secs(3600)),
        ));
        if config.redis.is_some() {
            cache.ping().await.expect("Failed to ping cache redis");
            info!("cache pool connected");
        }

        let locker = Arc::new(DistributedLockManager::new(locker_pool, &config.name));

        State {
            db,
            config: Arc::new(RwLock::new(config)),
            cache,
            locker,
            queue_pool,
        }
    }
}
