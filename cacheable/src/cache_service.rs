pub mod backend;
pub mod local_backend;
pub mod redis_backend;
#[cfg(test)]
mod tests;

use backend::CacheBackend;
use deadpool_redis::Pool;
use errors::CacheError;
use local_backend::LocalBackend;
use redis_backend::RedisBackend;
use std::sync::Arc;
use std::time::Duration;

/// Namespaced facade over the cache backend. All engine coordination keys
/// (locks aside) go through here so they share one prefix and one default
/// TTL policy.
pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    default_ttl: Option<Duration>,
}

impl CacheService {
    pub fn new(pool: Option<Pool>, namespace: String, default_ttl: Option<Duration>) -> Self {
        let backend: Arc<dyn CacheBackend> = match pool {
            Some(p) => Arc::new(RedisBackend::new(p)),
            None => Arc::new(LocalBackend::new()),
        };

        CacheService {
            backend,
            namespace,
            default_ttl,
        }
    }

    pub fn with_backend(
        backend: Arc<dyn CacheBackend>,
        namespace: String,
        default_ttl: Option<Duration>,
    ) -> Self {
        CacheService {
            backend,
            namespace,
            default_ttl,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.namespace, suffix)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.backend.get(&self.key(key)).await
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .get(key)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.backend
            .set(&self.key(key), value, ttl.or(self.default_ttl))
            .await
    }

    pub async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.set(key, value.as_bytes(), ttl).await
    }

    pub async fn set_nx(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.backend
            .set_nx(&self.key(key), value, ttl.or(self.default_ttl))
            .await
    }

    pub async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.backend.del(&self.key(key)).await
    }

    /// Pattern delete, bounded per call; maintenance-time invalidation only.
    pub async fn del_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let keys = self
            .backend
            .keys_with_limit(&self.key(pattern), 10_000)
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let refs: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        self.backend.del_batch(&refs).await
    }

    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.backend.incr(&self.key(key), delta).await
    }

    pub async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let namespaced: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        let refs: Vec<&str> = namespaced.iter().map(|k| k.as_str()).collect();
        self.backend.mget(&refs).await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }
}
