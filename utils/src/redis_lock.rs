use dashmap::DashMap;
use log::trace;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Debug)]
pub enum LockError {
    Redis(deadpool_redis::redis::RedisError),
    Pool(deadpool_redis::PoolError),
    InvalidOperation(String),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Redis(e) => write!(f, "Redis error: {e}"),
            LockError::Pool(e) => write!(f, "Pool error: {e}"),
            LockError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Redis(e) => Some(e),
            LockError::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<deadpool_redis::redis::RedisError> for LockError {
    fn from(error: deadpool_redis::redis::RedisError) -> Self {
        LockError::Redis(error)
    }
}

impl From<deadpool_redis::PoolError> for LockError {
    fn from(error: deadpool_redis::PoolError) -> Self {
        LockError::Pool(error)
    }
}

/// A held TTL lock. There is deliberately no renewal task: the schedule
/// driver sizes the TTL so the lock expires before the next recursive job
/// fires, which is what recovers a crashed holder.
#[derive(Debug, Clone)]
pub struct TtlLock {
    key: String,
    token: String,
    ttl: Duration,
    acquired_at: Instant,
}

impl TtlLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }
}

/// Cross-process TTL locks over Redis `SET NX EX`, with an in-process map
/// fallback when no pool is configured (single node, unit tests).
pub struct DistributedLockManager {
    pool: Option<Arc<deadpool_redis::Pool>>,
    local: Arc<DashMap<String, (String, Instant)>>,
    held: Arc<DashMap<String, TtlLock>>,
    prefix: String,
}

impl DistributedLockManager {
    pub fn new(pool: Option<Arc<deadpool_redis::Pool>>, prefix: &str) -> Self {
        Self {
            pool,
            local: Arc::new(DashMap::new()),
            held: Arc::new(DashMap::new()),
            prefix: prefix.to_string(),
        }
    }

    fn format_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }

    /// Single acquisition attempt. `false` means somebody else holds it.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        let key = self.format_key(name);
        let token = Uuid::new_v4().to_string();

        let acquired = if let Some(pool) = &self.pool {
            let mut conn = pool.get().await?;
            let result: Option<String> = deadpool_redis::redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            result.is_some()
        } else {
            let now = Instant::now();
            match self.local.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                    if entry.get().1 < now {
                        entry.insert((token.clone(), now + ttl));
                        true
                    } else {
                        false
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert((token.clone(), now + ttl));
                    true
                }
            }
        };

        if acquired {
            self.held.insert(
                name.to_string(),
                TtlLock {
                    key,
                    token,
                    ttl,
                    acquired_at: Instant::now(),
                },
            );
            trace!("Lock acquired: {name} (ttl {}s)", ttl.as_secs());
        }
        Ok(acquired)
    }

    /// Retries until `max_wait` elapses.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<bool, LockError> {
        let start = Instant::now();
        loop {
            if self.try_acquire(name, ttl).await? {
                return Ok(true);
            }
            if start.elapsed() >= max_wait {
                return Ok(false);
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Compare-and-delete release. A lock that already expired (and was
    /// possibly re-acquired elsewhere) is left alone.
    pub async fn release(&self, name: &str) -> Result<bool, LockError> {
        let Some((_, lock)) = self.held.remove(name) else {
            return Ok(false);
        };

        if let Some(pool) = &self.pool {
            let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;
            let mut conn = pool.get().await?;
            let result: i32 = deadpool_redis::redis::Script::new(script)
                .key(&lock.key)
                .arg(&lock.token)
                .invoke_async(&mut *conn)
                .await?;
            Ok(result == 1)
        } else {
            match self.local.entry(lock.key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    if entry.get().0 == lock.token {
                        entry.remove();
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(_) => Ok(false),
            }
        }
    }

    pub async fn with_lock<F, R>(
        &self,
        name: &str,
        ttl: Duration,
        max_wait: Duration,
        f: F,
    ) -> Result<Option<R>, LockError>
    where
        F: std::future::Future<Output = R>,
    {
        if self.acquire(name, ttl, max_wait).await? {
            let result = f.await;
            self.release(name).await?;
            Ok(Some(result))
        } else {
            Ok(None)
        }
    }

    pub fn get_pool(&self) -> Option<&deadpool_redis::Pool> {
        self.pool.as_ref().map(|p| p.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_lock_is_exclusive_until_released() {
        let manager = DistributedLockManager::new(None, "test");
        assert!(manager
            .try_acquire("sched:1", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!manager
            .try_acquire("sched:1", Duration::from_secs(30))
            .await
            .unwrap());

        assert!(manager.release("sched:1").await.unwrap());
        assert!(manager
            .try_acquire("sched:1", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn local_lock_expires_by_ttl() {
        let manager = DistributedLockManager::new(None, "test");
        assert!(manager
            .try_acquire("sched:2", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Expired entry is reclaimable without an explicit release.
        assert!(manager
            .try_acquire("sched:2", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn release_unknown_lock_is_noop() {
        let manager = DistributedLockManager::new(None, "test");
        assert!(!manager.release("never-held").await.unwrap());
    }
}
