use super::backend::CacheBackend;
use dashmap::DashMap;
use errors::CacheError;
use std::time::{Duration, Instant};

/// In-process backend used when no Redis pool is configured (single node,
/// unit tests). Expiry is lazy: entries are dropped when touched.
pub struct LocalBackend {
    entries: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn is_expired(deadline: &Option<Instant>) -> bool {
        matches!(deadline, Some(d) if *d <= Instant::now())
    }

    // Redis glob subset: '*' wildcards only, which is all the engine uses.
    fn matches(pattern: &str, key: &str) -> bool {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 1 {
            return pattern == key;
        }
        let mut rest = key;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            match rest.find(part) {
                Some(pos) => {
                    if i == 0 && pos != 0 {
                        return false;
                    }
                    rest = &rest[pos + part.len()..];
                }
                None => return false,
            }
        }
        if let Some(last) = parts.last() {
            if !last.is_empty() && !pattern.ends_with('*') && !key.ends_with(last) {
                return false;
            }
        }
        true
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CacheBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if Self::is_expired(&entry.1) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.0.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let deadline = ttl.map(|d| Instant::now() + d);
        self.entries
            .insert(key.to_string(), (value.to_vec(), deadline));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn del_batch(&self, keys: &[&str]) -> Result<u64, CacheError> {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(*key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.keys_with_limit(pattern, usize::MAX).await
    }

    async fn keys_with_limit(&self, pattern: &str, limit: usize) -> Result<Vec<String>, CacheError> {
        let mut out = Vec::new();
        for entry in self.entries.iter() {
            if out.len() >= limit {
                break;
            }
            if Self::is_expired(&entry.value().1) {
                continue;
            }
            if Self::matches(pattern, entry.key()) {
                out.push(entry.key().clone());
            }
        }
        Ok(out)
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let deadline = ttl.map(|d| Instant::now() + d);
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if Self::is_expired(&entry.get().1) {
                    entry.insert((value.to_vec(), deadline));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert((value.to_vec(), deadline));
                Ok(true)
            }
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut result = delta;
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let current = if Self::is_expired(&entry.get().1) {
                    0
                } else {
                    std::str::from_utf8(&entry.get().0)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .unwrap_or(0)
                };
                result = current + delta;
                let ttl = entry.get().1;
                entry.insert((result.to_string().into_bytes(), ttl));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert((delta.to_string().into_bytes(), None));
            }
        }
        Ok(result)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
