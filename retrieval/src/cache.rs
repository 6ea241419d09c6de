//! Two-tier search-result cache: in-process LRU in front of optional Redis.
//!
//! Keys are content hashes of the full request, so any change to query,
//! mode, filter or limits misses. Cache failures never fail a search.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use corpora_models::search::{SearchRequest, SearchResponse};

const LOCAL_CAPACITY: usize = 512;

struct LocalEntry {
    response: SearchResponse,
    expires_at: Instant,
}

pub struct SearchCache {
    local: Mutex<LruCache<String, LocalEntry>>,
    redis: Option<ConnectionManager>,
    ttl: Duration,
}

impl SearchCache {
    /// Connect the Redis tier if a URL is configured; otherwise run
    /// local-only. A failed connection downgrades with a warning.
    pub async fn new(redis_url: Option<&str>, ttl_seconds: u64) -> Self {
        let redis = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => {
                        debug!("search cache redis tier connected");
                        Some(conn)
                    }
                    Err(e) => {
                        warn!("redis connection failed, cache is local-only: {}", e);
                        None
                    }
                },
                Err(e) => {
                    warn!("redis client creation failed, cache is local-only: {}", e);
                    None
                }
            },
            None => None,
        };

        Self {
            local: Mutex::new(LruCache::new(
                NonZeroUsize::new(LOCAL_CAPACITY).expect("nonzero capacity"),
            )),
            redis,
            ttl: Duration::from_secs(ttl_seconds),
        }
    }

    /// Stable cache key over everything that affects the result.
    pub fn key(request: &SearchRequest) -> String {
        let canonical = serde_json::json!({
            "kb": request.knowledge_base_id.to_string(),
            "query": request.query,
            "mode": request.mode.as_str(),
            "top_k": request.top_k,
            "filter": request.filter,
            "rerank": request.enable_rerank,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        format!("corpora:search:{}", hex::encode(&digest[..16]))
    }

    pub async fn get(&self, key: &str) -> Option<SearchResponse> {
        {
            let mut local = self.local.lock();
            if let Some(entry) = local.get(key) {
                if entry.expires_at > Instant::now() {
                    return Some(entry.response.clone());
                }
                local.pop(key);
            }
        }

        let mut conn = self.redis.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(payload)) => match serde_json::from_str::<SearchResponse>(&payload) {
                Ok(response) => {
                    self.store_local(key, &response);
                    Some(response)
                }
                Err(e) => {
                    warn!("dropping malformed cached entry: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("redis GET failed: {}", e);
                None
            }
        }
    }

    pub async fn put(&self, key: &str, response: &SearchResponse) {
        self.store_local(key, response);

        if let Some(mut conn) = self.redis.clone() {
            match serde_json::to_string(response) {
                Ok(payload) => {
                    let result: Result<(), _> = conn
                        .set_ex(key, payload, self.ttl.as_secs())
                        .await;
                    if let Err(e) = result {
                        warn!("redis SETEX failed: {}", e);
                    }
                }
                Err(e) => warn!("response serialization for cache failed: {}", e),
            }
        }
    }

    fn store_local(&self, key: &str, response: &SearchResponse) {
        self.local.lock().put(
            key.to_string(),
            LocalEntry {
                response: response.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpora_models::search::{FilterExpr, SearchMetadata, SearchMode};
    use uuid::Uuid;

    fn request(query: &str) -> SearchRequest {
        SearchRequest {
            knowledge_base_id: Uuid::nil(),
            query: query.into(),
            mode: SearchMode::Hybrid,
            top_k: 10,
            filter: None,
            enable_rerank: false,
        }
    }

    fn response() -> SearchResponse {
        SearchResponse {
            results: vec![],
            metadata: SearchMetadata::default(),
        }
    }

    #[test]
    fn keys_are_stable_and_sensitive() {
        let a = SearchCache::key(&request("capital of France"));
        let b = SearchCache::key(&request("capital of France"));
        assert_eq!(a, b);
        assert_ne!(a, SearchCache::key(&request("capital of Germany")));

        let mut filtered = request("capital of France");
        filtered.filter = Some(FilterExpr::eq("chunk_type", serde_json::json!("text")));
        assert_ne!(a, SearchCache::key(&filtered));
    }

    #[tokio::test]
    async fn local_tier_round_trip() {
        let cache = SearchCache::new(None, 60).await;
        let key = SearchCache::key(&request("q"));
        assert!(cache.get(&key).await.is_none());
        cache.put(&key, &response()).await;
        assert!(cache.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn expired_local_entries_miss() {
        let cache = SearchCache::new(None, 0).await;
        let key = SearchCache::key(&request("q"));
        cache.put(&key, &response()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get(&key).await.is_none());
    }
}
