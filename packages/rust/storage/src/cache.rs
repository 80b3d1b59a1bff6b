//! Fingerprint cache: TTL-backed "seen/processed at stage X" markers and
//! cached stage results.
//!
//! Keys follow `{stage}_{sourceType}_{sourceList}_{fingerprint}`. LLM results
//! use `{stage}@{provider}/{model}` as the stage segment, and embedding
//! markers live in their own `embedding` namespace.

use std::time::Duration;

use async_trait::async_trait;
use autonews_shared::{Fingerprint, Result, SourceType};
use libsql::params;

use crate::{Storage, storage_err};

/// Pipeline stage a marker or cached value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Successfully written to the sink.
    Pushed,
    /// Cached summary.
    Summarize,
    /// Cached classification.
    Rank,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pushed => "pushed",
            Self::Summarize => "summarize",
            Self::Rank => "rank",
        }
    }
}

/// A fully qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Marker key for `stage`.
    pub fn stage(
        stage: Stage,
        source_type: SourceType,
        source_list: &str,
        fingerprint: &Fingerprint,
    ) -> Self {
        Self::build(stage.as_str(), source_type, source_list, fingerprint)
    }

    /// Result key for an LLM stage, scoped to the provider and model that
    /// produced the value.
    pub fn llm(
        stage: Stage,
        provider: &str,
        model: &str,
        source_type: SourceType,
        source_list: &str,
        fingerprint: &Fingerprint,
    ) -> Self {
        let segment = format!("{}@{provider}/{model}", stage.as_str());
        Self::build(&segment, source_type, source_list, fingerprint)
    }

    /// Embedding-tracking marker (long TTL namespace).
    pub fn embedding(source_type: SourceType, source_list: &str, fingerprint: &Fingerprint) -> Self {
        Self::build("embedding", source_type, source_list, fingerprint)
    }

    /// Last attempted run time of a source, used for conditional fetches.
    pub fn last_attempt(source_type: SourceType, source_list: &str) -> Self {
        Self(format!("last_attempt_{source_type}_{source_list}"))
    }

    fn build(stage: &str, source_type: SourceType, source_list: &str, fp: &Fingerprint) -> Self {
        Self(format!("{stage}_{source_type}_{source_list}_{fp}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// TTL-backed key-value store. Expired entries behave as absent; a miss only
/// means "recompute".
#[async_trait]
pub trait FingerprintCache: Send + Sync {
    /// Whether a live entry exists for `key`.
    async fn has(&self, key: &CacheKey) -> Result<bool>;

    /// Record a marker for `key`.
    async fn mark(&self, key: &CacheKey, ttl: Duration) -> Result<()>;

    /// Cached value for `key`, if live.
    async fn get(&self, key: &CacheKey) -> Result<Option<String>>;

    /// Store `value` under `key`. Counts as a marker for [`has`](Self::has).
    async fn put(&self, key: &CacheKey, value: &str, ttl: Duration) -> Result<()>;
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn expires_at(ttl: Duration) -> i64 {
    now_secs().saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

// ---------------------------------------------------------------------------
// libSQL implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl FingerprintCache for Storage {
    async fn has(&self, key: &CacheKey) -> Result<bool> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key.as_str(), now_secs()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn mark(&self, key: &CacheKey, ttl: Duration) -> Result<()> {
        self.check_writable()?;
        self.conn()
            .execute(
                "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, NULL, ?2)
                 ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
                params![key.as_str(), expires_at(ttl)],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key.as_str(), now_secs()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn put(&self, key: &CacheKey, value: &str, ttl: Duration) -> Result<()> {
        self.check_writable()?;
        self.conn()
            .execute(
                "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at",
                params![key.as_str(), value, expires_at(ttl)],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;

    fn fp() -> Fingerprint {
        Fingerprint::compute(SourceType::Feed, "HN", "https://example.com/a")
    }

    #[test]
    fn key_conventions() {
        let fp = fp();
        let marker = CacheKey::stage(Stage::Pushed, SourceType::Feed, "HN", &fp);
        assert_eq!(marker.as_str(), format!("pushed_feed_HN_{fp}"));

        let llm = CacheKey::llm(Stage::Summarize, "openrouter", "gpt-4o-mini", SourceType::Feed, "HN", &fp);
        assert_eq!(llm.as_str(), format!("summarize@openrouter/gpt-4o-mini_feed_HN_{fp}"));

        let emb = CacheKey::embedding(SourceType::WebPage, "Blog", &fp);
        assert!(emb.as_str().starts_with("embedding_web-page_Blog_"));
    }

    #[tokio::test]
    async fn mark_and_has() {
        let storage = test_storage().await;
        let key = CacheKey::stage(Stage::Pushed, SourceType::Feed, "HN", &fp());

        assert!(!storage.has(&key).await.unwrap());
        storage.mark(&key, Duration::from_secs(60)).await.unwrap();
        assert!(storage.has(&key).await.unwrap());
        assert_eq!(storage.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_and_get_values() {
        let storage = test_storage().await;
        let key = CacheKey::llm(Stage::Rank, "p", "m", SourceType::Feed, "HN", &fp());

        storage.put(&key, r#"{"score":0.8}"#, Duration::from_secs(60)).await.unwrap();
        assert!(storage.has(&key).await.unwrap());
        assert_eq!(storage.get(&key).await.unwrap().as_deref(), Some(r#"{"score":0.8}"#));

        storage.put(&key, "updated", Duration::from_secs(60)).await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap().as_deref(), Some("updated"));
    }

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let storage = test_storage().await;
        let key = CacheKey::stage(Stage::Pushed, SourceType::Video, "talks", &fp());

        storage.put(&key, "v", Duration::ZERO).await.unwrap();
        assert!(!storage.has(&key).await.unwrap());
        assert_eq!(storage.get(&key).await.unwrap(), None);

        assert_eq!(storage.purge_expired().await.unwrap(), 1);
    }
}
