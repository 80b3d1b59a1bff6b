//! In-memory cache, index and sink for tests and dry runs.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use autonews_shared::{DistanceMetric, Fingerprint, Item, Result, SinkSettings};
use chrono::Utc;

use crate::cache::{CacheKey, FingerprintCache};
use crate::index::{Neighbour, SimilarityIndex, nearest};
use crate::sink::{CollectionHandle, PushOutcome, Sink, SinkFilter, SinkRecord, rotation_name};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Option<String>, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: &CacheKey, value: Option<String>, ttl: Duration) {
        let now = Instant::now();
        let expires = now.checked_add(ttl).unwrap_or(now + Duration::from_secs(u32::MAX as u64));
        lock(&self.entries).insert(key.as_str().to_string(), (value, expires));
    }

    fn live(&self, key: &CacheKey) -> Option<Option<String>> {
        lock(&self.entries)
            .get(key.as_str())
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }

    /// Number of entries, live or expired.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FingerprintCache for MemoryCache {
    async fn has(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn mark(&self, key: &CacheKey, ttl: Duration) -> Result<()> {
        let existing = self.live(key).flatten();
        self.insert(key, existing, ttl);
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        Ok(self.live(key).flatten())
    }

    async fn put(&self, key: &CacheKey, value: &str, ttl: Duration) -> Result<()> {
        self.insert(key, Some(value.to_string()), ttl);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

pub struct MemoryIndex {
    metric: DistanceMetric,
    vectors: Mutex<HashMap<String, (Vec<f32>, serde_json::Value)>>,
}

impl MemoryIndex {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            vectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.vectors).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.vectors).contains_key(id)
    }
}

#[async_trait]
impl SimilarityIndex for MemoryIndex {
    async fn upsert(&self, id: &str, vector: &[f32], metadata: serde_json::Value) -> Result<()> {
        lock(&self.vectors).insert(id.to_string(), (vector.to_vec(), metadata));
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbour>> {
        let candidates: Vec<_> = lock(&self.vectors).values().cloned().collect();
        Ok(nearest(self.metric, vector, candidates, k))
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SinkState {
    collections: Vec<String>,
    records: Vec<SinkRecord>,
    categories: HashMap<String, BTreeSet<String>>,
    scripted: VecDeque<PushOutcome>,
    attempts: Vec<(CollectionHandle, Fingerprint)>,
}

/// Sink with the same category-capacity rule as the libSQL sink. Push
/// outcomes can be scripted to exercise rotation and transient failures.
pub struct MemorySink {
    settings: SinkSettings,
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new(settings: SinkSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(SinkState::default()),
        }
    }

    /// Queue outcomes returned by the next pushes, in order. A scripted
    /// `Ok` falls through to a normal write.
    pub fn script(&self, outcomes: impl IntoIterator<Item = PushOutcome>) {
        lock(&self.state).scripted.extend(outcomes);
    }

    /// Every push attempt as (handle, fingerprint), in call order.
    pub fn attempts(&self) -> Vec<(CollectionHandle, Fingerprint)> {
        lock(&self.state).attempts.clone()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        lock(&self.state).records.clone()
    }

    pub fn collections(&self) -> Vec<String> {
        lock(&self.state).collections.clone()
    }

    /// Seed a record directly, bypassing push.
    pub fn insert_record(&self, record: SinkRecord) {
        let mut state = lock(&self.state);
        if !state.collections.contains(&record.collection) {
            state.collections.push(record.collection.clone());
        }
        state.records.push(record);
    }

    fn rotate_locked(&self, state: &mut SinkState) -> CollectionHandle {
        let name = rotation_name(&self.settings.collection_prefix, Utc::now(), &state.collections);
        state.collections.push(name.clone());
        CollectionHandle(name)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn push(&self, handle: &CollectionHandle, item: &Item) -> Result<PushOutcome> {
        let mut state = lock(&self.state);
        state.attempts.push((handle.clone(), item.fingerprint.clone()));

        match state.scripted.pop_front() {
            Some(PushOutcome::Ok) | None => {}
            Some(outcome) => return Ok(outcome),
        }

        let record = SinkRecord::from_item(item, handle, Utc::now());
        let known = state.categories.entry(handle.0.clone()).or_default();
        let fresh: BTreeSet<&String> = record
            .categories
            .iter()
            .filter(|c| !known.contains(*c))
            .collect();
        if known.len() + fresh.len() > self.settings.max_categories {
            return Ok(PushOutcome::SchemaCapacityExceeded);
        }
        known.extend(record.categories.iter().cloned());

        if !state.records.iter().any(|r| r.fingerprint == record.fingerprint) {
            state.records.push(record);
        }
        Ok(PushOutcome::Ok)
    }

    async fn current_handle(&self) -> Result<CollectionHandle> {
        let mut state = lock(&self.state);
        match state.collections.last() {
            Some(name) => Ok(CollectionHandle(name.clone())),
            None => Ok(self.rotate_locked(&mut state)),
        }
    }

    async fn rotate(&self) -> Result<CollectionHandle> {
        let mut state = lock(&self.state);
        Ok(self.rotate_locked(&mut state))
    }

    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(lock(&self.state)
            .records
            .iter()
            .any(|r| &r.fingerprint == fingerprint))
    }

    async fn query(&self, filter: &SinkFilter) -> Result<Vec<SinkRecord>> {
        let mut records: Vec<SinkRecord> = lock(&self.state)
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.edited_at.cmp(&a.edited_at));
        Ok(records)
    }

    async fn record_feedback(
        &self,
        fingerprint: &Fingerprint,
        rating: Option<f32>,
        notes: Option<&str>,
    ) -> Result<bool> {
        let mut state = lock(&self.state);
        let Some(record) = state
            .records
            .iter_mut()
            .find(|r| &r.fingerprint == fingerprint)
        else {
            return Ok(false);
        };
        if rating.is_some() {
            record.user_rating = rating;
        }
        if let Some(notes) = notes {
            record.notes = notes.to_string();
        }
        record.edited_at = Utc::now().max(record.created_at + chrono::Duration::milliseconds(1));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use autonews_shared::{Classification, RawItem, SourceConfig, SourceType};
    use serde_json::json;

    use super::*;
    use crate::cache::Stage;

    fn item(id: &str, categories: &[&str]) -> Item {
        let source = SourceConfig::new("HN", SourceType::Forum, "https://news.example.com/rss");
        let raw = RawItem {
            native_id: Some(id.into()),
            title: format!("Item {id}"),
            text: "body".into(),
            ..Default::default()
        };
        let mut item = Item::from_raw(raw, &source, Utc::now()).unwrap();
        item.classification = Some(Classification {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        });
        item
    }

    #[tokio::test]
    async fn cache_respects_ttl() {
        let cache = MemoryCache::new();
        let fp = Fingerprint::compute(SourceType::Feed, "HN", "1");
        let live = CacheKey::llm(Stage::Summarize, "p", "m", SourceType::Feed, "HN", &fp);
        let dead = CacheKey::stage(Stage::Pushed, SourceType::Feed, "HN", &fp);

        cache.put(&live, "v", Duration::from_secs(60)).await.unwrap();
        cache.mark(&dead, Duration::ZERO).await.unwrap();

        assert!(cache.has(&live).await.unwrap());
        assert_eq!(cache.get(&live).await.unwrap().as_deref(), Some("v"));
        assert!(!cache.has(&dead).await.unwrap());
    }

    #[tokio::test]
    async fn index_orders_by_distance() {
        let index = MemoryIndex::new(DistanceMetric::L2);
        index.upsert("far", &[10.0, 10.0], json!("far")).await.unwrap();
        index.upsert("near", &[1.0, 1.0], json!("near")).await.unwrap();

        let hits = index.query(&[0.0, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata, json!("near"));
        assert!(index.contains("far"));
    }

    #[tokio::test]
    async fn scripted_outcomes_come_first() {
        let sink = MemorySink::new(SinkSettings::default());
        sink.script([PushOutcome::SchemaCapacityExceeded, PushOutcome::Ok]);
        let handle = sink.current_handle().await.unwrap();
        let item = item("1", &["A"]);

        assert_eq!(
            sink.push(&handle, &item).await.unwrap(),
            PushOutcome::SchemaCapacityExceeded
        );
        assert!(!sink.contains(&item.fingerprint).await.unwrap());
        assert_eq!(sink.push(&handle, &item).await.unwrap(), PushOutcome::Ok);
        assert!(sink.contains(&item.fingerprint).await.unwrap());
        assert_eq!(sink.attempts().len(), 2);
    }

    #[tokio::test]
    async fn capacity_is_per_collection() {
        let settings = SinkSettings {
            max_categories: 1,
            ..SinkSettings::default()
        };
        let sink = MemorySink::new(settings);
        let first = sink.current_handle().await.unwrap();

        assert_eq!(sink.push(&first, &item("1", &["A"])).await.unwrap(), PushOutcome::Ok);
        assert_eq!(
            sink.push(&first, &item("2", &["B"])).await.unwrap(),
            PushOutcome::SchemaCapacityExceeded
        );

        let second = sink.rotate().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(sink.push(&second, &item("2", &["B"])).await.unwrap(), PushOutcome::Ok);
        assert_eq!(sink.collections().len(), 2);
    }

    #[tokio::test]
    async fn feedback_updates_record() {
        let sink = MemorySink::new(SinkSettings::default());
        let handle = sink.current_handle().await.unwrap();
        let item = item("1", &[]);
        sink.push(&handle, &item).await.unwrap();

        assert!(sink.record_feedback(&item.fingerprint, None, Some("later")).await.unwrap());
        let record = &sink.records()[0];
        assert_eq!(record.notes, "later");
        assert_eq!(record.user_rating, None);
        assert!(record.is_read());
    }
}
