//! Destination store for pushed items.
//!
//! Items land in dated collections. When a collection hits a structural
//! limit the push reports [`PushOutcome::SchemaCapacityExceeded`] and the
//! caller rotates to a fresh collection.

use std::collections::BTreeSet;

use async_trait::async_trait;
use autonews_shared::{AutoNewsError, Fingerprint, Item, Result, SinkSettings, SourceType};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use libsql::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{check_writable, storage_err};

/// Name of a sink collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionHandle(pub String);

impl std::fmt::Display for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a single push attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Ok,
    /// The collection cannot take this item; rotate before retrying.
    SchemaCapacityExceeded,
    /// The write failed in a way that may succeed later.
    TransientError(String),
}

/// A pushed item as read back from the sink, including user feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub fingerprint: Fingerprint,
    pub collection: String,
    pub source_type: SourceType,
    pub source_list: String,
    pub title: String,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub text: String,
    pub topics: Vec<String>,
    pub categories: Vec<String>,
    /// Rank rating assigned by the pipeline.
    pub rating: Option<f32>,
    /// Rating the user gave the item.
    pub user_rating: Option<f32>,
    pub notes: String,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub edited_at: DateTime<Utc>,
}

impl SinkRecord {
    /// Build the record a push of `item` into `collection` creates.
    pub fn from_item(item: &Item, collection: &CollectionHandle, now: DateTime<Utc>) -> Self {
        let classification = item.classification.clone().unwrap_or_default();
        Self {
            fingerprint: item.fingerprint.clone(),
            collection: collection.0.clone(),
            source_type: item.source_type,
            source_list: item.source_list.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
            summary: item.summary.clone(),
            text: item.text.clone(),
            topics: classification.topics,
            categories: classification.categories,
            rating: item.rating,
            user_rating: None,
            notes: String::new(),
            published_at: item.published_at,
            created_at: now,
            edited_at: now,
        }
    }

    /// The user opened or annotated the item after it was pushed.
    pub fn is_read(&self) -> bool {
        self.edited_at > self.created_at
    }
}

/// Read-path filter for [`Sink::query`].
#[derive(Debug, Clone, Default)]
pub struct SinkFilter {
    /// Only items edited at or after this instant.
    pub edited_since: Option<DateTime<Utc>>,
    /// Only items in this collection.
    pub collection: Option<String>,
}

impl SinkFilter {
    pub fn matches(&self, record: &SinkRecord) -> bool {
        self.edited_since.is_none_or(|since| record.edited_at >= since)
            && self
                .collection
                .as_deref()
                .is_none_or(|c| record.collection == c)
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Append `item` to the collection `handle`.
    ///
    /// `Err` is reserved for loss of the store itself.
    async fn push(&self, handle: &CollectionHandle, item: &Item) -> Result<PushOutcome>;

    /// Collection new items go to, created on first use.
    async fn current_handle(&self) -> Result<CollectionHandle>;

    /// Create and return a fresh collection.
    async fn rotate(&self) -> Result<CollectionHandle>;

    /// Whether an item with `fingerprint` was already pushed.
    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool>;

    async fn query(&self, filter: &SinkFilter) -> Result<Vec<SinkRecord>>;

    /// Store user feedback. Returns `false` when no such item exists.
    async fn record_feedback(
        &self,
        fingerprint: &Fingerprint,
        rating: Option<f32>,
        notes: Option<&str>,
    ) -> Result<bool>;
}

/// Collection name for a rotation at `now`: `{prefix} - YYYY-MM`, suffixed
/// with ` (2)`, ` (3)`, ... while the name is taken.
pub fn rotation_name<S: AsRef<str>>(prefix: &str, now: DateTime<Utc>, existing: &[S]) -> String {
    let base = format!("{prefix} - {:04}-{:02}", now.year(), now.month());
    let taken = |name: &str| existing.iter().any(|e| e.as_ref() == name);

    if !taken(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{base} ({n})"))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

// ---------------------------------------------------------------------------
// libSQL implementation
// ---------------------------------------------------------------------------

/// Sink backed by the `sink_*` tables, enforcing `max_categories` distinct
/// category values per collection.
pub struct LibsqlSink {
    conn: Connection,
    settings: SinkSettings,
    readonly: bool,
}

impl LibsqlSink {
    pub(crate) fn new(conn: Connection, settings: SinkSettings, readonly: bool) -> Self {
        Self {
            conn,
            settings,
            readonly,
        }
    }

    async fn collection_names(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query("SELECT name FROM sink_collections ORDER BY id", params![])
            .await
            .map_err(storage_err)?;

        let mut names = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            names.push(row.get::<String>(0).map_err(storage_err)?);
        }
        Ok(names)
    }

    async fn known_categories(&self, collection: &str) -> Result<BTreeSet<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT category FROM sink_categories WHERE collection = ?1",
                params![collection],
            )
            .await
            .map_err(storage_err)?;

        let mut categories = BTreeSet::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            categories.insert(row.get::<String>(0).map_err(storage_err)?);
        }
        Ok(categories)
    }

    async fn write_item(&self, record: &SinkRecord, new_categories: &[String]) -> libsql::Result<()> {
        let topics = serde_json::to_string(&record.topics).unwrap_or_else(|_| "[]".into());
        let categories = serde_json::to_string(&record.categories).unwrap_or_else(|_| "[]".into());

        let tx = self.conn.transaction().await?;
        tx.execute(
            "INSERT INTO sink_items (fingerprint, collection, source_type, source_list, title, url,
                 summary, body, topics_json, categories_json, rating, notes,
                 published_at, created_at, edited_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, '', ?12, ?13, ?13)
             ON CONFLICT(fingerprint) DO NOTHING",
            params![
                record.fingerprint.as_str(),
                record.collection.as_str(),
                record.source_type.as_str(),
                record.source_list.as_str(),
                record.title.as_str(),
                record.url.as_deref(),
                record.summary.as_deref(),
                record.text.as_str(),
                topics,
                categories,
                record.rating.map(f64::from),
                record.published_at.timestamp_millis(),
                record.created_at.timestamp_millis(),
            ],
        )
        .await?;
        for category in new_categories {
            tx.execute(
                "INSERT OR IGNORE INTO sink_categories (collection, category) VALUES (?1, ?2)",
                params![record.collection.as_str(), category.as_str()],
            )
            .await?;
        }
        tx.commit().await
    }
}

/// Lock contention is worth retrying; anything else means the store is gone.
fn is_transient(err: &libsql::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("locked") || msg.contains("busy")
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AutoNewsError::Storage(format!("invalid timestamp {ms}")))
}

fn row_to_record(row: &libsql::Row) -> Result<SinkRecord> {
    let fingerprint: String = row.get(0).map_err(storage_err)?;
    let source_type: String = row.get(2).map_err(storage_err)?;
    let topics: String = row.get(8).map_err(storage_err)?;
    let categories: String = row.get(9).map_err(storage_err)?;

    Ok(SinkRecord {
        fingerprint: fingerprint.parse()?,
        collection: row.get(1).map_err(storage_err)?,
        source_type: source_type.parse()?,
        source_list: row.get(3).map_err(storage_err)?,
        title: row.get(4).map_err(storage_err)?,
        url: row.get::<String>(5).ok(),
        summary: row.get::<String>(6).ok(),
        text: row.get(7).map_err(storage_err)?,
        topics: serde_json::from_str(&topics).unwrap_or_default(),
        categories: serde_json::from_str(&categories).unwrap_or_default(),
        rating: row.get::<f64>(10).ok().map(|v| v as f32),
        user_rating: row.get::<f64>(11).ok().map(|v| v as f32),
        notes: row.get::<String>(12).unwrap_or_default(),
        published_at: millis_to_utc(row.get(13).map_err(storage_err)?)?,
        created_at: millis_to_utc(row.get(14).map_err(storage_err)?)?,
        edited_at: millis_to_utc(row.get(15).map_err(storage_err)?)?,
    })
}

#[async_trait]
impl Sink for LibsqlSink {
    async fn push(&self, handle: &CollectionHandle, item: &Item) -> Result<PushOutcome> {
        check_writable(self.readonly)?;

        let record = SinkRecord::from_item(item, handle, Utc::now());
        let known = self.known_categories(&handle.0).await?;
        let new_categories: Vec<String> = record
            .categories
            .iter()
            .filter(|c| !known.contains(*c))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if known.len() + new_categories.len() > self.settings.max_categories {
            debug!(
                collection = %handle,
                known = known.len(),
                new = new_categories.len(),
                max = self.settings.max_categories,
                "category capacity exceeded"
            );
            return Ok(PushOutcome::SchemaCapacityExceeded);
        }

        match self.write_item(&record, &new_categories).await {
            Ok(()) => Ok(PushOutcome::Ok),
            Err(e) if is_transient(&e) => {
                warn!(fingerprint = %item.fingerprint, error = %e, "transient sink write failure");
                Ok(PushOutcome::TransientError(e.to_string()))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn current_handle(&self) -> Result<CollectionHandle> {
        match self.collection_names().await?.pop() {
            Some(name) => Ok(CollectionHandle(name)),
            None => self.rotate().await,
        }
    }

    async fn rotate(&self) -> Result<CollectionHandle> {
        check_writable(self.readonly)?;
        let existing = self.collection_names().await?;
        let now = Utc::now();
        let name = rotation_name(&self.settings.collection_prefix, now, &existing);

        self.conn
            .execute(
                "INSERT INTO sink_collections (name, created_at) VALUES (?1, ?2)",
                params![name.as_str(), now.timestamp_millis()],
            )
            .await
            .map_err(storage_err)?;

        info!(collection = %name, "rotated sink collection");
        Ok(CollectionHandle(name))
    }

    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM sink_items WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(rows.next().await.map_err(storage_err)?.is_some())
    }

    async fn query(&self, filter: &SinkFilter) -> Result<Vec<SinkRecord>> {
        let since = filter
            .edited_since
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MIN);
        let mut rows = self
            .conn
            .query(
                "SELECT fingerprint, collection, source_type, source_list, title, url, summary,
                        body, topics_json, categories_json, rating, user_rating, notes,
                        published_at, created_at, edited_at
                 FROM sink_items
                 WHERE edited_at >= ?1 AND (?2 IS NULL OR collection = ?2)
                 ORDER BY edited_at DESC",
                params![since, filter.collection.as_deref()],
            )
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn record_feedback(
        &self,
        fingerprint: &Fingerprint,
        rating: Option<f32>,
        notes: Option<&str>,
    ) -> Result<bool> {
        check_writable(self.readonly)?;
        let updated = self
            .conn
            .execute(
                "UPDATE sink_items SET
                   user_rating = COALESCE(?2, user_rating),
                   notes = COALESCE(?3, notes),
                   edited_at = MAX(?4, created_at + 1)
                 WHERE fingerprint = ?1",
                params![
                    fingerprint.as_str(),
                    rating.map(f64::from),
                    notes,
                    Utc::now().timestamp_millis()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(updated > 0)
    }
}
