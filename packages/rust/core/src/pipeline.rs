//! The ingestion pipeline: Pull → Dedup → Score → Summarize → Rank → Push.
//!
//! One source batch is processed at a time. Score, Summarize and Rank fan out
//! over items with bounded concurrency; Push is sequential so rotation
//! happens at most once per capacity failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use autonews_extract::{Extraction, Extractor};
use autonews_shared::{
    AutoNewsError, Classification, Item, PipelineConfig, Relevance, Result, SourceConfig,
    SourceType, retry,
};
use autonews_storage::{
    CacheKey, CollectionHandle, FingerprintCache, Neighbour, PushOutcome, SimilarityIndex, Sink,
    Stage,
};

use crate::connectors::{ConnectorRegistry, Pulled};
use crate::generation::{GenerationService, truncate_chars};

/// Rating given to every item when classification is disabled.
pub const RATING_CLASSIFICATION_DISABLED: f32 = -0.02;
/// Rating given when the classifier reply could not be parsed.
pub const RATING_PARSE_FAILURE: f32 = -0.01;

const EMBEDDING_INPUT_CHARS: usize = 8_000;
const LABEL_MAX_CHARS: usize = 20;

// ---------------------------------------------------------------------------
// Run control and reporting
// ---------------------------------------------------------------------------

/// Run-level cancellation, checked between items and between sources.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Pull,
    Dedup,
    Score,
    Summarize,
    Rank,
    Push,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Dedup => "dedup",
            Self::Score => "score",
            Self::Summarize => "summarize",
            Self::Rank => "rank",
            Self::Push => "push",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a source batch starts.
    fn source_started(&self, name: &str, current: usize, total: usize);
    /// Called when a stage starts with `items` items.
    fn stage(&self, source: &str, stage: PipelineStage, items: usize);
    /// Called after each successful push.
    fn item_pushed(&self, title: &str);
    /// Called when a source batch ends, successfully or not.
    fn source_finished(&self, report: &SourceReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn source_started(&self, _name: &str, _current: usize, _total: usize) {}
    fn stage(&self, _source: &str, _stage: PipelineStage, _items: usize) {}
    fn item_pushed(&self, _title: &str) {}
    fn source_finished(&self, _report: &SourceReport) {}
}

/// Counters for one source batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceReport {
    pub source: String,
    pub not_modified: bool,
    pub pulled: usize,
    /// Dropped at Pull: same fingerprint twice in the batch, or no identity.
    pub batch_duplicates: usize,
    /// Dropped at Dedup: already pushed.
    pub already_seen: usize,
    pub unscored: usize,
    pub summarize_failed: usize,
    pub rank_failed: usize,
    pub below_threshold: usize,
    pub pushed: usize,
    pub push_failed: usize,
    pub rotations: usize,
    /// Source-level failure (bad configuration, unreachable source).
    pub error: Option<String>,
}

impl SourceReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub sources: Vec<SourceReport>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn pushed(&self) -> usize {
        self.sources.iter().map(|s| s.pushed).sum()
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| s.error.is_some())
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Relevance from the nearest neighbours: `1 - min_distance` over the
/// neighbours within `max_distance`, or `Unscored` if there are none.
pub fn relevance_from(neighbours: &[Neighbour], max_distance: f32) -> Relevance {
    neighbours
        .iter()
        .map(|n| n.distance)
        .filter(|d| d.is_finite() && *d <= max_distance)
        .min_by(f32::total_cmp)
        .map(|d| Relevance::Scored((1.0 - d).clamp(0.0, 1.0)))
        .unwrap_or(Relevance::Unscored)
}

/// Whether a rating survives Rank. Negative ratings are sentinels and always
/// survive.
pub fn passes_rank(rating: f32, min_rank_score: f32) -> bool {
    rating < 0.0 || rating >= min_rank_score
}

/// The ratings that survive Rank, in input order.
pub fn rank_filter(ratings: &[f32], min_rank_score: f32) -> Vec<f32> {
    ratings
        .iter()
        .copied()
        .filter(|r| passes_rank(*r, min_rank_score))
        .collect()
}

/// First `top_k` labels, each cut to 20 characters.
pub fn top_labels(labels: &[String], top_k: usize) -> Vec<String> {
    labels
        .iter()
        .take(top_k)
        .map(|l| truncate_chars(l.trim(), LABEL_MAX_CHARS).trim_end().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn embedding_input(item: &Item) -> String {
    format!("{}\n\n{}", item.title, truncate_chars(&item.text, EMBEDDING_INPUT_CHARS))
}

fn pushed_key(item: &Item) -> CacheKey {
    CacheKey::stage(Stage::Pushed, item.source_type, &item.source_list, &item.fingerprint)
}

/// Run `futures` with at most `limit` in flight, returning outputs in input
/// order. A panicked task is logged and omitted.
async fn fan_out<T, Fut>(limit: usize, futures: Vec<Fut>) -> Vec<T>
where
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    let total = futures.len();

    for (idx, fut) in futures.into_iter().enumerate() {
        let sem = semaphore.clone();
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            (idx, fut.await)
        });
    }

    let mut results = Vec::with_capacity(total);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => results.push(entry),
            Err(e) => warn!(error = %e, "pipeline task failed"),
        }
    }
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, value)| value).collect()
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// External collaborators of the pipeline.
pub struct Collaborators {
    pub connectors: ConnectorRegistry,
    /// Should already be throttled (see [`crate::throttle::Throttled`]).
    pub generator: Arc<dyn GenerationService>,
    pub cache: Arc<dyn FingerprintCache>,
    pub index: Arc<dyn SimilarityIndex>,
    pub sink: Arc<dyn Sink>,
    /// Used to re-fetch items that arrive without a body.
    pub extractor: Extractor,
}

pub struct Pipeline {
    inner: Arc<Inner>,
    cancel: CancelFlag,
}

struct Inner {
    config: PipelineConfig,
    connectors: ConnectorRegistry,
    generator: Arc<dyn GenerationService>,
    cache: Arc<dyn FingerprintCache>,
    index: Arc<dyn SimilarityIndex>,
    sink: Arc<dyn Sink>,
    extractor: Extractor,
}

enum Ranked {
    Kept(Item),
    BelowThreshold,
    Failed,
}

enum Pushed {
    Ok,
    Failed(String),
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            connectors,
            generator,
            cache,
            index,
            sink,
            extractor,
        } = collaborators;
        Self {
            inner: Arc::new(Inner {
                config,
                connectors,
                generator,
                cache,
                index,
                sink,
                extractor,
            }),
            cancel: CancelFlag::new(),
        }
    }

    /// Share an externally owned cancel flag (e.g. wired to Ctrl-C).
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run every enabled source once.
    ///
    /// Source-level failures are recorded in the summary and the run moves
    /// on; only a storage failure of the cache or the sink aborts the run.
    #[instrument(skip_all, fields(sources = sources.len()))]
    pub async fn run(
        &self,
        sources: &[SourceConfig],
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let enabled: Vec<&SourceConfig> = sources.iter().filter(|s| s.enabled).collect();
        let mut summary = RunSummary::default();

        info!(enabled = enabled.len(), "starting pipeline run");

        for (i, source) in enabled.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            progress.source_started(&source.name, i + 1, enabled.len());

            let mut report = SourceReport::new(&source.name);
            match self.run_source(source, &mut report, progress).await {
                Ok(()) => {}
                Err(e @ AutoNewsError::Storage(_)) => {
                    warn!(source = %source.name, error = %e, "storage failure, aborting run");
                    return Err(e);
                }
                Err(e) => {
                    warn!(source = %source.name, error = %e, "source failed");
                    report.error = Some(e.to_string());
                }
            }
            progress.source_finished(&report);
            summary.sources.push(report);
        }

        summary.cancelled |= self.cancel.is_cancelled();
        summary.elapsed = start.elapsed();
        info!(
            pushed = summary.pushed(),
            failed_sources = summary.failed_sources().count(),
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed.as_millis(),
            "pipeline run complete"
        );
        Ok(summary)
    }

    #[instrument(skip_all, fields(source = %source.name, source_type = %source.source_type))]
    async fn run_source(
        &self,
        source: &SourceConfig,
        report: &mut SourceReport,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        source.validate()?;
        let source = Arc::new(source.clone());
        let inner = &self.inner;

        // --- Pull ---
        progress.stage(&source.name, PipelineStage::Pull, 0);
        let started = Utc::now();
        let Some(items) = inner.pull(&source, started, report).await? else {
            return inner.record_attempt(&source, started).await;
        };

        self.process(items, &source, report, progress).await?;

        // Items left behind must come back on the next pull, so the
        // conditional-fetch marker only moves once the batch is settled.
        if self.cancel.is_cancelled() || report.push_failed > 0 {
            info!(
                push_failed = report.push_failed,
                cancelled = self.cancel.is_cancelled(),
                "items pending, keeping the previous pull marker"
            );
            return Ok(());
        }
        inner.record_attempt(&source, started).await
    }

    /// Dedup through Push for one pulled batch.
    async fn process(
        &self,
        items: Vec<Item>,
        source: &Arc<SourceConfig>,
        report: &mut SourceReport,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let inner = &self.inner;

        // --- Dedup ---
        progress.stage(&source.name, PipelineStage::Dedup, items.len());
        let items = inner.dedup(items, report).await?;
        if items.is_empty() || self.cancel.is_cancelled() {
            return Ok(());
        }

        // --- Score ---
        progress.stage(&source.name, PipelineStage::Score, items.len());
        let futures = items
            .into_iter()
            .map(|item| {
                let inner = inner.clone();
                async move { inner.score(item).await }
            })
            .collect::<Vec<_>>();
        let items: Vec<Item> = fan_out(inner.config.concurrency, futures).await;
        report.unscored = items
            .iter()
            .filter(|i| i.relevance == Relevance::Unscored)
            .count();
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        // --- Summarize ---
        progress.stage(&source.name, PipelineStage::Summarize, items.len());
        let futures = items
            .into_iter()
            .map(|item| {
                let inner = inner.clone();
                let source = source.clone();
                async move { inner.summarize(item, &source).await }
            })
            .collect::<Vec<_>>();
        let mut summarized = Vec::new();
        for result in fan_out(inner.config.concurrency, futures).await {
            match result? {
                Some(item) => summarized.push(item),
                None => report.summarize_failed += 1,
            }
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        // --- Rank ---
        progress.stage(&source.name, PipelineStage::Rank, summarized.len());
        let futures = summarized
            .into_iter()
            .map(|item| {
                let inner = inner.clone();
                async move { inner.rank(item).await }
            })
            .collect::<Vec<_>>();
        let mut ranked = Vec::new();
        for result in fan_out(inner.config.concurrency, futures).await {
            match result? {
                Ranked::Kept(item) => ranked.push(item),
                Ranked::BelowThreshold => report.below_threshold += 1,
                Ranked::Failed => report.rank_failed += 1,
            }
        }

        // --- Push ---
        progress.stage(&source.name, PipelineStage::Push, ranked.len());
        self.push_all(ranked, report, progress).await
    }

    async fn push_all(
        &self,
        mut items: Vec<Item>,
        report: &mut SourceReport,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        items.sort_by(|a, b| {
            let ra = a.rating.unwrap_or(f32::MIN);
            let rb = b.rating.unwrap_or(f32::MIN);
            rb.total_cmp(&ra)
        });

        let inner = &self.inner;
        let mut handle = inner.sink.current_handle().await?;
        for mut item in items {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(c) = item.classification.as_mut() {
                c.topics = top_labels(&c.topics, inner.config.top_k);
                c.categories = top_labels(&c.categories, inner.config.top_k);
            }

            match inner.push(&mut handle, &item, report).await? {
                Pushed::Ok => {
                    report.pushed += 1;
                    progress.item_pushed(&item.title);
                    inner.after_push(&item).await?;
                }
                Pushed::Failed(reason) => {
                    warn!(fingerprint = %item.fingerprint, %reason, "push failed");
                    report.push_failed += 1;
                }
            }
        }
        Ok(())
    }
}

impl Inner {
    async fn last_attempt(&self, source: &SourceConfig) -> Result<Option<DateTime<Utc>>> {
        let key = CacheKey::last_attempt(source.source_type, &source.name);
        Ok(self
            .cache
            .get(&key)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    async fn record_attempt(&self, source: &SourceConfig, started: DateTime<Utc>) -> Result<()> {
        self.cache
            .put(
                &CacheKey::last_attempt(source.source_type, &source.name),
                &started.to_rfc3339(),
                self.config.dedup_ttl,
            )
            .await
    }

    /// `None` when the source reported no change.
    async fn pull(
        &self,
        source: &SourceConfig,
        started: DateTime<Utc>,
        report: &mut SourceReport,
    ) -> Result<Option<Vec<Item>>> {
        let connector = self.connectors.get(source.source_type)?;
        let since = self.last_attempt(source).await?;
        let pulled = connector.pull(source, since).await?;

        let raw = match pulled {
            Pulled::NotModified => {
                info!(connector = connector.name(), "source not modified");
                report.not_modified = true;
                return Ok(None);
            }
            Pulled::Items(raw) => raw,
        };

        report.pulled = raw.len();
        let mut seen = HashSet::new();
        let items: Vec<Item> = raw
            .into_iter()
            .filter_map(|r| Item::from_raw(r, source, started))
            .filter(|item| seen.insert(item.fingerprint.clone()))
            .collect();
        report.batch_duplicates = report.pulled - items.len();

        debug!(pulled = report.pulled, kept = items.len(), "pull complete");
        Ok(Some(items))
    }

    async fn dedup(&self, items: Vec<Item>, report: &mut SourceReport) -> Result<Vec<Item>> {
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            if self.cache.has(&pushed_key(&item)).await? || self.sink.contains(&item.fingerprint).await? {
                debug!(fingerprint = %item.fingerprint, "already pushed");
                report.already_seen += 1;
                continue;
            }
            fresh.push(item);
        }
        Ok(fresh)
    }

    /// Attach embedding and relevance. Never drops the item.
    async fn score(&self, mut item: Item) -> Item {
        let vector = match self.generator.embed(&embedding_input(&item)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(fingerprint = %item.fingerprint, error = %e, "embedding failed, item stays unscored");
                return item;
            }
        };

        match self.index.query(&vector, self.config.neighbours).await {
            Ok(neighbours) => item.relevance = relevance_from(&neighbours, self.config.max_distance),
            Err(e) => warn!(fingerprint = %item.fingerprint, error = %e, "similarity query failed"),
        }
        item.embedding = Some(vector);
        item
    }

    /// `Ok(None)` drops the item.
    async fn summarize(&self, mut item: Item, source: &SourceConfig) -> Result<Option<Item>> {
        let key = CacheKey::llm(
            Stage::Summarize,
            self.generator.provider(),
            self.generator.model(),
            item.source_type,
            &item.source_list,
            &item.fingerprint,
        );
        if let Some(summary) = self.cache.get(&key).await? {
            debug!(fingerprint = %item.fingerprint, "summary cache hit");
            item.summary = Some(summary);
            return Ok(Some(item));
        }

        if item.text.trim().is_empty() {
            item.text = self.refetch_body(&item, source).await;
        }
        if item.text.trim().is_empty() {
            warn!(fingerprint = %item.fingerprint, "no content to summarize");
            return Ok(None);
        }

        let input = format!("[Source: {}]\n\n{}", item.source_list, item.text);
        match self
            .generator
            .summarize(&input, self.config.summary_max_length, self.config.target_language.as_deref())
            .await
        {
            Ok(summary) => {
                self.cache.put(&key, &summary, self.config.llm_ttl).await?;
                item.summary = Some(summary);
                Ok(Some(item))
            }
            Err(e) => {
                warn!(fingerprint = %item.fingerprint, error = %e, "summarize failed, dropping item");
                Ok(None)
            }
        }
    }

    async fn refetch_body(&self, item: &Item, source: &SourceConfig) -> String {
        let Some(url) = item.url.as_deref().and_then(|u| Url::parse(u).ok()) else {
            return String::new();
        };
        match self.extractor.extract(source, &url, None).await {
            Ok(Extraction::Article(article)) => {
                debug!(%url, chars = article.text.len(), "fetched body for summary");
                article.text
            }
            Ok(Extraction::NotModified) => String::new(),
            Err(e) => {
                warn!(%url, error = %e, "body fetch failed");
                String::new()
            }
        }
    }

    async fn rank(&self, mut item: Item) -> Result<Ranked> {
        if !self.config.enable_classification {
            item.rating = Some(RATING_CLASSIFICATION_DISABLED);
            return Ok(Ranked::Kept(item));
        }

        let key = CacheKey::llm(
            Stage::Rank,
            self.generator.provider(),
            self.generator.model(),
            item.source_type,
            &item.source_list,
            &item.fingerprint,
        );
        let cached = self
            .cache
            .get(&key)
            .await?
            .and_then(|raw| serde_json::from_str::<Classification>(&raw).ok());

        let classification = match cached {
            Some(c) => c,
            None => {
                let input = item.summary.as_deref().unwrap_or(&item.text);
                let input = truncate_chars(input, self.config.summary_max_length);
                match self.generator.classify_and_score(input).await {
                    Ok(c) => {
                        let encoded = serde_json::to_string(&c)
                            .map_err(|e| AutoNewsError::Conversion(e.to_string()))?;
                        self.cache.put(&key, &encoded, self.config.llm_ttl).await?;
                        c
                    }
                    Err(e @ AutoNewsError::Parse { .. }) => {
                        warn!(fingerprint = %item.fingerprint, error = %e, "unparsable classification, keeping item");
                        item.rating = Some(RATING_PARSE_FAILURE);
                        return Ok(Ranked::Kept(item));
                    }
                    Err(e) => {
                        warn!(fingerprint = %item.fingerprint, error = %e, "classification failed, dropping item");
                        return Ok(Ranked::Failed);
                    }
                }
            }
        };

        let rating = classification.score * self.config.rank_scale;
        item.classification = Some(classification);
        item.rating = Some(rating);

        if passes_rank(rating, self.config.min_rank_score) {
            Ok(Ranked::Kept(item))
        } else {
            debug!(fingerprint = %item.fingerprint, rating, min = self.config.min_rank_score, "below rank threshold");
            Ok(Ranked::BelowThreshold)
        }
    }

    /// Push with transient retry. On capacity failure rotate once and retry
    /// exactly once on the fresh collection.
    async fn push(
        &self,
        handle: &mut CollectionHandle,
        item: &Item,
        report: &mut SourceReport,
    ) -> Result<Pushed> {
        let current = handle.clone();
        let outcome = retry(&self.config.push_retry, "sink push", || async {
            match self.sink.push(&current, item).await? {
                PushOutcome::TransientError(msg) => Err(AutoNewsError::Network(msg)),
                other => Ok(other),
            }
        })
        .await;

        match outcome {
            Ok(PushOutcome::Ok) => Ok(Pushed::Ok),
            Ok(PushOutcome::SchemaCapacityExceeded) => {
                let fresh = self.sink.rotate().await?;
                info!(from = %handle, to = %fresh, "sink capacity exceeded, rotated collection");
                *handle = fresh;
                report.rotations += 1;

                Ok(match self.sink.push(handle, item).await? {
                    PushOutcome::Ok => Pushed::Ok,
                    PushOutcome::SchemaCapacityExceeded => {
                        Pushed::Failed("capacity exceeded on a fresh collection".into())
                    }
                    PushOutcome::TransientError(msg) => Pushed::Failed(msg),
                })
            }
            Ok(PushOutcome::TransientError(msg)) => Ok(Pushed::Failed(msg)),
            Err(e @ AutoNewsError::Storage(_)) => Err(e),
            Err(e) => Ok(Pushed::Failed(e.to_string())),
        }
    }

    /// Mark the item pushed and index its embedding.
    async fn after_push(&self, item: &Item) -> Result<()> {
        self.cache.mark(&pushed_key(item), self.config.dedup_ttl).await?;

        let Some(vector) = item.embedding.as_deref() else {
            return Ok(());
        };
        let marker = CacheKey::embedding(item.source_type, &item.source_list, &item.fingerprint);
        if self.cache.has(&marker).await? {
            return Ok(());
        }

        let metadata = json!({
            "fingerprint": item.fingerprint,
            "title": item.title,
            "url": item.url,
            "source_type": item.source_type,
            "source_list": item.source_list,
        });
        match self.index.upsert(item.fingerprint.as_str(), vector, metadata).await {
            Ok(()) => self.cache.mark(&marker, self.config.embedding_ttl).await?,
            Err(e) => warn!(fingerprint = %item.fingerprint, error = %e, "index upsert failed"),
        }
        Ok(())
    }
}

/// Source types the default registry cannot serve without an external
/// connector.
pub fn needs_external_connector(source_type: SourceType) -> bool {
    matches!(source_type, SourceType::DocumentInbox)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use autonews_shared::{ExtractionConfig, RawItem, RetryPolicy, SinkSettings};
    use autonews_storage::{MemoryCache, MemoryIndex, MemorySink};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::connectors::{FeedConnector, SourceConnector};

    // -- fakes ---------------------------------------------------------------

    /// Scores by title: "title=score" lookups, default 0.8. Titles starting
    /// with "garbled" produce a parse failure, "broken" a generation failure.
    #[derive(Default)]
    struct ScriptedGenerator {
        scores: HashMap<String, f32>,
        fail_embed: bool,
        embeds: AtomicUsize,
        summaries: AtomicUsize,
        classifications: AtomicUsize,
    }

    #[async_trait]
    impl GenerationService for ScriptedGenerator {
        async fn summarize(&self, text: &str, _: usize, _: Option<&str>) -> Result<String> {
            self.summaries.fetch_add(1, Ordering::SeqCst);
            if text.contains("broken") {
                return Err(AutoNewsError::Generation("model error".into()));
            }
            Ok(format!("summary: {}", truncate_chars(text, 60)))
        }

        async fn classify_and_score(&self, text: &str) -> Result<Classification> {
            self.classifications.fetch_add(1, Ordering::SeqCst);
            if text.contains("garbled") {
                return Err(AutoNewsError::parse("no JSON"));
            }
            let score = self
                .scores
                .iter()
                .find(|(title, _)| text.contains(title.as_str()))
                .map(|(_, s)| *s)
                .unwrap_or(0.8);
            Ok(Classification {
                topics: vec![
                    "a very long topic name that exceeds the limit".into(),
                    "second".into(),
                    "third".into(),
                    "fourth".into(),
                ],
                categories: vec!["Engineering".into()],
                score,
                feedback: "ok".into(),
            })
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.embeds.fetch_add(1, Ordering::SeqCst);
            if self.fail_embed {
                return Err(AutoNewsError::Network("down".into()));
            }
            let len = text.len() as f32;
            Ok(vec![1.0, len.sin(), len.cos()])
        }

        fn provider(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "v1"
        }
    }

    struct StaticConnector {
        items: Vec<RawItem>,
        sinces: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    impl StaticConnector {
        fn new(items: Vec<RawItem>) -> Self {
            Self {
                items,
                sinces: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceConnector for StaticConnector {
        async fn pull(&self, _: &SourceConfig, since: Option<DateTime<Utc>>) -> Result<Pulled> {
            self.sinces.lock().unwrap().push(since);
            Ok(Pulled::Items(self.items.clone()))
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    /// Cache whose every call fails like a lost database.
    struct LostCache;

    #[async_trait]
    impl FingerprintCache for LostCache {
        async fn has(&self, _: &CacheKey) -> Result<bool> {
            Err(AutoNewsError::Storage("database is gone".into()))
        }
        async fn mark(&self, _: &CacheKey, _: Duration) -> Result<()> {
            Err(AutoNewsError::Storage("database is gone".into()))
        }
        async fn get(&self, _: &CacheKey) -> Result<Option<String>> {
            Err(AutoNewsError::Storage("database is gone".into()))
        }
        async fn put(&self, _: &CacheKey, _: &str, _: Duration) -> Result<()> {
            Err(AutoNewsError::Storage("database is gone".into()))
        }
    }

    fn raw(id: &str, title: &str) -> RawItem {
        RawItem {
            native_id: Some(id.into()),
            url: Some(format!("https://example.com/{id}")),
            title: title.into(),
            text: format!("{title} body text"),
            ..Default::default()
        }
    }

    fn feed_source() -> SourceConfig {
        SourceConfig::new("HN", SourceType::Feed, "https://news.example.com/rss")
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            push_retry: RetryPolicy {
                max_attempts: 2,
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
            },
            ..PipelineConfig::default()
        }
    }

    struct Harness {
        pipeline: Pipeline,
        generator: Arc<ScriptedGenerator>,
        cache: Arc<MemoryCache>,
        index: Arc<MemoryIndex>,
        sink: Arc<MemorySink>,
        connector: Arc<StaticConnector>,
    }

    fn harness_with(config: PipelineConfig, generator: ScriptedGenerator, items: Vec<RawItem>) -> Harness {
        let generator = Arc::new(generator);
        let cache = Arc::new(MemoryCache::new());
        let index = Arc::new(MemoryIndex::new(Default::default()));
        let sink = Arc::new(MemorySink::new(SinkSettings::default()));
        let connector = Arc::new(StaticConnector::new(items));

        let mut connectors = ConnectorRegistry::new();
        connectors.register(SourceType::Feed, connector.clone());

        let pipeline = Pipeline::new(
            config,
            Collaborators {
                connectors,
                generator: generator.clone(),
                cache: cache.clone(),
                index: index.clone(),
                sink: sink.clone(),
                extractor: Extractor::new(ExtractionConfig {
                    retry: RetryPolicy::none(),
                    ..ExtractionConfig::default()
                })
                .unwrap(),
            },
        );
        Harness {
            pipeline,
            generator,
            cache,
            index,
            sink,
            connector,
        }
    }

    fn harness(items: Vec<RawItem>) -> Harness {
        harness_with(test_config(), ScriptedGenerator::default(), items)
    }

    fn quiet_extractor() -> Extractor {
        Extractor::new(ExtractionConfig {
            retry: RetryPolicy::none(),
            ..ExtractionConfig::default()
        })
        .unwrap()
    }

    /// Fresh pipeline (and cancel flag) over a real feed connector, sharing
    /// the cache and sink across runs.
    fn feed_pipeline(cache: Arc<MemoryCache>, sink: Arc<MemorySink>) -> Pipeline {
        let mut connectors = ConnectorRegistry::new();
        connectors.register(SourceType::Feed, Arc::new(FeedConnector::new(quiet_extractor())));
        Pipeline::new(
            test_config(),
            Collaborators {
                connectors,
                generator: Arc::new(ScriptedGenerator::default()),
                cache,
                index: Arc::new(MemoryIndex::new(Default::default())),
                sink,
                extractor: quiet_extractor(),
            },
        )
    }

    /// Serves `titles` as RSS, and 304 to any conditional request.
    async fn conditional_feed(titles: &[&str]) -> MockServer {
        let server = MockServer::start().await;
        let items: String = titles
            .iter()
            .map(|t| {
                format!(
                    "<item><guid>{t}</guid><title>{t}</title><link>{}/{t}</link><description>{t} body text</description></item>",
                    server.uri()
                )
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .and(header_exists("if-modified-since"))
            .respond_with(ResponseTemplate::new(304))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(r#"<rss version="2.0"><channel>{items}</channel></rss>"#)),
            )
            .mount(&server)
            .await;
        server
    }

    /// Cancels the run as soon as one item lands in the sink.
    struct CancelAfterFirstPush(CancelFlag);

    impl ProgressReporter for CancelAfterFirstPush {
        fn source_started(&self, _: &str, _: usize, _: usize) {}
        fn stage(&self, _: &str, _: PipelineStage, _: usize) {}
        fn item_pushed(&self, _: &str) {
            self.0.cancel();
        }
        fn source_finished(&self, _: &SourceReport) {}
    }

    // -- pure helpers --------------------------------------------------------

    #[test]
    fn rank_filter_keeps_ratings_at_or_above_threshold() {
        assert_eq!(rank_filter(&[2.0, 4.0, 4.5, 6.0], 4.0), vec![4.0, 4.5, 6.0]);
    }

    #[test]
    fn sentinels_always_pass() {
        assert!(passes_rank(RATING_CLASSIFICATION_DISABLED, 4.0));
        assert!(passes_rank(RATING_PARSE_FAILURE, 4.0));
    }

    #[test]
    fn relevance_ignores_far_neighbours() {
        let near = Neighbour { distance: 0.2, metadata: json!(null) };
        let far = Neighbour { distance: 0.9, metadata: json!(null) };

        assert_eq!(relevance_from(&[], 0.45), Relevance::Unscored);
        assert_eq!(relevance_from(&[far.clone()], 0.45), Relevance::Unscored);
        match relevance_from(&[far, near], 0.45) {
            Relevance::Scored(v) => assert!((v - 0.8).abs() < 1e-6),
            other => panic!("expected score, got {other:?}"),
        }
    }

    #[test]
    fn labels_are_capped_in_count_and_length() {
        let labels = vec![
            "a very long topic name that exceeds".to_string(),
            "b".into(),
            "c".into(),
            "d".into(),
        ];
        let top = top_labels(&labels, 3);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0], "a very long topic na");
        assert!(top.iter().all(|l| l.chars().count() <= 20));
    }

    // -- stage behaviour -----------------------------------------------------

    #[tokio::test]
    async fn second_run_writes_nothing() {
        let h = harness(vec![raw("1", "First"), raw("2", "Second")]);
        let source = feed_source();

        let first = h.pipeline.run(std::slice::from_ref(&source), &SilentProgress).await.unwrap();
        assert_eq!(first.pushed(), 2);
        let attempts = h.sink.attempts().len();

        let second = h.pipeline.run(&[source], &SilentProgress).await.unwrap();
        assert_eq!(second.pushed(), 0);
        assert_eq!(second.sources[0].already_seen, 2);
        assert_eq!(h.sink.attempts().len(), attempts);
    }

    #[tokio::test]
    async fn marked_fingerprints_never_reach_score() {
        let h = harness(vec![raw("1", "First"), raw("2", "Second"), raw("3", "Third")]);
        let source = feed_source();
        let item = Item::from_raw(raw("2", "Second"), &source, Utc::now()).unwrap();
        h.cache.mark(&pushed_key(&item), Duration::from_secs(60)).await.unwrap();

        let summary = h.pipeline.run(&[source], &SilentProgress).await.unwrap();
        assert_eq!(summary.sources[0].already_seen, 1);
        assert_eq!(h.generator.embeds.load(Ordering::SeqCst), 2);
        assert!(h.sink.attempts().iter().all(|(_, fp)| fp != &item.fingerprint));
    }

    #[tokio::test]
    async fn batch_duplicates_collapse() {
        let h = harness(vec![raw("1", "First"), raw("1", "First again"), RawItem::default()]);
        let summary = h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        let report = &summary.sources[0];
        assert_eq!(report.pulled, 3);
        assert_eq!(report.batch_duplicates, 2);
        assert_eq!(report.pushed, 1);
    }

    #[tokio::test]
    async fn cold_start_is_unscored_not_zero() {
        let h = harness(vec![raw("1", "First"), raw("2", "Second")]);
        let source = feed_source();
        for r in [raw("1", "First"), raw("2", "Second")] {
            let item = Item::from_raw(r, &source, Utc::now()).unwrap();
            let scored = h.pipeline.inner.score(item).await;
            assert_eq!(scored.relevance, Relevance::Unscored);
            assert!(scored.embedding.is_some());
        }
    }

    #[tokio::test]
    async fn relevance_comes_from_pushed_history() {
        let h = harness(vec![raw("1", "First")]);
        let source = feed_source();
        h.pipeline.run(std::slice::from_ref(&source), &SilentProgress).await.unwrap();
        assert_eq!(h.index.len(), 1);

        // Same title and body length gives the same vector: distance 0.
        let item = Item::from_raw(raw("9", "First"), &source, Utc::now()).unwrap();
        let scored = h.pipeline.inner.score(item).await;
        match scored.relevance {
            Relevance::Scored(v) => assert!((v - 1.0).abs() < 1e-5),
            Relevance::Unscored => panic!("expected a score"),
        }
    }

    #[tokio::test]
    async fn embed_failure_leaves_item_unscored_but_pushed() {
        let generator = ScriptedGenerator {
            fail_embed: true,
            ..Default::default()
        };
        let h = harness_with(test_config(), generator, vec![raw("1", "First")]);
        let summary = h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        assert_eq!(summary.sources[0].unscored, 1);
        assert_eq!(summary.pushed(), 1);
        assert!(h.index.is_empty());
    }

    #[tokio::test]
    async fn rank_threshold_and_push_order() {
        let generator = ScriptedGenerator {
            scores: HashMap::from([
                ("Low".to_string(), 0.4),
                ("Mid".to_string(), 0.8),
                ("High".to_string(), 0.9),
                ("Top".to_string(), 1.2),
            ]),
            ..Default::default()
        };
        let config = PipelineConfig {
            min_rank_score: 4.0,
            ..test_config()
        };
        let h = harness_with(
            config,
            generator,
            vec![raw("1", "Low"), raw("2", "Mid"), raw("3", "Top"), raw("4", "High")],
        );
        let summary = h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        assert_eq!(summary.sources[0].below_threshold, 1);
        assert_eq!(summary.pushed(), 3);

        let titles: Vec<String> = h.sink.records().iter().map(|r| r.title.clone()).collect();
        assert_eq!(titles, vec!["Top", "High", "Mid"]);

        let top = &h.sink.records()[0];
        assert_eq!(top.topics.len(), 3);
        assert!(top.topics.iter().all(|t| t.chars().count() <= 20));
    }

    #[tokio::test]
    async fn disabled_classification_uses_sentinel() {
        let config = PipelineConfig {
            enable_classification: false,
            min_rank_score: 4.0,
            ..test_config()
        };
        let h = harness_with(config, ScriptedGenerator::default(), vec![raw("1", "First")]);
        h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        assert_eq!(h.generator.classifications.load(Ordering::SeqCst), 0);
        assert_eq!(h.sink.records()[0].rating, Some(RATING_CLASSIFICATION_DISABLED));
    }

    #[tokio::test]
    async fn parse_failure_uses_sentinel_and_keeps_item() {
        let config = PipelineConfig {
            min_rank_score: 4.0,
            ..test_config()
        };
        let h = harness_with(config, ScriptedGenerator::default(), vec![raw("1", "garbled")]);
        h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        assert_eq!(h.sink.records()[0].rating, Some(RATING_PARSE_FAILURE));
    }

    #[tokio::test]
    async fn summarize_failure_drops_item() {
        let h = harness(vec![raw("1", "broken"), raw("2", "Fine")]);
        let summary = h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        assert_eq!(summary.sources[0].summarize_failed, 1);
        assert_eq!(summary.pushed(), 1);
    }

    #[tokio::test]
    async fn llm_results_are_cached_across_runs() {
        let h = harness(vec![raw("1", "First")]);
        let source = feed_source();
        let item = Item::from_raw(raw("1", "First"), &source, Utc::now()).unwrap();

        let first = h.pipeline.inner.summarize(item.clone(), &source).await.unwrap().unwrap();
        let again = h.pipeline.inner.summarize(item, &source).await.unwrap().unwrap();
        assert_eq!(first.summary, again.summary);
        assert_eq!(h.generator.summaries.load(Ordering::SeqCst), 1);

        let Ranked::Kept(_) = h.pipeline.inner.rank(first.clone()).await.unwrap() else {
            panic!("expected kept");
        };
        let Ranked::Kept(ranked) = h.pipeline.inner.rank(first).await.unwrap() else {
            panic!("expected kept");
        };
        assert_eq!(h.generator.classifications.load(Ordering::SeqCst), 1);
        assert!((ranked.rating.unwrap() - 4.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn summary_input_names_the_source() {
        let h = harness(vec![]);
        let source = feed_source();
        let item = Item::from_raw(raw("1", "First"), &source, Utc::now()).unwrap();
        let out = h.pipeline.inner.summarize(item, &source).await.unwrap().unwrap();
        assert!(out.summary.unwrap().starts_with("summary: [Source: HN]"));
    }

    #[tokio::test]
    async fn empty_body_is_fetched_before_summarizing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><article><p>Fetched body with plenty of words for the summarizer.</p></article></body></html>",
            ))
            .mount(&server)
            .await;

        let h = harness(vec![]);
        let source = feed_source();
        let item = Item::from_raw(
            RawItem {
                url: Some(format!("{}/post", server.uri())),
                title: "Link only".into(),
                ..Default::default()
            },
            &source,
            Utc::now(),
        )
        .unwrap();

        let out = h.pipeline.inner.summarize(item, &source).await.unwrap().unwrap();
        assert!(out.text.contains("Fetched body"));
        assert!(out.summary.is_some());
    }

    #[tokio::test]
    async fn capacity_failure_rotates_and_retries_once() {
        let h = harness(vec![raw("1", "First")]);
        h.sink.script([PushOutcome::SchemaCapacityExceeded, PushOutcome::TransientError("busy".into())]);

        let summary = h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        let report = &summary.sources[0];
        assert_eq!(report.rotations, 1);
        assert_eq!(report.push_failed, 1);
        assert_eq!(report.pushed, 0);

        let attempts = h.sink.attempts();
        assert_eq!(attempts.len(), 2);
        assert_ne!(attempts[0].0, attempts[1].0);
        assert_eq!(h.sink.collections().len(), 2);
    }

    #[tokio::test]
    async fn rotation_retry_can_succeed() {
        let h = harness(vec![raw("1", "First"), raw("2", "Second")]);
        h.sink.script([PushOutcome::SchemaCapacityExceeded]);

        let summary = h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        assert_eq!(summary.pushed(), 2);

        // Both items land in the rotated collection.
        let collections = h.sink.collections();
        let latest = collections.last().unwrap();
        assert!(h.sink.records().iter().all(|r| &r.collection == latest));
    }

    #[tokio::test]
    async fn transient_push_failures_are_retried() {
        let h = harness(vec![raw("1", "First")]);
        h.sink.script([PushOutcome::TransientError("locked".into())]);

        let summary = h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        assert_eq!(summary.pushed(), 1);
        assert_eq!(h.sink.attempts().len(), 2);
    }

    #[tokio::test]
    async fn persistent_transient_failure_is_not_marked() {
        let h = harness(vec![raw("1", "First")]);
        h.sink.script([
            PushOutcome::TransientError("locked".into()),
            PushOutcome::TransientError("locked".into()),
        ]);

        let source = feed_source();
        let summary = h.pipeline.run(std::slice::from_ref(&source), &SilentProgress).await.unwrap();
        assert_eq!(summary.sources[0].push_failed, 1);

        let item = Item::from_raw(raw("1", "First"), &source, Utc::now()).unwrap();
        assert!(!h.cache.has(&pushed_key(&item)).await.unwrap());
    }

    #[tokio::test]
    async fn failed_push_is_pulled_again_despite_conditional_fetch() {
        let server = conditional_feed(&["First"]).await;
        let source = SourceConfig::new("Feed", SourceType::Feed, format!("{}/feed.xml", server.uri()));
        let cache = Arc::new(MemoryCache::new());
        let sink = Arc::new(MemorySink::new(SinkSettings::default()));
        sink.script([
            PushOutcome::TransientError("locked".into()),
            PushOutcome::TransientError("locked".into()),
        ]);

        let first = feed_pipeline(cache.clone(), sink.clone())
            .run(std::slice::from_ref(&source), &SilentProgress)
            .await
            .unwrap();
        assert_eq!(first.sources[0].push_failed, 1);
        assert!(sink.records().is_empty());

        let second = feed_pipeline(cache.clone(), sink.clone())
            .run(std::slice::from_ref(&source), &SilentProgress)
            .await
            .unwrap();
        assert!(!second.sources[0].not_modified);
        assert_eq!(second.pushed(), 1);
        assert_eq!(sink.records().len(), 1);

        // Settled now: the next pull is conditional and upstream has nothing new.
        let third = feed_pipeline(cache, sink.clone())
            .run(&[source], &SilentProgress)
            .await
            .unwrap();
        assert!(third.sources[0].not_modified);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_batch_is_finished_by_the_next_run() {
        let server = conditional_feed(&["First", "Second", "Third"]).await;
        let source = SourceConfig::new("Feed", SourceType::Feed, format!("{}/feed.xml", server.uri()));
        let cache = Arc::new(MemoryCache::new());
        let sink = Arc::new(MemorySink::new(SinkSettings::default()));

        let interrupted = feed_pipeline(cache.clone(), sink.clone());
        let reporter = CancelAfterFirstPush(interrupted.cancel_flag());
        let first = interrupted.run(std::slice::from_ref(&source), &reporter).await.unwrap();
        assert!(first.cancelled);
        assert_eq!(first.pushed(), 1);

        let second = feed_pipeline(cache, sink.clone())
            .run(&[source], &SilentProgress)
            .await
            .unwrap();
        assert!(!second.sources[0].not_modified);
        assert_eq!(second.sources[0].already_seen, 1);
        assert_eq!(second.pushed(), 2);
        assert_eq!(sink.records().len(), 3);

        let conditional = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.headers.contains_key("if-modified-since"))
            .count();
        assert_eq!(conditional, 0);
    }

    #[tokio::test]
    async fn configuration_errors_stay_with_their_source() {
        let h = harness(vec![raw("1", "First")]);
        let inbox = SourceConfig::new("Inbox", SourceType::DocumentInbox, "https://inbox.example.com");
        let mut invalid = feed_source();
        invalid.name = "Broken".into();
        invalid.url = "not a url".into();

        let summary = h
            .pipeline
            .run(&[inbox, invalid, feed_source()], &SilentProgress)
            .await
            .unwrap();
        assert_eq!(summary.failed_sources().count(), 2);
        assert_eq!(summary.pushed(), 1);
        assert!(needs_external_connector(SourceType::DocumentInbox));
    }

    #[tokio::test]
    async fn disabled_sources_are_skipped() {
        let h = harness(vec![raw("1", "First")]);
        let mut source = feed_source();
        source.enabled = false;
        let summary = h.pipeline.run(&[source], &SilentProgress).await.unwrap();
        assert!(summary.sources.is_empty());
        assert!(h.connector.sinces.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_attempt_feeds_the_next_pull() {
        let h = harness(vec![raw("1", "First")]);
        let source = feed_source();
        h.pipeline.run(std::slice::from_ref(&source), &SilentProgress).await.unwrap();
        h.pipeline.run(&[source], &SilentProgress).await.unwrap();

        let sinces = h.connector.sinces.lock().unwrap().clone();
        assert_eq!(sinces.len(), 2);
        assert!(sinces[0].is_none());
        assert!(sinces[1].is_some());
    }

    #[tokio::test]
    async fn lost_cache_aborts_the_run() {
        let generator: Arc<dyn GenerationService> = Arc::new(ScriptedGenerator::default());
        let mut connectors = ConnectorRegistry::new();
        connectors.register(SourceType::Feed, Arc::new(StaticConnector::new(vec![raw("1", "First")])));

        let pipeline = Pipeline::new(
            test_config(),
            Collaborators {
                connectors,
                generator,
                cache: Arc::new(LostCache),
                index: Arc::new(MemoryIndex::new(Default::default())),
                sink: Arc::new(MemorySink::new(SinkSettings::default())),
                extractor: Extractor::new(ExtractionConfig::default()).unwrap(),
            },
        );
        let result = pipeline.run(&[feed_source(), feed_source()], &SilentProgress).await;
        assert!(matches!(result, Err(AutoNewsError::Storage(_))));
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_next_source() {
        let h = harness(vec![raw("1", "First")]);
        let cancel = h.pipeline.cancel_flag();
        cancel.cancel();
        let summary = h.pipeline.run(&[feed_source()], &SilentProgress).await.unwrap();
        assert!(summary.cancelled);
        assert!(summary.sources.is_empty());
    }
}
