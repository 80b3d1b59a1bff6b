//! Application configuration for AutoNews.
//!
//! User config lives at `~/.autonews/autonews.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AutoNewsError, Result};
use crate::retry::RetryPolicy;
use crate::types::SourceConfig;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "autonews.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".autonews";

/// Default User-Agent for outbound requests.
pub const USER_AGENT: &str = concat!("AutoNews/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Config structs (matching autonews.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Generation provider settings.
    #[serde(default)]
    pub generation: GenerationSettings,

    /// Stage thresholds and fan-out.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Fingerprint cache TTLs.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Fetch/extraction behaviour.
    #[serde(default)]
    pub extraction: ExtractionSettings,

    /// Destination store settings.
    #[serde(default)]
    pub sink: SinkSettings,

    /// Digest selection settings.
    #[serde(default)]
    pub digest: DigestSettings,

    /// Configured sources.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// libSQL database path. `~` expands to the home directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Language summaries are written in. `None` keeps the source language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            target_language: None,
        }
    }
}

fn default_database_path() -> String {
    "~/.autonews/autonews.db".into()
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Provider label used in cache keys.
    #[serde(default = "default_provider")]
    pub provider: String,

    /// OpenAI-compatible API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Chat model for summaries and ranking.
    #[serde(default = "default_model")]
    pub model: String,

    /// Embedding model for the similarity index.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Concurrent in-flight calls per provider.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_generation_backoff_ms")]
    pub backoff_initial_ms: u64,

    /// Initial backoff after a quota rejection.
    #[serde(default = "default_quota_backoff_ms")]
    pub quota_backoff_initial_ms: u64,

    /// Input characters sent to the summarizer.
    #[serde(default = "default_summary_max_length")]
    pub summary_max_length: usize,

    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_generation_backoff_ms(),
            quota_backoff_initial_ms: default_quota_backoff_ms(),
            summary_max_length: default_summary_max_length(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".into()
}
fn default_max_concurrency() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_generation_backoff_ms() -> u64 {
    1_000
}
fn default_quota_backoff_ms() -> u64 {
    5_000
}
fn default_summary_max_length() -> usize {
    20_000
}
fn default_generation_timeout() -> u64 {
    120
}

/// Distance metric of the similarity index. Every metric is expressed so
/// that smaller means closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    L2,
    InnerProduct,
    #[default]
    Cosine,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Items pulled/scored in parallel.
    #[serde(default = "default_pipeline_concurrency")]
    pub concurrency: usize,

    /// Items with a rating below this are dropped at Rank.
    #[serde(default)]
    pub min_rank_score: f32,

    /// Multiplier from the LLM's 0..1 score to the rating scale.
    #[serde(default = "default_rank_scale")]
    pub rank_scale: f32,

    /// Topics/categories kept per item at Push.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Neighbours queried at Score.
    #[serde(default = "default_neighbours")]
    pub neighbours: usize,

    /// Neighbours further than this do not count toward relevance.
    #[serde(default = "default_max_distance")]
    pub max_distance: f32,

    #[serde(default)]
    pub distance_metric: DistanceMetric,

    /// When false, Rank assigns a sentinel rating and keeps every item.
    #[serde(default = "default_true")]
    pub enable_classification: bool,

    /// Attempts for transient sink failures.
    #[serde(default = "default_max_attempts")]
    pub push_max_attempts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: default_pipeline_concurrency(),
            min_rank_score: 0.0,
            rank_scale: default_rank_scale(),
            top_k: default_top_k(),
            neighbours: default_neighbours(),
            max_distance: default_max_distance(),
            distance_metric: DistanceMetric::default(),
            enable_classification: true,
            push_max_attempts: default_max_attempts(),
        }
    }
}

fn default_pipeline_concurrency() -> usize {
    4
}
fn default_rank_scale() -> f32 {
    5.0
}
fn default_top_k() -> usize {
    3
}
fn default_neighbours() -> usize {
    2
}
fn default_max_distance() -> f32 {
    0.45
}
fn default_true() -> bool {
    true
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// TTL of pull/dedup/pushed markers.
    #[serde(default = "default_week")]
    pub dedup_ttl_secs: u64,

    /// TTL of cached summaries and rankings.
    #[serde(default = "default_week")]
    pub llm_ttl_secs: u64,

    /// TTL of embedding-tracking markers.
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dedup_ttl_secs: default_week(),
            llm_ttl_secs: default_week(),
            embedding_ttl_secs: default_embedding_ttl(),
        }
    }
}

fn default_week() -> u64 {
    7 * 24 * 3600
}
fn default_embedding_ttl() -> u64 {
    90 * 24 * 3600
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    /// Per-request timeout.
    #[serde(default = "default_extraction_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Links followed from a digest page unless the source overrides it.
    #[serde(default = "default_digest_limit")]
    pub digest_limit: usize,

    /// Concurrent link fetches during digest expansion.
    #[serde(default = "default_pipeline_concurrency")]
    pub concurrency: usize,

    /// Default User-Agent. Sources may override it.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_extraction_timeout(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            digest_limit: default_digest_limit(),
            concurrency: default_pipeline_concurrency(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_extraction_timeout() -> u64 {
    60
}
fn default_backoff_initial_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    10_000
}
fn default_digest_limit() -> usize {
    30
}
fn default_user_agent() -> String {
    USER_AGENT.into()
}

/// `[sink]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Distinct category values a collection may hold.
    #[serde(default = "default_max_categories")]
    pub max_categories: usize,

    /// Prefix of rotated collection names (`{prefix} - YYYY-MM`).
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            max_categories: default_max_categories(),
            collection_prefix: default_collection_prefix(),
        }
    }
}

fn default_max_categories() -> usize {
    100
}
fn default_collection_prefix() -> String {
    "ToRead".into()
}

/// `[digest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSettings {
    #[serde(default = "default_hours_back")]
    pub hours_back: u32,

    #[serde(default = "default_min_rating")]
    pub min_rating: f32,

    /// Skip items the user already opened (edited after creation).
    #[serde(default)]
    pub skip_read: bool,

    /// Characters kept per item.
    #[serde(default = "default_item_max_chars")]
    pub item_max_chars: usize,

    /// Characters kept in total.
    #[serde(default = "default_max_content")]
    pub max_content: usize,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            hours_back: default_hours_back(),
            min_rating: default_min_rating(),
            skip_read: false,
            item_max_chars: default_item_max_chars(),
            max_content: default_max_content(),
        }
    }
}

fn default_hours_back() -> u32 {
    24
}
fn default_min_rating() -> f32 {
    3.0
}
fn default_item_max_chars() -> usize {
    500
}
fn default_max_content() -> usize {
    15_000
}

// ---------------------------------------------------------------------------
// Runtime snapshots (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, passed to the orchestrator at construction.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub concurrency: usize,
    pub min_rank_score: f32,
    pub rank_scale: f32,
    pub top_k: usize,
    pub neighbours: usize,
    pub max_distance: f32,
    pub enable_classification: bool,
    pub summary_max_length: usize,
    pub target_language: Option<String>,
    pub dedup_ttl: Duration,
    pub llm_ttl: Duration,
    pub embedding_ttl: Duration,
    /// Backoff for transient sink failures.
    pub push_retry: RetryPolicy,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            concurrency: p.concurrency.max(1),
            min_rank_score: p.min_rank_score,
            rank_scale: p.rank_scale,
            top_k: p.top_k,
            neighbours: p.neighbours.max(1),
            max_distance: p.max_distance,
            enable_classification: p.enable_classification,
            summary_max_length: config.generation.summary_max_length,
            target_language: config.defaults.target_language.clone(),
            dedup_ttl: Duration::from_secs(config.cache.dedup_ttl_secs),
            llm_ttl: Duration::from_secs(config.cache.llm_ttl_secs),
            embedding_ttl: Duration::from_secs(config.cache.embedding_ttl_secs),
            push_retry: RetryPolicy {
                max_attempts: p.push_max_attempts.max(1),
                initial_interval: Duration::from_millis(500),
                max_interval: Duration::from_secs(10),
            },
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime extraction configuration.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub digest_limit: usize,
    pub concurrency: usize,
    pub user_agent: String,
}

impl From<&AppConfig> for ExtractionConfig {
    fn from(config: &AppConfig) -> Self {
        let e = &config.extraction;
        Self {
            timeout: Duration::from_secs(e.timeout_secs),
            retry: RetryPolicy {
                max_attempts: e.max_attempts.max(1),
                initial_interval: Duration::from_millis(e.backoff_initial_ms),
                max_interval: Duration::from_millis(e.backoff_max_ms),
            },
            digest_limit: e.digest_limit,
            concurrency: e.concurrency.max(1),
            user_agent: e.user_agent.clone(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime digest configuration.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub hours_back: u32,
    pub min_rating: f32,
    pub skip_read: bool,
    pub item_max_chars: usize,
    pub max_content: usize,
}

impl From<&AppConfig> for DigestConfig {
    fn from(config: &AppConfig) -> Self {
        let d = &config.digest;
        Self {
            hours_back: d.hours_back,
            min_rating: d.min_rating,
            skip_read: d.skip_read,
            item_max_chars: d.item_max_chars,
            max_content: d.max_content,
        }
    }
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.autonews/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AutoNewsError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.autonews/autonews.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AutoNewsError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| AutoNewsError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AutoNewsError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| AutoNewsError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AutoNewsError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the generation API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.generation.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(AutoNewsError::config(format!(
            "generation API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| AutoNewsError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
