//! Core domain types for the AutoNews pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{AutoNewsError, Result};

/// Default number of entries pulled per source per run.
pub const DEFAULT_MAX_ITEMS: usize = 3;

// ---------------------------------------------------------------------------
// SourceType
// ---------------------------------------------------------------------------

/// Kind of upstream a source pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Feed,
    Forum,
    Video,
    DocumentInbox,
    WebPage,
}

impl SourceType {
    /// Stable identifier used in cache keys and storage rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feed => "feed",
            Self::Forum => "forum",
            Self::Video => "video",
            Self::DocumentInbox => "document-inbox",
            Self::WebPage => "web-page",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = AutoNewsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "feed" => Ok(Self::Feed),
            "forum" => Ok(Self::Forum),
            "video" => Ok(Self::Video),
            "document-inbox" => Ok(Self::DocumentInbox),
            "web-page" => Ok(Self::WebPage),
            other => Err(AutoNewsError::parse(format!("unknown source type '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Deterministic item identity.
///
/// Derived only from `(source type, source list, native id or URL)`, so the
/// same upstream entry maps to the same fingerprint on every run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for an upstream entry.
    pub fn compute(source_type: SourceType, source_list: &str, native_id_or_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_type.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(source_list.as_bytes());
        hasher.update([0x1f]);
        hasher.update(native_id_or_url.trim().as_bytes());
        let hex = format!("{:x}", hasher.finalize());
        Self(hex[..32].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = AutoNewsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(AutoNewsError::parse(format!("invalid fingerprint '{s}'")))
        }
    }
}

// ---------------------------------------------------------------------------
// SourceConfig
// ---------------------------------------------------------------------------

/// Extra request headers, either as a TOML table or a JSON object string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderSpec {
    Table(BTreeMap<String, String>),
    Json(String),
}

impl HeaderSpec {
    /// Resolve into a header map, rejecting JSON that is not a flat object.
    pub fn resolve(&self) -> Result<BTreeMap<String, String>> {
        match self {
            Self::Table(map) => Ok(map.clone()),
            Self::Json(raw) => {
                let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
                    AutoNewsError::config(format!("headers must be valid JSON: {e}"))
                })?;
                let obj = value
                    .as_object()
                    .ok_or_else(|| AutoNewsError::config("headers must be a JSON object"))?;
                obj.iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => Ok((k.clone(), s.clone())),
                        other => Ok((k.clone(), other.to_string())),
                    })
                    .collect()
            }
        }
    }
}

/// One `[[sources]]` entry: a feed, page, or account to pull from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source list name (part of every fingerprint).
    pub name: String,
    /// Upstream kind.
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Feed URL, page URL, or handle.
    pub url: String,
    /// Disabled sources are skipped entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Content-selection rule (CSS selector or simple XPath).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Render through a headless browser before extraction.
    #[serde(default)]
    pub browser_mode: bool,
    /// For feeds: fetch each entry's page instead of using the feed summary.
    #[serde(default)]
    pub fetch_full_article: bool,
    /// Treat the page as an index and follow its links.
    #[serde(default)]
    pub digest: bool,
    /// Maximum links followed from a digest page. Falls back to
    /// `[extraction] digest_limit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_limit: Option<usize>,
    /// Maximum entries pulled per run.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Proxy URL for every request made for this source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Override the default User-Agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Additional request headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderSpec>,
}

fn default_true() -> bool {
    true
}
fn default_max_items() -> usize {
    DEFAULT_MAX_ITEMS
}

impl SourceConfig {
    /// Minimal config for a source of `source_type` at `url`.
    pub fn new(name: impl Into<String>, source_type: SourceType, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_type,
            url: url.into(),
            enabled: true,
            selector: None,
            browser_mode: false,
            fetch_full_article: false,
            digest: false,
            digest_limit: None,
            max_items: DEFAULT_MAX_ITEMS,
            proxy: None,
            user_agent: None,
            headers: None,
        }
    }

    /// Check the entry is usable. Errors are `Config` and only disable this source.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AutoNewsError::config("source name must not be empty"));
        }
        Url::parse(&self.url).map_err(|e| {
            AutoNewsError::config(format!("source '{}': invalid url '{}': {e}", self.name, self.url))
        })?;
        if self.digest && self.digest_limit == Some(0) {
            return Err(AutoNewsError::config(format!(
                "source '{}': digest_limit must be at least 1",
                self.name
            )));
        }
        if let Some(proxy) = &self.proxy {
            Url::parse(proxy).map_err(|e| {
                AutoNewsError::config(format!("source '{}': invalid proxy '{proxy}': {e}", self.name))
            })?;
        }
        if let Some(headers) = &self.headers {
            headers.resolve()?;
        }
        Ok(())
    }

    /// Resolved extra headers (empty when none configured).
    pub fn header_map(&self) -> Result<BTreeMap<String, String>> {
        match &self.headers {
            Some(spec) => spec.resolve(),
            None => Ok(BTreeMap::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// RawItem / Item
// ---------------------------------------------------------------------------

/// Unprocessed entry as yielded by a source connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Upstream-native identifier (feed guid, post id, video id).
    pub native_id: Option<String>,
    /// Canonical URL of the entry.
    pub url: Option<String>,
    pub title: String,
    /// Raw body text (may be empty when only a link is known).
    pub text: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Upstream tags/labels.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RawItem {
    /// The identity component of the fingerprint: native id, else URL.
    pub fn identity(&self) -> Option<&str> {
        self.native_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.url.as_deref().filter(|s| !s.trim().is_empty()))
    }
}

/// Similarity-derived relevance of an item.
///
/// `Unscored` marks "no historical data yet" and is distinct from any
/// numeric score, including zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Relevance {
    #[default]
    Unscored,
    Scored(f32),
}

impl Relevance {
    pub fn value(&self) -> Option<f32> {
        match self {
            Self::Unscored => None,
            Self::Scored(v) => Some(*v),
        }
    }
}

/// Output of the generation service's classify-and-score call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Quality/interest judgment in `0..=1`.
    pub score: f32,
    /// Short free-text rationale from the model.
    #[serde(default)]
    pub feedback: String,
}

/// The unit flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub fingerprint: Fingerprint,
    pub source_type: SourceType,
    /// Name of the source the item was pulled from.
    pub source_list: String,
    pub title: String,
    pub text: String,
    pub url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Set by Score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Set by Score.
    #[serde(default)]
    pub relevance: Relevance,
    /// Set by Summarize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Set by Rank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    /// Rank score on the configured scale, set by Rank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
}

impl Item {
    /// Build an item from a connector entry. Returns `None` when the entry
    /// carries neither a native id nor a URL.
    pub fn from_raw(raw: RawItem, source: &SourceConfig, pulled_at: DateTime<Utc>) -> Option<Self> {
        let identity = raw.identity()?.to_string();
        let fingerprint = Fingerprint::compute(source.source_type, &source.name, &identity);

        Some(Self {
            fingerprint,
            source_type: source.source_type,
            source_list: source.name.clone(),
            title: raw.title,
            text: raw.text,
            url: raw.url,
            published_at: raw.published_at.unwrap_or(pulled_at),
            author: raw.author,
            tags: raw.tags,
            embedding: None,
            relevance: Relevance::Unscored,
            summary: None,
            classification: None,
            rating: None,
        })
    }
}
