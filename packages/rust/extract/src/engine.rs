//! Extraction engine: fetch a page (directly or rendered), select its content,
//! and normalize it into article text with a publish time.
//!
//! Digest sources treat the fetched page as a link index and extract every
//! linked page with bounded concurrency.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED, USER_AGENT};
use reqwest::{Client, StatusCode};
use scraper::Html;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use autonews_shared::{AutoNewsError, ExtractionConfig, Result, SourceConfig, retry};

use crate::content::{extract_links, page_meta, select_content, select_link_area};
use crate::render::PageRenderer;
use crate::text::html_to_text;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Per-source request settings shared by the direct and rendered fetch paths.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<String>,
    /// Sent as `If-Modified-Since` when set.
    pub if_modified_since: Option<DateTime<Utc>>,
}

impl RequestProfile {
    /// `If-Modified-Since` value in HTTP-date format.
    pub fn if_modified_since_header(&self) -> Option<String> {
        self.if_modified_since
            .map(|t| t.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
    }
}

/// Normalized content of one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub url: Url,
    pub title: Option<String>,
    pub text: String,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// Outcome of extracting a single URL.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// Upstream answered 304; nothing changed since the last attempt.
    NotModified,
    Article(Article),
}

/// Result of expanding a digest page.
#[derive(Debug, Clone, Default)]
pub struct Digest {
    /// Links attempted after capping at the digest limit.
    pub attempted: usize,
    /// Successful extractions, in link order.
    pub articles: Vec<Article>,
    /// `(url, error)` for each link that failed.
    pub failures: Vec<(String, String)>,
}

/// Outcome of extracting a digest source.
#[derive(Debug, Clone)]
pub enum DigestOutcome {
    NotModified,
    Expanded(Digest),
}

/// Raw page as returned by either fetch path.
#[derive(Debug)]
struct FetchedPage {
    html: String,
    /// URL after redirects, used to resolve relative links.
    final_url: Url,
    last_modified: Option<DateTime<Utc>>,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug)]
enum Fetched {
    NotModified,
    Page(FetchedPage),
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Fetches and extracts article content for configured sources.
///
/// Cheap to clone; clones share HTTP clients and the renderer.
#[derive(Clone)]
pub struct Extractor {
    config: ExtractionConfig,
    client: Client,
    /// One client per proxy URL, built on first use.
    proxied: Arc<Mutex<HashMap<String, Client>>>,
    renderer: Option<Arc<dyn PageRenderer>>,
}

impl Extractor {
    /// Create an extractor without a browser renderer.
    pub fn new(config: ExtractionConfig) -> Result<Self> {
        let client = build_client(&config, None)?;
        Ok(Self {
            config,
            client,
            proxied: Arc::new(Mutex::new(HashMap::new())),
            renderer: None,
        })
    }

    /// Use `renderer` for sources with `browser_mode` set.
    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract a single URL with the source's selection rule.
    #[instrument(skip_all, fields(source = %source.name, url = %url))]
    pub async fn extract(
        &self,
        source: &SourceConfig,
        url: &Url,
        since: Option<DateTime<Utc>>,
    ) -> Result<Extraction> {
        let profile = self.profile(source, since)?;
        self.extract_with(source, url, &profile, source.selector.as_deref())
            .await
    }

    /// Fetch the raw body of `url` with the source's request settings,
    /// bypassing content selection and the renderer. `None` means 304.
    #[instrument(skip_all, fields(source = %source.name, url = %url))]
    pub async fn fetch_raw(
        &self,
        source: &SourceConfig,
        url: &Url,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        let profile = self.profile(source, since)?;
        let client = self.client_for(&profile)?;
        let fetched = retry(&self.config.retry, url.as_str(), || {
            fetch_direct(&client, url, &profile)
        })
        .await?;

        Ok(match fetched {
            Fetched::NotModified => None,
            Fetched::Page(page) => Some(page.html),
        })
    }

    /// Expand a digest source: fetch the index at `source.url`, follow up to
    /// the digest limit of its content links and extract each one.
    ///
    /// Link failures are logged and skipped; only a failure of the index page
    /// itself is returned as an error.
    #[instrument(skip_all, fields(source = %source.name))]
    pub async fn extract_digest(
        &self,
        source: &SourceConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<DigestOutcome> {
        let index_url = Url::parse(&source.url).map_err(|e| {
            AutoNewsError::config(format!("source '{}': invalid url: {e}", source.name))
        })?;
        let profile = self.profile(source, since)?;

        let page = match self.fetch(source, &index_url, &profile).await? {
            Fetched::NotModified => {
                info!(url = %index_url, "digest index not modified");
                return Ok(DigestOutcome::NotModified);
            }
            Fetched::Page(page) => page,
        };

        let mut links = {
            let doc = Html::parse_document(&page.html);
            let area = select_link_area(&doc, source.selector.as_deref(), index_url.as_str())?;
            extract_links(&area, &page.final_url)
        };
        let limit = source.digest_limit.unwrap_or(self.config.digest_limit);
        let found = links.len();
        links.truncate(limit);

        info!(found, limit, following = links.len(), "expanding digest");

        // Linked pages are new content: no conditional header, heuristic selection.
        let link_profile = RequestProfile {
            if_modified_since: None,
            ..profile
        };
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let attempted = links.len();

        for (idx, link) in links.into_iter().enumerate() {
            let this = self.clone();
            let source = source.clone();
            let profile = link_profile.clone();
            let sem = semaphore.clone();

            tasks.spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return (idx, link, Err(AutoNewsError::Network("digest fetch cancelled".into())));
                };
                let result = this.extract_with(&source, &link, &profile, None).await;
                (idx, link, result)
            });
        }

        let mut results = Vec::with_capacity(attempted);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => warn!(error = %e, "digest task failed"),
            }
        }
        results.sort_by_key(|(idx, _, _)| *idx);

        let mut digest = Digest {
            attempted,
            ..Digest::default()
        };
        for (_, link, result) in results {
            match result {
                Ok(Extraction::Article(article)) => digest.articles.push(article),
                Ok(Extraction::NotModified) => {}
                Err(e) => {
                    warn!(url = %link, error = %e, "digest link failed, skipping");
                    digest.failures.push((link.to_string(), e.to_string()));
                }
            }
        }

        info!(
            attempted = digest.attempted,
            extracted = digest.articles.len(),
            failed = digest.failures.len(),
            "digest expanded"
        );

        Ok(DigestOutcome::Expanded(digest))
    }

    /// Resolve the request settings of a source.
    pub fn profile(
        &self,
        source: &SourceConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<RequestProfile> {
        let headers = source.header_map()?;
        for (name, value) in &headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                AutoNewsError::config(format!("source '{}': invalid header name '{name}': {e}", source.name))
            })?;
            HeaderValue::from_str(value).map_err(|e| {
                AutoNewsError::config(format!("source '{}': invalid value for header '{name}': {e}", source.name))
            })?;
        }

        Ok(RequestProfile {
            user_agent: source
                .user_agent
                .clone()
                .unwrap_or_else(|| self.config.user_agent.clone()),
            headers,
            proxy: source.proxy.clone(),
            if_modified_since: since,
        })
    }

    async fn extract_with(
        &self,
        source: &SourceConfig,
        url: &Url,
        profile: &RequestProfile,
        rule: Option<&str>,
    ) -> Result<Extraction> {
        match self.fetch(source, url, profile).await? {
            Fetched::NotModified => {
                debug!(%url, "not modified");
                Ok(Extraction::NotModified)
            }
            Fetched::Page(page) => build_article(url, &page, rule).map(Extraction::Article),
        }
    }

    /// Fetch through the renderer when the source asks for it, degrading once
    /// to the direct path on render failure.
    async fn fetch(
        &self,
        source: &SourceConfig,
        url: &Url,
        profile: &RequestProfile,
    ) -> Result<Fetched> {
        if source.browser_mode {
            match &self.renderer {
                Some(renderer) => match renderer.render(url, profile).await {
                    Ok(html) => {
                        return Ok(Fetched::Page(FetchedPage {
                            html,
                            final_url: url.clone(),
                            last_modified: None,
                            fetched_at: Utc::now(),
                        }));
                    }
                    Err(e) => {
                        warn!(%url, renderer = renderer.name(), error = %e, "render failed, falling back to direct fetch");
                    }
                },
                None => debug!(%url, "browser mode requested without a renderer, fetching directly"),
            }
        }

        let client = self.client_for(profile)?;
        retry(&self.config.retry, url.as_str(), || {
            fetch_direct(&client, url, profile)
        })
        .await
    }

    fn client_for(&self, profile: &RequestProfile) -> Result<Client> {
        let Some(proxy) = &profile.proxy else {
            return Ok(self.client.clone());
        };

        let mut clients = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, Some(proxy))?;
        clients.insert(proxy.clone(), client.clone());
        Ok(client)
    }
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

fn build_client(config: &ExtractionConfig, proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(config.timeout);

    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| AutoNewsError::config(format!("invalid proxy '{proxy}': {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| AutoNewsError::Network(format!("failed to build HTTP client: {e}")))
}

/// One direct HTTP attempt. 429 and 5xx are transient; other non-success
/// statuses fail the URL.
async fn fetch_direct(client: &Client, url: &Url, profile: &RequestProfile) -> Result<Fetched> {
    debug!(%url, "fetching page");

    let mut request = client
        .get(url.as_str())
        .header(USER_AGENT, profile.user_agent.as_str());
    for (name, value) in &profile.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(since) = profile.if_modified_since_header() {
        request = request.header(IF_MODIFIED_SINCE, since);
    }

    let response = request
        .send()
        .await
        .map_err(|e| AutoNewsError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if status == StatusCode::NOT_MODIFIED {
        return Ok(Fetched::NotModified);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AutoNewsError::Network(format!(
            "{url}: HTTP 429 Too Many Requests. The site is rate limiting; \
             lower the run frequency or configure a proxy for this source"
        )));
    }
    if status.is_server_error() {
        return Err(AutoNewsError::Network(format!("{url}: HTTP {status}")));
    }
    if !status.is_success() {
        return Err(AutoNewsError::extraction(url.as_str(), format!("HTTP {status}")));
    }

    let last_modified = response
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|d| d.with_timezone(&Utc));
    let final_url = response.url().clone();

    let html = response
        .text()
        .await
        .map_err(|e| AutoNewsError::Network(format!("{url}: body read failed: {e}")))?;

    Ok(Fetched::Page(FetchedPage {
        html,
        final_url,
        last_modified,
        fetched_at: Utc::now(),
    }))
}

/// Select, convert and date a fetched page.
///
/// `publishedAt` comes from page metadata, then `Last-Modified`, then the
/// fetch time.
fn build_article(url: &Url, page: &FetchedPage, rule: Option<&str>) -> Result<Article> {
    let doc = Html::parse_document(&page.html);
    let meta = page_meta(&doc);
    let selected = select_content(&doc, rule, url.as_str())?;
    let text = html_to_text(&selected, Some(&page.final_url))?;

    if text.is_empty() {
        return Err(AutoNewsError::extraction(url.as_str(), "no text content"));
    }

    Ok(Article {
        url: url.clone(),
        title: meta.title,
        text,
        author: meta.author,
        published_at: meta
            .published_at
            .or(page.last_modified)
            .unwrap_or(page.fetched_at),
    })
}
