use async_trait::async_trait;
use autonews_extract::{Article, DigestOutcome, Extraction, Extractor};
use autonews_shared::{AutoNewsError, RawItem, Result, SourceConfig};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use url::Url;

use super::{Pulled, SourceConnector};

/// Web pages and digest indexes, through the extraction engine.
pub struct WebConnector {
    extractor: Extractor,
}

impl WebConnector {
    pub fn new(extractor: Extractor) -> Self {
        Self { extractor }
    }
}

fn to_raw(article: Article) -> RawItem {
    RawItem {
        native_id: None,
        url: Some(article.url.to_string()),
        title: article.title.unwrap_or_else(|| article.url.to_string()),
        text: article.text,
        author: article.author,
        published_at: Some(article.published_at),
        tags: Vec::new(),
    }
}

#[async_trait]
impl SourceConnector for WebConnector {
    #[instrument(skip_all, fields(source = %source.name, digest = source.digest))]
    async fn pull(&self, source: &SourceConfig, since: Option<DateTime<Utc>>) -> Result<Pulled> {
        if source.digest {
            return match self.extractor.extract_digest(source, since).await? {
                DigestOutcome::NotModified => Ok(Pulled::NotModified),
                DigestOutcome::Expanded(digest) => {
                    info!(
                        attempted = digest.attempted,
                        items = digest.articles.len(),
                        "digest pulled"
                    );
                    Ok(Pulled::Items(digest.articles.into_iter().map(to_raw).collect()))
                }
            };
        }

        let url = Url::parse(&source.url).map_err(|e| {
            AutoNewsError::config(format!("source '{}': invalid url: {e}", source.name))
        })?;
        match self.extractor.extract(source, &url, since).await? {
            Extraction::NotModified => Ok(Pulled::NotModified),
            Extraction::Article(article) => Ok(Pulled::Items(vec![to_raw(article)])),
        }
    }

    fn name(&self) -> &str {
        "web"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use autonews_shared::{ExtractionConfig, RetryPolicy, SourceType};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn extractor() -> Extractor {
        Extractor::new(ExtractionConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::none(),
            digest_limit: 30,
            concurrency: 2,
            user_agent: "AutoNews/test".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn single_page_becomes_one_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blog"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><head><title>Weekly notes</title></head><body>\
                 <main><p>Notes on compilers, allocators and scheduling for this week.</p></main></body></html>",
            ))
            .mount(&server)
            .await;

        let source = SourceConfig::new("Blog", SourceType::WebPage, format!("{}/blog", server.uri()));
        let Pulled::Items(items) = WebConnector::new(extractor()).pull(&source, None).await.unwrap() else {
            panic!("expected items");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Weekly notes");
        assert!(items[0].text.contains("allocators"));
        assert_eq!(items[0].identity(), Some(format!("{}/blog", server.uri()).as_str()));
    }

    #[tokio::test]
    async fn digest_links_become_items() {
        let server = MockServer::start().await;
        let index = format!(
            "<html><body><ul><li><a href=\"{0}/a\">A</a></li><li><a href=\"{0}/b\">B</a></li></ul></body></html>",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/index"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index))
            .mount(&server)
            .await;
        for p in ["/a", "/b"] {
            Mock::given(method("GET"))
                .and(path(p))
                .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                    "<html><body><article><p>Article at {p} with enough words to count as content.</p></article></body></html>"
                )))
                .mount(&server)
                .await;
        }

        let mut source = SourceConfig::new("Index", SourceType::WebPage, format!("{}/index", server.uri()));
        source.digest = true;
        let Pulled::Items(items) = WebConnector::new(extractor()).pull(&source, None).await.unwrap() else {
            panic!("expected items");
        };
        assert_eq!(items.len(), 2);
        assert!(items[0].url.as_deref().unwrap().ends_with("/a"));
        assert!(items[1].url.as_deref().unwrap().ends_with("/b"));
    }

    #[tokio::test]
    async fn not_modified_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blog"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let source = SourceConfig::new("Blog", SourceType::WebPage, format!("{}/blog", server.uri()));
        let pulled = WebConnector::new(extractor())
            .pull(&source, Some(Utc::now()))
            .await
            .unwrap();
        assert_eq!(pulled, Pulled::NotModified);
    }
}
