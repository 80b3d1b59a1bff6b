//! RSS 2.0 / RSS 1.0 / Atom connector.
//!
//! Forum and video platforms publish the same formats (YouTube channels are
//! Atom with a `yt:videoId`), so they share this connector.

use async_trait::async_trait;
use autonews_extract::{Extraction, Extractor, html_to_text, parse_timestamp};
use autonews_shared::{AutoNewsError, RawItem, Result, SourceConfig};
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{Pulled, SourceConnector};

pub struct FeedConnector {
    extractor: Extractor,
}

impl FeedConnector {
    pub fn new(extractor: Extractor) -> Self {
        Self { extractor }
    }

    /// Replace feed excerpts with the extracted article body.
    async fn fetch_full_articles(&self, source: &SourceConfig, items: &mut [RawItem]) {
        for item in items.iter_mut() {
            let Some(link) = item.url.as_deref().and_then(|u| Url::parse(u).ok()) else {
                continue;
            };
            match self.extractor.extract(source, &link, None).await {
                Ok(Extraction::Article(article)) => {
                    debug!(url = %link, chars = article.text.len(), "full article fetched");
                    item.text = article.text;
                    if item.author.is_none() {
                        item.author = article.author;
                    }
                }
                Ok(Extraction::NotModified) => {}
                Err(e) => warn!(url = %link, error = %e, "full article fetch failed, keeping feed text"),
            }
        }
    }
}

#[async_trait]
impl SourceConnector for FeedConnector {
    #[instrument(skip_all, fields(source = %source.name))]
    async fn pull(&self, source: &SourceConfig, since: Option<DateTime<Utc>>) -> Result<Pulled> {
        let url = Url::parse(&source.url).map_err(|e| {
            AutoNewsError::config(format!("source '{}': invalid url: {e}", source.name))
        })?;

        let Some(body) = self.extractor.fetch_raw(source, &url, since).await? else {
            info!("feed not modified");
            return Ok(Pulled::NotModified);
        };

        let mut items = parse_feed(&body)?;
        let total = items.len();
        items.truncate(source.max_items);
        info!(total, kept = items.len(), "feed parsed");

        if source.fetch_full_article {
            self.fetch_full_articles(source, &mut items).await;
        }
        Ok(Pulled::Items(items))
    }

    fn name(&self) -> &str {
        "feed"
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Entry {
    id: Option<String>,
    link: Option<String>,
    title: Option<String>,
    summary: Option<String>,
    content: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    author: Option<String>,
    tags: Vec<String>,
}

impl Entry {
    fn into_raw(self) -> RawItem {
        let body = self.content.or(self.summary).unwrap_or_default();
        let text = html_to_text(&body, None).unwrap_or(body);
        let published_at = self
            .published
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.updated.as_deref().and_then(parse_timestamp));

        RawItem {
            native_id: self.id,
            title: self.title.or_else(|| self.link.clone()).unwrap_or_default(),
            url: self.link,
            text,
            author: self.author,
            published_at,
            tags: self.tags,
        }
    }

    /// Atom `<link href rel>`; only alternate (or unqualified) links count.
    fn take_link_attrs(&mut self, e: &BytesStart<'_>) {
        let mut href = None;
        let mut rel = None;
        for attr in e.attributes().flatten() {
            let value = attr.unescape_value().map(|v| v.into_owned()).ok();
            match attr.key.local_name().as_ref() {
                b"href" => href = value,
                b"rel" => rel = value,
                _ => {}
            }
        }
        if self.link.is_none() && matches!(rel.as_deref(), None | Some("alternate")) {
            self.link = href;
        }
    }

    fn take_category_attrs(&mut self, e: &BytesStart<'_>) {
        for attr in e.attributes().flatten() {
            if attr.key.local_name().as_ref() == b"term" {
                if let Ok(term) = attr.unescape_value() {
                    self.tags.push(term.into_owned());
                }
            }
        }
    }

    fn assign(&mut self, element: &[u8], text: String) {
        if text.is_empty() {
            return;
        }
        let slot = match element {
            b"title" => &mut self.title,
            b"link" => &mut self.link,
            b"guid" | b"id" | b"videoId" => &mut self.id,
            b"description" | b"summary" => &mut self.summary,
            b"encoded" | b"content" => &mut self.content,
            b"pubDate" | b"published" | b"date" => &mut self.published,
            b"updated" => &mut self.updated,
            b"author" | b"creator" | b"name" => &mut self.author,
            b"category" => {
                self.tags.push(text);
                return;
            }
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(text);
        }
    }
}

/// Parse an RSS or Atom document into raw items, in document order.
pub fn parse_feed(xml: &str) -> Result<Vec<RawItem>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut recognized = false;
    let mut current: Option<Entry> = None;
    let mut text = String::new();
    let mut items = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| AutoNewsError::parse(format!("feed XML at {}: {e}", reader.buffer_position())))?;

        match event {
            Event::Start(e) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"rss" | b"RDF" | b"feed" => recognized = true,
                    b"item" | b"entry" => current = Some(Entry::default()),
                    b"link" => {
                        if let Some(entry) = current.as_mut() {
                            entry.take_link_attrs(&e);
                        }
                    }
                    _ => {}
                }
                text.clear();
            }
            Event::Empty(e) => {
                if let Some(entry) = current.as_mut() {
                    match e.local_name().as_ref() {
                        b"link" => entry.take_link_attrs(&e),
                        b"category" => entry.take_category_attrs(&e),
                        _ => {}
                    }
                }
            }
            Event::Text(t) => match t.unescape() {
                Ok(s) => text.push_str(&s),
                Err(_) => text.push_str(&String::from_utf8_lossy(&t)),
            },
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Event::End(e) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"item" | b"entry" => {
                        if let Some(entry) = current.take() {
                            items.push(entry.into_raw());
                        }
                    }
                    element => {
                        if let Some(entry) = current.as_mut() {
                            entry.assign(element, text.trim().to_string());
                        }
                    }
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !recognized {
        return Err(AutoNewsError::parse("document is not an RSS or Atom feed"));
    }
    Ok(items)
}
