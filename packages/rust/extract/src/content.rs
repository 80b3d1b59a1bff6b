//! Content selection and page metadata.
//!
//! A configured rule (CSS selector or a simple XPath) wins; otherwise a
//! main-content heuristic picks the article area and strips page chrome.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use autonews_shared::{AutoNewsError, Result};

/// Candidate containers tried in order before falling back to text density.
const MAIN_CANDIDATES: &[&str] = &[
    "article",
    "main",
    r#"[role="main"]"#,
    ".content",
    "#content",
    ".post",
    ".entry-content",
];

/// Elements removed from heuristically selected content.
const CHROME_SELECTOR: &str = "nav, header, footer, aside, script, style, noscript, form, iframe, \
    .sidebar, .nav, .menu, .ads, .ad, .advert, .advertisement, .sponsored, .promo, \
    [class^='ad-'], [class*=' ad-'], [id^='ad-'], [class*='cookie'], [class*='newsletter']";

/// Text shorter than this does not count as a main-content match.
const MIN_CANDIDATE_TEXT: usize = 40;

static CHROME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(CHROME_SELECTOR).expect("valid selector"));

static BODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid selector"));

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Select the content HTML of a page.
///
/// With a rule, every matching element is kept in document order and a rule
/// that matches nothing is an extraction failure for `url`.
pub fn select_content(doc: &Html, rule: Option<&str>, url: &str) -> Result<String> {
    match rule.map(str::trim).filter(|r| !r.is_empty()) {
        Some(rule) => {
            let css = rule_to_css(rule)?;
            let selector = Selector::parse(&css)
                .map_err(|e| AutoNewsError::config(format!("invalid selector '{rule}': {e:?}")))?;
            let parts: Vec<String> = doc.select(&selector).map(|el| el.html()).collect();
            if parts.is_empty() {
                return Err(AutoNewsError::extraction(
                    url,
                    format!("selector '{rule}' matched nothing"),
                ));
            }
            Ok(parts.join("\n"))
        }
        None => Ok(strip_chrome(&main_content(doc))),
    }
}

/// Select the area whose links a digest page expands.
///
/// A rule selects exactly as for article content. Without one the whole body
/// minus chrome is used, since index pages often hold many `article` teasers.
pub fn select_link_area(doc: &Html, rule: Option<&str>, url: &str) -> Result<String> {
    if rule.is_some_and(|r| !r.trim().is_empty()) {
        return select_content(doc, rule, url);
    }
    let body = doc
        .select(&BODY_SEL)
        .next()
        .map(|body| body.inner_html())
        .unwrap_or_default();
    Ok(strip_chrome(&body))
}

/// Translate a selection rule to CSS.
///
/// Rules starting with `/` are read as XPath in the `//tag[@attr='v']` subset:
/// descendant (`//`) and child (`/`) steps, `*`, and `[@attr]`/`[@attr='v']`
/// predicates. Anything else is returned unchanged as CSS.
pub fn rule_to_css(rule: &str) -> Result<String> {
    if !rule.starts_with('/') {
        return Ok(rule.to_string());
    }

    static STEP_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"^(//|/)([A-Za-z*][\w-]*)((?:\[@[\w:-]+(?:\s*=\s*(?:'[^']*'|"[^"]*"))?\])*)"#)
            .expect("valid regex")
    });
    static PRED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"\[@([\w:-]+)(?:\s*=\s*(?:'([^']*)'|"([^"]*)"))?\]"#).expect("valid regex")
    });

    let mut css = String::new();
    let mut rest = rule;

    while !rest.is_empty() {
        let caps = STEP_RE.captures(rest).ok_or_else(|| {
            AutoNewsError::config(format!("unsupported XPath expression '{rule}'"))
        })?;
        let axis = &caps[1];
        let tag = &caps[2];

        if !css.is_empty() {
            css.push_str(if axis == "//" { " " } else { " > " });
        }
        css.push_str(tag);

        for pred in PRED_RE.captures_iter(&caps[3]) {
            let attr = &pred[1];
            match pred.get(2).or_else(|| pred.get(3)) {
                Some(value) => {
                    let escaped = value.as_str().replace('"', "\\\"");
                    css.push_str(&format!("[{attr}=\"{escaped}\"]"));
                }
                None => css.push_str(&format!("[{attr}]")),
            }
        }

        rest = &rest[caps[0].len()..];
    }

    Ok(css)
}

/// Main-content heuristic: first substantial candidate container, else the
/// densest text block in `body`, else the whole body.
fn main_content(doc: &Html) -> String {
    for sel_str in MAIN_CANDIDATES {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        if let Some(el) = doc
            .select(&sel)
            .find(|el| visible_text_len(el) >= MIN_CANDIDATE_TEXT)
        {
            return el.inner_html();
        }
    }

    if let Some(el) = densest_block(doc) {
        return el.inner_html();
    }

    doc.select(&BODY_SEL)
        .next()
        .map(|body| body.inner_html())
        .unwrap_or_default()
}

/// The block whose own paragraphs carry the most text.
fn densest_block(doc: &Html) -> Option<ElementRef<'_>> {
    static BLOCK_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("body div, body section, body td").expect("valid selector"));

    doc.select(&BLOCK_SEL)
        .filter(|el| !is_within_chrome(el))
        .map(|el| (own_paragraph_text_len(&el), el))
        .filter(|(len, _)| *len >= MIN_CANDIDATE_TEXT)
        .max_by_key(|(len, _)| *len)
        .map(|(_, el)| el)
}

fn own_paragraph_text_len(el: &ElementRef<'_>) -> usize {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(|child| matches!(child.value().name(), "p" | "pre" | "blockquote" | "ul" | "ol"))
        .map(|child| visible_text_len(&child))
        .sum()
}

fn visible_text_len(el: &ElementRef<'_>) -> usize {
    el.text().map(|t| t.trim().len()).sum()
}

fn is_within_chrome(el: &ElementRef<'_>) -> bool {
    std::iter::once(*el)
        .chain(el.ancestors().filter_map(ElementRef::wrap))
        .any(|e| CHROME_SEL.matches(&e))
}

/// Strip navigation, ads and other chrome elements from an HTML fragment.
pub fn strip_chrome(html: &str) -> String {
    let doc = Html::parse_fragment(html);

    let mut chrome: Vec<String> = doc.select(&CHROME_SEL).map(|el| el.html()).collect();
    // Outer elements first so nested chrome disappears with its parent.
    chrome.sort_by_key(|outer| std::cmp::Reverse(outer.len()));

    let mut result = doc.root_element().inner_html();
    for outer in chrome {
        result = result.replace(&outer, "");
    }
    result
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Outbound links of an HTML fragment, resolved against `base`.
///
/// Fragment-only, `javascript:` and `mailto:` links are skipped; fragments are
/// stripped and duplicates dropped, preserving document order.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    static LINK_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

    let doc = Html::parse_fragment(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for el in doc.select(&LINK_SEL) {
        let Some(href) = el.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty()
            || href.starts_with('#')
            || href.to_ascii_lowercase().starts_with("javascript:")
            || href.to_ascii_lowercase().starts_with("mailto:")
        {
            continue;
        }

        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        resolved.set_fragment(None);

        if seen.insert(resolved.to_string()) {
            links.push(resolved);
        }
    }

    links
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Title, author and publish time found in a page's markup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMeta {
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Read title/author/published metadata from a parsed page.
pub fn page_meta(doc: &Html) -> PageMeta {
    PageMeta {
        title: first_attr(doc, r#"meta[property="og:title"]"#, "content")
            .or_else(|| first_text(doc, "title"))
            .or_else(|| first_text(doc, "h1")),
        author: first_attr(doc, r#"meta[name="author"]"#, "content")
            .or_else(|| first_attr(doc, r#"meta[property="article:author"]"#, "content")),
        published_at: published_at(doc),
    }
}

fn published_at(doc: &Html) -> Option<DateTime<Utc>> {
    const SOURCES: &[(&str, &str)] = &[
        (r#"meta[property="article:published_time"]"#, "content"),
        (r#"meta[property="og:published_time"]"#, "content"),
        (r#"meta[itemprop="datePublished"]"#, "content"),
        (r#"meta[name="datePublished"]"#, "content"),
        (r#"[itemprop="datePublished"][datetime]"#, "datetime"),
        ("time[datetime]", "datetime"),
        (r#"meta[name="pubdate"]"#, "content"),
        ("time[pubdate]", "datetime"),
    ];

    SOURCES
        .iter()
        .filter_map(|(sel, attr)| first_attr(doc, sel, attr))
        .find_map(|raw| parse_timestamp(&raw))
}

/// Parse the timestamp formats pages commonly carry.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn first_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .filter_map(|el| el.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .find(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE_PAGE: &str = r#"<html><head>
        <title>Fallback title</title>
        <meta property="og:title" content="Rust 2024 is here">
        <meta name="author" content="Ferris">
        <meta property="article:published_time" content="2024-02-20T10:00:00+01:00">
        </head><body>
        <nav><a href="/">Home</a></nav>
        <article>
          <h1>Rust 2024 is here</h1>
          <p>The new edition stabilizes a long list of improvements to the language.</p>
          <aside>Related posts</aside>
          <div class="ad-banner">Buy now</div>
        </article>
        <footer>Copyright</footer>
        </body></html>"#;

    #[test]
    fn xpath_subset_translates_to_css() {
        assert_eq!(rule_to_css("//div[@class='post-body']").unwrap(), r#"div[class="post-body"]"#);
        assert_eq!(
            rule_to_css("//main/article[@id=\"story\"]//p").unwrap(),
            r#"main > article[id="story"] p"#
        );
        assert_eq!(rule_to_css("//*[@data-content]").unwrap(), "*[data-content]");
        assert_eq!(rule_to_css("div.post > p").unwrap(), "div.post > p");
        assert!(rule_to_css("//div[contains(@class,'x')]").is_err());
    }

    #[test]
    fn heuristic_prefers_article_and_strips_chrome() {
        let doc = Html::parse_document(ARTICLE_PAGE);
        let html = select_content(&doc, None, "https://example.com/a").unwrap();
        assert!(html.contains("long list of improvements"));
        assert!(!html.contains("Related posts"));
        assert!(!html.contains("Buy now"));
        assert!(!html.contains("Copyright"));
    }

    #[test]
    fn heuristic_falls_back_to_densest_block() {
        let page = r#"<html><body>
            <div class="menu"><p>Home About Contact and many other menu entries here</p></div>
            <div id="wrap"><div class="story">
              <p>First paragraph of the story with enough words to count as content.</p>
              <p>Second paragraph continues the story with more detail.</p>
            </div></div>
        </body></html>"#;
        let doc = Html::parse_document(page);
        let html = select_content(&doc, None, "https://example.com/b").unwrap();
        assert!(html.contains("Second paragraph"));
        assert!(!html.contains("menu entries"));
    }

    #[test]
    fn rule_matching_nothing_fails() {
        let doc = Html::parse_document(ARTICLE_PAGE);
        let err = select_content(&doc, Some("//div[@class='missing']"), "https://example.com/a")
            .unwrap_err();
        assert!(matches!(err, AutoNewsError::Extraction { .. }));
    }

    #[test]
    fn rule_keeps_all_matches() {
        let page = r#"<body><p class="x">one</p><p>skip</p><p class="x">two</p></body>"#;
        let doc = Html::parse_document(page);
        let html = select_content(&doc, Some("p.x"), "u").unwrap();
        assert!(html.contains("one") && html.contains("two"));
        assert!(!html.contains("skip"));
    }

    #[test]
    fn links_are_filtered_resolved_and_deduplicated() {
        let html = r##"<a href="/a">A</a><a href="#top">Top</a><a href="javascript:void(0)">JS</a>
            <a href="mailto:x@example.com">Mail</a><a href="b#frag">B</a><a href="/a">A again</a>
            <a href="https://other.org/c">C</a>"##;
        let base = Url::parse("https://example.com/index/").unwrap();
        let links: Vec<String> = extract_links(html, &base).iter().map(Url::to_string).collect();
        assert_eq!(
            links,
            vec![
                "https://example.com/a",
                "https://example.com/index/b",
                "https://other.org/c",
            ]
        );
    }

    #[test]
    fn link_area_covers_every_teaser() {
        let page = r#"<html><body><nav><a href="/login">Login</a></nav>
            <article><a href="/p/1">One</a> teaser text that is long enough to matter here</article>
            <article><a href="/p/2">Two</a> teaser text that is long enough to matter here</article>
            </body></html>"#;
        let doc = Html::parse_document(page);
        let area = select_link_area(&doc, None, "https://example.com/").unwrap();
        let base = Url::parse("https://example.com/").unwrap();
        let links = extract_links(&area, &base);
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.path().starts_with("/p/")));
    }

    #[test]
    fn metadata_extraction() {
        let doc = Html::parse_document(ARTICLE_PAGE);
        let meta = page_meta(&doc);
        assert_eq!(meta.title.as_deref(), Some("Rust 2024 is here"));
        assert_eq!(meta.author.as_deref(), Some("Ferris"));
        assert_eq!(
            meta.published_at.unwrap().to_rfc3339(),
            "2024-02-20T09:00:00+00:00"
        );
    }

    #[test]
    fn metadata_falls_back_to_title_and_time_element() {
        let page = r#"<html><head><title>Plain</title></head><body>
            <time datetime="2023-11-05">Nov 5</time></body></html>"#;
        let meta = page_meta(&Html::parse_document(page));
        assert_eq!(meta.title.as_deref(), Some("Plain"));
        assert_eq!(meta.author, None);
        assert_eq!(meta.published_at.unwrap().to_rfc3339(), "2023-11-05T00:00:00+00:00");
    }
}
