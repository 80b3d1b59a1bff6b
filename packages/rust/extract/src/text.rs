//! HTML-to-text normalization.
//!
//! Selected HTML is converted to Markdown-flavoured plain text with `htmd`,
//! then a short series of cleanup passes normalizes links and whitespace.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;
use url::Url;

use autonews_shared::{AutoNewsError, Result};

/// Convert an HTML fragment to normalized text.
///
/// Relative links are resolved against `base_url` when given.
pub fn html_to_text(html: &str, base_url: Option<&Url>) -> Result<String> {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec![
            "script", "style", "nav", "iframe", "noscript", "svg", "form", "button",
        ])
        .build();

    let raw = converter
        .convert(html)
        .map_err(|e| AutoNewsError::Conversion(format!("htmd conversion failed: {e}")))?;

    debug!(raw_len = raw.len(), "htmd conversion complete");

    Ok(run_pipeline(&raw, base_url))
}

/// Run the cleanup passes on raw converter output.
fn run_pipeline(md: &str, base_url: Option<&Url>) -> String {
    let mut result = strip_leftover_html(md);
    result = resolve_links(&result, base_url);
    result = normalize_whitespace(&result);
    result = collapse_blank_lines(&result);
    result.trim().to_string()
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

/// Remove structural tags that survived the conversion, keeping their content.
/// Code blocks are left untouched.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|main)(?:\s[^>]*)?>")
            .expect("valid regex")
    });

    let mut out = Vec::new();
    let mut in_code_block = false;

    for line in md.lines() {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
            out.push(line.to_string());
        } else if in_code_block {
            out.push(line.to_string());
        } else {
            out.push(HTML_TAG_RE.replace_all(line, "").to_string());
        }
    }

    out.join("\n")
}

/// Resolve relative URLs in Markdown links against a base URL.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    let Some(base) = base_url else {
        return md.to_string();
    };

    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    LINK_RE
        .replace_all(md, |caps: &regex::Captures| {
            let text = &caps[1];
            let href = &caps[2];

            if href.starts_with("http://")
                || href.starts_with("https://")
                || href.starts_with('#')
                || href.starts_with("mailto:")
            {
                return caps[0].to_string();
            }

            match base.join(href) {
                Ok(resolved) => format!("[{text}]({resolved})"),
                Err(_) => caps[0].to_string(),
            }
        })
        .to_string()
}

/// Trim trailing whitespace, turn non-breaking spaces into spaces and collapse
/// runs of inline spaces outside code blocks.
fn normalize_whitespace(md: &str) -> String {
    static SPACES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));

    let mut in_code_block = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_code_block = !in_code_block;
                return line.trim_end().to_string();
            }
            if in_code_block {
                return line.trim_end().to_string();
            }
            let line = line.replace('\u{a0}', " ");
            let indent_len = line.len() - line.trim_start().len();
            let (indent, body) = line.split_at(indent_len);
            format!("{indent}{}", SPACES_RE.replace_all(body.trim_end(), " "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse runs of blank lines into a single blank line.
fn collapse_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}
