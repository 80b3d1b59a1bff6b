//! Web content extraction for AutoNews.
//!
//! This crate provides:
//! - [`Extractor`], which fetches pages directly or through a [`PageRenderer`],
//!   honouring per-source proxy, headers and user agent
//! - [`content`], rule-based and heuristic content selection plus metadata
//! - [`text`], HTML-to-text normalization
//! - digest expansion: a page treated as a link index with bounded fan-out

pub mod content;
pub mod engine;
pub mod render;
pub mod text;

pub use content::{
    PageMeta, extract_links, page_meta, parse_timestamp, rule_to_css, select_content, strip_chrome,
};
pub use engine::{Article, Digest, DigestOutcome, Extraction, Extractor, RequestProfile};
pub use render::PageRenderer;
#[cfg(feature = "browser")]
pub use render::ChromiumRenderer;
pub use text::html_to_text;
