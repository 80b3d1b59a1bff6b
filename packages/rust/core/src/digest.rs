//! Digest selection and rendering.
//!
//! Reads recently edited items back from the sink, keeps the highly rated or
//! annotated ones, and renders a Markdown recap grouped by source type.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument};

use autonews_shared::{DigestConfig, Result, SourceType};
use autonews_storage::{Sink, SinkFilter, SinkRecord};

use crate::generation::truncate_chars;

const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Selected items, grouped by source type.
#[derive(Debug, Clone)]
pub struct Digest {
    pub generated_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub groups: BTreeMap<SourceType, Vec<SinkRecord>>,
    /// Items skipped because the user already read them.
    pub skipped_read: usize,
}

impl Digest {
    pub fn total(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// The rating used for inclusion: the user's when present, else the one
/// assigned at Rank.
pub fn effective_rating(record: &SinkRecord) -> Option<f32> {
    record.user_rating.or(record.rating)
}

/// Include an item if its rating reaches `min_rating` or it carries notes.
pub fn include(record: &SinkRecord, min_rating: f32) -> bool {
    effective_rating(record).is_some_and(|r| r >= min_rating) || !record.notes.trim().is_empty()
}

/// Select digest items from already-queried records.
pub fn select(records: Vec<SinkRecord>, config: &DigestConfig, now: DateTime<Utc>) -> Digest {
    let window_start = now - Duration::hours(i64::from(config.hours_back));
    let mut groups: BTreeMap<SourceType, Vec<SinkRecord>> = BTreeMap::new();
    let mut skipped_read = 0;

    for record in records {
        if record.edited_at < window_start {
            continue;
        }
        if config.skip_read && record.is_read() {
            skipped_read += 1;
            continue;
        }
        if !include(&record, config.min_rating) {
            debug!(title = %record.title, rating = ?effective_rating(&record), "excluded from digest");
            continue;
        }
        groups.entry(record.source_type).or_default().push(record);
    }

    for items in groups.values_mut() {
        items.sort_by(|a, b| {
            let ra = effective_rating(a).unwrap_or(f32::MIN);
            let rb = effective_rating(b).unwrap_or(f32::MIN);
            rb.total_cmp(&ra).then_with(|| b.edited_at.cmp(&a.edited_at))
        });
    }

    Digest {
        generated_at: now,
        window_start,
        groups,
        skipped_read,
    }
}

/// Query the sink for the window ending at `now` and select from it.
#[instrument(skip_all, fields(hours_back = config.hours_back, min_rating = config.min_rating))]
pub async fn build_digest(sink: &dyn Sink, config: &DigestConfig, now: DateTime<Utc>) -> Result<Digest> {
    let filter = SinkFilter {
        edited_since: Some(now - Duration::hours(i64::from(config.hours_back))),
        collection: None,
    };
    let records = sink.query(&filter).await?;
    let queried = records.len();
    let digest = select(records, config, now);
    info!(
        queried,
        included = digest.total(),
        skipped_read = digest.skipped_read,
        "digest selected"
    );
    Ok(digest)
}

/// Render the digest as Markdown.
pub fn render(digest: &Digest, config: &DigestConfig) -> String {
    let mut md = format!("# Digest - {}\n\n", digest.generated_at.format("%Y-%m-%d"));

    if digest.is_empty() {
        md.push_str("No significant news items found for this period.\n");
        return md;
    }

    let counts: Vec<String> = digest
        .groups
        .iter()
        .map(|(source_type, items)| format!("{source_type} ({})", items.len()))
        .collect();
    md.push_str(&format!(
        "{} items since {}: {}\n",
        digest.total(),
        digest.window_start.format("%Y-%m-%d %H:%M UTC"),
        counts.join(", ")
    ));

    let mut body = String::new();
    for (source_type, items) in &digest.groups {
        body.push_str(&format!("\n## {source_type} ({})\n", items.len()));
        for record in items {
            body.push_str(&render_item(record, config.item_max_chars));
        }
    }

    if body.chars().count() > config.max_content {
        body = truncate_chars(&body, config.max_content).to_string();
        body.push_str(TRUNCATION_MARKER);
        body.push('\n');
    }
    md.push_str(&body);
    md
}

fn render_item(record: &SinkRecord, max_chars: usize) -> String {
    let mut out = match &record.url {
        Some(url) => format!("\n### [{}]({url})\n\n", record.title),
        None => format!("\n### {}\n\n", record.title),
    };

    let mut meta = vec![format!("*{}*", record.source_list)];
    if let Some(rating) = effective_rating(record).filter(|r| *r >= 0.0) {
        meta.push(format!("rating {rating:.1}"));
    }
    if !record.topics.is_empty() {
        meta.push(record.topics.join(", "));
    }
    out.push_str(&meta.join(" · "));
    out.push('\n');

    let text = record.summary.as_deref().unwrap_or(&record.text).trim();
    if !text.is_empty() {
        out.push('\n');
        out.push_str(truncate_chars(text, max_chars).trim_end());
        out.push('\n');
    }

    let notes = record.notes.trim();
    if !notes.is_empty() {
        out.push_str(&format!("\n> {notes}\n"));
    }
    out
}
