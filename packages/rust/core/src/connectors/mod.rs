//! Source connector trait and the built-in connectors.
//!
//! A connector turns one configured source into raw items. The registry maps
//! each [`SourceType`] to the connector that serves it.

mod feed;
mod web;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use autonews_extract::Extractor;
use autonews_shared::{AutoNewsError, RawItem, Result, SourceConfig, SourceType};
use chrono::{DateTime, Utc};

pub use feed::{FeedConnector, parse_feed};
pub use web::WebConnector;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Result of pulling one source.
#[derive(Debug, Clone, PartialEq)]
pub enum Pulled {
    /// Upstream reported no change since `since`.
    NotModified,
    Items(Vec<RawItem>),
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Pull raw items. `since` is the last attempted run of this source and
    /// becomes a conditional request where the transport supports one.
    async fn pull(&self, source: &SourceConfig, since: Option<DateTime<Utc>>) -> Result<Pulled>;

    /// Human-readable connector name for tracing.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Connectors keyed by source type.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<SourceType, Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in connectors. Feeds, forums and video
    /// channels share the feed connector; document inboxes need an external
    /// connector.
    pub fn with_defaults(extractor: Extractor) -> Self {
        let feed: Arc<dyn SourceConnector> = Arc::new(FeedConnector::new(extractor.clone()));
        let mut registry = Self::new();
        registry.register(SourceType::Feed, feed.clone());
        registry.register(SourceType::Forum, feed.clone());
        registry.register(SourceType::Video, feed);
        registry.register(SourceType::WebPage, Arc::new(WebConnector::new(extractor)));
        registry
    }

    pub fn register(&mut self, source_type: SourceType, connector: Arc<dyn SourceConnector>) {
        self.connectors.insert(source_type, connector);
    }

    /// Connector for `source_type`, or a configuration error if none is
    /// registered.
    pub fn get(&self, source_type: SourceType) -> Result<Arc<dyn SourceConnector>> {
        self.connectors.get(&source_type).cloned().ok_or_else(|| {
            AutoNewsError::config(format!("no connector registered for source type '{source_type}'"))
        })
    }
}

#[cfg(test)]
mod tests {
    use autonews_shared::ExtractionConfig;

    use super::*;

    #[test]
    fn defaults_cover_everything_but_inbox() {
        let registry = ConnectorRegistry::with_defaults(Extractor::new(ExtractionConfig::default()).unwrap());
        assert_eq!(registry.get(SourceType::Feed).unwrap().name(), "feed");
        assert_eq!(registry.get(SourceType::Forum).unwrap().name(), "feed");
        assert_eq!(registry.get(SourceType::Video).unwrap().name(), "feed");
        assert_eq!(registry.get(SourceType::WebPage).unwrap().name(), "web");

        let err = registry.get(SourceType::DocumentInbox).err().unwrap();
        assert!(matches!(err, AutoNewsError::Config { .. }));
    }
}
