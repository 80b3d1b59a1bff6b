//! Shared types, error model, and configuration for AutoNews.
//!
//! This crate is the foundation depended on by all other AutoNews crates.
//! It provides:
//! - [`AutoNewsError`], the unified error type
//! - Domain types ([`Item`], [`RawItem`], [`SourceConfig`], [`Fingerprint`])
//! - Configuration ([`AppConfig`], runtime snapshots, config loading)
//! - [`retry`], bounded backoff for transient failures

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheSettings, DefaultsConfig, DigestConfig, DigestSettings, DistanceMetric,
    ExtractionConfig, ExtractionSettings, GenerationSettings, PipelineConfig, PipelineSettings,
    SinkSettings, USER_AGENT, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, validate_api_key,
};
pub use error::{AutoNewsError, Result};
pub use retry::{RetryPolicy, retry, retry_with_quota};
pub use types::{
    Classification, Fingerprint, HeaderSpec, Item, RawItem, Relevance, SourceConfig, SourceType,
};
