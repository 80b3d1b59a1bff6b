//! Core pipeline orchestration and domain logic for AutoNews.
//!
//! This crate ties together source connectors, the generation service, the
//! fingerprint cache, the similarity index and the sink into one run
//! (Pull → Dedup → Score → Summarize → Rank → Push), and selects digests
//! from what was pushed.

pub mod connectors;
pub mod digest;
pub mod generation;
pub mod pipeline;
pub mod prompts;
pub mod throttle;

pub use connectors::{ConnectorRegistry, Pulled, SourceConnector};
pub use generation::{GenerationService, OpenAiGenerator};
pub use pipeline::{
    CancelFlag, Collaborators, Pipeline, PipelineStage, ProgressReporter, RunSummary,
    SilentProgress, SourceReport,
};
pub use throttle::{ProviderLimits, Throttled};
