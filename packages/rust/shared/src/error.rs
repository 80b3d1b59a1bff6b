//! Error types for AutoNews.
//!
//! Library crates use [`AutoNewsError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all AutoNews operations.
#[derive(Debug, thiserror::Error)]
pub enum AutoNewsError {
    /// Configuration loading or validation error. Fatal for the affected source only.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transient network/HTTP error (timeouts, connection resets, 5xx, 429).
    #[error("network error: {0}")]
    Network(String),

    /// Generation provider rejected the call for quota/rate reasons.
    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Sink refused a write because a structural schema limit was reached.
    #[error("sink schema capacity exceeded: {0}")]
    SchemaCapacity(String),

    /// Content could not be extracted from a fetched page.
    #[error("extraction failed for {url}: {message}")]
    Extraction { url: String, message: String },

    /// HTML/XML/JSON parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Generation service error (API, or response parsing).
    #[error("generation error: {0}")]
    Generation(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-text conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AutoNewsError>;

impl AutoNewsError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an extraction error for `url`.
    pub fn extraction(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Extraction {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::QuotaExceeded(_))
    }

    /// Whether the error is a provider quota rejection (longer backoff applies).
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = AutoNewsError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = AutoNewsError::extraction("https://example.com/a", "selector matched nothing");
        assert!(err.to_string().contains("https://example.com/a"));
        assert!(err.to_string().contains("selector matched nothing"));
    }

    #[test]
    fn retry_classification() {
        assert!(AutoNewsError::Network("timeout".into()).is_retryable());
        assert!(AutoNewsError::QuotaExceeded("429".into()).is_retryable());
        assert!(AutoNewsError::QuotaExceeded("429".into()).is_quota());
        assert!(!AutoNewsError::Storage("gone".into()).is_retryable());
        assert!(!AutoNewsError::SchemaCapacity("full".into()).is_retryable());
        assert!(!AutoNewsError::extraction("u", "m").is_retryable());
    }
}
