//! Generation service: summaries, classification and embeddings.
//!
//! [`OpenAiGenerator`] talks to any OpenAI-compatible endpoint (OpenRouter by
//! default). It makes exactly one HTTP call per operation; retries and
//! concurrency limits live in [`crate::throttle`].

use std::time::Duration;

use async_trait::async_trait;
use autonews_shared::{
    AppConfig, AutoNewsError, Classification, GenerationSettings, Result, USER_AGENT,
    validate_api_key,
};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::prompts;

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Summarize `text`, truncated to `max_length` characters first.
    async fn summarize(
        &self,
        text: &str,
        max_length: usize,
        target_language: Option<&str>,
    ) -> Result<String>;

    /// Topics, categories and a quality score in `0..=1`.
    ///
    /// An unparsable model reply is reported as [`AutoNewsError::Parse`].
    async fn classify_and_score(&self, text: &str) -> Result<Classification>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Provider label used in cache keys.
    fn provider(&self) -> &str;

    /// Chat model used in cache keys.
    fn model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible client
// ---------------------------------------------------------------------------

pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    provider: String,
    model: String,
    embedding_model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiGenerator {
    pub fn new(settings: &GenerationSettings, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| AutoNewsError::Network(format!("client build: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            provider: settings.provider.clone(),
            model: settings.model.clone(),
            embedding_model: settings.embedding_model.clone(),
        })
    }

    /// Build from the app config, reading the API key from the configured
    /// environment variable.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = validate_api_key(config)?;
        Self::new(&config.generation, api_key)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AutoNewsError::Network(format!("{path}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response.text().await.unwrap_or_default();
        warn!(%status, path, "generation API error");
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => {
                AutoNewsError::QuotaExceeded(format!("{}: {detail}", self.provider))
            }
            s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
                AutoNewsError::Network(format!("{path}: HTTP {s}"))
            }
            s => AutoNewsError::Generation(format!("{path}: HTTP {s}: {detail}")),
        })
    }

    async fn chat(&self, prompt: String) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.0,
        });
        let response: ChatResponse = self
            .post("chat/completions", &body)
            .await?
            .json()
            .await
            .map_err(|e| AutoNewsError::parse(format!("chat response: {e}")))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AutoNewsError::Generation("empty completion".into()))
    }
}

#[async_trait]
impl GenerationService for OpenAiGenerator {
    #[instrument(skip_all, fields(model = %self.model, chars = text.len()))]
    async fn summarize(
        &self,
        text: &str,
        max_length: usize,
        target_language: Option<&str>,
    ) -> Result<String> {
        let input = truncate_chars(text, max_length);
        let summary = self.chat(prompts::summary(input, target_language)).await?;
        debug!(summary_chars = summary.len(), "summary generated");
        Ok(summary.trim().to_string())
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn classify_and_score(&self, text: &str) -> Result<Classification> {
        let reply = self.chat(prompts::classify(text)).await?;
        parse_classification(&reply)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.embedding_model, "input": text });
        let response: EmbeddingResponse = self
            .post("embeddings", &body)
            .await?
            .json()
            .await
            .map_err(|e| AutoNewsError::parse(format!("embedding response: {e}")))?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AutoNewsError::Generation("empty embedding".into()))
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// First `max` characters of `text`, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The first balanced `{...}` object in `text`, skipping braces inside JSON
/// strings. Tolerates prose and code fences around the object.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TopicEntry {
    Tagged {
        topic: String,
        #[serde(default)]
        category: Option<String>,
    },
    Plain(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Score {
    Number(f32),
    Text(String),
}

#[derive(Deserialize)]
struct ClassificationReply {
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    topics: Vec<TopicEntry>,
    #[serde(default, alias = "score")]
    overall_score: Option<Score>,
}

/// Parse a classifier reply into a [`Classification`].
pub fn parse_classification(reply: &str) -> Result<Classification> {
    let object = first_json_object(reply)
        .ok_or_else(|| AutoNewsError::parse("no JSON object in classifier reply"))?;
    let parsed: ClassificationReply = serde_json::from_str(object)
        .map_err(|e| AutoNewsError::parse(format!("classifier reply: {e}")))?;

    let score = match parsed.overall_score {
        Some(Score::Number(n)) => n,
        Some(Score::Text(s)) => s
            .trim()
            .parse::<f32>()
            .map_err(|_| AutoNewsError::parse(format!("non-numeric score {s:?}")))?,
        None => return Err(AutoNewsError::parse("classifier reply has no score")),
    };
    if !score.is_finite() {
        return Err(AutoNewsError::parse("classifier score is not finite"));
    }

    let mut topics = Vec::new();
    let mut categories: Vec<String> = Vec::new();
    for entry in parsed.topics {
        match entry {
            TopicEntry::Tagged { topic, category } => {
                topics.push(topic);
                if let Some(category) = category.filter(|c| !c.trim().is_empty()) {
                    if !categories.contains(&category) {
                        categories.push(category);
                    }
                }
            }
            TopicEntry::Plain(topic) => topics.push(topic),
        }
    }

    Ok(Classification {
        topics,
        categories,
        score: score.clamp(0.0, 1.0),
        feedback: parsed.feedback,
    })
}
