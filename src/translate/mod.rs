//! LLM translation layer: request/response types, the `Translator` seam,
//! and the Claude client behind it.

pub mod cache;
pub mod claude;
pub mod glossary;
#[cfg(test)]
pub mod mock;
pub mod normalize;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One unit of text to translate.
#[derive(Debug, Clone, Serialize)]
pub struct TranslateRequest {
    /// Text with untranslatable tokens already replaced by placeholders.
    pub text: String,
    pub source_lang: Option<String>,
    pub target_lang: String,
    /// What the text is ("post title", "HTML content block", ...).
    pub context: &'static str,
    pub glossary_entries: Vec<GlossaryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
    /// Restrict the entry to one target language; `None` applies everywhere.
    #[serde(default)]
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateResult {
    pub translated_text: String,
    pub tokens_used: u32,
}

/// Translation backend adapter.
#[async_trait]
pub trait Translator: Send + Sync {
    fn model(&self) -> &str;

    async fn translate(
        &self,
        request: &TranslateRequest,
    ) -> Result<TranslateResult, TranslateError>;
}

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("API error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("throttled locally, retry after {retry_after_ms}ms")]
    Throttled { retry_after_ms: u64 },

    #[error("translation timeout")]
    Timeout,

    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    #[error("translation cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl TranslateError {
    /// Whether another attempt can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranslateError::Network(_)
                | TranslateError::Server { .. }
                | TranslateError::RateLimited { .. }
                | TranslateError::Throttled { .. }
                | TranslateError::Timeout
                | TranslateError::MalformedOutput(_)
        )
    }

    /// Server- or throttle-provided wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TranslateError::RateLimited { retry_after_ms }
            | TranslateError::Throttled { retry_after_ms }
                if *retry_after_ms > 0 =>
            {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}
