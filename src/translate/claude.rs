//! Claude Messages API translation client.
//! Connection pooling via reqwest. One HTTP request per call; retries,
//! backoff and throttling are the engine's job, so every failure is mapped
//! to a `TranslateError` the retry policy can classify.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{GlossaryEntry, TranslateError, TranslateRequest, TranslateResult, Translator};
use crate::config::{ApiConfig, API_KEY_ENV};

pub struct ClaudeClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    anthropic_version: String,
}

impl ClaudeClient {
    /// Create a client, reading the API key from `ANTHROPIC_API_KEY`.
    pub fn from_env(config: &ApiConfig) -> Result<Self, TranslateError> {
        let api_key = std::env::var(API_KEY_ENV).map_err(|_| {
            TranslateError::InvalidInput(format!("{API_KEY_ENV} environment variable not set"))
        })?;
        Self::new(config, api_key)
    }

    pub fn new(config: &ApiConfig, api_key: impl Into<String>) -> Result<Self, TranslateError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(TranslateError::InvalidInput("empty API key".into()));
        }

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TranslateError::Api(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            anthropic_version: config.anthropic_version.clone(),
        })
    }

    fn request_body(&self, request: &TranslateRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": estimate_max_tokens(&request.text, self.max_tokens),
            "temperature": 0.0,
            "system": system_prompt(request.source_lang.as_deref(), &request.target_lang),
            "messages": [
                {"role": "user", "content": build_user_prompt(request)}
            ]
        })
    }
}

#[async_trait]
impl Translator for ClaudeClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn translate(
        &self,
        request: &TranslateRequest,
    ) -> Result<TranslateResult, TranslateError> {
        if request.text.trim().is_empty() {
            return Err(TranslateError::InvalidInput("empty text".into()));
        }

        let start = Instant::now();
        let result = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.anthropic_version)
            .header("content-type", "application/json")
            .json(&self.request_body(request))
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(TranslateError::Timeout),
            Err(e) => return Err(TranslateError::Network(e.to_string())),
        };

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(0);
            warn!(retry_after_ms, "429 rate limited by API");
            return Err(TranslateError::RateLimited { retry_after_ms });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(TranslateError::Auth(truncate(&body_text, 200)));
        }
        // includes 529 (overloaded)
        if status.is_server_error() {
            warn!(status = status.as_u16(), "API server error");
            return Err(TranslateError::Server {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(TranslateError::Api(format!(
                "unexpected status {}: {}",
                status,
                truncate(&body_text, 200)
            )));
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| TranslateError::MalformedOutput(e.to_string()))?;

        if parsed.stop_reason.as_deref() == Some("max_tokens") {
            return Err(TranslateError::MalformedOutput(
                "response truncated at max_tokens".into(),
            ));
        }

        let translated_text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        if translated_text.trim().is_empty() {
            return Err(TranslateError::MalformedOutput("empty completion".into()));
        }

        let tokens_used = parsed
            .usage
            .map(|u| u.input_tokens + u.output_tokens)
            .unwrap_or(0);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(tokens_used, elapsed_ms, target = %request.target_lang, "claude translation done");

        Ok(TranslateResult {
            translated_text: translated_text.trim().to_string(),
            tokens_used,
        })
    }
}

// --- Prompt construction ---

fn system_prompt(source_lang: Option<&str>, target_lang: &str) -> String {
    let from = source_lang
        .map(|l| format!(" from {l}"))
        .unwrap_or_default();
    format!(
        "You are a professional translator for a publishing system. \
         The user sends a JSON object; translate its \"text\" field{from} into {target_lang}, \
         using the optional \"glossary\" map for fixed term translations. \
         Tokens like <<PH0>> are placeholders: copy each one unchanged and keep it \
         next to the words it belongs to. Never translate, add or drop placeholders. \
         Output only the translation, nothing else."
    )
}

/// Compact JSON prompt: {"kind":..,"text":..,"glossary":{src:tgt}}.
fn build_user_prompt(request: &TranslateRequest) -> String {
    let mut prompt = serde_json::json!({
        "kind": request.context,
        "text": request.text,
    });
    if !request.glossary_entries.is_empty() {
        let glossary: serde_json::Map<String, serde_json::Value> = request
            .glossary_entries
            .iter()
            .map(|GlossaryEntry { source, target, .. }| {
                (source.clone(), serde_json::Value::String(target.clone()))
            })
            .collect();
        prompt["glossary"] = serde_json::Value::Object(glossary);
    }
    prompt.to_string()
}

/// Estimate max_tokens: (input_tokens * 2 + 64), capped at the configured limit.
fn estimate_max_tokens(text: &str, cap: u32) -> u32 {
    // Rough: ~3 chars/token; target languages can run longer than the source
    let estimated_input_tokens = text.len() as f64 / 3.0;
    let max = (estimated_input_tokens * 2.0 + 64.0) as u32;
    max.clamp(64, cap.max(64))
}

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

// --- Response types ---

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(text: &str) -> TranslateRequest {
        TranslateRequest {
            text: text.into(),
            source_lang: Some("en".into()),
            target_lang: "fr".into(),
            context: "post title (plain text)",
            glossary_entries: vec![GlossaryEntry {
                source: "Acme".into(),
                target: "Acme".into(),
                lang: None,
            }],
        }
    }

    fn client(server: &MockServer) -> ClaudeClient {
        let config = ApiConfig {
            base_url: server.uri(),
            timeout_secs: 5,
            ..ApiConfig::default()
        };
        ClaudeClient::new(&config, "test-key").unwrap()
    }

    #[tokio::test]
    async fn test_successful_translation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": " Bonjour Acme "}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 5}
            })))
            .mount(&server)
            .await;

        let result = client(&server).translate(&request("Hello Acme")).await.unwrap();
        assert_eq!(result.translated_text, "Bonjour Acme");
        assert_eq!(result.tokens_used, 17);
    }

    #[tokio::test]
    async fn test_rate_limit_maps_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let err = client(&server).translate(&request("Hi")).await.unwrap_err();
        assert!(matches!(err, TranslateError::RateLimited { retry_after_ms: 3000 }));
    }

    #[tokio::test]
    async fn test_huge_retry_after_saturates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", "18446744073709552"),
            )
            .mount(&server)
            .await;

        let err = client(&server).translate(&request("Hi")).await.unwrap_err();
        assert!(matches!(err, TranslateError::RateLimited { retry_after_ms: u64::MAX }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_and_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .mount(&server)
            .await;

        let c = client(&server);
        let first = c.translate(&request("Hi")).await.unwrap_err();
        assert!(matches!(first, TranslateError::Server { status: 529 }));
        assert!(first.is_retryable());
        let second = c.translate(&request("Hi")).await.unwrap_err();
        assert!(matches!(second, TranslateError::Auth(_)));
        assert!(!second.is_retryable());
    }

    #[tokio::test]
    async fn test_truncated_output_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "Bonj"}],
                "stop_reason": "max_tokens"
            })))
            .mount(&server)
            .await;

        let err = client(&server).translate(&request("Hello")).await.unwrap_err();
        assert!(matches!(err, TranslateError::MalformedOutput(_)));
    }

    #[test]
    fn test_user_prompt_carries_glossary() {
        let prompt = build_user_prompt(&request("Say \"hi\"\n"));
        let parsed: serde_json::Value = serde_json::from_str(&prompt).unwrap();
        assert_eq!(parsed["text"], "Say \"hi\"\n");
        assert_eq!(parsed["glossary"]["Acme"], "Acme");
    }

    #[test]
    fn test_max_tokens_bounds() {
        assert_eq!(estimate_max_tokens("", 4096), 64);
        assert_eq!(estimate_max_tokens(&"x".repeat(100_000), 4096), 4096);
    }

    #[test]
    fn test_empty_api_key_rejected() {
        assert!(ClaudeClient::new(&ApiConfig::default(), "  ").is_err());
    }
}
