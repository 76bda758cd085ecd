//! LLM completion backends.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{GenerationError, GeneratorError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Text generation service behind the sentence generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Groq,
    Gemini,
    Mistral,
}

impl Provider {
    /// Prefix every key of this provider starts with, if any.
    pub fn key_prefix(self) -> Option<&'static str> {
        match self {
            Provider::Groq => Some("gsk_"),
            Provider::Gemini => Some("AIzaSy"),
            Provider::Mistral => None,
        }
    }

    /// Whether `key` looks like a key of this provider.
    pub fn accepts(self, key: &str) -> bool {
        !key.is_empty() && self.key_prefix().is_none_or(|prefix| key.starts_with(prefix))
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Groq => "llama-3.3-70b-versatile",
            Provider::Gemini => "gemini-1.5-flash",
            Provider::Mistral => "mistral-small-latest",
        }
    }

    /// Base URL of the completion API.
    pub fn default_endpoint(self) -> &'static str {
        match self {
            Provider::Groq => "https://api.groq.com/openai/v1/chat/completions",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/models",
            Provider::Mistral => "https://api.mistral.ai/v1/chat/completions",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::Groq => "groq",
            Provider::Gemini => "gemini",
            Provider::Mistral => "mistral",
        })
    }
}

/// Something able to answer a prompt using an API key.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str, key: &str) -> Result<String, GenerationError>;
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
    content: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

/// [`CompletionProvider`] talking to a hosted API over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    provider: Provider,
    model: String,
    endpoint: String,
}

impl HttpProvider {
    /// Create a new [`HttpProvider`], falling back to the provider's default
    /// model and endpoint.
    pub fn new(
        provider: Provider,
        model: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self, GeneratorError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("lexica/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            provider,
            model: model.unwrap_or_else(|| provider.default_model().to_owned()),
            endpoint: endpoint
                .unwrap_or_else(|| provider.default_endpoint().to_owned())
                .trim_end_matches('/')
                .to_owned(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, prompt: &str, key: &str) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .header(header::ACCEPT, "application/json")
            .json(&json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .await?;

        let body: ChatResponse = self.check(response).await?.json().await.map_err(|err| {
            tracing::debug!(error = %err, "unexpected completion payload");
            GenerationError::Generation("Unexpected response format".into())
        })?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::Generation("Unexpected response format".into()))
    }

    async fn gemini(&self, prompt: &str, key: &str) -> Result<String, GenerationError> {
        let safety_settings: Vec<_> = [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
        .collect();

        let response = self
            .client
            .post(format!("{}/{}:generateContent", self.endpoint, self.model))
            .header("x-goog-api-key", key)
            .json(&json!({
                "contents": [{ "parts": [{ "text": prompt }] }],
                "generationConfig": {
                    "temperature": 0.9,
                    "topP": 1,
                    "topK": 1,
                    "maxOutputTokens": 2048,
                },
                "safetySettings": safety_settings,
            }))
            .send()
            .await?;

        let body: GeminiResponse = self.check(response).await?.json().await.map_err(|err| {
            tracing::debug!(error = %err, "unexpected gemini payload");
            GenerationError::Generation("Unexpected response format".into())
        })?;

        let text: String = body
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(GenerationError::Generation("Empty response".into()));
        }

        Ok(text)
    }

    /// Turn non-success statuses into [`GenerationError`].
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited {
                retry_after: retry_after.or_else(|| gemini_retry_delay(&body)),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::error!(provider = %self.provider, "API key rejected");
                GenerationError::Unauthorized
            },
            StatusCode::BAD_REQUEST => GenerationError::Malformed(body),
            _ => {
                tracing::error!(provider = %self.provider, %status, %body, "completion API error");
                GenerationError::Generation(format!(
                    "{} API error: {} - {}",
                    self.provider, status, body
                ))
            },
        })
    }
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    async fn complete(&self, prompt: &str, key: &str) -> Result<String, GenerationError> {
        match self.provider {
            Provider::Gemini => self.gemini(prompt, key).await,
            Provider::Groq | Provider::Mistral => self.chat(prompt, key).await,
        }
    }
}

/// Read `RetryInfo.retryDelay` (such as `"31s"`) from a Gemini error body.
fn gemini_retry_delay(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;

    value
        .pointer("/error/details")?
        .as_array()?
        .iter()
        .filter(|detail| {
            detail
                .get("@type")
                .and_then(|kind| kind.as_str())
                .is_some_and(|kind| kind.ends_with("RetryInfo"))
        })
        .find_map(|detail| detail.get("retryDelay")?.as_str())
        .and_then(|delay| delay.trim_end_matches('s').parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}
