use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::error::LlmError;
use crate::models::TokenUsage;
use crate::rotation::{redact, KeyRing, RateBudget};

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// One turn in the wire-format message list sent to the completion endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Per-call generation knobs. Unset fields fall back to the provider's
/// configured `max_tokens` and the standard temperature.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    /// Trace extras: redacted key prefix, upstream response id.
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub model: String,
    pub total_keys: usize,
    pub available_keys: usize,
    pub exhausted_keys: usize,
    pub total_requests: u64,
    pub total_tokens_used: u64,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
}

pub type TextDeltaStream = ReceiverStream<Result<String, LlmError>>;

/// Contract every chat backend satisfies. The gateway only depends on this,
/// so fallback chains can mix real providers with anything else.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<LlmResponse, LlmError>;

    /// Start a streaming completion. Setup failures surface here; transport
    /// errors after setup arrive as `Err` items on the stream itself.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<TextDeltaStream, LlmError>;

    async fn stats(&self) -> ProviderStats;
}

/// OpenAI-compatible chat provider with a rotating credential ring.
///
/// Every request leases a key from the ring; a 429 marks that key exhausted
/// for the server-suggested cooldown and the error propagates so the gateway
/// can try the next provider.
pub struct ChatProvider {
    name: String,
    client: reqwest::Client,
    settings: LlmSettings,
    keys: Arc<KeyRing>,
}

impl ChatProvider {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let keys = KeyRing::new(settings.api_keys.clone(), RateBudget::from(&settings));
        if keys.is_empty() {
            return Err(LlmError::NoCredentials(settings.provider.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            name: settings.provider.clone(),
            client,
            settings,
            keys: Arc::new(keys),
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/openai/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, messages: &[ChatMessage], options: GenerationOptions, stream: bool) -> Value {
        json!({
            "model": self.settings.model,
            "messages": messages,
            "max_tokens": options.max_tokens.unwrap_or(self.settings.max_tokens),
            "temperature": options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "stream": stream,
        })
    }

    /// Handle a 429 by cooling the leased key down, then surface the limit.
    async fn handle_rate_limit(&self, key_index: usize, response: &reqwest::Response) -> LlmError {
        let retry_after_secs = retry_after_secs(response);
        self.keys
            .mark_exhausted(key_index, Duration::from_secs(retry_after_secs))
            .await;
        LlmError::RateLimited { retry_after_secs }
    }
}

#[async_trait]
impl GenerationProvider for ChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<LlmResponse, LlmError> {
        let key = self
            .keys
            .next_available_key()
            .await
            .ok_or(LlmError::NoAvailableKey)?;

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&key.secret)
            .json(&self.request_body(messages, options, false))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(self.handle_rate_limit(key.index, &response).await);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider(format!(
                "{} returned {status}: {}",
                self.name,
                truncate_for_log(&body)
            )));
        }

        let completion: CompletionResponse = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Provider("completion response had no choices".to_string()))?;

        let usage = TokenUsage {
            prompt_tokens: completion.usage.prompt_tokens,
            completion_tokens: completion.usage.completion_tokens,
            total_tokens: completion.usage.total_tokens,
        };
        self.keys.record_usage(key.index, usage.total_tokens).await;

        let mut metadata = Map::new();
        metadata.insert("key_used".to_string(), Value::String(redact(&key.secret)));
        if let Some(id) = completion.id {
            metadata.insert("response_id".to_string(), Value::String(id));
        }

        debug!(
            provider = %self.name,
            model = %self.settings.model,
            tokens = usage.total_tokens,
            "completion received"
        );

        Ok(LlmResponse {
            content,
            provider: self.name.clone(),
            model: self.settings.model.clone(),
            usage,
            metadata,
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<TextDeltaStream, LlmError> {
        let key = self
            .keys
            .next_available_key()
            .await
            .ok_or(LlmError::NoAvailableKey)?;

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&key.secret)
            .json(&self.request_body(messages, options, true))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(self.handle_rate_limit(key.index, &response).await);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider(format!(
                "{} returned {status}: {}",
                self.name,
                truncate_for_log(&body)
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<String, LlmError>>(32);
        let keys = Arc::clone(&self.keys);
        let key_index = key.index;
        let provider = self.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut emitted_chars = 0usize;
            let mut done = false;

            'read: while let Some(piece) = byte_stream.next().await {
                match piece {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(newline) = buffer.find('\n') {
                            let line = buffer[..newline].trim_end_matches('\r').to_string();
                            buffer.drain(..=newline);
                            match parse_sse_line(&line) {
                                SsePayload::Delta(text) => {
                                    emitted_chars += text.chars().count();
                                    if tx.send(Ok(text)).await.is_err() {
                                        break 'read;
                                    }
                                }
                                SsePayload::Done => {
                                    done = true;
                                    break 'read;
                                }
                                SsePayload::Skip => {}
                            }
                        }
                    }
                    Err(error) => {
                        warn!(provider = %provider, error = %error, "stream transport failed");
                        let _ = tx.send(Err(LlmError::Stream(error.to_string()))).await;
                        break 'read;
                    }
                }
            }

            // No usage object arrives on the streaming wire; charge an
            // estimate so rotation still sees the spend.
            keys.record_usage(key_index, approx_stream_tokens(emitted_chars)).await;
            debug!(provider = %provider, emitted_chars, done, "stream closed");
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn stats(&self) -> ProviderStats {
        let ring = self.keys.stats().await;
        ProviderStats {
            provider: self.name.clone(),
            model: self.settings.model.clone(),
            total_keys: ring.total_keys,
            available_keys: ring.available_keys,
            exhausted_keys: ring.exhausted_keys,
            total_requests: ring.total_requests,
            total_tokens_used: ring.total_tokens,
            requests_per_minute: self.settings.requests_per_minute,
            tokens_per_minute: self.settings.tokens_per_minute,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SsePayload {
    Delta(String),
    Done,
    Skip,
}

/// Decode one server-sent-events line. Non-data lines, keep-alives, and
/// frames without text all come back as `Skip`.
fn parse_sse_line(line: &str) -> SsePayload {
    let Some(data) = line.strip_prefix("data: ") else {
        return SsePayload::Skip;
    };
    if data.trim() == "[DONE]" {
        return SsePayload::Done;
    }
    let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
        return SsePayload::Skip;
    };
    match chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty())
    {
        Some(text) => SsePayload::Delta(text),
        None => SsePayload::Skip,
    }
}

fn retry_after_secs(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Rough chars-per-token estimate for streamed output, floored at one so a
/// completed stream never counts as free.
fn approx_stream_tokens(chars: usize) -> u64 {
    ((chars / 4) as u64).max(1)
}

fn truncate_for_log(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(200).collect();
        format!("{head}...")
    }
}
