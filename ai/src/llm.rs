//! Chat LLM client: blocking completion and token streaming.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use corpora_config::ModelConfig;
use corpora_models::conversation::TokenUsage;
use corpora_models::{CoreError, CoreResult};

use crate::limits::{with_retries, ClientLimits};
use crate::usage::{UsageRecord, UsageSink};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2_048,
            tools: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResult {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Option<serde_json::Value>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One streamed increment: delta text, optional tool-call delta, and the
/// termination reason on the final chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenChunk {
    #[serde(default)]
    pub delta: String,
    #[serde(default)]
    pub tool_call_delta: Option<serde_json::Value>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// Chat completion contract. Cancelling the token passed to
/// `complete_stream` closes the channel and aborts the upstream request.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CoreResult<CompletionResult>;

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        cancel: CancellationToken,
    ) -> CoreResult<mpsc::Receiver<CoreResult<TokenChunk>>>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a serde_json::Value>,
}

pub struct HttpChatModel {
    client: Client,
    url: String,
    model: String,
    limits: ClientLimits,
    usage: Arc<dyn UsageSink>,
}

impl HttpChatModel {
    pub fn new(
        url: impl Into<String>,
        config: &ModelConfig,
        limits: ClientLimits,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            model: config.llm_model.clone(),
            limits,
            usage,
        }
    }

    fn classify_send_error(err: reqwest::Error) -> CoreError {
        if err.is_timeout() || err.is_connect() {
            CoreError::transient(format!("llm unreachable: {}", err))
        } else {
            CoreError::dependency("llm", err.to_string())
        }
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> CoreResult<reqwest::Response> {
        let body = ChatRequestBody {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream,
            tools: options.tools.as_ref(),
        };
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .json(&body);
        if !stream {
            // Streams outlive the per-request deadline by design; idle
            // detection belongs to the consumer.
            request = request.timeout(self.limits.request_timeout);
        }
        let response = request.send().await.map_err(Self::classify_send_error)?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CoreError::transient(format!("llm status {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::dependency(
                "llm",
                format!("status {}: {}", status, text),
            ));
        }
        Ok(response)
    }

    /// Parse one SSE `data:` payload into a token chunk.
    fn parse_sse_line(line: &str) -> Option<CoreResult<TokenChunk>> {
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == "[DONE]" {
            return Some(Ok(TokenChunk {
                finish_reason: Some("stop".into()),
                ..TokenChunk::default()
            }));
        }
        match serde_json::from_str::<TokenChunk>(payload) {
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => Some(Err(CoreError::dependency(
                "llm",
                format!("malformed stream chunk: {}", e),
            ))),
        }
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CoreResult<CompletionResult> {
        let _permit = self.limits.acquire().await?;
        let start = Instant::now();

        let result = with_retries(self.limits.retries, "llm_complete", || async {
            let response = self.send(messages, options, false).await?;
            response
                .json::<CompletionResult>()
                .await
                .map_err(|e| CoreError::dependency("llm", e.to_string()))
        })
        .await;

        if let Ok(completion) = &result {
            let usage = completion.usage.unwrap_or_default();
            self.usage.record(UsageRecord {
                model: self.model.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                latency_ms: start.elapsed().as_millis() as u64,
            });
        }
        result
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        cancel: CancellationToken,
    ) -> CoreResult<mpsc::Receiver<CoreResult<TokenChunk>>> {
        let permit = self.limits.acquire().await?;
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CoreError::Cancelled("stream cancelled before connect".into()));
            }
            response = self.send(messages, options, true) => response?,
        };

        let (tx, rx) = mpsc::channel(64);
        let model = self.model.clone();
        let usage_sink = Arc::clone(&self.usage);
        let start = Instant::now();

        tokio::spawn(async move {
            // Permit held for the lifetime of the upstream stream.
            let _permit = permit;
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut total_usage = TokenUsage::default();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("llm stream cancelled, aborting upstream request");
                        break;
                    }
                    next = byte_stream.next() => next,
                };

                let bytes = match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(CoreError::dependency("llm", e.to_string())))
                            .await;
                        break;
                    }
                    None => break,
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let Some(parsed) = Self::parse_sse_line(line.trim_end()) else {
                        continue;
                    };
                    let done = match &parsed {
                        Ok(chunk) => {
                            if let Some(usage) = chunk.usage {
                                total_usage = usage;
                            }
                            chunk.finish_reason.is_some()
                        }
                        Err(_) => true,
                    };
                    if tx.send(parsed).await.is_err() {
                        // Receiver dropped: abort upstream by returning.
                        return;
                    }
                    if done {
                        usage_sink.record(UsageRecord {
                            model: model.clone(),
                            prompt_tokens: total_usage.prompt_tokens,
                            completion_tokens: total_usage.completion_tokens,
                            latency_ms: start.elapsed().as_millis() as u64,
                        });
                        return;
                    }
                }
            }
            // Dropping `byte_stream` (and with it the response) aborts the
            // underlying connection; closing `tx` ends the consumer loop.
        });

        Ok(rx)
    }
}

/// Degrade a failed completion into a single fallback attempt with a
/// simplified prompt, as the synthesizer error policy requires.
pub async fn complete_with_fallback(
    model: &dyn ChatModel,
    primary: &[ChatMessage],
    fallback: &[ChatMessage],
    options: &CompletionOptions,
) -> CoreResult<CompletionResult> {
    match model.complete(primary, options).await {
        Ok(result) => Ok(result),
        Err(first_err) => {
            warn!("primary completion failed, trying fallback prompt: {}", first_err);
            model.complete(fallback, options).await.map_err(|second| {
                CoreError::dependency(
                    "llm",
                    format!("primary: {}; fallback: {}", first_err, second),
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::NoopUsageSink;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_model(url: String, retries: u32) -> HttpChatModel {
        HttpChatModel::new(
            url,
            &ModelConfig::default(),
            ClientLimits::new(2, 4, Duration::from_secs(2), retries),
            Arc::new(NoopUsageSink),
        )
    }

    #[test]
    fn sse_parsing_handles_done_and_noise() {
        assert!(HttpChatModel::parse_sse_line(": keepalive").is_none());
        assert!(HttpChatModel::parse_sse_line("").is_none());

        let done = HttpChatModel::parse_sse_line("data: [DONE]").unwrap().unwrap();
        assert_eq!(done.finish_reason.as_deref(), Some("stop"));

        let chunk = HttpChatModel::parse_sse_line(r#"data: {"delta": "Hel"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.delta, "Hel");

        let malformed = HttpChatModel::parse_sse_line("data: {not json").unwrap();
        assert!(malformed.is_err());
    }

    #[tokio::test]
    async fn complete_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": "Paris is the capital of France.",
                "usage": { "prompt_tokens": 42, "completion_tokens": 8 },
                "finish_reason": "stop"
            })))
            .mount(&server)
            .await;

        let result = chat_model(server.uri(), 0)
            .complete(&[ChatMessage::user("capital of France?")], &CompletionOptions::default())
            .await
            .unwrap();
        assert!(result.content.contains("Paris"));
        assert_eq!(result.usage.unwrap().prompt_tokens, 42);
    }

    #[tokio::test]
    async fn streaming_delivers_deltas_in_order() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"delta\": \"Par\"}\n",
            "data: {\"delta\": \"is\"}\n",
            "data: {\"delta\": \"\", \"finish_reason\": \"stop\", \"usage\": {\"prompt_tokens\": 5, \"completion_tokens\": 2}}\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let mut rx = chat_model(server.uri(), 0)
            .complete_stream(
                &[ChatMessage::user("capital of France?")],
                &CompletionOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut text = String::new();
        let mut finished = false;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            text.push_str(&chunk.delta);
            if chunk.finish_reason.is_some() {
                finished = true;
            }
        }
        assert_eq!(text, "Paris");
        assert!(finished);
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream() {
        let server = MockServer::start().await;
        // A stream that never finishes on its own.
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"delta\": \"slow\"}\n")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let model = chat_model(server.uri(), 0);
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match model
                    .complete_stream(
                        &[ChatMessage::user("hang")],
                        &CompletionOptions::default(),
                        cancel,
                    )
                    .await
                {
                    Ok(mut rx) => {
                        // Drain until the channel closes.
                        while rx.recv().await.is_some() {}
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("stream did not close after cancellation")
            .unwrap();
        match joined {
            Ok(()) => {}
            Err(e) => assert!(e.is_cancelled()),
        }
    }

    #[tokio::test]
    async fn fallback_prompt_is_attempted_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("prompt too complex"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": "short answer"
            })))
            .mount(&server)
            .await;

        let model = chat_model(server.uri(), 0);
        let result = complete_with_fallback(
            &model,
            &[ChatMessage::user("elaborate prompt")],
            &[ChatMessage::user("simple prompt")],
            &CompletionOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.content, "short answer");
    }
}
