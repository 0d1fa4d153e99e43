use super::{ChunkReceiver, GenerationRequest, LlmProvider, ProviderIdentity, StreamChunk};
use crate::retry::ProviderFailure;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Streams chat completions from any OpenAI-compatible endpoint
/// (`POST {base_url}/chat/completions` with `stream: true`).
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    identity: ProviderIdentity,
    api_key: String,
    base_url: String,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(identity: ProviderIdentity, api_key: String, base_url: String) -> Result<Self> {
        Self::with_timeouts(
            identity,
            api_key,
            base_url,
            Duration::from_secs(10),
            Duration::from_secs(300),
        )
    }

    pub fn with_timeouts(
        identity: ProviderIdentity,
        api_key: String,
        base_url: String,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(anyhow!("{} API key cannot be empty", identity));
        }

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            identity,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Default public endpoint for each identity.
    pub fn default_base_url(identity: ProviderIdentity) -> &'static str {
        match identity {
            ProviderIdentity::Gateway => "https://ai-gateway.vercel.sh/v1",
            ProviderIdentity::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    /// Builds a provider from `<PREFIX>_API_KEY` / `<PREFIX>_BASE_URL`.
    pub fn from_env(identity: ProviderIdentity) -> Result<Self> {
        let prefix = match identity {
            ProviderIdentity::Gateway => "GATEWAY",
            ProviderIdentity::OpenRouter => "OPENROUTER",
        };
        let api_key = std::env::var(format!("{prefix}_API_KEY"))
            .with_context(|| format!("{prefix}_API_KEY is not set"))?;
        let base_url = std::env::var(format!("{prefix}_BASE_URL"))
            .unwrap_or_else(|_| Self::default_base_url(identity).to_string());
        Self::new(identity, api_key, base_url)
    }

    fn build_body(request: &GenerationRequest) -> CompletionRequest<'_> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(WireMessage {
                role: "system",
                content: &request.system_prompt,
            });
        }
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        CompletionRequest {
            model: &request.model,
            messages,
            stream: true,
            temperature: request.parameters.temperature,
            max_tokens: request.parameters.max_tokens,
            top_p: request.parameters.top_p,
        }
    }

    /// Turns a non-2xx response into a failure, keeping the provider's error code.
    async fn failure_from_response(response: reqwest::Response) -> ProviderFailure {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());

        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => {
                let mut failure = ProviderFailure::http(status, envelope.error.message);
                if let Some(code) = envelope.error.code.and_then(code_to_string) {
                    failure = failure.with_code(code);
                } else if let Some(kind) = envelope.error.kind {
                    failure = failure.with_code(kind);
                }
                failure
            }
            Err(_) => ProviderFailure::http(status, body),
        }
    }
}

fn code_to_string(code: serde_json::Value) -> Option<String> {
    match code {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses one SSE event block into chunks. Returns `None` on `[DONE]`.
pub(crate) fn parse_sse_event(event: &str) -> Option<Result<Vec<StreamChunk>, ProviderFailure>> {
    let mut chunks = Vec::new();
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            return None;
        }

        let parsed: CompletionChunk = match serde_json::from_str(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable SSE payload");
                continue;
            }
        };

        if let Some(err) = parsed.error {
            let mut failure = ProviderFailure::stream(err.message);
            if let Some(code) = err.code.and_then(code_to_string) {
                failure = failure.with_code(code);
            }
            return Some(Err(failure));
        }

        for choice in parsed.choices {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    chunks.push(StreamChunk::TextDelta { text: content });
                }
                for annotation in delta.annotations.unwrap_or_default() {
                    if let Some(citation) = annotation.url_citation {
                        chunks.push(StreamChunk::Source {
                            url: citation.url,
                            title: citation.title,
                        });
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                chunks.push(StreamChunk::Finished { reason });
            }
        }
    }
    Some(Ok(chunks))
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

async fn pump_sse(
    response: reqwest::Response,
    tx: &mpsc::Sender<Result<StreamChunk, ProviderFailure>>,
    cancel: &CancellationToken,
) -> Result<(), ProviderFailure> {
    let mut stream = response.bytes_stream();
    // Raw bytes; a multi-byte character may straddle two network chunks
    let mut buffer: Vec<u8> = Vec::new();
    let mut finished = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stream cancelled, dropping response body");
                return Ok(());
            }
            next = stream.next() => next,
        };

        let Some(chunk) = next else { break };
        let bytes = chunk.map_err(|e| ProviderFailure::from_reqwest_error(&e))?;
        buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        while let Some(event_end) = find_event_end(&buffer) {
            let raw: Vec<u8> = buffer.drain(..event_end + 2).collect();
            let event = match std::str::from_utf8(&raw) {
                Ok(event) => event.to_string(),
                Err(e) => {
                    warn!(error = %e, "SSE event is not valid UTF-8");
                    String::from_utf8_lossy(&raw).into_owned()
                }
            };
            match parse_sse_event(&event) {
                None => {
                    if !finished {
                        let _ = tx
                            .send(Ok(StreamChunk::Finished {
                                reason: "stop".to_string(),
                            }))
                            .await;
                    }
                    return Ok(());
                }
                Some(Err(failure)) => return Err(failure),
                Some(Ok(chunks)) => {
                    for chunk in chunks {
                        if matches!(chunk, StreamChunk::Finished { .. }) {
                            if finished {
                                continue;
                            }
                            finished = true;
                        }
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Receiver dropped, stop streaming
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    if finished {
        Ok(())
    } else {
        Err(ProviderFailure::network(
            "connection closed before the stream finished",
        ))
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn identity(&self) -> ProviderIdentity {
        self.identity
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, ProviderFailure> {
        let url = format!("{}/chat/completions", self.base_url);
        info!(
            provider = %self.identity,
            model = %request.model,
            turns = request.messages.len(),
            "🚀 Starting streaming request"
        );

        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&Self::build_body(&request))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProviderFailure::new(
                    crate::retry::FailureOrigin::Other,
                    "request cancelled before the provider answered",
                ));
            }
            response = send => response.map_err(|e| ProviderFailure::from_reqwest_error(&e))?,
        };

        if !response.status().is_success() {
            let failure = Self::failure_from_response(response).await;
            error!(
                provider = %self.identity,
                status = ?failure.status,
                "Provider rejected streaming request: {}",
                failure.message
            );
            return Err(failure);
        }

        let (tx, rx) = mpsc::channel(100);
        let identity = self.identity;

        tokio::spawn(async move {
            match pump_sse(response, &tx, &cancel).await {
                Ok(()) => debug!(provider = %identity, "✅ Streaming request completed"),
                Err(failure) => {
                    warn!(provider = %identity, "Stream failed: {}", failure.message);
                    let _ = tx.send(Err(failure)).await;
                }
            }
        });

        Ok(rx)
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    annotations: Option<Vec<Annotation>>,
}

#[derive(Debug, Deserialize)]
struct Annotation {
    #[serde(default)]
    url_citation: Option<UrlCitation>,
}

#[derive(Debug, Deserialize)]
struct UrlCitation {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}
