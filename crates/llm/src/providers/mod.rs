use crate::retry::ProviderFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod openai_compatible;
pub mod scripted_provider;

pub use openai_compatible::OpenAiCompatibleProvider;
pub use scripted_provider::{ScriptStep, ScriptedProvider};

/// Closed set of providers the backend can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderIdentity {
    #[serde(rename = "vercel-gateway")]
    Gateway,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl ProviderIdentity {
    pub const ALL: [ProviderIdentity; 2] = [ProviderIdentity::Gateway, ProviderIdentity::OpenRouter];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderIdentity::Gateway => "vercel-gateway",
            ProviderIdentity::OpenRouter => "openrouter",
        }
    }

    /// The other member of the pair.
    pub fn other(self) -> ProviderIdentity {
        match self {
            ProviderIdentity::Gateway => ProviderIdentity::OpenRouter,
            ProviderIdentity::OpenRouter => ProviderIdentity::Gateway,
        }
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderIdentity {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vercel-gateway" | "gateway" | "vercel" => Ok(ProviderIdentity::Gateway),
            "openrouter" => Ok(ProviderIdentity::OpenRouter),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: MessageRole::System,
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: MessageRole::User,
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            top_p: None,
        }
    }
}

/// Everything a provider needs for one streamed call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub parameters: GenerationParameters,
}

/// Incremental output of a streamed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta { text: String },
    Source { url: String, title: Option<String> },
    Finished { reason: String },
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        StreamChunk::TextDelta { text: text.into() }
    }
}

pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderFailure>>;

/// Uniform streaming capability of a model provider.
///
/// `generate` returns once the provider has accepted the request. Failures
/// after that point arrive as `Err` items on the channel; the channel closes
/// after the last chunk. Implementations must stop producing promptly once
/// `cancel` fires.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn identity(&self) -> ProviderIdentity;

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, ProviderFailure>;
}

/// Provider instances keyed by identity.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderIdentity, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.identity(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, identity: ProviderIdentity) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(&identity).cloned()
    }

    pub fn identities(&self) -> Vec<ProviderIdentity> {
        let mut ids: Vec<_> = self.providers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.identities())
            .finish()
    }
}
