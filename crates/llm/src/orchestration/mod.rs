//! Stream orchestration for one chat request.
//!
//! Per request: load the active config, select a provider, stream the
//! generation into the [`StreamWriter`], and on a retryable failure of the
//! primary (before anything reached the client) make exactly one more
//! attempt on the fallback. Afterwards the workflow-state marker is
//! extracted from the full reply and emitted as `message-metadata`.

pub mod writer;

pub use writer::{EventReceiver, StreamEvent, StreamWriter};

use crate::cohort::{CohortAssigner, PromptVariant};
use crate::config_cache::{ConfigCache, DynamicModelConfig};
use crate::provider_management::{
    ProviderHealthTracker, ProviderRole, ProviderSelection, ProviderSelector, SelectionOptions,
};
use crate::providers::{
    ChatMessage, GenerationRequest, ProviderIdentity, ProviderRegistry, StreamChunk,
};
use crate::retry::{ErrorKind, FailureOrigin, ProviderFailure};
use common::{OperationTimer, ValidationError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use workflow::{compose_with_policy, extract, OffTopicPolicy, WorkflowMetadata};

const NO_PROVIDER_MESSAGE: &str =
    "No language model is available right now. Please try again in a few minutes.";

/// Inbound chat request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub test_mode: bool,
    /// Workflow state persisted after the previous turn
    #[serde(default)]
    pub previous_metadata: Option<WorkflowMetadata>,
    /// Stable id used for prompt-variant cohorts
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Request rejected before any provider was contacted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("conversation must contain at least one message")]
    EmptyConversation,

    #[error("invalid request: {0}")]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "kind")]
pub enum FailureKind {
    Provider(ErrorKind),
    NoViableProvider,
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed {
        provider: ProviderIdentity,
        model: String,
        text: String,
        metadata: WorkflowMetadata,
        fell_back: bool,
    },
    Failed {
        kind: FailureKind,
        message: String,
        /// Some content reached the client before the failure
        partial: bool,
    },
    Aborted,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub selection: SelectionOptions,
    pub off_topic: OffTopicPolicy,
    /// Weighted system-prompt variants; empty means use the configured prompt
    pub prompt_variants: Vec<PromptVariant>,
}

enum AttemptResult {
    Completed {
        text: String,
        latency: Duration,
    },
    Failed {
        failure: ProviderFailure,
    },
    Aborted,
}

pub struct StreamOrchestrator {
    config_cache: Arc<ConfigCache>,
    selector: Arc<ProviderSelector>,
    registry: ProviderRegistry,
    cohorts: Arc<CohortAssigner>,
    settings: OrchestratorSettings,
}

impl StreamOrchestrator {
    pub fn new(
        config_cache: Arc<ConfigCache>,
        selector: Arc<ProviderSelector>,
        registry: ProviderRegistry,
    ) -> Self {
        Self {
            config_cache,
            selector,
            registry,
            cohorts: Arc::new(CohortAssigner::new()),
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cohorts(mut self, cohorts: Arc<CohortAssigner>) -> Self {
        self.cohorts = cohorts;
        self
    }

    pub fn health(&self) -> &Arc<ProviderHealthTracker> {
        self.selector.tracker()
    }

    fn validate(request: &ChatRequest) -> Result<(), OrchestratorError> {
        if request.messages.is_empty() {
            return Err(OrchestratorError::EmptyConversation);
        }
        common::require_non_blank("conversation_id", &request.conversation_id)?;
        common::validate_turns(
            request
                .messages
                .iter()
                .map(|m| (m.role.as_str(), m.content.as_str())),
        )?;
        Ok(())
    }

    fn system_prompt(&self, config: &DynamicModelConfig, request: &ChatRequest) -> String {
        let base = request
            .user_id
            .as_deref()
            .and_then(|user| {
                self.cohorts
                    .select_prompt_for_user(user, &self.settings.prompt_variants)
            })
            .map(|variant| {
                debug!(variant = %variant.id, "Using prompt variant");
                variant.prompt.as_str()
            })
            .unwrap_or(config.system_prompt.as_str());

        let initial;
        let metadata = match &request.previous_metadata {
            Some(previous) => previous,
            None => {
                initial = WorkflowMetadata::initial();
                &initial
            }
        };
        compose_with_policy(base, metadata, &self.settings.off_topic)
    }

    /// Runs one chat request to completion, writing events to `writer`.
    ///
    /// Returns `Err` only when the request is rejected up front, in which
    /// case nothing was written.
    pub async fn stream(
        &self,
        request: ChatRequest,
        writer: &StreamWriter,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome, OrchestratorError> {
        Self::validate(&request)?;

        let mut timer = OperationTimer::new("chat_stream");
        timer.add_field("conversation_id", &request.conversation_id);

        let config = self.config_cache.get_config().await;
        let system_prompt = self.system_prompt(&config, &request);

        let mut selection = match self
            .selector
            .select_provider(&config, &self.settings.selection)
        {
            Ok(selection) => selection,
            Err(e) => {
                warn!(conversation_id = %request.conversation_id, "Provider selection failed: {}", e);
                writer.error(NO_PROVIDER_MESSAGE).await;
                timer.add_field("outcome", "no_viable_provider");
                timer.finish();
                return Ok(StreamOutcome::Failed {
                    kind: FailureKind::NoViableProvider,
                    message: NO_PROVIDER_MESSAGE.to_string(),
                    partial: false,
                });
            }
        };

        let message_id = uuid::Uuid::new_v4().to_string();
        let text_id = uuid::Uuid::new_v4().to_string();
        writer.start(&message_id).await;

        let mut fell_back = false;

        loop {
            info!(
                conversation_id = %request.conversation_id,
                provider = %selection.provider,
                model = %selection.model,
                role = ?selection.role,
                test_mode = request.test_mode,
                "🚀 Starting generation attempt"
            );

            let generation = GenerationRequest {
                model: selection.model.clone(),
                system_prompt: system_prompt.clone(),
                messages: request.messages.clone(),
                parameters: selection.parameters.clone(),
            };

            let result = self
                .run_attempt(&selection, generation, writer, &text_id, &cancel)
                .await;

            match result {
                AttemptResult::Completed { text, latency } => {
                    if !request.test_mode {
                        self.health().record_success(selection.provider, latency);
                    }
                    if writer.has_content() {
                        writer.text_end(&text_id).await;
                    }

                    let metadata = extract(&text, request.previous_metadata.as_ref())
                        .or_else(|| request.previous_metadata.clone())
                        .unwrap_or_else(WorkflowMetadata::initial);

                    writer.metadata(&metadata).await;
                    writer.finish("stop").await;

                    info!(
                        conversation_id = %request.conversation_id,
                        provider = %selection.provider,
                        phase = %metadata.phase,
                        fell_back,
                        "✅ Generation completed"
                    );
                    timer.add_field("outcome", "completed");
                    timer.add_field("provider", selection.provider.as_str());
                    timer.finish();
                    return Ok(StreamOutcome::Completed {
                        provider: selection.provider,
                        model: selection.model,
                        text,
                        metadata,
                        fell_back,
                    });
                }
                AttemptResult::Aborted => {
                    info!(conversation_id = %request.conversation_id, "Generation aborted");
                    timer.add_field("outcome", "aborted");
                    timer.finish();
                    return Ok(StreamOutcome::Aborted);
                }
                AttemptResult::Failed { failure } => {
                    let classification = failure.classify();
                    warn!(
                        conversation_id = %request.conversation_id,
                        provider = %selection.provider,
                        kind = %classification.kind,
                        retryable = classification.retryable,
                        status = ?failure.status,
                        "Generation attempt failed: {}",
                        failure.message
                    );
                    if cancel.is_cancelled() {
                        timer.add_field("outcome", "aborted");
                        timer.finish();
                        return Ok(StreamOutcome::Aborted);
                    }

                    if !request.test_mode {
                        self.health()
                            .record_failure(selection.provider, &failure.message);
                    }

                    let may_fall_back = classification.retryable
                        && selection.role == ProviderRole::Primary
                        && !fell_back
                        && !writer.has_content();

                    if may_fall_back {
                        // The fallback is the last resort, so its health is not consulted
                        selection =
                            ProviderSelection::for_role(&config, ProviderRole::Fallback, self.health());
                        fell_back = true;
                        info!(
                            fallback = %selection.provider,
                            model = %selection.model,
                            "Retrying on fallback provider"
                        );
                        continue;
                    }

                    let partial = writer.has_content();
                    if partial {
                        writer.text_end(&text_id).await;
                        writer.finish("error").await;
                    } else {
                        writer.error(classification.user_message).await;
                    }

                    error!(
                        conversation_id = %request.conversation_id,
                        kind = %classification.kind,
                        partial,
                        fell_back,
                        "Chat request failed"
                    );
                    timer.add_field("outcome", classification.kind.as_str());
                    timer.finish();
                    return Ok(StreamOutcome::Failed {
                        kind: FailureKind::Provider(classification.kind),
                        message: classification.user_message.to_string(),
                        partial,
                    });
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        selection: &ProviderSelection,
        request: GenerationRequest,
        writer: &StreamWriter,
        text_id: &str,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let Some(provider) = self.registry.get(selection.provider) else {
            error!(provider = %selection.provider, "Provider is not registered");
            return AttemptResult::Failed {
                failure: ProviderFailure::new(
                    FailureOrigin::Other,
                    format!("provider {} is not configured", selection.provider),
                ),
            };
        };

        let started = Instant::now();
        let attempt_cancel = cancel.child_token();

        let opened = tokio::select! {
            _ = cancel.cancelled() => return AttemptResult::Aborted,
            opened = provider.generate(request, attempt_cancel.clone()) => opened,
        };
        let mut rx = match opened {
            Ok(rx) => rx,
            Err(failure) => return AttemptResult::Failed { failure },
        };

        let mut text = String::new();
        let mut first_chunk: Option<Duration> = None;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    attempt_cancel.cancel();
                    return AttemptResult::Aborted;
                }
                item = rx.recv() => item,
            };

            let chunk = match item {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(failure)) => {
                    attempt_cancel.cancel();
                    return AttemptResult::Failed { failure };
                }
            };
            first_chunk.get_or_insert_with(|| started.elapsed());

            match chunk {
                StreamChunk::TextDelta { text: delta } => {
                    text.push_str(&delta);
                    writer.text_delta(text_id, &delta).await;
                }
                StreamChunk::Source { url, title } => {
                    writer.source(&url, title.as_deref()).await;
                }
                StreamChunk::Finished { reason } => {
                    debug!(provider = %selection.provider, %reason, "Provider finished");
                    break;
                }
            }

            if writer.is_closed() {
                debug!("Client went away, cancelling generation");
                attempt_cancel.cancel();
                return AttemptResult::Aborted;
            }
        }

        AttemptResult::Completed {
            text,
            latency: first_chunk.unwrap_or_else(|| started.elapsed()),
        }
    }
}
