use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub mod cohort;
pub mod config_cache;
pub mod orchestration;
pub mod provider_management;
pub mod providers;
pub mod retry;

pub use cohort::{bucket_for, CohortAssigner, CohortAssignment, CohortCacheConfig, PromptVariant};
pub use config_cache::{
    ConfigCache, ConfigCacheSettings, ConfigError, ConfigOrigin, ConfigStore, DynamicModelConfig,
    FileConfigStore, StaticConfigStore, StoredModelConfig,
};
pub use orchestration::{
    ChatRequest, EventReceiver, FailureKind, OrchestratorError, OrchestratorSettings,
    StreamEvent, StreamOrchestrator, StreamOutcome, StreamWriter,
};
pub use provider_management::{
    HealthStatus, HealthTrackerConfig, ProviderHealthRecord, ProviderHealthTracker, ProviderRole,
    ProviderSelection, ProviderSelector, SelectionError, SelectionOptions, StrategyKind,
};
pub use providers::{
    ChatMessage, GenerationParameters, GenerationRequest, LlmProvider, MessageRole,
    OpenAiCompatibleProvider, ProviderIdentity, ProviderRegistry, ScriptStep, ScriptedProvider,
    StreamChunk,
};
pub use retry::{Classification, ErrorKind, FailureOrigin, ProviderFailure, RetryableError};

/// Builds HTTP providers for every identity with credentials in the
/// environment (or a `.env` file).
pub fn registry_from_env() -> Result<ProviderRegistry> {
    dotenv::dotenv().ok();

    let mut registry = ProviderRegistry::new();
    for identity in ProviderIdentity::ALL {
        match OpenAiCompatibleProvider::from_env(identity) {
            Ok(provider) => {
                info!(provider = %identity, "Registered provider");
                registry.register(Arc::new(provider));
            }
            Err(e) => warn!(provider = %identity, "Provider not configured: {e:#}"),
        }
    }

    if registry.is_empty() {
        return Err(anyhow!(
            "No provider credentials found; set GATEWAY_API_KEY or OPENROUTER_API_KEY"
        ));
    }
    Ok(registry)
}

/// Offline registry that answers every request with `reply` from both
/// providers.
pub fn scripted_registry(reply: &str) -> ProviderRegistry {
    ProviderIdentity::ALL
        .into_iter()
        .fold(ProviderRegistry::new(), |registry, identity| {
            registry.with(Arc::new(ScriptedProvider::replying(identity, reply)))
        })
}
