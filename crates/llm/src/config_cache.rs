//! Active model configuration and its TTL cache.
//!
//! The configuration store is external and may be slow or down. The cache
//! keeps one immutable [`DynamicModelConfig`] snapshot behind an `Arc`,
//! swaps it whole on refresh, and lets only one reload run at a time.
//! Store failures never reach the caller: the last snapshot (or a safe
//! default) is served instead.

use crate::providers::{GenerationParameters, ProviderIdentity};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("configuration store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration as kept by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredModelConfig {
    pub primary_provider: String,
    pub primary_model: String,
    pub fallback_provider: String,
    pub fallback_model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

/// Validated, immutable snapshot used for one or more requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicModelConfig {
    pub primary_provider: ProviderIdentity,
    pub fallback_provider: ProviderIdentity,
    pub primary_model: String,
    pub fallback_model: String,
    pub system_prompt: String,
    pub generation_parameters: GenerationParameters,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are an academic writing assistant. Guide the user \
step by step from choosing a topic to delivering a finished paper.";

impl DynamicModelConfig {
    /// Last-known-safe configuration used when the store cannot be read.
    pub fn safe_default() -> Self {
        Self {
            primary_provider: ProviderIdentity::Gateway,
            fallback_provider: ProviderIdentity::OpenRouter,
            primary_model: "google/gemini-2.5-flash".to_string(),
            fallback_model: "google/gemini-2.5-flash".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation_parameters: GenerationParameters::default(),
        }
    }
}

impl TryFrom<StoredModelConfig> for DynamicModelConfig {
    type Error = ConfigError;

    fn try_from(stored: StoredModelConfig) -> Result<Self, Self::Error> {
        let primary_provider: ProviderIdentity = stored
            .primary_provider
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("primary_provider: {e}")))?;
        let fallback_provider: ProviderIdentity = stored
            .fallback_provider
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("fallback_provider: {e}")))?;

        if stored.primary_model.trim().is_empty() || stored.fallback_model.trim().is_empty() {
            return Err(ConfigError::Invalid("model names must not be empty".to_string()));
        }

        let defaults = GenerationParameters::default();
        let temperature = stored.temperature.unwrap_or(defaults.temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {temperature} outside 0.0..=2.0"
            )));
        }
        let max_tokens = stored.max_tokens.unwrap_or(defaults.max_tokens);
        if max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be positive".to_string()));
        }

        let system_prompt = if stored.system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            stored.system_prompt
        };

        Ok(Self {
            primary_provider,
            fallback_provider,
            primary_model: stored.primary_model,
            fallback_model: stored.fallback_model,
            system_prompt,
            generation_parameters: GenerationParameters {
                temperature,
                max_tokens,
                top_p: stored.top_p,
            },
        })
    }
}

/// Read-only access to the external configuration store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_active_model_config(&self) -> Result<StoredModelConfig, ConfigError>;
}

/// TOML file re-read on every load.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load_active_model_config(&self) -> Result<StoredModelConfig, ConfigError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConfigError::Unavailable(format!("{}: {e}", self.path.display())))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// In-memory store for tests and offline runs.
#[derive(Debug)]
pub struct StaticConfigStore {
    response: Mutex<Result<StoredModelConfig, ConfigError>>,
    delay: Option<Duration>,
    loads: AtomicUsize,
}

impl StaticConfigStore {
    pub fn new(config: StoredModelConfig) -> Self {
        Self {
            response: Mutex::new(Ok(config)),
            delay: None,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ConfigError) -> Self {
        Self {
            response: Mutex::new(Err(error)),
            delay: None,
            loads: AtomicUsize::new(0),
        }
    }

    /// Every load sleeps for `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set(&self, response: Result<StoredModelConfig, ConfigError>) {
        *self.response.lock() = response;
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn load_active_model_config(&self) -> Result<StoredModelConfig, ConfigError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.lock().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOrigin {
    Store,
    /// Store failed, previous snapshot kept
    LastKnown,
    /// Store failed and nothing was loaded before
    SafeDefault,
}

#[derive(Debug, Clone)]
pub struct ConfigCacheSettings {
    pub ttl: Duration,
    /// How long a fallback entry is served before the store is tried again
    pub failure_retry_after: Duration,
}

impl Default for ConfigCacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            failure_retry_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    config: Arc<DynamicModelConfig>,
    origin: ConfigOrigin,
    expires_at: Instant,
    stale: bool,
}

impl CachedEntry {
    fn is_fresh(&self) -> bool {
        !self.stale && Instant::now() < self.expires_at
    }
}

pub struct ConfigCache {
    store: Arc<dyn ConfigStore>,
    settings: ConfigCacheSettings,
    slot: RwLock<Option<CachedEntry>>,
    reload: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ConfigCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCache")
            .field("settings", &self.settings)
            .field("origin", &self.origin())
            .finish()
    }
}

impl ConfigCache {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self::with_settings(store, ConfigCacheSettings::default())
    }

    pub fn with_settings(store: Arc<dyn ConfigStore>, settings: ConfigCacheSettings) -> Self {
        Self {
            store,
            settings,
            slot: RwLock::new(None),
            reload: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot if it is still fresh. Never touches the store.
    pub fn peek(&self) -> Option<Arc<DynamicModelConfig>> {
        self.slot
            .read()
            .as_ref()
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.config.clone())
    }

    /// Where the current snapshot came from, if there is one.
    pub fn origin(&self) -> Option<ConfigOrigin> {
        self.slot.read().as_ref().map(|entry| entry.origin)
    }

    /// Returns the active configuration, reloading it when expired.
    pub async fn get_config(&self) -> Arc<DynamicModelConfig> {
        if let Some(config) = self.peek() {
            return config;
        }

        let _guard = self.reload.lock().await;

        // Another caller may have finished the reload while we waited
        if let Some(config) = self.peek() {
            return config;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let started = Instant::now();
        let loaded = self
            .store
            .load_active_model_config()
            .await
            .and_then(DynamicModelConfig::try_from);

        let mut slot = self.slot.write();
        let entry = match loaded {
            Ok(config) => {
                info!(
                    primary = %config.primary_provider,
                    fallback = %config.fallback_provider,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Loaded model configuration"
                );
                CachedEntry {
                    config: Arc::new(config),
                    origin: ConfigOrigin::Store,
                    expires_at: Instant::now() + self.settings.ttl,
                    stale: false,
                }
            }
            Err(e) => {
                let (config, origin) = match slot.as_ref() {
                    Some(previous) => (previous.config.clone(), ConfigOrigin::LastKnown),
                    None => (
                        Arc::new(DynamicModelConfig::safe_default()),
                        ConfigOrigin::SafeDefault,
                    ),
                };
                warn!(error = %e, ?origin, "Config load failed, serving fallback configuration");
                CachedEntry {
                    config,
                    origin,
                    expires_at: Instant::now() + self.settings.failure_retry_after,
                    stale: false,
                }
            }
        };

        let mut entry = entry;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Configuration invalidated during reload");
            entry.stale = true;
        }
        let config = entry.config.clone();
        *slot = Some(entry);
        config
    }

    /// Forces the next `get_config` to reload. The current snapshot is kept
    /// as the last-known value in case the store is down.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(entry) = self.slot.write().as_mut() {
            entry.stale = true;
        }
        debug!("Model configuration invalidated");
    }
}
