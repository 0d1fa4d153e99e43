//! Wiring shared by the subcommands.

use anyhow::{Context, Result};
use llm::{ConfigCache, ConfigError, ConfigStore, FileConfigStore, PromptVariant, StaticConfigStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Extra sections the CLI reads from the model configuration file.
#[derive(Debug, Default, Deserialize)]
struct CliSections {
    #[serde(default)]
    prompt_variants: Vec<PromptVariant>,
}

pub fn config_store(path: Option<&Path>) -> Arc<dyn ConfigStore> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "Using file configuration store");
            Arc::new(FileConfigStore::new(path))
        }
        None => {
            warn!("No configuration file given, serving the built-in default");
            Arc::new(StaticConfigStore::failing(ConfigError::Unavailable(
                "no configuration file".to_string(),
            )))
        }
    }
}

pub fn config_cache(path: Option<&Path>) -> Arc<ConfigCache> {
    Arc::new(ConfigCache::new(config_store(path)))
}

/// Prompt variants declared as `[[prompt_variants]]` tables.
pub fn prompt_variants(path: Option<&Path>) -> Result<Vec<PromptVariant>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let Ok(content) = std::fs::read_to_string(path) else {
        // The cache reports unreadable files itself
        return Ok(Vec::new());
    };
    let sections: CliSections = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(sections.prompt_variants)
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
