use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use llm::{DynamicModelConfig, StoredModelConfig};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::services;

const EXAMPLE_CONFIG: &str = r#"# Active model configuration
primary_provider = "vercel-gateway"
primary_model = "google/gemini-2.5-flash"
fallback_provider = "openrouter"
fallback_model = "google/gemini-2.5-flash"
temperature = 0.7
max_tokens = 4096

# Optional weighted system-prompt variants, assigned by user cohort
# [[prompt_variants]]
# id = "concise"
# weight = 50
# prompt = "You are an academic writing assistant. Keep answers short."
"#;

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: Option<ConfigSubcommand>,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    /// Show the configuration requests would use (the default)
    Show,

    /// Load and validate the configuration file, failing on errors
    #[command(alias = "check")]
    Validate,

    /// Print an example configuration file
    Example,
}

impl ConfigCommand {
    pub async fn execute(self, config_path: Option<PathBuf>) -> Result<()> {
        match self.command.unwrap_or(ConfigSubcommand::Show) {
            ConfigSubcommand::Show => Self::show(config_path).await,
            ConfigSubcommand::Validate => Self::validate(config_path),
            ConfigSubcommand::Example => {
                print!("{EXAMPLE_CONFIG}");
                Ok(())
            }
        }
    }

    async fn show(config_path: Option<PathBuf>) -> Result<()> {
        let cache = services::config_cache(config_path.as_deref());
        let config = cache.get_config().await;
        let output = serde_json::json!({
            "origin": cache.origin(),
            "config": config.as_ref(),
            "promptVariants": services::prompt_variants(config_path.as_deref())?,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }

    fn validate(config_path: Option<PathBuf>) -> Result<()> {
        let path = config_path.ok_or_else(|| anyhow!("no configuration file given"))?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let stored: StoredModelConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        match DynamicModelConfig::try_from(stored) {
            Ok(config) => {
                info!(
                    primary = %config.primary_provider,
                    fallback = %config.fallback_provider,
                    "✅ Configuration is valid"
                );
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            Err(e) => {
                warn!("Configuration rejected: {e}");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_is_valid() {
        let stored: StoredModelConfig = toml::from_str(EXAMPLE_CONFIG).unwrap();
        let config = DynamicModelConfig::try_from(stored).unwrap();
        assert_eq!(config.primary_model, "google/gemini-2.5-flash");
        assert_eq!(config.generation_parameters.max_tokens, 4096);
    }
}
