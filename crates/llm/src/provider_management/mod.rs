//! Provider health tracking and selection.
//!
//! The selector turns the active [`DynamicModelConfig`] plus the current
//! health records into one concrete provider, model and parameter set for a
//! generation attempt.

pub mod health;
pub mod strategies;

pub use health::{HealthStatus, HealthTrackerConfig, ProviderHealthRecord, ProviderHealthTracker};
pub use strategies::{
    is_viable, FallbackOnlyStrategy, HealthBasedStrategy, PrimaryFirstStrategy,
    RoundRobinStrategy, SelectionError, SelectionStrategy, StrategyKind, UnknownStrategy,
};

use crate::config_cache::DynamicModelConfig;
use crate::providers::{GenerationParameters, ProviderIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Slot of the configured provider pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Primary,
    Fallback,
}

/// Health snapshot both strategies decide on.
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub primary: ProviderIdentity,
    pub fallback: ProviderIdentity,
    pub primary_health: ProviderHealthRecord,
    pub fallback_health: ProviderHealthRecord,
    pub require_healthy: bool,
    pub max_response_time: Duration,
}

impl SelectionContext {
    pub fn new(
        primary: ProviderIdentity,
        fallback: ProviderIdentity,
        tracker: &ProviderHealthTracker,
        require_healthy: bool,
        max_response_time: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            primary_health: tracker.health(primary),
            fallback_health: tracker.health(fallback),
            require_healthy,
            max_response_time,
        }
    }

    pub fn health(&self, role: ProviderRole) -> &ProviderHealthRecord {
        match role {
            ProviderRole::Primary => &self.primary_health,
            ProviderRole::Fallback => &self.fallback_health,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOptions {
    pub strategy: StrategyKind,
    pub require_healthy: bool,
    pub max_response_time: Duration,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::PrimaryFirst,
            require_healthy: true,
            max_response_time: Duration::from_secs(30),
        }
    }
}

/// Result of provider selection
#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub role: ProviderRole,
    pub provider: ProviderIdentity,
    pub model: String,
    pub parameters: GenerationParameters,
    pub health: ProviderHealthRecord,
}

impl ProviderSelection {
    /// The configured slot for `role`, without any viability check.
    pub fn for_role(
        config: &DynamicModelConfig,
        role: ProviderRole,
        tracker: &ProviderHealthTracker,
    ) -> Self {
        let (provider, model) = match role {
            ProviderRole::Primary => (config.primary_provider, config.primary_model.clone()),
            ProviderRole::Fallback => (config.fallback_provider, config.fallback_model.clone()),
        };
        Self {
            role,
            provider,
            model,
            parameters: config.generation_parameters.clone(),
            health: tracker.health(provider),
        }
    }
}

/// Chooses a provider for each generation attempt.
#[derive(Debug)]
pub struct ProviderSelector {
    tracker: Arc<ProviderHealthTracker>,
    strategies: HashMap<StrategyKind, Box<dyn SelectionStrategy>>,
}

impl ProviderSelector {
    pub fn new(tracker: Arc<ProviderHealthTracker>) -> Self {
        let strategies = [
            StrategyKind::PrimaryFirst,
            StrategyKind::HealthBased,
            StrategyKind::RoundRobin,
            StrategyKind::FallbackOnly,
        ]
        .into_iter()
        .map(|kind| (kind, kind.build()))
        .collect();

        Self {
            tracker,
            strategies,
        }
    }

    pub fn tracker(&self) -> &Arc<ProviderHealthTracker> {
        &self.tracker
    }

    pub fn select_provider(
        &self,
        config: &DynamicModelConfig,
        options: &SelectionOptions,
    ) -> Result<ProviderSelection, SelectionError> {
        let context = SelectionContext::new(
            config.primary_provider,
            config.fallback_provider,
            &self.tracker,
            options.require_healthy,
            options.max_response_time,
        );

        let strategy = self
            .strategies
            .get(&options.strategy)
            .ok_or(SelectionError::NoViableProvider {
                strategy: "unregistered",
            })?;

        match strategy.select(&context) {
            Ok(role) => {
                let selection = ProviderSelection::for_role(config, role, &self.tracker);
                debug!(
                    strategy = strategy.name(),
                    provider = %selection.provider,
                    model = %selection.model,
                    ?role,
                    "Selected provider"
                );
                Ok(selection)
            }
            Err(e) => {
                warn!(
                    strategy = strategy.name(),
                    primary_status = ?context.primary_health.status,
                    fallback_status = ?context.fallback_health.status,
                    "No viable provider"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_maps_role_to_model() {
        let tracker = Arc::new(ProviderHealthTracker::new());
        let selector = ProviderSelector::new(tracker.clone());
        let config = DynamicModelConfig::safe_default();

        let selection = selector
            .select_provider(&config, &SelectionOptions::default())
            .unwrap();
        assert_eq!(selection.role, ProviderRole::Primary);
        assert_eq!(selection.provider, config.primary_provider);
        assert_eq!(selection.model, config.primary_model);

        let options = SelectionOptions {
            strategy: StrategyKind::FallbackOnly,
            ..Default::default()
        };
        let selection = selector.select_provider(&config, &options).unwrap();
        assert_eq!(selection.provider, config.fallback_provider);
        assert_eq!(selection.model, config.fallback_model);
    }

    #[test]
    fn test_round_robin_counter_survives_calls() {
        let selector = ProviderSelector::new(Arc::new(ProviderHealthTracker::new()));
        let config = DynamicModelConfig::safe_default();
        let options = SelectionOptions {
            strategy: StrategyKind::RoundRobin,
            ..Default::default()
        };
        let first = selector.select_provider(&config, &options).unwrap().role;
        let second = selector.select_provider(&config, &options).unwrap().role;
        assert_ne!(first, second);
    }
}
