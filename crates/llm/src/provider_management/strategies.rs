//! Provider selection strategies

use super::health::{HealthStatus, ProviderHealthRecord};
use super::{ProviderRole, SelectionContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::debug;

/// Score awarded per health status before the latency penalty.
const HEALTHY_SCORE: f64 = 100.0;
const DEGRADED_SCORE: f64 = 50.0;
const UNHEALTHY_SCORE: f64 = 0.0;
/// Penalty at `latency == max_response_time`.
const LATENCY_PENALTY: f64 = 20.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no viable provider for strategy '{strategy}'")]
    NoViableProvider { strategy: &'static str },
}

/// Trait for provider selection strategies
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Picks the primary or the fallback slot
    fn select(&self, context: &SelectionContext) -> Result<ProviderRole, SelectionError>;

    /// Strategy name for logging and debugging
    fn name(&self) -> &'static str;
}

/// Whether a candidate may receive traffic under the current constraints.
pub fn is_viable(record: &ProviderHealthRecord, context: &SelectionContext) -> bool {
    if context.require_healthy && record.status == HealthStatus::Unhealthy {
        return false;
    }
    match record.last_response_time_ms {
        Some(ms) => ms <= context.max_response_time.as_millis() as u64,
        None => true,
    }
}

/// Uses the primary unless it is not viable.
#[derive(Debug, Default)]
pub struct PrimaryFirstStrategy;

impl SelectionStrategy for PrimaryFirstStrategy {
    fn select(&self, context: &SelectionContext) -> Result<ProviderRole, SelectionError> {
        for role in [ProviderRole::Primary, ProviderRole::Fallback] {
            if is_viable(context.health(role), context) {
                return Ok(role);
            }
            debug!(?role, "Candidate not viable, trying next");
        }
        Err(SelectionError::NoViableProvider {
            strategy: self.name(),
        })
    }

    fn name(&self) -> &'static str {
        "primary_first"
    }
}

/// Picks the viable candidate with the best health score.
#[derive(Debug, Default)]
pub struct HealthBasedStrategy;

impl HealthBasedStrategy {
    pub fn score(record: &ProviderHealthRecord, context: &SelectionContext) -> f64 {
        let base = match record.status {
            HealthStatus::Healthy => HEALTHY_SCORE,
            HealthStatus::Degraded => DEGRADED_SCORE,
            HealthStatus::Unhealthy => UNHEALTHY_SCORE,
        };
        let max_ms = context.max_response_time.as_millis().max(1) as f64;
        let penalty = record
            .last_response_time_ms
            .map(|ms| LATENCY_PENALTY * (ms as f64 / max_ms))
            .unwrap_or(0.0);
        base - penalty
    }
}

impl SelectionStrategy for HealthBasedStrategy {
    fn select(&self, context: &SelectionContext) -> Result<ProviderRole, SelectionError> {
        let scored: Vec<(ProviderRole, f64)> = [ProviderRole::Primary, ProviderRole::Fallback]
            .into_iter()
            .filter(|role| is_viable(context.health(*role), context))
            .map(|role| (role, Self::score(context.health(role), context)))
            .collect();

        debug!(?scored, "Health-based scores");

        // Primary comes first, so it keeps ties
        scored
            .into_iter()
            .fold(None, |best: Option<(ProviderRole, f64)>, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            })
            .map(|(role, _)| role)
            .ok_or(SelectionError::NoViableProvider {
                strategy: self.name(),
            })
    }

    fn name(&self) -> &'static str {
        "health_based"
    }
}

/// Alternates the starting candidate on every call.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select(&self, context: &SelectionContext) -> Result<ProviderRole, SelectionError> {
        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        let order = if turn % 2 == 0 {
            [ProviderRole::Primary, ProviderRole::Fallback]
        } else {
            [ProviderRole::Fallback, ProviderRole::Primary]
        };
        order
            .into_iter()
            .find(|role| is_viable(context.health(*role), context))
            .ok_or(SelectionError::NoViableProvider {
                strategy: self.name(),
            })
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Always routes to the fallback slot, whatever its health.
#[derive(Debug, Default)]
pub struct FallbackOnlyStrategy;

impl SelectionStrategy for FallbackOnlyStrategy {
    fn select(&self, context: &SelectionContext) -> Result<ProviderRole, SelectionError> {
        if !is_viable(context.health(ProviderRole::Fallback), context) {
            debug!("Fallback not viable, routing to it anyway");
        }
        Ok(ProviderRole::Fallback)
    }

    fn name(&self) -> &'static str {
        "fallback_only"
    }
}

/// Strategy names accepted in configuration and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    PrimaryFirst,
    HealthBased,
    RoundRobin,
    FallbackOnly,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            StrategyKind::PrimaryFirst => Box::new(PrimaryFirstStrategy),
            StrategyKind::HealthBased => Box::new(HealthBasedStrategy),
            StrategyKind::RoundRobin => Box::<RoundRobinStrategy>::default(),
            StrategyKind::FallbackOnly => Box::new(FallbackOnlyStrategy),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown selection strategy '{0}'")]
pub struct UnknownStrategy(pub String);

impl FromStr for StrategyKind {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "primary-first" => Ok(StrategyKind::PrimaryFirst),
            "health-based" => Ok(StrategyKind::HealthBased),
            "round-robin" => Ok(StrategyKind::RoundRobin),
            "fallback-only" => Ok(StrategyKind::FallbackOnly),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}
