//! Passive health tracking for providers.
//!
//! Records are fed by the outcome of real generation attempts; there is no
//! background probing. Each record behaves like a small circuit breaker:
//! consecutive failures push it to `Degraded` and then `Unhealthy`, a success
//! closes it again.

use crate::providers::ProviderIdentity;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthRecord {
    pub status: HealthStatus,
    pub last_response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_checked_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip)]
    last_failure: Option<Instant>,
}

impl ProviderHealthRecord {
    fn fresh() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_response_time_ms: None,
            consecutive_failures: 0,
            last_checked_at: Utc::now(),
            last_error: None,
            last_failure: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthTrackerConfig {
    /// Consecutive failures before a provider is unhealthy
    pub unhealthy_after: u32,
    /// A success slower than this leaves the provider degraded
    pub slow_response_threshold: Duration,
    /// Quiet period after which an unhealthy provider may be probed again.
    /// `None` keeps it unhealthy until a success is recorded.
    pub recovery_timeout: Option<Duration>,
}

impl Default for HealthTrackerConfig {
    fn default() -> Self {
        Self {
            unhealthy_after: 3,
            slow_response_threshold: Duration::from_secs(15),
            recovery_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Shared, process-wide health state keyed by provider.
#[derive(Debug, Default)]
pub struct ProviderHealthTracker {
    records: RwLock<HashMap<ProviderIdentity, ProviderHealthRecord>>,
    config: HealthTrackerConfig,
}

impl ProviderHealthTracker {
    pub fn new() -> Self {
        Self::with_config(HealthTrackerConfig::default())
    }

    pub fn with_config(config: HealthTrackerConfig) -> Self {
        debug!("Creating health tracker with config: {:?}", config);
        Self {
            records: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &HealthTrackerConfig {
        &self.config
    }

    pub fn record_success(&self, provider: ProviderIdentity, latency: Duration) {
        let mut records = self.records.write();
        let record = records
            .entry(provider)
            .or_insert_with(ProviderHealthRecord::fresh);

        let was = record.status;
        record.consecutive_failures = 0;
        record.last_failure = None;
        record.last_error = None;
        record.last_response_time_ms = Some(latency.as_millis() as u64);
        record.last_checked_at = Utc::now();
        record.status = if latency > self.config.slow_response_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if was == HealthStatus::Unhealthy {
            info!(provider = %provider, "✅ Provider recovered");
        }
    }

    pub fn record_failure(&self, provider: ProviderIdentity, error: &str) {
        let mut records = self.records.write();
        let record = records
            .entry(provider)
            .or_insert_with(ProviderHealthRecord::fresh);

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_failure = Some(Instant::now());
        record.last_error = Some(error.to_string());
        record.last_checked_at = Utc::now();

        let previous = record.status;
        record.status = if record.consecutive_failures >= self.config.unhealthy_after {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        if record.status == HealthStatus::Unhealthy && previous != HealthStatus::Unhealthy {
            warn!(
                provider = %provider,
                failures = record.consecutive_failures,
                "🚨 Provider marked unhealthy"
            );
        }
    }

    /// Current view of a provider. Unknown providers read as healthy.
    ///
    /// An unhealthy record older than `recovery_timeout` reads as degraded so
    /// that selection will try it again.
    pub fn health(&self, provider: ProviderIdentity) -> ProviderHealthRecord {
        let records = self.records.read();
        match records.get(&provider) {
            Some(record) => self.effective(record),
            None => ProviderHealthRecord::fresh(),
        }
    }

    pub fn snapshot(&self) -> Vec<(ProviderIdentity, ProviderHealthRecord)> {
        let records = self.records.read();
        let mut all: Vec<_> = records
            .iter()
            .map(|(id, record)| (*id, self.effective(record)))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn reset(&self, provider: ProviderIdentity) {
        self.records.write().remove(&provider);
    }

    fn effective(&self, record: &ProviderHealthRecord) -> ProviderHealthRecord {
        let mut view = record.clone();
        if view.status == HealthStatus::Unhealthy {
            if let (Some(timeout), Some(last_failure)) =
                (self.config.recovery_timeout, view.last_failure)
            {
                if last_failure.elapsed() >= timeout {
                    view.status = HealthStatus::Degraded;
                }
            }
        }
        view
    }
}
