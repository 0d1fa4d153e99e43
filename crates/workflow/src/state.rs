//! Workflow state reported by the model at the end of each response.
//!
//! The model closes every answer with
//! `<!--workflow-state:{"phase":"...","progress":0.4,"artifacts":{...}}-->`.
//! [`extract`] turns that marker into a new [`WorkflowMetadata`] merged over
//! the previous one. Model text is untrusted: every parse or validation
//! problem yields `None` ("no update") and is logged, never raised.

use crate::phases::WorkflowPhase;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Artifact key that gates the outlining phases.
pub const OUTLINE_ARTIFACT: &str = "outline";

/// Minimum length of a string outline before it counts as real content.
pub const MIN_OUTLINE_CHARS: usize = 20;

/// Payloads longer than this are not parsed at all.
pub const MAX_MARKER_PAYLOAD: usize = 64 * 1024;

static MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<!--\s*workflow-state:\s*(\{.*?\})\s*-->").expect("marker regex is valid")
});

/// Per-conversation workflow record, persisted by the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub phase: WorkflowPhase,
    pub progress: f64,
    #[serde(default)]
    pub artifacts: Map<String, Value>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub off_topic_count: u32,
}

impl WorkflowMetadata {
    /// State of a conversation that has not reported anything yet.
    pub fn initial() -> Self {
        Self {
            phase: WorkflowPhase::Exploring,
            progress: WorkflowPhase::Exploring.canonical_progress(),
            artifacts: Map::new(),
            timestamp: now_millis(),
            off_topic_count: 0,
        }
    }

    pub fn has_outline(&self) -> bool {
        self.artifacts
            .get(OUTLINE_ARTIFACT)
            .map(is_substantial_outline)
            .unwrap_or(false)
    }
}

impl Default for WorkflowMetadata {
    fn default() -> Self {
        Self::initial()
    }
}

/// Why a candidate marker was discarded. Only used for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    PayloadTooLarge(usize),
    InvalidJson(String),
    NotAnObject,
    PhaseNotAString,
    ArtifactsNotAnObject,
}

/// Outcome of looking for a marker, before merging.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerScan {
    Absent,
    Rejected(RejectReason),
    Found(Map<String, Value>),
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Finds the marker payload. Only the last marker in the text is considered.
pub fn scan_marker(raw: &str) -> MarkerScan {
    let Some(captures) = MARKER_RE.captures_iter(raw).last() else {
        return MarkerScan::Absent;
    };
    let Some(payload) = captures.get(1).map(|m| m.as_str()) else {
        return MarkerScan::Absent;
    };

    if payload.len() > MAX_MARKER_PAYLOAD {
        return MarkerScan::Rejected(RejectReason::PayloadTooLarge(payload.len()));
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => return MarkerScan::Rejected(RejectReason::InvalidJson(e.to_string())),
    };

    let Value::Object(object) = value else {
        return MarkerScan::Rejected(RejectReason::NotAnObject);
    };

    if matches!(object.get("phase"), Some(v) if !v.is_string() && !v.is_null()) {
        return MarkerScan::Rejected(RejectReason::PhaseNotAString);
    }
    if matches!(object.get("artifacts"), Some(v) if !v.is_object() && !v.is_null()) {
        return MarkerScan::Rejected(RejectReason::ArtifactsNotAnObject);
    }

    MarkerScan::Found(object)
}

/// Removes every state marker, for display and persistence of the reply text.
pub fn strip_state_marker(raw: &str) -> String {
    MARKER_RE.replace_all(raw, "").trim_end().to_string()
}

/// Parses the marker in `raw` and merges it over `previous`.
///
/// Returns `None` when there is no marker or it cannot be used; the caller
/// keeps `previous` unchanged in that case.
pub fn extract(raw: &str, previous: Option<&WorkflowMetadata>) -> Option<WorkflowMetadata> {
    match scan_marker(raw) {
        MarkerScan::Absent => {
            debug!("No workflow-state marker in response");
            None
        }
        MarkerScan::Rejected(reason) => {
            warn!(?reason, "Discarding malformed workflow-state marker");
            None
        }
        MarkerScan::Found(candidate) => {
            let initial;
            let previous = match previous {
                Some(previous) => previous,
                None => {
                    initial = WorkflowMetadata::initial();
                    &initial
                }
            };
            Some(merge(previous, &candidate))
        }
    }
}

/// Merges a validated candidate object over the previous metadata.
pub fn merge(previous: &WorkflowMetadata, candidate: &Map<String, Value>) -> WorkflowMetadata {
    let candidate_phase = candidate
        .get("phase")
        .and_then(Value::as_str)
        .and_then(|s| match s.parse::<WorkflowPhase>() {
            Ok(phase) => Some(phase),
            Err(e) => {
                warn!(error = %e, "Unrecognised phase in workflow-state marker");
                None
            }
        });
    let candidate_progress = candidate
        .get("progress")
        .and_then(Value::as_f64)
        .filter(|p| p.is_finite() && (0.0..=1.0).contains(p));
    let candidate_artifacts = candidate
        .get("artifacts")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let (mut phase, mut progress) = match candidate_phase {
        Some(phase) if phase < previous.phase => {
            debug!(
                from = %previous.phase,
                to = %phase,
                "Ignoring backwards phase transition"
            );
            (previous.phase, previous.progress)
        }
        Some(phase) => (
            phase,
            candidate_progress.unwrap_or_else(|| phase.canonical_progress()),
        ),
        None => (
            previous.phase,
            candidate_progress.unwrap_or(previous.progress),
        ),
    };

    let mut artifacts = previous.artifacts.clone();
    let mut outline_rejected = false;

    if phase.requires_outline() {
        let candidate_has_outline = candidate_artifacts
            .get(OUTLINE_ARTIFACT)
            .map(is_substantial_outline)
            .unwrap_or(false);
        if !candidate_has_outline && !previous.has_outline() {
            warn!(
                requested = %phase,
                kept = %previous.phase,
                "Phase requires an outline artifact; keeping previous phase"
            );
            phase = previous.phase;
            progress = previous.progress;
            outline_rejected = true;
        }
    }

    for (key, value) in candidate_artifacts {
        if outline_rejected && key == OUTLINE_ARTIFACT {
            continue;
        }
        artifacts.insert(key, value);
    }

    WorkflowMetadata {
        phase,
        progress,
        artifacts,
        timestamp: now_millis(),
        off_topic_count: previous.off_topic_count,
    }
}

fn is_substantial_outline(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().chars().count() >= MIN_OUTLINE_CHARS,
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        _ => false,
    }
}
