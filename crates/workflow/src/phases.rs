//! Fixed registry of the eleven academic-writing phases.
//!
//! Declaration order is the workflow order: `Ord` on [`WorkflowPhase`] and
//! [`WorkflowPhase::index`] agree, and a conversation only ever moves forward
//! through this list.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    #[serde(alias = "exploration")]
    Exploring,
    TopicLocked,
    Researching,
    FoundationReady,
    Outlining,
    OutlineLocked,
    Drafting,
    DraftingLocked,
    Integrating,
    Polishing,
    Delivered,
}

/// Static description of one phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseDefinition {
    pub phase: WorkflowPhase,
    pub label: &'static str,
    pub description: &'static str,
    /// Progress fraction a conversation reports on entering this phase
    pub canonical_progress: f64,
}

pub const PHASE_COUNT: usize = 11;

static PHASES: [PhaseDefinition; PHASE_COUNT] = [
    PhaseDefinition {
        phase: WorkflowPhase::Exploring,
        label: "Exploring",
        description: "Discussing interests and candidate topics",
        canonical_progress: 0.05,
    },
    PhaseDefinition {
        phase: WorkflowPhase::TopicLocked,
        label: "Topic locked",
        description: "Topic and research question agreed",
        canonical_progress: 0.15,
    },
    PhaseDefinition {
        phase: WorkflowPhase::Researching,
        label: "Researching",
        description: "Collecting and reviewing literature",
        canonical_progress: 0.25,
    },
    PhaseDefinition {
        phase: WorkflowPhase::FoundationReady,
        label: "Foundation ready",
        description: "Sources and theoretical framing in place",
        canonical_progress: 0.35,
    },
    PhaseDefinition {
        phase: WorkflowPhase::Outlining,
        label: "Outlining",
        description: "Structuring chapters and sections",
        canonical_progress: 0.45,
    },
    PhaseDefinition {
        phase: WorkflowPhase::OutlineLocked,
        label: "Outline locked",
        description: "Outline approved by the user",
        canonical_progress: 0.55,
    },
    PhaseDefinition {
        phase: WorkflowPhase::Drafting,
        label: "Drafting",
        description: "Writing section drafts",
        canonical_progress: 0.65,
    },
    PhaseDefinition {
        phase: WorkflowPhase::DraftingLocked,
        label: "Drafting locked",
        description: "All sections drafted and approved",
        canonical_progress: 0.75,
    },
    PhaseDefinition {
        phase: WorkflowPhase::Integrating,
        label: "Integrating",
        description: "Merging sections into one coherent paper",
        canonical_progress: 0.85,
    },
    PhaseDefinition {
        phase: WorkflowPhase::Polishing,
        label: "Polishing",
        description: "Language, citation and formatting pass",
        canonical_progress: 0.95,
    },
    PhaseDefinition {
        phase: WorkflowPhase::Delivered,
        label: "Delivered",
        description: "Final paper handed over",
        canonical_progress: 1.0,
    },
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown workflow phase '{0}'")]
pub struct UnknownPhase(pub String);

impl WorkflowPhase {
    pub fn all() -> impl Iterator<Item = WorkflowPhase> {
        PHASES.iter().map(|def| def.phase)
    }

    pub fn definitions() -> &'static [PhaseDefinition] {
        &PHASES
    }

    pub fn definition(self) -> &'static PhaseDefinition {
        &PHASES[self.index()]
    }

    /// Position in the workflow order, 0-based.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<WorkflowPhase> {
        PHASES.get(index).map(|def| def.phase)
    }

    pub fn label(self) -> &'static str {
        self.definition().label
    }

    pub fn description(self) -> &'static str {
        self.definition().description
    }

    pub fn canonical_progress(self) -> f64 {
        self.definition().canonical_progress
    }

    pub fn next(self) -> Option<WorkflowPhase> {
        Self::from_index(self.index() + 1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowPhase::Exploring => "exploring",
            WorkflowPhase::TopicLocked => "topic_locked",
            WorkflowPhase::Researching => "researching",
            WorkflowPhase::FoundationReady => "foundation_ready",
            WorkflowPhase::Outlining => "outlining",
            WorkflowPhase::OutlineLocked => "outline_locked",
            WorkflowPhase::Drafting => "drafting",
            WorkflowPhase::DraftingLocked => "drafting_locked",
            WorkflowPhase::Integrating => "integrating",
            WorkflowPhase::Polishing => "polishing",
            WorkflowPhase::Delivered => "delivered",
        }
    }

    /// Phases that require an outline artifact before they can be entered.
    pub fn requires_outline(self) -> bool {
        matches!(self, WorkflowPhase::Outlining | WorkflowPhase::OutlineLocked)
    }
}

impl Default for WorkflowPhase {
    fn default() -> Self {
        WorkflowPhase::Exploring
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowPhase {
    type Err = UnknownPhase;

    /// Accepts snake_case, kebab-case, any ASCII case, and `exploration`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        if normalized == "exploration" {
            return Ok(WorkflowPhase::Exploring);
        }
        WorkflowPhase::all()
            .find(|phase| phase.as_str() == normalized)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_matches_enum_order() {
        for (i, def) in PHASES.iter().enumerate() {
            assert_eq!(def.phase.index(), i);
            assert_eq!(WorkflowPhase::from_index(i), Some(def.phase));
        }
        assert_eq!(WorkflowPhase::all().count(), PHASE_COUNT);
    }

    #[test]
    fn test_canonical_progress_is_increasing() {
        let progress: Vec<f64> = PHASES.iter().map(|d| d.canonical_progress).collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(WorkflowPhase::Delivered.canonical_progress(), 1.0);
        assert_eq!(WorkflowPhase::Exploring.canonical_progress(), 0.05);
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!("topic_locked".parse(), Ok(WorkflowPhase::TopicLocked));
        assert_eq!("Outline-Locked".parse(), Ok(WorkflowPhase::OutlineLocked));
        assert_eq!("exploration".parse(), Ok(WorkflowPhase::Exploring));
        assert!("writing".parse::<WorkflowPhase>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&WorkflowPhase::FoundationReady).unwrap();
        assert_eq!(json, "\"foundation_ready\"");
        let back: WorkflowPhase = serde_json::from_str("\"exploration\"").unwrap();
        assert_eq!(back, WorkflowPhase::Exploring);
    }

    #[test]
    fn test_next_and_bounds() {
        assert_eq!(WorkflowPhase::Exploring.next(), Some(WorkflowPhase::TopicLocked));
        assert_eq!(WorkflowPhase::Delivered.next(), None);
        assert!(WorkflowPhase::Outlining.requires_outline());
        assert!(!WorkflowPhase::Drafting.requires_outline());
    }
}
