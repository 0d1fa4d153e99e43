pub mod off_topic;
pub mod phases;
pub mod prompt_context;
pub mod state;

pub use off_topic::{Escalation, OffTopicPolicy};
pub use phases::{PhaseDefinition, UnknownPhase, WorkflowPhase, PHASE_COUNT};
pub use prompt_context::{compose_system_prompt, compose_with_policy};
pub use state::{
    extract, merge, scan_marker, strip_state_marker, MarkerScan, RejectReason, WorkflowMetadata,
    OUTLINE_ARTIFACT,
};
