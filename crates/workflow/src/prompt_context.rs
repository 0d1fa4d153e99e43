//! Builds the per-turn system prompt from the configured base prompt and the
//! conversation's current workflow state.

use crate::off_topic::OffTopicPolicy;
use crate::state::WorkflowMetadata;

const MARKER_INSTRUCTION: &str = "End every response with exactly one line of the form \
<!--workflow-state:{\"phase\":\"<phase>\",\"progress\":<0.0-1.0>,\"artifacts\":{...}}--> \
using one of the phase names listed above. Never move to an earlier phase.";

pub fn compose_system_prompt(base: &str, metadata: &WorkflowMetadata) -> String {
    compose_with_policy(base, metadata, &OffTopicPolicy::default())
}

pub fn compose_with_policy(
    base: &str,
    metadata: &WorkflowMetadata,
    policy: &OffTopicPolicy,
) -> String {
    let mut prompt = String::with_capacity(base.len() + 512);
    prompt.push_str(base.trim_end());
    prompt.push_str("\n\n## Workflow\n");

    let phase = metadata.phase;
    prompt.push_str(&format!(
        "Current phase: {} ({}), {}. Progress: {:.0}%.\n",
        phase.as_str(),
        phase.label(),
        phase.description(),
        metadata.progress * 100.0
    ));
    if let Some(next) = phase.next() {
        prompt.push_str(&format!("Next phase: {} ({}).\n", next.as_str(), next.label()));
    }
    if !metadata.artifacts.is_empty() {
        let keys: Vec<&str> = metadata.artifacts.keys().map(String::as_str).collect();
        prompt.push_str(&format!("Recorded artifacts: {}.\n", keys.join(", ")));
    }

    prompt.push_str("Phases in order: ");
    let names: Vec<&str> = crate::phases::WorkflowPhase::all()
        .map(|p| p.as_str())
        .collect();
    prompt.push_str(&names.join(", "));
    prompt.push('\n');
    prompt.push_str(MARKER_INSTRUCTION);

    if let Some(guidance) = policy.guidance(metadata.off_topic_count) {
        prompt.push_str("\n\n## Focus\n");
        prompt.push_str(guidance);
    }

    prompt
}
