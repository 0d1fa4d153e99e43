use proptest::prelude::*;
use serde_json::json;
use workflow::{extract, WorkflowMetadata, WorkflowPhase, OUTLINE_ARTIFACT, PHASE_COUNT};

fn marker(payload: serde_json::Value) -> String {
    format!("Model answer text.\n<!--workflow-state:{}-->", payload)
}

fn researching() -> WorkflowMetadata {
    let mut meta = WorkflowMetadata::initial();
    meta.phase = WorkflowPhase::Researching;
    meta.progress = 0.3;
    meta
}

#[test]
fn test_backwards_candidate_keeps_previous_state() {
    let previous = researching();
    let text = marker(json!({"phase": "exploring", "progress": 0.1, "artifacts": {}}));

    let merged = extract(&text, Some(&previous)).expect("marker present");

    assert_eq!(merged.phase, WorkflowPhase::Researching);
    assert_eq!(merged.progress, 0.3);
    assert!(merged.artifacts.is_empty());
}

#[test]
fn test_outlining_without_outline_is_rejected() {
    let previous = researching();
    let text = marker(json!({"phase": "outlining", "progress": 0.5, "artifacts": {}}));

    let merged = extract(&text, Some(&previous)).expect("marker present");

    assert_eq!(merged.phase, previous.phase);
    assert!(!merged.artifacts.contains_key(OUTLINE_ARTIFACT));
}

#[test]
fn test_full_conversation_walk() {
    let mut meta = WorkflowMetadata::initial();
    let steps = [
        (json!({"phase": "topic_locked", "artifacts": {"topic": "Soil carbon"}}), WorkflowPhase::TopicLocked),
        (json!({"phase": "researching", "artifacts": {"sources": ["a", "b"]}}), WorkflowPhase::Researching),
        (json!({"phase": "outlining"}), WorkflowPhase::Researching),
        (
            json!({"phase": "outlining", "artifacts": {"outline": ["Intro", "Methods", "Results"]}}),
            WorkflowPhase::Outlining,
        ),
        (json!({"phase": "topic_locked"}), WorkflowPhase::Outlining),
        (json!({"phase": "outline_locked"}), WorkflowPhase::OutlineLocked),
        (json!({"phase": "delivered", "progress": 1.0}), WorkflowPhase::Delivered),
    ];

    for (payload, expected) in steps {
        meta = extract(&marker(payload), Some(&meta)).expect("marker present");
        assert_eq!(meta.phase, expected);
    }

    assert_eq!(meta.artifacts["topic"], "Soil carbon");
    assert_eq!(meta.artifacts["sources"], json!(["a", "b"]));
    assert!(meta.has_outline());
}

#[test]
fn test_malformed_marker_is_not_an_error() {
    let previous = researching();
    for text in [
        "<!--workflow-state:not json at all-->",
        "<!--workflow-state:{\"phase\":\"drafting\"",
        "<!--workflow-state:[1,2,3]-->",
        "<!--workflow-state:{\"artifacts\":\"outline\"}-->",
    ] {
        assert!(extract(text, Some(&previous)).is_none(), "accepted {text}");
    }
}

fn phase_name() -> impl Strategy<Value = String> {
    prop_oneof![
        (0..PHASE_COUNT).prop_map(|i| WorkflowPhase::from_index(i).unwrap().as_str().to_string()),
        "[a-z_]{1,16}",
    ]
}

fn candidate() -> impl Strategy<Value = String> {
    (
        prop::option::of(phase_name()),
        prop::option::of(-1.0f64..2.0),
        prop::option::of("[ -~]{0,40}"),
    )
        .prop_map(|(phase, progress, outline)| {
            let mut payload = serde_json::Map::new();
            if let Some(phase) = phase {
                payload.insert("phase".into(), json!(phase));
            }
            if let Some(progress) = progress {
                payload.insert("progress".into(), json!(progress));
            }
            if let Some(outline) = outline {
                payload.insert("artifacts".into(), json!({ "outline": outline }));
            }
            marker(serde_json::Value::Object(payload))
        })
}

proptest! {
    #[test]
    fn test_phase_index_never_decreases(texts in prop::collection::vec(candidate(), 1..30)) {
        let mut meta = WorkflowMetadata::initial();
        for text in texts {
            if let Some(next) = extract(&text, Some(&meta)) {
                prop_assert!(next.phase.index() >= meta.phase.index());
                prop_assert!((0.0..=1.0).contains(&next.progress));
                for key in meta.artifacts.keys() {
                    prop_assert!(next.artifacts.contains_key(key));
                }
                meta = next;
            }
        }
    }

    #[test]
    fn test_arbitrary_text_never_panics(text in "\\PC{0,200}") {
        let previous = researching();
        let _ = extract(&text, Some(&previous));
        let wrapped = format!("<!--workflow-state:{}-->", text);
        if let Some(merged) = extract(&wrapped, Some(&previous)) {
            prop_assert!(merged.phase >= previous.phase);
        }
    }
}
