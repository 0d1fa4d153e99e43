use llm::{
    ChatMessage, ChatRequest, ConfigCache, ErrorKind, FailureKind, HealthStatus,
    ProviderFailure, ProviderHealthTracker, ProviderIdentity, ProviderRegistry, ProviderSelector,
    ScriptStep, ScriptedProvider, StaticConfigStore, StoredModelConfig, StreamChunk, StreamEvent,
    StreamOrchestrator, StreamOutcome, StreamWriter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workflow::{WorkflowMetadata, WorkflowPhase};

struct Harness {
    orchestrator: StreamOrchestrator,
    primary: Arc<ScriptedProvider>,
    fallback: Arc<ScriptedProvider>,
    health: Arc<ProviderHealthTracker>,
}

fn stored_config() -> StoredModelConfig {
    StoredModelConfig {
        primary_provider: "vercel-gateway".to_string(),
        primary_model: "primary-model".to_string(),
        fallback_provider: "openrouter".to_string(),
        fallback_model: "fallback-model".to_string(),
        system_prompt: "You are a writing tutor.".to_string(),
        temperature: None,
        max_tokens: None,
        top_p: None,
    }
}

fn harness(primary: ScriptedProvider, fallback: ScriptedProvider) -> Harness {
    let primary = Arc::new(primary);
    let fallback = Arc::new(fallback);
    let health = Arc::new(ProviderHealthTracker::new());
    let cache = Arc::new(ConfigCache::new(Arc::new(StaticConfigStore::new(
        stored_config(),
    ))));
    let registry = ProviderRegistry::new()
        .with(primary.clone())
        .with(fallback.clone());
    let orchestrator = StreamOrchestrator::new(
        cache,
        Arc::new(ProviderSelector::new(health.clone())),
        registry,
    );
    Harness {
        orchestrator,
        primary,
        fallback,
        health,
    }
}

fn request() -> ChatRequest {
    ChatRequest {
        conversation_id: "conv-1".to_string(),
        messages: vec![ChatMessage::user("I want to write about coral reefs")],
        ..Default::default()
    }
}

async fn run(h: &Harness, request: ChatRequest) -> (StreamOutcome, Vec<StreamEvent>) {
    let (writer, mut rx) = StreamWriter::channel(256);
    let outcome = h
        .orchestrator
        .stream(request, &writer, CancellationToken::new())
        .await
        .expect("request accepted");
    drop(writer);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (outcome, events)
}

fn terminal_count(events: &[StreamEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

fn streamed_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_successful_stream_event_order() {
    let reply = "Let's narrow the topic.\n<!--workflow-state:{\"phase\":\"topic_locked\",\"progress\":0.15,\"artifacts\":{\"topic\":\"Coral bleaching\"}}-->";
    let h = harness(
        ScriptedProvider::replying(ProviderIdentity::Gateway, reply),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "unused"),
    );

    let (outcome, events) = run(&h, request()).await;

    assert!(matches!(events.first(), Some(StreamEvent::Start { .. })));
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Finish {
            finish_reason: "stop".to_string()
        })
    );
    let n = events.len();
    assert!(matches!(events[n - 2], StreamEvent::MessageMetadata { .. }));
    assert!(matches!(events[n - 3], StreamEvent::TextEnd { .. }));
    assert_eq!(streamed_text(&events), reply);

    match outcome {
        StreamOutcome::Completed {
            provider,
            metadata,
            fell_back,
            ..
        } => {
            assert_eq!(provider, ProviderIdentity::Gateway);
            assert!(!fell_back);
            assert_eq!(metadata.phase, WorkflowPhase::TopicLocked);
            assert_eq!(metadata.artifacts["topic"], "Coral bleaching");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.fallback.calls(), 0);
    assert_eq!(h.health.health(ProviderIdentity::Gateway).status, HealthStatus::Healthy);
    assert!(h.health.health(ProviderIdentity::Gateway).last_response_time_ms.is_some());
}

#[tokio::test]
async fn test_rate_limit_triggers_fallback_before_terminal_event() {
    let h = harness(
        ScriptedProvider::rejecting(
            ProviderIdentity::Gateway,
            ProviderFailure::http(429, "Rate limit exceeded"),
        ),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "Fallback answer"),
    );

    let (outcome, events) = run(&h, request()).await;

    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 1);
    assert_eq!(
        h.fallback.last_request().map(|r| r.model),
        Some("fallback-model".to_string())
    );
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Start { .. }))
            .count(),
        1
    );
    assert!(matches!(
        outcome,
        StreamOutcome::Completed {
            provider: ProviderIdentity::OpenRouter,
            fell_back: true,
            ..
        }
    ));
    assert_eq!(
        h.health.health(ProviderIdentity::Gateway).consecutive_failures,
        1
    );
}

#[tokio::test]
async fn test_client_error_does_not_fall_back() {
    let h = harness(
        ScriptedProvider::rejecting(
            ProviderIdentity::Gateway,
            ProviderFailure::http(400, "Unsupported parameter"),
        ),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "never"),
    );

    let (outcome, events) = run(&h, request()).await;

    assert_eq!(h.fallback.calls(), 0);
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Error {
            error_text: ErrorKind::ClientError.user_message().to_string()
        })
    );
    assert_eq!(
        outcome,
        StreamOutcome::Failed {
            kind: FailureKind::Provider(ErrorKind::ClientError),
            message: ErrorKind::ClientError.user_message().to_string(),
            partial: false,
        }
    );
}

#[tokio::test]
async fn test_second_failure_is_surfaced_once() {
    let h = harness(
        ScriptedProvider::rejecting(ProviderIdentity::Gateway, ProviderFailure::http(502, "bad gateway")),
        ScriptedProvider::rejecting(ProviderIdentity::OpenRouter, ProviderFailure::timeout("timed out")),
    );

    let (outcome, events) = run(&h, request()).await;

    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 1);
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        outcome,
        StreamOutcome::Failed {
            kind: FailureKind::Provider(ErrorKind::Timeout),
            ..
        }
    ));
}

#[tokio::test]
async fn test_failure_after_partial_content_finishes_without_error() {
    let h = harness(
        ScriptedProvider::new(
            ProviderIdentity::Gateway,
            vec![
                ScriptStep::text("Here is the first half"),
                ScriptStep::Fail(ProviderFailure::network("read ECONNRESET")),
            ],
        ),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "duplicate"),
    );

    let (outcome, events) = run(&h, request()).await;

    assert_eq!(h.fallback.calls(), 0, "no fallback once content was sent");
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Finish {
            finish_reason: "error".to_string()
        })
    );
    assert_eq!(streamed_text(&events), "Here is the first half");
    assert!(matches!(
        outcome,
        StreamOutcome::Failed {
            kind: FailureKind::Provider(ErrorKind::NetworkError),
            partial: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_no_viable_provider_emits_only_error() {
    let h = harness(
        ScriptedProvider::replying(ProviderIdentity::Gateway, "x"),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "y"),
    );
    for identity in ProviderIdentity::ALL {
        for _ in 0..3 {
            h.health.record_failure(identity, "503");
        }
    }

    let (outcome, events) = run(&h, request()).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Error { .. }));
    assert!(matches!(
        outcome,
        StreamOutcome::Failed {
            kind: FailureKind::NoViableProvider,
            ..
        }
    ));
    assert_eq!(h.primary.calls() + h.fallback.calls(), 0);
}

#[tokio::test]
async fn test_abort_stops_without_terminal_event_or_fallback() {
    let h = harness(
        ScriptedProvider::new(
            ProviderIdentity::Gateway,
            vec![ScriptStep::text("Thinking"), ScriptStep::Hang],
        ),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "never"),
    );

    let (writer, mut rx) = StreamWriter::channel(64);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let outcome = h
        .orchestrator
        .stream(request(), &writer, cancel)
        .await
        .unwrap();
    drop(writer);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(outcome, StreamOutcome::Aborted);
    assert_eq!(terminal_count(&events), 0);
    assert_eq!(h.fallback.calls(), 0);
    let record = h.health.health(ProviderIdentity::Gateway);
    assert_eq!(record.consecutive_failures, 0);
    assert!(record.last_response_time_ms.is_none());
}

#[tokio::test]
async fn test_test_mode_does_not_touch_health() {
    let h = harness(
        ScriptedProvider::rejecting(ProviderIdentity::Gateway, ProviderFailure::http(500, "boom")),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "ok"),
    );
    let mut req = request();
    req.test_mode = true;

    let (outcome, _) = run(&h, req).await;

    assert!(matches!(outcome, StreamOutcome::Completed { fell_back: true, .. }));
    assert!(h.health.snapshot().is_empty());
}

#[tokio::test]
async fn test_backwards_marker_keeps_previous_metadata() {
    let reply = "Sure.\n<!--workflow-state:{\"phase\":\"exploring\",\"progress\":0.1,\"artifacts\":{}}-->";
    let h = harness(
        ScriptedProvider::replying(ProviderIdentity::Gateway, reply),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "unused"),
    );
    let mut previous = WorkflowMetadata::initial();
    previous.phase = WorkflowPhase::Researching;
    previous.progress = 0.3;
    let mut req = request();
    req.previous_metadata = Some(previous);

    let (outcome, events) = run(&h, req).await;

    let emitted = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageMetadata { metadata } => Some(metadata.clone()),
            _ => None,
        })
        .expect("metadata event");
    assert_eq!(emitted.phase, WorkflowPhase::Researching);
    assert_eq!(emitted.progress, 0.3);
    assert!(matches!(outcome, StreamOutcome::Completed { metadata, .. } if metadata == emitted));
}

#[tokio::test]
async fn test_reply_without_marker_keeps_previous_metadata() {
    let h = harness(
        ScriptedProvider::replying(ProviderIdentity::Gateway, "No marker here"),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "unused"),
    );
    let mut previous = WorkflowMetadata::initial();
    previous.phase = WorkflowPhase::Drafting;
    previous.progress = 0.62;
    previous.off_topic_count = 1;
    let mut req = request();
    req.previous_metadata = Some(previous.clone());

    let (outcome, _) = run(&h, req).await;

    match outcome {
        StreamOutcome::Completed { metadata, .. } => assert_eq!(metadata, previous),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_requests_share_one_config_load() {
    let store = Arc::new(StaticConfigStore::new(stored_config()).with_delay(Duration::from_millis(50)));
    let cache = Arc::new(ConfigCache::new(store.clone()));
    let registry = llm::scripted_registry("hello");
    let orchestrator = Arc::new(StreamOrchestrator::new(
        cache,
        Arc::new(ProviderSelector::new(Arc::new(ProviderHealthTracker::new()))),
        registry,
    ));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let (writer, _rx) = StreamWriter::channel(64);
                orchestrator
                    .stream(request(), &writer, CancellationToken::new())
                    .await
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, StreamOutcome::Completed { .. }));
    }
    assert_eq!(store.loads(), 1);
}

#[tokio::test]
async fn test_failure_inside_stream_before_content_falls_back() {
    let h = harness(
        ScriptedProvider::new(
            ProviderIdentity::Gateway,
            vec![ScriptStep::Fail(ProviderFailure::http(503, "upstream unavailable"))],
        ),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "Recovered answer"),
    );

    let (outcome, events) = run(&h, request()).await;

    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 1);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Start { .. }))
            .count(),
        1
    );
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Finish {
            finish_reason: "stop".to_string()
        })
    );
    assert_eq!(streamed_text(&events), "Recovered answer");
    assert!(matches!(
        outcome,
        StreamOutcome::Completed {
            provider: ProviderIdentity::OpenRouter,
            fell_back: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_failure_after_source_counts_as_partial() {
    let h = harness(
        ScriptedProvider::new(
            ProviderIdentity::Gateway,
            vec![
                ScriptStep::Chunk(StreamChunk::Source {
                    url: "https://example.org/reef-survey".to_string(),
                    title: Some("Reef survey".to_string()),
                }),
                ScriptStep::Fail(ProviderFailure::http(503, "upstream unavailable")),
            ],
        ),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "duplicate"),
    );

    let (outcome, events) = run(&h, request()).await;

    assert_eq!(h.fallback.calls(), 0);
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Source { .. })));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Finish {
            finish_reason: "error".to_string()
        })
    );
    assert!(matches!(
        outcome,
        StreamOutcome::Failed {
            kind: FailureKind::Provider(ErrorKind::ServerError),
            partial: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_retry_uses_fallback_even_when_unhealthy() {
    let h = harness(
        ScriptedProvider::rejecting(
            ProviderIdentity::Gateway,
            ProviderFailure::http(429, "Rate limit exceeded"),
        ),
        ScriptedProvider::replying(ProviderIdentity::OpenRouter, "Fallback answer"),
    );
    for _ in 0..3 {
        h.health.record_failure(ProviderIdentity::OpenRouter, "503");
    }
    assert_eq!(
        h.health.health(ProviderIdentity::OpenRouter).status,
        HealthStatus::Unhealthy
    );

    let (outcome, events) = run(&h, request()).await;

    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 1);
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        outcome,
        StreamOutcome::Completed {
            provider: ProviderIdentity::OpenRouter,
            fell_back: true,
            ..
        }
    ));
}
