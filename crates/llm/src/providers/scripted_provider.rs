use super::{ChunkReceiver, GenerationRequest, LlmProvider, ProviderIdentity, StreamChunk};
use crate::retry::ProviderFailure;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One step of a scripted stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(StreamChunk),
    Fail(ProviderFailure),
    Delay(Duration),
    /// Blocks until the request is cancelled
    Hang,
}

impl ScriptStep {
    pub fn text(text: &str) -> Self {
        ScriptStep::Chunk(StreamChunk::text(text))
    }

    pub fn finish() -> Self {
        ScriptStep::Chunk(StreamChunk::Finished {
            reason: "stop".to_string(),
        })
    }
}

/// Provider that replays a fixed script on every call.
///
/// Used by the orchestrator tests and by the CLI `--test-mode`.
#[derive(Debug)]
pub struct ScriptedProvider {
    identity: ProviderIdentity,
    script: Vec<ScriptStep>,
    reject_with: Option<ProviderFailure>,
    calls: AtomicUsize,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl ScriptedProvider {
    pub fn new(identity: ProviderIdentity, script: Vec<ScriptStep>) -> Self {
        Self {
            identity,
            script,
            reject_with: None,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Streams `text` word by word and finishes normally.
    pub fn replying(identity: ProviderIdentity, text: &str) -> Self {
        let mut script: Vec<ScriptStep> = text
            .split_inclusive(' ')
            .map(ScriptStep::text)
            .collect();
        script.push(ScriptStep::finish());
        Self::new(identity, script)
    }

    /// Refuses every call before any chunk is produced.
    pub fn rejecting(identity: ProviderIdentity, failure: ProviderFailure) -> Self {
        Self {
            reject_with: Some(failure),
            ..Self::new(identity, Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn identity(&self) -> ProviderIdentity {
        self.identity
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request);

        if let Some(failure) = &self.reject_with {
            return Err(failure.clone());
        }

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let script = self.script.clone();
        let identity = self.identity;

        tokio::spawn(async move {
            for step in script {
                let item = match step {
                    ScriptStep::Chunk(chunk) => Ok(chunk),
                    ScriptStep::Fail(failure) => Err(failure),
                    ScriptStep::Delay(delay) => {
                        let cancelled = tokio::select! {
                            _ = cancel.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            break;
                        }
                        continue;
                    }
                    ScriptStep::Hang => {
                        cancel.cancelled().await;
                        break;
                    }
                };
                if cancel.is_cancelled() || tx.send(item).await.is_err() {
                    break;
                }
            }
            debug!(provider = %identity, "Scripted stream finished");
        });

        Ok(rx)
    }
}
