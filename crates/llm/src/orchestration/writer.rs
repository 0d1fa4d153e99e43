//! Outbound event transport for one chat request.
//!
//! A request owns exactly one [`StreamWriter`]. The writer enforces the
//! stream protocol: `start` at most once, at most one terminal event
//! (`finish` or `error`), and never an `error` once content has been
//! forwarded to the client.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use workflow::WorkflowMetadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    Source {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    MessageMetadata {
        metadata: WorkflowMetadata,
    },
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: String,
    },
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. } | StreamEvent::Error { .. })
    }
}

pub type EventReceiver = mpsc::Receiver<StreamEvent>;

#[derive(Debug)]
pub struct StreamWriter {
    tx: mpsc::Sender<StreamEvent>,
    started: AtomicBool,
    content_written: AtomicBool,
    terminated: AtomicBool,
    closed: AtomicBool,
}

impl StreamWriter {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            started: AtomicBool::new(false),
            content_written: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Writer plus the receiving end the transport reads from.
    pub fn channel(capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    async fn emit(&self, event: StreamEvent) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            warn!(?event, "Dropping event written after the terminal event");
            return false;
        }
        self.send(event).await
    }

    async fn send(&self, event: StreamEvent) -> bool {
        if self.tx.send(event).await.is_err() {
            if !self.closed.swap(true, Ordering::SeqCst) {
                debug!("Client transport closed");
            }
            return false;
        }
        true
    }

    /// Emits `start` the first time it is called.
    pub async fn start(&self, message_id: &str) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(StreamEvent::Start {
            message_id: message_id.to_string(),
        })
        .await
    }

    pub async fn text_delta(&self, id: &str, delta: &str) -> bool {
        self.content_written.store(true, Ordering::SeqCst);
        self.emit(StreamEvent::TextDelta {
            id: id.to_string(),
            delta: delta.to_string(),
        })
        .await
    }

    pub async fn text_end(&self, id: &str) -> bool {
        self.emit(StreamEvent::TextEnd { id: id.to_string() }).await
    }

    pub async fn source(&self, url: &str, title: Option<&str>) -> bool {
        self.content_written.store(true, Ordering::SeqCst);
        self.emit(StreamEvent::Source {
            url: url.to_string(),
            title: title.map(str::to_string),
        })
        .await
    }

    pub async fn metadata(&self, metadata: &WorkflowMetadata) -> bool {
        self.emit(StreamEvent::MessageMetadata {
            metadata: metadata.clone(),
        })
        .await
    }

    /// Terminates the stream normally or after a partial failure.
    pub async fn finish(&self, reason: &str) -> bool {
        // Claim the terminal slot before writing so concurrent callers cannot both emit
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send(StreamEvent::Finish {
            finish_reason: reason.to_string(),
        })
        .await
    }

    /// Terminates the stream with an error, unless content was already
    /// forwarded or a terminal event was written. Returns whether the error
    /// was written.
    pub async fn error(&self, message: &str) -> bool {
        if self.content_written.load(Ordering::SeqCst) {
            debug!("Not writing error event after partial content");
            return false;
        }
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send(StreamEvent::Error {
            error_text: message.to_string(),
        })
        .await
    }

    pub fn has_content(&self) -> bool {
        self.content_written.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// True once the client side of the transport has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}
