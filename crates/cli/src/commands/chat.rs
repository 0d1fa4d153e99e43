use anyhow::{anyhow, Result};
use clap::Args;
use common::RequestContext;
use llm::{
    ChatMessage, ChatRequest, OrchestratorSettings, ProviderHealthTracker, ProviderSelector,
    SelectionOptions, StrategyKind, StreamOrchestrator, StreamOutcome, StreamWriter,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use workflow::WorkflowMetadata;

use crate::services;

const TEST_MODE_REPLY: &str = "Thanks, let's keep exploring possible topics for your paper.";

#[derive(Debug, Args)]
pub struct ChatCommand {
    /// Conversation turns, alternating user and assistant, starting with user
    #[arg(required = true, num_args = 1..)]
    messages: Vec<String>,

    /// Workflow metadata (JSON) persisted after the previous turn
    #[arg(long)]
    previous: Option<PathBuf>,

    /// Use offline scripted providers and skip health reporting
    #[arg(long)]
    test_mode: bool,

    /// Reply the scripted providers give in test mode
    #[arg(long, requires = "test_mode")]
    reply: Option<String>,

    /// Provider selection strategy
    #[arg(long, default_value = "primary-first")]
    strategy: StrategyKind,

    /// Stable user id for prompt-variant cohorts
    #[arg(long)]
    user_id: Option<String>,

    #[arg(long)]
    conversation_id: Option<String>,

    /// Print provider health to stderr after the reply
    #[arg(long)]
    health: bool,
}

impl ChatCommand {
    fn conversation(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .enumerate()
            .map(|(index, text)| {
                if index % 2 == 0 {
                    ChatMessage::user(text)
                } else {
                    ChatMessage::assistant(text)
                }
            })
            .collect()
    }

    pub async fn execute(self, config_path: Option<PathBuf>) -> Result<()> {
        let previous_metadata = self
            .previous
            .as_ref()
            .map(services::read_json::<WorkflowMetadata>)
            .transpose()?;

        let registry = if self.test_mode {
            llm::scripted_registry(self.reply.as_deref().unwrap_or(TEST_MODE_REPLY))
        } else {
            llm::registry_from_env()?
        };

        let tracker = Arc::new(ProviderHealthTracker::new());
        let orchestrator = StreamOrchestrator::new(
            services::config_cache(config_path.as_deref()),
            Arc::new(ProviderSelector::new(tracker.clone())),
            registry,
        )
        .with_settings(OrchestratorSettings {
            selection: SelectionOptions {
                strategy: self.strategy,
                ..SelectionOptions::default()
            },
            prompt_variants: services::prompt_variants(config_path.as_deref())?,
            ..OrchestratorSettings::default()
        });

        let request = ChatRequest {
            conversation_id: self
                .conversation_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            messages: self.conversation(),
            test_mode: self.test_mode,
            previous_metadata,
            user_id: self.user_id.clone(),
        };

        let mut context = RequestContext::new().with_conversation(request.conversation_id.clone());
        if let Some(user) = &request.user_id {
            context = context.with_user(user.clone());
        }

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling the reply");
                interrupt.cancel();
            }
        });

        let (writer, mut events) = StreamWriter::channel(64);
        let printer = tokio::spawn(async move {
            let stdout = std::io::stdout();
            while let Some(event) = events.recv().await {
                let line = serde_json::to_string(&event)?;
                let mut out = stdout.lock();
                writeln!(out, "{line}")?;
                out.flush()?;
            }
            anyhow::Ok(())
        });

        let outcome = orchestrator
            .stream(request, &writer, cancel)
            .instrument(context.span())
            .await;
        drop(writer);
        printer.await??;

        if self.health {
            let snapshot = tracker.snapshot();
            eprintln!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        match outcome? {
            StreamOutcome::Completed {
                provider,
                fell_back,
                ..
            } => {
                info!(provider = %provider, fell_back, "Reply completed");
                Ok(())
            }
            StreamOutcome::Aborted => {
                info!("Reply aborted");
                Ok(())
            }
            StreamOutcome::Failed { kind, message, .. } => {
                Err(anyhow!("reply failed ({kind:?}): {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use llm::MessageRole;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        chat: ChatCommand,
    }

    #[test]
    fn test_turns_alternate_starting_with_user() {
        let harness = Harness::parse_from(["chat", "Hi", "Hello!", "Help me pick a topic"]);
        let roles: Vec<MessageRole> = harness
            .chat
            .conversation()
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Assistant, MessageRole::User]
        );
    }

    #[test]
    fn test_strategy_parsed_from_flag() {
        let harness = Harness::parse_from(["chat", "--strategy", "health-based", "Hi"]);
        assert_eq!(harness.chat.strategy, StrategyKind::HealthBased);
    }

    #[test]
    fn test_reply_requires_test_mode() {
        assert!(Harness::try_parse_from(["chat", "--reply", "x", "Hi"]).is_err());
    }
}
