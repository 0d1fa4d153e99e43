//! Escalation policy for consecutive off-topic turns.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    None,
    Reminder,
    HardRedirect,
}

/// Thresholds on `offTopicCount`. Classification of a turn happens upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffTopicPolicy {
    pub reminder_at: u32,
    pub redirect_at: u32,
}

impl Default for OffTopicPolicy {
    fn default() -> Self {
        Self {
            reminder_at: 2,
            redirect_at: 3,
        }
    }
}

const REMINDER: &str = "The last few messages drifted away from the paper. \
Answer briefly, then gently steer the conversation back to the current writing task.";

const HARD_REDIRECT: &str = "The conversation has repeatedly left the academic task. \
Do not engage with the off-topic request. Ask the user to choose exactly one of two options: \
continue working on the paper, or end the session.";

impl OffTopicPolicy {
    /// Next counter value: consecutive off-topic turns, reset by an on-topic one.
    pub fn record_turn(&self, count: u32, is_off_topic: bool) -> u32 {
        if is_off_topic {
            count.saturating_add(1)
        } else {
            0
        }
    }

    pub fn escalation(&self, count: u32) -> Escalation {
        if count >= self.redirect_at {
            Escalation::HardRedirect
        } else if count >= self.reminder_at {
            Escalation::Reminder
        } else {
            Escalation::None
        }
    }

    /// Instruction to inject into the next prompt context, if any.
    pub fn guidance(&self, count: u32) -> Option<&'static str> {
        match self.escalation(count) {
            Escalation::None => None,
            Escalation::Reminder => Some(REMINDER),
            Escalation::HardRedirect => Some(HARD_REDIRECT),
        }
    }
}
