//! Input validation for inbound chat requests.
//!
//! Everything here runs before a provider is contacted, so a rejected request
//! never opens a stream.

use thiserror::Error;

/// Upper bound on a single turn, in characters.
pub const MAX_TURN_LENGTH: usize = 100_000;

/// Upper bound on the number of turns forwarded to a provider.
pub const MAX_TURNS: usize = 500;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("conversation must contain at least one turn")]
    EmptyConversation,

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("turn {index} exceeds {max} characters")]
    TurnTooLong { index: usize, max: usize },

    #[error("conversation has {count} turns, limit is {max}")]
    TooManyTurns { count: usize, max: usize },

    #[error("unknown role '{0}'")]
    UnknownRole(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Checks the shape of a conversation given as `(role, text)` pairs.
pub fn validate_turns<'a, I>(turns: I) -> ValidationResult<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut count = 0usize;
    for (index, (role, text)) in turns.into_iter().enumerate() {
        if !matches!(role, "system" | "user" | "assistant") {
            return Err(ValidationError::UnknownRole(role.to_string()));
        }
        if text.chars().count() > MAX_TURN_LENGTH {
            return Err(ValidationError::TurnTooLong {
                index,
                max: MAX_TURN_LENGTH,
            });
        }
        count += 1;
    }

    if count == 0 {
        return Err(ValidationError::EmptyConversation);
    }
    if count > MAX_TURNS {
        return Err(ValidationError::TooManyTurns {
            count,
            max: MAX_TURNS,
        });
    }
    Ok(())
}

/// Rejects blank identifiers such as conversation ids.
pub fn require_non_blank(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field.to_string()));
    }
    Ok(())
}
