pub mod structured_logging;
pub mod validation;

pub use structured_logging::{
    init_structured_logging, ExecutionContext, JsonFormatter, LoggingConfig, OperationTimer,
    RequestContext, StructuredLogEntry,
};

pub use validation::{
    require_non_blank, validate_turns, ValidationError, ValidationResult, MAX_TURNS,
    MAX_TURN_LENGTH,
};
