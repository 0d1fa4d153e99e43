pub mod chat;
pub mod cohort;
pub mod config;
pub mod extract;
pub mod phases;

pub use chat::ChatCommand;
pub use cohort::CohortCommand;
pub use config::ConfigCommand;
pub use extract::ExtractCommand;
pub use phases::PhasesCommand;
