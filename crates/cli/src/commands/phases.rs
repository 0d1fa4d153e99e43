use anyhow::Result;
use clap::Args;
use workflow::WorkflowPhase;

#[derive(Debug, Args)]
pub struct PhasesCommand {
    /// Print the registry as JSON
    #[arg(long)]
    json: bool,
}

impl PhasesCommand {
    pub fn execute(self) -> Result<()> {
        if self.json {
            let rows: Vec<serde_json::Value> = WorkflowPhase::all()
                .map(|phase| {
                    serde_json::json!({
                        "phase": phase,
                        "label": phase.label(),
                        "description": phase.description(),
                        "progress": phase.canonical_progress(),
                        "requiresOutline": phase.requires_outline(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        for phase in WorkflowPhase::all() {
            println!(
                "{:>2}. {:<17} {:>4.0}%  {}",
                phase.index() + 1,
                phase.as_str(),
                phase.canonical_progress() * 100.0,
                phase.label()
            );
        }
        Ok(())
    }
}
