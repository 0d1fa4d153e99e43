use anyhow::Result;
use clap::Args;
use llm::CohortAssigner;

#[derive(Debug, Args)]
pub struct CohortCommand {
    user_id: String,
}

impl CohortCommand {
    pub fn execute(self) -> Result<()> {
        let assignment = CohortAssigner::new().assign(&self.user_id);
        println!("{}", serde_json::to_string_pretty(&assignment)?);
        Ok(())
    }
}
