use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use workflow::WorkflowMetadata;

use crate::services;

#[derive(Debug, Args)]
pub struct ExtractCommand {
    /// File holding the raw assistant reply
    file: PathBuf,

    /// Workflow metadata (JSON) persisted after the previous turn
    #[arg(long)]
    previous: Option<PathBuf>,
}

impl ExtractCommand {
    pub fn execute(self) -> Result<()> {
        let raw = std::fs::read_to_string(&self.file)
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let previous = self
            .previous
            .as_ref()
            .map(services::read_json::<WorkflowMetadata>)
            .transpose()?;

        let merged = workflow::extract(&raw, previous.as_ref());
        println!("{}", serde_json::to_string_pretty(&merged)?);
        Ok(())
    }
}
