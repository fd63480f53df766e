//! Paths command - show where a module would be loaded from.

use super::RequestArgs;
use anyhow::Result;
use arkhost_runtime::HostConfig;
use clap::Args;

#[derive(Args)]
pub struct PathsCommand {
    #[command(flatten)]
    pub target: RequestArgs,
}

impl PathsCommand {
    pub fn run(&self, config: &HostConfig) -> Result<()> {
        let manager = self.target.manager(config)?;
        let candidates = manager.candidate_paths(&self.target.request())?;
        for path in candidates.iter() {
            let marker = if path.exists() { "found" } else { "missing" };
            println!("{}\t{marker}", path.display());
        }
        Ok(())
    }
}
