//! Probe command - load a native module and describe it.

use super::RequestArgs;
use anyhow::{Context, Result};
use arkhost_runtime::HostConfig;
use clap::Args;

#[derive(Args)]
pub struct ProbeCommand {
    #[command(flatten)]
    pub target: RequestArgs,

    /// Also look for embedded bytecode
    #[arg(long)]
    pub ark: bool,
}

impl ProbeCommand {
    pub fn run(&self, config: &HostConfig) -> Result<()> {
        let manager = self.target.manager(config)?;
        let mut request = self.target.request();
        if self.ark {
            request = request.ark();
        }

        let module = manager
            .resolve(&request)
            .with_context(|| format!("Failed to load native module '{}'", self.target.name))?;

        println!("name:      {}", module.name());
        println!("version:   {}", module.version());
        match module.file_path() {
            Some(path) => println!("file:      {}", path.display()),
            None => println!("file:      (built in)"),
        }
        println!("register:  {}", module.register_callback().is_some());
        match module.code() {
            Some(code) => println!("bytecode:  {} bytes", code.len()),
            None => println!("bytecode:  none"),
        }

        let others: Vec<_> = manager
            .registered_names()
            .into_iter()
            .filter(|name| !name.eq_ignore_ascii_case(module.name()))
            .collect();
        if !others.is_empty() {
            println!("also registered: {}", others.join(", "));
        }
        Ok(())
    }
}
