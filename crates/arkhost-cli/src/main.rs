mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{paths::PathsCommand, probe::ProbeCommand};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "arkhost", version, about = "Native module host tools")]
struct Cli {
    /// Configuration file (default: arkhost.toml in this or a parent directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the library paths a module name maps to
    Paths(PathsCommand),
    /// Load a native module and report what it registered
    Probe(ProbeCommand),
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Paths(cmd) => cmd.run(&config)?,
        Commands::Probe(cmd) => cmd.run(&config)?,
        Commands::Config => print!("{}", config.to_toml_string()?),
    }

    Ok(())
}
