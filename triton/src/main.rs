// Austin Shafer - 2024
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use triton::{Config, Runtime};

#[derive(Parser)]
#[command(name = "triton", about = "Runs a self-wrapped guest ELF image")]
struct Cli {
    /// Path to a triton.toml config file. Defaults to built-in defaults
    /// plus any TRITON_* environment overrides.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Loads, relocates and starts the given guest image.
    Run {
        /// Path to the guest's self-wrapped ELF64 image.
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { path } => run(config, &path),
    }
}

fn run(config: Config, path: &std::path::Path) -> Result<()> {
    utils::log::info!("loading {}", path.display());

    let mut runtime = Runtime::new(config);
    runtime.load_program(path)?;
    runtime.relocate_all()?;
    runtime.start_all_modules()?;

    utils::log::info!("guest started, running until stopped");

    runtime.stop_all_modules();
    Ok(())
}
