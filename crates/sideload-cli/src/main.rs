//! Sideload CLI - run and inspect module archives

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command_async(cli))
}

async fn run_command_async(cli: Cli) -> anyhow::Result<()> {
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            dir,
            poll_ms,
            no_watch,
        } => {
            commands::run::run(config, dir, poll_ms, !no_watch).await?;
        }

        Commands::Inspect { archive, json } => {
            commands::inspect::run(&archive, json)?;
        }

        Commands::InitConfig { output, force } => {
            commands::init_config::run(&output, force)?;
        }
    }

    Ok(())
}
