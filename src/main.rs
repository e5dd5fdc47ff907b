mod agent;
mod config;
mod context;
mod engine;
mod fitness;
mod manager;
mod model;
mod output;
mod policy;
mod pool;
mod search;
mod stats;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the configured fine schedule.
    Simulate,

    /// Search for the fine schedule with the highest expected welfare.
    Optimize,

    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Simulate => mgr.simulate()?,
        Command::Optimize => mgr.optimize()?,
        Command::Clean => mgr.clean()?,
    }

    Ok(())
}
