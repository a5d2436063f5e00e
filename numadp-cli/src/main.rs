//! ## numadp-cli
//! **Operator interface for the NUMA pool system**
//!
//! `probe` reports the detected topology; `run` brings the pool system up,
//! carves blocks per configuration and drives bound workers against it.

use clap::Parser;

mod commands;

use commands::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Probe(args) => commands::probe(args),
        Commands::Run(args) => commands::run(args),
    }
}
