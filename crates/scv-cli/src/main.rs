//! SCV CLI: the `scv` command.

mod cli;
mod commands;
mod config;
mod logging;

use clap::Parser;
use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => commands::serve::run(config, bind),

        Commands::CheckConfig { config, json } => commands::check_config::run(config, json),
    }
}
