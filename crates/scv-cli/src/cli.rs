use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "scv",
    about = "SCV: stream work-distribution server for volunteer compute",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load the stream records and serve the HTTP API until interrupted
    Serve {
        /// Server configuration (TOML)
        #[arg(long, env = "SCV_CONFIG", default_value = "scv.toml")]
        config: String,

        /// Bind address (host:port); overrides `bind` from the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Validate a configuration file and print the resolved settings
    CheckConfig {
        /// Server configuration (TOML)
        #[arg(long, env = "SCV_CONFIG", default_value = "scv.toml")]
        config: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
