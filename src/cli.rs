use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "trailgate")]
#[command(version)]
#[command(about = "Chart-alert driven futures entries with trigger-armed trailing stops", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and environment overrides
    #[arg(short, long, global = true, default_value = "config", env = "TRAILGATE_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server, quote streams and supervisors
    Serve,
    /// Load and validate configuration, then exit
    CheckConfig,
    /// Resolve a chart ticker to the broker contract id
    Resolve {
        /// Chart ticker, e.g. NQ1! or MNQZ5
        ticker: String,
    },
}
