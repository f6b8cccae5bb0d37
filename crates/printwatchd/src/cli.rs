use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "printwatchd", version, about = "3D printer fleet monitor daemon")]
pub struct Cli {
    /// Config file path (default: platform config directory).
    #[arg(short, long, global = true, env = "PRINTWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the monitor daemon (the default).
    Run,
    /// Validate the configuration and exit.
    Check,
}
