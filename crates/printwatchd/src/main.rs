//! printwatchd: spawns one monitor per configured printer, mirrors
//! every event into the relay database, and routes alerts.

mod cli;
mod daemon;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Check => check(cli.config.as_deref()),
        Command::Run => daemon::run_daemon(cli.config.as_deref()).await,
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn,printwatchd=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

fn check(path: Option<&std::path::Path>) -> Result<(), daemon::DaemonError> {
    let config = printwatch_config::load(path)?;
    println!(
        "configuration OK: {} printer(s), database {}",
        config.printers.len(),
        config.database_path().display(),
    );
    Ok(())
}
