use clap::Parser;
use libdfork::DforkError;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::Cli;

/// Process exit status for a failed command: the positive errno when the
/// failure came from the library, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<DforkError>()
        .map(|e| -e.errno())
        .filter(|code| *code > 0)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = commands::run(cli).await {
        eprintln!("dfork: {err:#}");
        std::process::exit(exit_code(&err));
    }
}
