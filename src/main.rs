use clap::Parser;
use tracing_subscriber::EnvFilter;

use rjob::cli::{self, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Cli::parse();
    if let Err(err) = cli::execute(args).await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
