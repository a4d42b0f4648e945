use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use terminal_relay::cli::{Cli, Commands};
use terminal_relay::config::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if let Some(Commands::Join { url, code }) = cli.command {
        return terminal_relay::cli::run_join_client(url, code).await;
    }

    let config = Config::from_env();
    info!(
        port = config.port,
        code_expiry_ms = config.session_code_expiry.as_millis() as u64,
        "starting terminal relay"
    );
    terminal_relay::run(config).await
}
