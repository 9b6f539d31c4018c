use clap::Parser;
use townhall_server::config::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    townhall_server::observability::init_tracing();

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    };

    match Cli::parse().into_command() {
        Command::Relay(config) => {
            townhall_server::run_relay(config.with_file_overrides()?, shutdown).await
        }
        Command::Broker(config) => townhall_server::run_broker(config, shutdown).await,
    }
}
