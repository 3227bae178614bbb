//! testenv-provider-mem: in-memory provider subprocess.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use testenv_proto::provider::ProviderToolHandler;
use testenv_provider_mem::MemProvider;

/// In-memory testenv provider
#[derive(Parser, Debug)]
#[command(name = "testenv-provider-mem", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the provider tools on stdin/stdout.
    ServeTools,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testenv_provider_mem=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli {
        command: Command::ServeTools,
    } = Cli::parse();

    info!("serving in-memory provider tools on stdio");
    let handler = ProviderToolHandler::new(Arc::new(MemProvider::new()));
    let result = testenv_proto::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        &handler,
        CancellationToken::new(),
    )
    .await;

    if let Err(e) = result {
        error!(error = %e, "tool channel failed");
        std::process::exit(1);
    }
}
