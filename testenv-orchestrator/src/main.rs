//! testenv-vm: ephemeral test environment orchestrator.
//!
//! The host test-runner launches this binary with `serve-tools` and
//! speaks newline-delimited JSON on stdin/stdout. All diagnostics go to
//! stderr; stdout carries nothing but tool responses.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use testenv_orchestrator::{Config, Orchestrator, OrchestratorHandler, ProviderConfig};

/// Ephemeral test environment orchestrator
#[derive(Parser, Debug)]
#[command(name = "testenv-vm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the create/delete tools on stdin/stdout.
    ServeTools {
        /// State directory (defaults to $TESTENV_VM_STATE_DIR).
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Provider subprocess as name=command. Repeatable; defaults to
        /// vm=testenv-provider-vm.
        #[arg(long = "provider")]
        providers: Vec<String>,

        /// Roll back ready resources when a create fails.
        #[arg(long)]
        cleanup_on_failure: Option<bool>,

        /// Maximum concurrent requests per provider within a phase.
        #[arg(long)]
        max_parallel: Option<usize>,
    },
}

fn parse_provider(raw: &str) -> Result<ProviderConfig, String> {
    match raw.split_once('=') {
        Some((name, command)) if !name.is_empty() && !command.is_empty() => {
            Ok(ProviderConfig::new(name, command))
        }
        _ => Err(format!("invalid provider {raw:?}, expected name=command")),
    }
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout belongs to the tool channel.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testenv=info,testenv_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::ServeTools {
            state_dir,
            providers,
            cleanup_on_failure,
            max_parallel,
        } => {
            let mut config = Config::from_env();
            if let Some(dir) = state_dir {
                config.state_dir = dir;
            }
            if let Some(cleanup) = cleanup_on_failure {
                config.cleanup_on_failure = cleanup;
            }
            config.per_provider_limit = max_parallel.or(config.per_provider_limit);

            for raw in &providers {
                match parse_provider(raw) {
                    Ok(provider) => config.providers.push(provider),
                    Err(e) => {
                        // Usage error.
                        eprintln!("testenv-vm: {e}");
                        std::process::exit(2);
                    }
                }
            }
            if config.providers.is_empty() {
                config
                    .providers
                    .push(ProviderConfig::new("vm", "testenv-provider-vm"));
            }

            info!(state_dir = %config.state_dir.display(), "serving tools on stdio");
            let orchestrator = Arc::new(Orchestrator::new(config));
            let handler = OrchestratorHandler::new(orchestrator);
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
    }
}
