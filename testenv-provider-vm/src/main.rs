//! testenv-provider-vm: hypervisor-backed provider subprocess.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use testenv_provider_vm::host::{HostTools, SystemTools};
use testenv_provider_vm::VmProvider;
use testenv_proto::provider::ProviderToolHandler;

const DEFAULT_STATE_DIR: &str = ".forge/testenv-vm/state";

/// Hypervisor-backed testenv provider
#[derive(Parser, Debug)]
#[command(name = "testenv-provider-vm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the provider tools on stdin/stdout.
    ServeTools {
        /// State directory (defaults to $TESTENV_VM_STATE_DIR).
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Base image cache to grant the hypervisor read access to
        /// (defaults to $TESTENV_VM_IMAGE_CACHE_DIR).
        #[arg(long)]
        image_cache_dir: Option<PathBuf>,

        /// libvirt connection URI, e.g. qemu:///system.
        #[arg(long)]
        connect: Option<String>,
    },
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[tokio::main]
async fn main() {
    // stdout carries tool responses only.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testenv_provider_vm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli {
        command:
            Command::ServeTools {
                state_dir,
                image_cache_dir,
                connect,
            },
    } = Cli::parse();

    let state_dir = state_dir
        .or_else(|| env_path("TESTENV_VM_STATE_DIR"))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    if let Err(e) = tokio::fs::create_dir_all(&state_dir).await {
        error!(state_dir = %state_dir.display(), error = %e, "cannot create state directory");
        std::process::exit(1);
    }

    let image_cache_dir = image_cache_dir.or_else(|| env_path("TESTENV_VM_IMAGE_CACHE_DIR"));
    if let Some(cache) = &image_cache_dir {
        // Best effort: the hypervisor user needs read access to cached
        // base images.
        if let Err(e) = SystemTools.grant_read_acl(cache).await {
            warn!(dir = %cache.display(), error = %e, "image cache acl grant failed");
        }
    }

    info!(state_dir = %state_dir.display(), "serving hypervisor provider tools on stdio");
    let provider = Arc::new(VmProvider::new(state_dir, connect));
    let handler = ProviderToolHandler::new(provider);
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
