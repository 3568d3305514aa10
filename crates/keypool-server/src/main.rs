#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CleanupConfig, Cli, Command, GenerateConfig, SidecarConfig};
use server::telemetry::init_telemetry;
use server::{jobs, sidecar};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Validate before installing telemetry so a bad option fails fast.
    let command = match cli.command {
        Command::Sidecar(args) => Validated::Sidecar(SidecarConfig::try_from(args)?),
        Command::Generate(args) => Validated::Generate(GenerateConfig::try_from(args)?),
        Command::Cleanup(args) => Validated::Cleanup(CleanupConfig::try_from(args)?),
    };

    let providers = init_telemetry()?;

    let result = match command {
        Validated::Sidecar(config) => sidecar::run(config).await,
        Validated::Generate(config) => jobs::generate(config).await.map(|_| ()),
        Validated::Cleanup(config) => jobs::cleanup(config).await.map(|_| ()),
    };

    if let Err(_e) = &result {
        #[cfg(feature = "tracing")]
        tracing::error!("{_e:#}");
    }

    providers.shutdown();
    result
}

enum Validated {
    Sidecar(SidecarConfig),
    Generate(GenerateConfig),
    Cleanup(CleanupConfig),
}
