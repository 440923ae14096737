//! Lattice CLI - networked multi-sheet spreadsheet service.

use clap::Parser;
use lattice_server::ServerConfig;

#[derive(Parser)]
#[command(name = "lattice")]
#[command(about = "Networked multi-sheet spreadsheet service")]
#[command(version)]
struct Cli {
    /// Path to the redb database file
    #[arg(long, env = "DATABASE_FILEPATH")]
    database_filepath: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Base URL this instance is externally reachable at, handed to peer
    /// services as the external-ref callback origin
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "lattice server exited with an error");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db = lattice_core::store::open(&cli.database_filepath)?;
    let repository = lattice_core::SheetRepository::new(std::sync::Arc::new(db));

    let base_url = cli
        .base_url
        .unwrap_or_else(|| format!("http://{}:{}", cli.host, cli.port));

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        base_url,
    };

    lattice_server::serve(repository, config).await
}
