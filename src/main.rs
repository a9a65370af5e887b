//! VectoriaDB server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start the server with data under ./data
//! vectoriadb serve --base-path ./data --port 9090
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vectoriadb::api::create_router;
use vectoriadb::config::Config;
use vectoriadb::memory;
use vectoriadb::IndexManager;

#[derive(Parser)]
#[command(name = "vectoriadb")]
#[command(about = "A disk-backed vector database node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Root of the indexes/, logs/ and config/ directories
        #[arg(long, default_value = ".")]
        base_path: PathBuf,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(short, long, default_value = "9090")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            base_path,
            host,
            port,
        } => {
            let config = Config::load(&base_path)?;

            let available_ram = memory::fetch_available_ram()?;
            let budgets = memory::compute_budgets(available_ram, &config);

            let manager = IndexManager::new(config, budgets)?;
            let router = create_router(manager.clone());

            let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("Listening on {}", addr);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            manager.shutdown().await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
