use anyhow::Result;
use clap::Parser;
use ensemble_core::{api::ApiServer, config::Config, container::Container};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ensemble-core", about = "Multi-agent coordination server")]
struct Cli {
    /// Listen port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Sqlite database path (overrides DATABASE_PATH, implies --no-mocks)
    #[arg(long)]
    database: Option<String>,
    /// Force the in-memory state store
    #[arg(long)]
    use_mocks: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(database) = cli.database {
        config.storage.database_path = database;
        config.storage.use_mocks = false;
    }
    if cli.use_mocks {
        config.storage.use_mocks = true;
    }

    info!("starting ensemble-core coordination server");
    let container = Container::init(config).await?;
    let api_server = ApiServer::new(container.clone());

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("server failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    container.shutdown().await;
    Ok(())
}
