//! Mock Data Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use mock_data_server::{server, Catalog, MockServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-data-server",
    about = "Mock HTTP server - templated responses matched by request path",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Address to listen on (overrides the configuration file)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Directory of mock definitions (overrides the configuration file)
    #[arg(short, long, value_name = "DIR")]
    mock_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Load the mock catalog and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        print!("{}", MockServerConfig::default().to_yaml()?);
        return Ok(());
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockServerConfig::from_file(&args.config)?
    } else {
        info!("Using default configuration");
        MockServerConfig::default()
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(mock_dir) = args.mock_dir {
        config.mock_dir = mock_dir;
    }
    config.validate()?;

    // The catalog is complete before the listener binds
    let catalog = Catalog::load(&config.mock_dir)
        .with_context(|| format!("Failed to load mock definitions from {:?}", config.mock_dir))?;

    if args.validate {
        println!(
            "Mock catalog is valid ({} definitions loaded)",
            catalog.len()
        );
        return Ok(());
    }

    server::serve(&config, catalog).await?;

    Ok(())
}
