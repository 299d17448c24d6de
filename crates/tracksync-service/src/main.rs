//! tracksync service - telemetry sync engine and HTTP API.
//!
//! Run with: `cargo run -p tracksync-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tracksync_service::icons::ICONS_ROUTE;
use tracksync_service::{AppState, Config, Ingestor, MockFleet, api, mock};
use tracksync_store::Store;

/// tracksync service - telemetry sync engine and HTTP REST API.
#[derive(Parser, Debug)]
#[command(name = "tracksync-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long, global = true)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Telemetry source URL (overrides config).
    #[arg(long, global = true)]
    telemetry_url: Option<String>,

    /// Disable background ingestion (API only mode).
    #[arg(long, global = true)]
    no_ingest: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground (default behavior).
    Run {
        /// Also serve the mock telemetry source and ingest from it.
        #[arg(long)]
        mock: bool,
    },

    /// Serve only the mock telemetry source.
    Mock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracksync_service=info".parse()?)
                .add_directive("tracksync_store=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::Mock) => run_mock(config).await,
        Some(Command::Run { mock }) => run_server(config, args.no_ingest, mock).await,
        None => run_server(config, args.no_ingest, false).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    // Override config with CLI args
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }
    if let Some(url) = &args.telemetry_url {
        config.telemetry.url = url.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Seed the mock fleet and serve it, with mutation rounds in the background.
///
/// Returns the stop sender for the mutation task.
async fn start_mock(config: &Config) -> anyhow::Result<watch::Sender<bool>> {
    let fleet = Arc::new(MockFleet::seed(&config.mock, &config.telemetry).await?);
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(mock::run_mutations(
        Arc::clone(&fleet),
        config.mock.clone(),
        stop_rx,
    ));

    let addr: SocketAddr = config.mock.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Mock telemetry source on http://{}{}", addr, mock::DEVICES_PATH);

    let app = mock::router(fleet).layer(TraceLayer::new_for_http());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Mock telemetry server stopped: {}", e);
        }
    });

    Ok(stop_tx)
}

async fn run_mock(config: Config) -> anyhow::Result<()> {
    let stop_tx = start_mock(&config).await?;
    tokio::signal::ctrl_c().await?;
    let _ = stop_tx.send(true);
    info!("Shutting down mock telemetry source");
    Ok(())
}

async fn run_server(mut config: Config, no_ingest: bool, with_mock: bool) -> anyhow::Result<()> {
    let _mock_stop = if with_mock {
        let stop_tx = start_mock(&config).await?;
        config.telemetry.url = format!("http://{}{}", config.mock.bind, mock::DEVICES_PATH);
        config.telemetry.api_key.clear();
        Some(stop_tx)
    } else {
        None
    };

    // Open the database; failing here is fatal
    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)?;
    store.set_busy_timeout(config.storage.op_timeout())?;

    let icons_dir = config.server.icons_dir.clone();
    let addr: SocketAddr = config.server.bind.parse()?;
    let ingest_enabled = config.ingest.enabled && !no_ingest;

    info!("Ingesting from {}", config.telemetry.endpoint());
    let state = AppState::new(store, config)?;

    if ingest_enabled {
        Ingestor::new(Arc::clone(&state)).start().await;
    } else {
        info!("Background ingestion disabled");
    }

    // Build the router
    let app = Router::new()
        .merge(api::router())
        .nest_service(ICONS_ROUTE, ServeDir::new(icons_dir))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
