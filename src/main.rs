//! Silovault server binary.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use silovault::bucket::BucketCache;
use silovault::metadata::store::MetadataStore;
use silovault::storage::BlobStore;
use silovault::AppState;

/// Command-line arguments for the silovault server.
#[derive(Parser, Debug)]
#[command(
    name = "silovault",
    version,
    about = "Reverse-proxy-fronted object store"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "silovault.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = silovault::config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    if config.observability.metrics {
        silovault::metrics::init_metrics();
        silovault::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Schema-init failures are fatal here; runtime store errors never are.
    let store = if config.server.debug_mode {
        let store = MetadataStore::open_in_memory()?;
        store.init_schema()?;
        store.seed_debug_fixture()?;
        info!("Debug mode: in-memory metadata store with fixture bucket seeded");
        store
    } else {
        let store = MetadataStore::open(&config.metadata.path)?;
        store.init_schema()?;
        info!("Metadata store initialized at {}", config.metadata.path);
        store
    };

    let blobs = BlobStore::new(&config.storage.data_directory)?;
    info!("Blob store rooted at {}", config.storage.data_directory);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    let state = Arc::new(AppState {
        config,
        store,
        blobs,
        buckets: BucketCache::new(),
    });
    let app = silovault::server::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening for requests on {bind_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Resolve when the process receives SIGINT.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install shutdown signal handler: {err}");
        return;
    }
    info!("Shutdown signal received, draining connections");
}
