//! ADSIM: real-time ad auction marketplace simulator
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the configured store, seeds demo data when the store is empty,
//! and serves the HTTP API until Ctrl+C.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::info;

use adsim::api::{self, ApiState};
use adsim::config::{self, StorageBackend};
use adsim::engine::orchestrator::AuctionEngine;
use adsim::metrics::MetricsAggregator;
use adsim::seed;
use adsim::storage::memory::MemoryStore;
use adsim::storage::sqlite::SqliteStore;
use adsim::storage::AuctionStore;

const BANNER: &str = r#"
    _    ____  ____ ___ __  __
   / \  |  _ \/ ___|_ _|  \/  |
  / _ \ | | | \___ \| || |\/| |
 / ___ \| |_| |___) | || |  | |
/_/   \_\____/|____/___|_|  |_|

  Real-time ad auction marketplace simulator
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        marketplace = %cfg.marketplace.name,
        backend = ?cfg.storage.backend,
        utc_offset_minutes = cfg.reporting.utc_offset_minutes,
        "ADSIM starting up"
    );

    // -- Storage -----------------------------------------------------------

    let store: Arc<dyn AuctionStore> = match cfg.storage.backend {
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::connect(&cfg.storage.database_url, cfg.storage.max_connections)
                .await
                .with_context(|| format!("Failed to open {}", cfg.storage.database_url))?,
        ),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let engine = AuctionEngine::new(store.clone());
    let metrics = MetricsAggregator::new(
        store,
        cfg.reporting.utc_offset()?,
        cfg.reporting.max_window_days,
    );

    // -- Demo data ---------------------------------------------------------

    if cfg.seed.enabled {
        let mut rng = match cfg.seed.rng_seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        seed::seed(&engine, &cfg.seed, &mut rng, Utc::now()).await?;
    }

    // -- Serve -------------------------------------------------------------

    if !cfg.api.enabled {
        info!("API disabled, nothing left to do");
        return Ok(());
    }

    let port = cfg.api.port;
    let state = Arc::new(ApiState::new(engine, metrics, cfg));
    info!("Serving. Press Ctrl+C to stop.");
    api::serve(state, port, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received.");
    })
    .await?;

    info!("ADSIM shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("adsim=info"));

    let json_logging = std::env::var("ADSIM_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
