//! DUALSTAKE: double-stake peer-to-peer trade settlement engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the engine from its last snapshot (or starts fresh), serves
//! the HTTP API and snapshots the engine periodically until shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use dualstake::api;
use dualstake::config;
use dualstake::engine::timeout::SystemClock;
use dualstake::engine::TradeEngine;
use dualstake::storage;

const BANNER: &str = r#"
 ____  _   _    _    _     ____ _____  _    _  _______
|  _ \| | | |  / \  | |   / ___|_   _|/ \  | |/ / ____|
| | | | | | | / _ \ | |   \___ \ | | / _ \ | ' /|  _|
| |_| | |_| |/ ___ \| |___ ___) || |/ ___ \| . \| |___
|____/ \___//_/   \_\_____|____/ |_/_/   \_\_|\_\_____|

  Double-Stake Peer-to-Peer Trade Settlement
  v0.1.0
"#;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("DUALSTAKE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = config::AppConfig::load_or_default(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        config = %config_path,
        activation_window_secs = cfg.engine.activation_window_secs,
        refund_access = ?cfg.engine.refund_access,
        snapshot_path = %cfg.storage.snapshot_path,
        "DUALSTAKE starting up"
    );

    // -- Restore or create the engine -------------------------------------

    let snapshot_path = cfg.storage.snapshot_path.as_str();
    let clock = Arc::new(SystemClock);
    let engine = match storage::load_snapshot(Some(snapshot_path))? {
        Some(snapshot) => TradeEngine::restore(&cfg.engine, clock, snapshot),
        None => {
            info!("Fresh start");
            TradeEngine::new(&cfg.engine, clock)
        }
    };
    let engine = Arc::new(engine);

    // -- API ---------------------------------------------------------------

    if cfg.api.enabled {
        api::spawn_api(engine.clone(), cfg.api.port);
    } else {
        info!("API disabled");
    }

    // -- Main loop ---------------------------------------------------------

    let mut interval =
        tokio::time::interval(Duration::from_secs(cfg.storage.snapshot_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.storage.snapshot_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = storage::save_snapshot(&engine.snapshot(), Some(snapshot_path)) {
                    error!(error = %e, "Failed to save snapshot");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // Save final snapshot
    storage::save_snapshot(&engine.snapshot(), Some(snapshot_path))?;
    info!(
        trades = engine.trade_count(),
        held = %engine.total_held(),
        "DUALSTAKE shut down cleanly."
    );

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dualstake=info"));

    let json_logging = std::env::var("DUALSTAKE_LOG_JSON").is_ok();

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
