//! Persistence layer.
//!
//! Saves and loads a full engine snapshot to/from a JSON file. Decimal
//! amounts are written as strings, so a restored engine holds exactly the
//! balances it saved.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::engine::custody::CustodyAccount;
use crate::engine::events::TradeEvent;
use crate::types::{Identity, ListingMetadata, Trade, TradeId};

/// Default snapshot file path.
const DEFAULT_SNAPSHOT_FILE: &str = "dualstake_state.json";

/// Everything needed to rebuild a `TradeEngine`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSnapshot {
    pub saved_at: Option<DateTime<Utc>>,
    pub next_trade_id: u64,
    pub trades: Vec<Trade>,
    pub archived: Vec<Trade>,
    pub metadata: Vec<(TradeId, ListingMetadata)>,
    pub custody: Vec<CustodyAccount>,
    pub payouts: Vec<(Identity, Decimal)>,
    pub events: Vec<TradeEvent>,
    pub halted: Vec<(TradeId, String)>,
}

impl EngineSnapshot {
    pub fn trade_total(&self) -> usize {
        self.trades.len() + self.archived.len()
    }
}

/// Save an engine snapshot to a JSON file.
pub fn save_snapshot(snapshot: &EngineSnapshot, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);
    let json = serde_json::to_string_pretty(snapshot)
        .context("Failed to serialise engine snapshot")?;

    std::fs::write(path, &json)
        .context(format!("Failed to write snapshot to {path}"))?;

    debug!(
        path,
        trades = snapshot.trade_total(),
        events = snapshot.events.len(),
        "Snapshot saved"
    );
    Ok(())
}

/// Load an engine snapshot from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: Option<&str>) -> Result<Option<EngineSnapshot>> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);

    if !Path::new(path).exists() {
        info!(path, "No snapshot found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .context(format!("Failed to read snapshot from {path}"))?;

    let snapshot: EngineSnapshot = serde_json::from_str(&json)
        .context(format!("Failed to parse snapshot from {path}"))?;

    info!(
        path,
        trades = snapshot.trades.len(),
        archived = snapshot.archived.len(),
        next_trade_id = snapshot.next_trade_id,
        halted = snapshot.halted.len(),
        "Snapshot loaded from disk"
    );

    Ok(Some(snapshot))
}

/// Delete the snapshot file (for testing or reset).
pub fn delete_snapshot(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .context(format!("Failed to delete snapshot file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
