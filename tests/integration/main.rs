//! Integration tests driving the public engine API end to end.

mod concurrency;
mod lifecycle;

use chrono::{DateTime, TimeZone, Utc};
use dualstake::config::EngineConfig;
use dualstake::engine::timeout::ManualClock;
use dualstake::engine::TradeEngine;
use dualstake::types::{Identity, ListingMetadata, TradeId};
use rust_decimal::Decimal;
use std::sync::Arc;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
}

pub fn engine() -> (Arc<TradeEngine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = Arc::new(TradeEngine::new(&EngineConfig::default(), clock.clone()));
    (engine, clock)
}

pub fn seller() -> Identity {
    Identity::new("0x5e11e2")
}

pub fn buyer() -> Identity {
    Identity::new("0xb0b")
}

pub fn list(engine: &TradeEngine, price: Decimal) -> TradeId {
    engine
        .create_listing(seller(), price, ListingMetadata::new("Guitar", "music"))
        .unwrap()
}
