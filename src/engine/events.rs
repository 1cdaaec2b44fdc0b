//! Ordered trade notifications.
//!
//! One event is emitted per successful commit. Consumers either poll the
//! log by sequence number or subscribe to the broadcast channel; the
//! engine never waits on, or fails because of, a consumer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::types::{Identity, RefundReason, TradeId};

/// What happened to a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeEventKind {
    ListingCreated { seller: Identity, price: Decimal },
    BuyerStaked { buyer: Identity, amount: Decimal },
    Active { timestamp: DateTime<Utc> },
    ItemReleased,
    TradeCompleted { seller_payout: Decimal, buyer_payout: Decimal },
    Refunded {
        reason: RefundReason,
        buyer_refund: Decimal,
        seller_refund: Decimal,
    },
    Archived,
}

impl TradeEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            TradeEventKind::ListingCreated { .. } => "ListingCreated",
            TradeEventKind::BuyerStaked { .. } => "BuyerStaked",
            TradeEventKind::Active { .. } => "Active",
            TradeEventKind::ItemReleased => "ItemReleased",
            TradeEventKind::TradeCompleted { .. } => "TradeCompleted",
            TradeEventKind::Refunded { .. } => "Refunded",
            TradeEventKind::Archived => "Archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Global emission order, starting at 1.
    pub sequence: u64,
    pub event_id: Uuid,
    pub trade_id: TradeId,
    pub at: DateTime<Utc>,
    pub kind: TradeEventKind,
}

impl fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.sequence, self.trade_id, self.kind.name())
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EventLog {
    entries: Mutex<Vec<TradeEvent>>,
    sender: broadcast::Sender<TradeEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventLog {
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            entries: Mutex::new(Vec::new()),
            sender,
        }
    }

    /// Rebuild from a persisted log. Sequence numbering continues after
    /// the last restored event.
    pub fn restore(channel_capacity: usize, mut events: Vec<TradeEvent>) -> Self {
        events.sort_by_key(|e| e.sequence);
        let log = Self::new(channel_capacity);
        *log.lock() = events;
        log
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TradeEvent>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event and notify subscribers.
    pub fn emit(&self, trade_id: TradeId, at: DateTime<Utc>, kind: TradeEventKind) -> TradeEvent {
        let mut entries = self.lock();
        let sequence = entries.last().map(|e| e.sequence).unwrap_or(0) + 1;
        let event = TradeEvent {
            sequence,
            event_id: Uuid::new_v4(),
            trade_id,
            at,
            kind,
        };
        entries.push(event.clone());
        // No receivers is fine.
        let _ = self.sender.send(event.clone());
        trace!(sequence, trade_id = %trade_id, kind = event.kind.name(), "Event emitted");
        event
    }

    /// Events with a sequence number strictly greater than `after`.
    pub fn since(&self, after: u64) -> Vec<TradeEvent> {
        let entries = self.lock();
        let start = entries.partition_point(|e| e.sequence <= after);
        entries[start..].to_vec()
    }

    pub fn for_trade(&self, trade_id: TradeId) -> Vec<TradeEvent> {
        self.lock()
            .iter()
            .filter(|e| e.trade_id == trade_id)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.sender.subscribe()
    }

    pub fn last_sequence(&self) -> u64 {
        self.lock().last().map(|e| e.sequence).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<TradeEvent> {
        self.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn created(seller: &str) -> TradeEventKind {
        TradeEventKind::ListingCreated {
            seller: Identity::new(seller),
            price: dec!(1),
        }
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let log = EventLog::default();
        let a = log.emit(TradeId(1), Utc::now(), created("0xa"));
        let b = log.emit(TradeId(2), Utc::now(), created("0xb"));
        let c = log.emit(TradeId(1), Utc::now(), TradeEventKind::ItemReleased);
        assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 3));
        assert_eq!(log.last_sequence(), 3);
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_since_returns_strictly_newer() {
        let log = EventLog::default();
        for i in 1..=5 {
            log.emit(TradeId(i), Utc::now(), TradeEventKind::ItemReleased);
        }
        let newer = log.since(3);
        assert_eq!(newer.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(log.since(0).len(), 5);
        assert!(log.since(5).is_empty());
        assert!(log.since(99).is_empty());
    }

    #[test]
    fn test_for_trade_filters() {
        let log = EventLog::default();
        log.emit(TradeId(1), Utc::now(), created("0xa"));
        log.emit(TradeId(2), Utc::now(), created("0xb"));
        log.emit(TradeId(1), Utc::now(), TradeEventKind::ItemReleased);

        let kinds: Vec<_> = log.for_trade(TradeId(1)).iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["ListingCreated", "ItemReleased"]);
    }

    #[test]
    fn test_emit_without_subscribers_succeeds() {
        let log = EventLog::new(1);
        for _ in 0..10 {
            log.emit(TradeId(1), Utc::now(), TradeEventKind::ItemReleased);
        }
        assert_eq!(log.len(), 10);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let log = EventLog::default();
        let mut rx = log.subscribe();
        log.emit(TradeId(1), Utc::now(), created("0xa"));
        log.emit(TradeId(1), Utc::now(), TradeEventKind::ItemReleased);

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.kind, TradeEventKind::ItemReleased);
    }

    #[test]
    fn test_restore_continues_sequence() {
        let log = EventLog::default();
        log.emit(TradeId(1), Utc::now(), created("0xa"));
        log.emit(TradeId(1), Utc::now(), TradeEventKind::ItemReleased);

        let restored = EventLog::restore(8, log.all());
        let next = restored.emit(TradeId(2), Utc::now(), created("0xb"));
        assert_eq!(next.sequence, 3);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let log = EventLog::default();
        let event = log.emit(TradeId(4), Utc::now(), created("0xA"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "listing_created");
        assert_eq!(json["kind"]["seller"], "0xa");
        assert_eq!(json["trade_id"], 4);
    }
}
