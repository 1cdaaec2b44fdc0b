//! The authoritative store of trade records.
//!
//! Records live in a sharded map, so commits on different trade ids never
//! contend on a common lock. Every commit is a compare-and-swap on the
//! record's version: the caller names the version it observed and the
//! commit fails with `StaleCommit` if anything else got there first.
//! Terminal records reject every commit and can be moved to the archive,
//! where they stay readable forever.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::types::{Identity, ListingMetadata, Trade, TradeError, TradeId, TradeState};

#[derive(Debug)]
pub struct TradeLedger {
    /// Next id to hand out.
    next_id: AtomicU64,
    trades: DashMap<TradeId, Trade>,
    archived: DashMap<TradeId, Trade>,
    metadata: DashMap<TradeId, ListingMetadata>,
}

impl Default for TradeLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeLedger {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            trades: DashMap::new(),
            archived: DashMap::new(),
            metadata: DashMap::new(),
        }
    }

    /// Allocate a new `Created` record. `on_create` runs before the record
    /// becomes visible to any other caller.
    pub fn create<F>(
        &self,
        seller: Identity,
        price: Decimal,
        metadata: ListingMetadata,
        now: DateTime<Utc>,
        on_create: F,
    ) -> Result<Trade, TradeError>
    where
        F: FnOnce(&Trade),
    {
        let id = TradeId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let trade = Trade::new(id, seller, price, now);
        if let Err(detail) = trade.check_invariants() {
            return Err(TradeError::InvariantViolation { trade_id: id, detail });
        }

        self.metadata.insert(id, metadata);
        let entry = self.trades.entry(id).or_insert_with(|| trade.clone());
        on_create(entry.value());
        drop(entry);

        debug!(trade_id = %id, seller = %trade.seller, price = %trade.price, "Trade record created");
        Ok(trade)
    }

    /// Current record, active or archived.
    pub fn get(&self, id: TradeId) -> Result<Trade, TradeError> {
        if let Some(trade) = self.trades.get(&id) {
            return Ok(trade.clone());
        }
        self.archived
            .get(&id)
            .map(|t| t.clone())
            .ok_or(TradeError::NotFound(id))
    }

    pub fn metadata(&self, id: TradeId) -> Result<ListingMetadata, TradeError> {
        self.metadata
            .get(&id)
            .map(|m| m.clone())
            .ok_or(TradeError::NotFound(id))
    }

    pub fn is_archived(&self, id: TradeId) -> bool {
        self.archived.contains_key(&id)
    }

    /// Replace the record `observed` with `next`, atomically.
    ///
    /// Fails without side effects if the trade is unknown, terminal or
    /// archived, if its version moved since `observed` was read, if
    /// `next.state` is not a legal successor, or if `next` breaks a record
    /// invariant. `effect` runs while the record is held; if it fails the
    /// record is left untouched.
    pub fn commit<F>(&self, observed: &Trade, next: Trade, effect: F) -> Result<Trade, TradeError>
    where
        F: FnOnce(&Trade) -> Result<(), TradeError>,
    {
        let id = observed.id;
        let Some(mut current) = self.trades.get_mut(&id) else {
            return match self.archived.get(&id) {
                Some(archived) => Err(TradeError::InvalidState {
                    trade_id: id,
                    state: archived.state,
                    action: "commit",
                }),
                None => Err(TradeError::NotFound(id)),
            };
        };

        // A settled record stays settled, however old the caller's copy.
        if current.state.is_terminal() {
            return Err(TradeError::InvalidState {
                trade_id: id,
                state: current.state,
                action: "commit",
            });
        }
        if current.version != observed.version {
            warn!(
                trade_id = %id,
                observed = observed.version,
                current = current.version,
                "Stale commit rejected"
            );
            return Err(TradeError::StaleCommit {
                trade_id: id,
                observed: observed.version,
                current: current.version,
            });
        }
        if !current.state.can_transition_to(next.state) {
            return Err(TradeError::InvariantViolation {
                trade_id: id,
                detail: format!("illegal transition {} -> {}", current.state, next.state),
            });
        }
        if next.id != id || next.price != current.price || next.seller != current.seller {
            return Err(TradeError::InvariantViolation {
                trade_id: id,
                detail: "immutable field changed".to_string(),
            });
        }
        if current.activation_time.is_some() && next.activation_time != current.activation_time {
            return Err(TradeError::InvariantViolation {
                trade_id: id,
                detail: "activation time rewritten".to_string(),
            });
        }
        if let Err(detail) = next.check_invariants() {
            return Err(TradeError::InvariantViolation { trade_id: id, detail });
        }

        let mut next = next;
        next.version = current.version + 1;
        effect(&next)?;

        debug!(
            trade_id = %id,
            from = %current.state,
            to = %next.state,
            version = next.version,
            "Trade record committed"
        );
        *current = next.clone();
        Ok(next)
    }

    /// Move a terminal record into the archive.
    pub fn archive(&self, id: TradeId) -> Result<Trade, TradeError> {
        let trade = match self.trades.get(&id) {
            Some(trade) => trade.clone(),
            None => {
                return match self.archived.get(&id) {
                    Some(archived) => Err(TradeError::InvalidState {
                        trade_id: id,
                        state: archived.state,
                        action: "archive",
                    }),
                    None => Err(TradeError::NotFound(id)),
                };
            }
        };
        if !trade.state.is_terminal() {
            return Err(TradeError::InvalidState {
                trade_id: id,
                state: trade.state,
                action: "archive",
            });
        }

        // Terminal records never change, so the copy taken above is final.
        match self.archived.entry(id) {
            Entry::Occupied(_) => {
                return Err(TradeError::InvalidState {
                    trade_id: id,
                    state: trade.state,
                    action: "archive",
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(trade.clone());
            }
        }
        self.trades.remove(&id);

        info!(trade_id = %id, state = %trade.state, "Trade archived");
        Ok(trade)
    }

    /// Number of ids ever allocated (`tradeCounter`).
    pub fn trade_count(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst) - 1
    }

    /// Every record, active and archived, ordered by id.
    pub fn all(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .trades
            .iter()
            .map(|t| t.clone())
            .chain(self.archived.iter().map(|t| t.clone()))
            .collect();
        trades.sort_by_key(|t| t.id);
        trades
    }

    /// Records where `who` is the seller or the buyer.
    pub fn trades_for(&self, who: &Identity) -> Vec<Trade> {
        self.all()
            .into_iter()
            .filter(|t| t.is_participant(who))
            .collect()
    }

    pub fn in_state(&self, state: TradeState) -> Vec<Trade> {
        self.all().into_iter().filter(|t| t.state == state).collect()
    }

    pub fn active_records(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.trades.iter().map(|t| t.clone()).collect();
        trades.sort_by_key(|t| t.id);
        trades
    }

    pub fn archived_records(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.archived.iter().map(|t| t.clone()).collect();
        trades.sort_by_key(|t| t.id);
        trades
    }

    pub fn all_metadata(&self) -> Vec<(TradeId, ListingMetadata)> {
        let mut entries: Vec<_> = self
            .metadata
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Rebuild a ledger from persisted records. The id counter resumes
    /// after the highest id seen, even if `next_id` says otherwise.
    pub fn restore(
        next_id: u64,
        active: Vec<Trade>,
        archived: Vec<Trade>,
        metadata: Vec<(TradeId, ListingMetadata)>,
    ) -> Self {
        let highest = active
            .iter()
            .chain(archived.iter())
            .map(|t| t.id.value())
            .max()
            .unwrap_or(0);
        let ledger = Self::new();
        ledger
            .next_id
            .store(next_id.max(highest + 1).max(1), Ordering::SeqCst);
        for trade in active {
            ledger.trades.insert(trade.id, trade);
        }
        for trade in archived {
            ledger.archived.insert(trade.id, trade);
        }
        for (id, meta) in metadata {
            ledger.metadata.insert(id, meta);
        }
        ledger
    }

    /// Records that fail their invariants, e.g. after loading a damaged
    /// snapshot.
    pub fn invalid_records(&self) -> Vec<(TradeId, String)> {
        let mut invalid: Vec<(TradeId, String)> = self
            .trades
            .iter()
            .chain(self.archived.iter())
            .filter_map(|entry| entry.check_invariants().err().map(|detail| (entry.id, detail)))
            .collect();
        invalid.sort_by_key(|(id, _)| *id);
        invalid
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
