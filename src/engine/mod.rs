//! Trade engine: the single entry point for every trade operation.
//!
//! An action flows through four components:
//! read the record from the [`ledger`], let the [`transitions`] state
//! machine check its guards and plan the change, then commit the plan.
//! Custody movements and the notification event are applied inside the
//! ledger's commit, so either the record, the escrow and the event all
//! change together or nothing does. Snapshots wait for in-flight commits
//! and hold new ones back while they read.

pub mod custody;
pub mod events;
pub mod ledger;
pub mod stake;
pub mod timeout;
pub mod transitions;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::storage::EngineSnapshot;
use crate::types::{Identity, ListingMetadata, Trade, TradeError, TradeId};

use custody::{CustodyViolation, FundsCustody};
use events::{EventLog, TradeEvent, TradeEventKind};
use ledger::TradeLedger;
use stake::StakeCalculator;
use timeout::{Clock, SystemClock, TimeoutPolicy};
use transitions::{CustodyEffect, TradeAction, Transition, TransitionEngine};

pub struct TradeEngine {
    ledger: TradeLedger,
    custody: FundsCustody,
    transitions: TransitionEngine,
    events: EventLog,
    clock: Arc<dyn Clock>,
    /// Trades frozen after an invariant violation, with the reason.
    halted: DashMap<TradeId, String>,
    /// Shared by mutations, exclusive for `snapshot`.
    commit_gate: RwLock<()>,
}

impl TradeEngine {
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: TradeLedger::new(),
            custody: FundsCustody::new(),
            transitions: transition_engine(config),
            events: EventLog::new(config.event_channel_capacity),
            clock,
            halted: DashMap::new(),
            commit_gate: RwLock::new(()),
        }
    }

    pub fn with_system_clock(config: &EngineConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    /// Rebuild an engine from a persisted snapshot. Records that fail their
    /// invariants, or whose escrow does not match their state, come back
    /// halted.
    pub fn restore(config: &EngineConfig, clock: Arc<dyn Clock>, snapshot: EngineSnapshot) -> Self {
        let halted = DashMap::new();
        for (id, reason) in snapshot.halted {
            halted.insert(id, reason);
        }
        let engine = Self {
            ledger: TradeLedger::restore(
                snapshot.next_trade_id,
                snapshot.trades,
                snapshot.archived,
                snapshot.metadata,
            ),
            custody: FundsCustody::restore(snapshot.custody, snapshot.payouts),
            transitions: transition_engine(config),
            events: EventLog::restore(config.event_channel_capacity, snapshot.events),
            clock,
            halted,
            commit_gate: RwLock::new(()),
        };
        for (id, reason) in engine.audit() {
            error!(trade_id = %id, reason = %reason, "Restored trade is inconsistent, halting");
            engine.halted.entry(id).or_insert(reason);
        }
        info!(
            trades = engine.ledger.trade_count(),
            next_id = engine.ledger.next_id(),
            events = engine.events.len(),
            halted = engine.halted.len(),
            "Engine restored from snapshot"
        );
        engine
    }

    /// Capture the full engine state as of a single point between commits.
    pub fn snapshot(&self) -> EngineSnapshot {
        let _exclusive = self.commit_gate.write().unwrap_or_else(PoisonError::into_inner);
        let mut halted: Vec<_> = self
            .halted
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        halted.sort_by_key(|(id, _)| *id);

        EngineSnapshot {
            saved_at: Some(self.clock.now()),
            next_trade_id: self.ledger.next_id(),
            trades: self.ledger.active_records(),
            archived: self.ledger.archived_records(),
            metadata: self.ledger.all_metadata(),
            custody: self.custody.accounts(),
            payouts: self.custody.payouts(),
            events: self.events.all(),
            halted,
        }
    }

    // -- Operations ------------------------------------------------------

    /// Open a new listing in `Created` state.
    pub fn create_listing(
        &self,
        seller: Identity,
        price: Decimal,
        metadata: ListingMetadata,
    ) -> Result<TradeId, TradeError> {
        if let Err(e) = StakeCalculator::required(price) {
            debug!(seller = %seller, price = %price, error = %e, "Listing rejected");
            return Err(e);
        }

        let _gate = self.mutation_gate();
        let now = self.clock.now();
        let trade = self.ledger.create(seller, price, metadata, now, |trade| {
            self.events.emit(
                trade.id,
                now,
                TradeEventKind::ListingCreated {
                    seller: trade.seller.clone(),
                    price: trade.price,
                },
            );
        })?;

        info!(trade_id = %trade.id, seller = %trade.seller, price = %trade.price, "Listing created");
        Ok(trade.id)
    }

    pub fn buyer_deposit(
        &self,
        id: TradeId,
        caller: Identity,
        value: Decimal,
    ) -> Result<Trade, TradeError> {
        self.submit(id, TradeAction::BuyerDeposit { from: caller, value })
    }

    pub fn seller_deposit(
        &self,
        id: TradeId,
        caller: Identity,
        value: Decimal,
    ) -> Result<Trade, TradeError> {
        self.submit(id, TradeAction::SellerDeposit { from: caller, value })
    }

    pub fn mark_item_released(&self, id: TradeId, caller: Identity) -> Result<Trade, TradeError> {
        self.submit(id, TradeAction::MarkItemReleased { from: caller })
    }

    pub fn confirm_delivery(&self, id: TradeId, caller: Identity) -> Result<Trade, TradeError> {
        self.submit(id, TradeAction::ConfirmDelivery { from: caller })
    }

    pub fn refund_timeout(&self, id: TradeId, caller: Identity) -> Result<Trade, TradeError> {
        self.submit(id, TradeAction::RefundTimeout { from: caller })
    }

    pub fn emergency_withdraw_buyer(
        &self,
        id: TradeId,
        caller: Identity,
    ) -> Result<Trade, TradeError> {
        self.submit(id, TradeAction::EmergencyWithdrawBuyer { from: caller })
    }

    /// Apply `action` to trade `id`. Returns the committed record.
    pub fn submit(&self, id: TradeId, action: TradeAction) -> Result<Trade, TradeError> {
        if self.halted.contains_key(&id) {
            debug!(trade_id = %id, action = action.name(), "Action on halted trade rejected");
            return Err(TradeError::Halted(id));
        }

        let _gate = self.mutation_gate();
        let now = self.clock.now();
        let result = self.ledger.get(id).and_then(|current| {
            let transition = self.transitions.plan(&current, &action, now)?;
            self.apply(&current, transition, now)
        });

        match result {
            Ok(trade) => {
                info!(
                    trade_id = %id,
                    action = action.name(),
                    caller = %action.caller(),
                    state = %trade.state,
                    "Trade advanced"
                );
                Ok(trade)
            }
            Err(e @ TradeError::InvariantViolation { .. }) => {
                if !self.is_halted(id) {
                    self.halt(id, &e);
                }
                Err(e)
            }
            Err(e) => {
                debug!(
                    trade_id = %id,
                    action = action.name(),
                    caller = %action.caller(),
                    code = e.code(),
                    error = %e,
                    "Action rejected"
                );
                Err(e)
            }
        }
    }

    /// Commit a planned transition on top of `current`. Custody and the
    /// event are applied under the record lock.
    fn apply(
        &self,
        current: &Trade,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Trade, TradeError> {
        let id = current.id;
        let Transition {
            next,
            custody,
            event,
        } = transition;

        self.ledger.commit(current, next, |_| {
            // A halt may have landed since the caller last looked.
            if self.halted.contains_key(&id) {
                return Err(TradeError::Halted(id));
            }
            let moved = match &custody {
                CustodyEffect::None => Ok(()),
                CustodyEffect::Lock(amount) => self.custody.lock(id, *amount),
                CustodyEffect::Settle(payouts) => self.custody.settle(id, payouts),
            };
            if let Err(v) = moved {
                let e = violation(v);
                // Halted before the record lock is released, so no other
                // writer gets in between.
                self.halt(id, &e);
                return Err(e);
            }
            self.events.emit(id, now, event);
            Ok(())
        })
    }

    /// Move a terminal trade into the archive.
    pub fn archive(&self, id: TradeId) -> Result<Trade, TradeError> {
        if self.halted.contains_key(&id) {
            return Err(TradeError::Halted(id));
        }
        let _gate = self.mutation_gate();
        let trade = self.ledger.archive(id)?;
        self.events.emit(id, self.clock.now(), TradeEventKind::Archived);
        Ok(trade)
    }

    fn halt(&self, id: TradeId, cause: &TradeError) {
        error!(trade_id = %id, error = %cause, "Invariant violation, halting trade");
        if self.halted.insert(id, cause.to_string()).is_some() {
            warn!(trade_id = %id, "Trade was already halted");
        }
    }

    fn mutation_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that fail their own invariants or whose escrow balance is
    /// not what their state implies.
    fn audit(&self) -> Vec<(TradeId, String)> {
        let mut findings = self.ledger.invalid_records();
        for trade in self.ledger.all() {
            if findings.iter().any(|(id, _)| *id == trade.id) {
                continue;
            }
            let expected = if trade.state.is_terminal() {
                Decimal::ZERO
            } else {
                trade.total_staked()
            };
            let held = self.custody.balance(trade.id);
            if held != expected {
                findings.push((
                    trade.id,
                    format!("escrow holds {held} but {} expects {expected}", trade.state),
                ));
            }
        }
        findings
    }

    // -- Queries ---------------------------------------------------------

    pub fn trade(&self, id: TradeId) -> Result<Trade, TradeError> {
        self.ledger.get(id)
    }

    pub fn metadata(&self, id: TradeId) -> Result<ListingMetadata, TradeError> {
        self.ledger.metadata(id)
    }

    /// Number of ids handed out so far.
    pub fn trade_count(&self) -> u64 {
        self.ledger.trade_count()
    }

    /// Trades in which `who` is the seller or the buyer.
    pub fn trades_for(&self, who: &Identity) -> Vec<Trade> {
        self.ledger.trades_for(who)
    }

    pub fn all_trades(&self) -> Vec<Trade> {
        self.ledger.all()
    }

    pub fn is_archived(&self, id: TradeId) -> bool {
        self.ledger.is_archived(id)
    }

    pub fn custody_balance(&self, id: TradeId) -> Decimal {
        self.custody.balance(id)
    }

    pub fn total_held(&self) -> Decimal {
        self.custody.total_held()
    }

    pub fn paid_to(&self, who: &Identity) -> Decimal {
        self.custody.paid_to(who)
    }

    pub fn events_since(&self, after: u64) -> Vec<TradeEvent> {
        self.events.since(after)
    }

    pub fn events_for(&self, id: TradeId) -> Vec<TradeEvent> {
        self.events.for_trade(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.events.subscribe()
    }

    pub fn is_halted(&self, id: TradeId) -> bool {
        self.halted.contains_key(&id)
    }

    pub fn halt_reason(&self, id: TradeId) -> Option<String> {
        self.halted.get(&id).map(|r| r.clone())
    }

    pub fn activation_window_secs(&self) -> i64 {
        self.transitions.timeout().window().num_seconds()
    }
}

fn transition_engine(config: &EngineConfig) -> TransitionEngine {
    TransitionEngine::new(
        TimeoutPolicy::from_secs(config.activation_window_secs),
        config.refund_access,
    )
}

fn violation(v: CustodyViolation) -> TradeError {
    TradeError::InvariantViolation {
        trade_id: v.trade_id,
        detail: v.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
