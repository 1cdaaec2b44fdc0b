//! Escrow accounts, one per trade.
//!
//! Tracks what has been locked for each trade and what has been paid out
//! of it. The sum of releases for a trade can never exceed the sum of its
//! locks; an attempt to do so is a `CustodyViolation`, which means the
//! engine computed an inconsistent transfer.

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::types::{Identity, TradeId};

// ---------------------------------------------------------------------------
// Accounts and payouts
// ---------------------------------------------------------------------------

/// Escrow account of a single trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustodyAccount {
    pub trade_id: TradeId,
    pub locked: Decimal,
    pub released: Decimal,
}

impl CustodyAccount {
    fn new(trade_id: TradeId) -> Self {
        Self {
            trade_id,
            locked: Decimal::ZERO,
            released: Decimal::ZERO,
        }
    }

    /// Amount still held.
    pub fn balance(&self) -> Decimal {
        self.locked - self.released
    }
}

/// A transfer out of escrow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub destination: Identity,
    pub amount: Decimal,
}

impl Payout {
    pub fn new(destination: Identity, amount: Decimal) -> Self {
        Self { destination, amount }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Custody violation on trade {trade_id}: {detail} (requested {requested}, held {available})")]
pub struct CustodyViolation {
    pub trade_id: TradeId,
    pub requested: Decimal,
    pub available: Decimal,
    pub detail: &'static str,
}

// ---------------------------------------------------------------------------
// FundsCustody
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FundsCustody {
    accounts: DashMap<TradeId, CustodyAccount>,
    /// Cumulative amounts paid out to each identity.
    paid: DashMap<Identity, Decimal>,
}

impl FundsCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increase the held balance of a trade.
    pub fn lock(&self, trade_id: TradeId, amount: Decimal) -> Result<(), CustodyViolation> {
        if amount <= Decimal::ZERO {
            return Err(CustodyViolation {
                trade_id,
                requested: amount,
                available: self.balance(trade_id),
                detail: "non-positive lock",
            });
        }
        let mut account = self
            .accounts
            .entry(trade_id)
            .or_insert_with(|| CustodyAccount::new(trade_id));
        account.locked += amount;
        debug!(trade_id = %trade_id, amount = %amount, balance = %account.balance(), "Funds locked");
        Ok(())
    }

    /// Pay `amount` of a trade's escrow to `destination`.
    pub fn release(
        &self,
        trade_id: TradeId,
        amount: Decimal,
        destination: &Identity,
    ) -> Result<(), CustodyViolation> {
        self.settle_inner(trade_id, &[Payout::new(destination.clone(), amount)], false)
    }

    /// Pay out a set of transfers that must drain the trade's escrow exactly.
    /// Either every payout is applied or none is.
    pub fn settle(&self, trade_id: TradeId, payouts: &[Payout]) -> Result<(), CustodyViolation> {
        self.settle_inner(trade_id, payouts, true)
    }

    fn settle_inner(
        &self,
        trade_id: TradeId,
        payouts: &[Payout],
        drain: bool,
    ) -> Result<(), CustodyViolation> {
        let requested: Decimal = payouts.iter().map(|p| p.amount).sum();

        {
            let Some(mut account) = self.accounts.get_mut(&trade_id) else {
                error!(trade_id = %trade_id, requested = %requested, "Release from a trade with no escrow");
                return Err(CustodyViolation {
                    trade_id,
                    requested,
                    available: Decimal::ZERO,
                    detail: "no escrow held",
                });
            };
            let available = account.balance();

            let detail = if payouts.iter().any(|p| p.amount < Decimal::ZERO) {
                Some("negative payout")
            } else if requested > available {
                Some("over-release")
            } else if drain && requested != available {
                Some("settlement leaves a residual balance")
            } else {
                None
            };
            if let Some(detail) = detail {
                error!(
                    trade_id = %trade_id,
                    requested = %requested,
                    available = %available,
                    detail,
                    "Custody violation"
                );
                return Err(CustodyViolation {
                    trade_id,
                    requested,
                    available,
                    detail,
                });
            }
            account.released += requested;
        }

        for payout in payouts.iter().filter(|p| !p.amount.is_zero()) {
            *self
                .paid
                .entry(payout.destination.clone())
                .or_insert(Decimal::ZERO) += payout.amount;
            debug!(
                trade_id = %trade_id,
                destination = %payout.destination,
                amount = %payout.amount,
                "Funds released"
            );
        }
        Ok(())
    }

    /// Amount currently held for a trade.
    pub fn balance(&self, trade_id: TradeId) -> Decimal {
        self.accounts
            .get(&trade_id)
            .map(|a| a.balance())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn account(&self, trade_id: TradeId) -> Option<CustodyAccount> {
        self.accounts.get(&trade_id).map(|a| a.clone())
    }

    /// Total paid out to `who` across all trades.
    pub fn paid_to(&self, who: &Identity) -> Decimal {
        self.paid.get(who).map(|v| *v).unwrap_or(Decimal::ZERO)
    }

    /// Sum of balances still held across all trades.
    pub fn total_held(&self) -> Decimal {
        self.accounts.iter().map(|a| a.balance()).sum()
    }

    pub fn accounts(&self) -> Vec<CustodyAccount> {
        let mut accounts: Vec<_> = self.accounts.iter().map(|a| a.clone()).collect();
        accounts.sort_by_key(|a| a.trade_id);
        accounts
    }

    pub fn payouts(&self) -> Vec<(Identity, Decimal)> {
        let mut paid: Vec<_> = self
            .paid
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        paid.sort_by(|a, b| a.0.cmp(&b.0));
        paid
    }

    /// Rebuild from persisted accounts and payout totals.
    pub fn restore(accounts: Vec<CustodyAccount>, payouts: Vec<(Identity, Decimal)>) -> Self {
        let custody = Self::new();
        for account in accounts {
            custody.accounts.insert(account.trade_id, account);
        }
        for (who, amount) in payouts {
            custody.paid.insert(who, amount);
        }
        custody
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
