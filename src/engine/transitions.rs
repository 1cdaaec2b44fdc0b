//! The trade state machine.
//!
//! `plan` is a pure function of (record, action, now): it checks every
//! guard and, if they all pass, describes the next record, the custody
//! movement and the event to emit. Nothing is applied here; the facade
//! commits the plan through the ledger.
//!
//! Guard order is fixed: state, then caller role, then amount, then time.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::custody::Payout;
use super::events::TradeEventKind;
use super::stake::StakeCalculator;
use super::timeout::TimeoutPolicy;
use crate::config::RefundAccess;
use crate::types::{Identity, RefundReason, Role, Trade, TradeError, TradeState};

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// One caller-submitted action against an existing trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TradeAction {
    BuyerDeposit { from: Identity, value: Decimal },
    SellerDeposit { from: Identity, value: Decimal },
    MarkItemReleased { from: Identity },
    ConfirmDelivery { from: Identity },
    RefundTimeout { from: Identity },
    EmergencyWithdrawBuyer { from: Identity },
}

impl TradeAction {
    pub fn name(&self) -> &'static str {
        match self {
            TradeAction::BuyerDeposit { .. } => "buyerDeposit",
            TradeAction::SellerDeposit { .. } => "sellerDeposit",
            TradeAction::MarkItemReleased { .. } => "markItemReleased",
            TradeAction::ConfirmDelivery { .. } => "confirmDelivery",
            TradeAction::RefundTimeout { .. } => "refundTimeout",
            TradeAction::EmergencyWithdrawBuyer { .. } => "emergencyWithdrawBuyer",
        }
    }

    pub fn caller(&self) -> &Identity {
        match self {
            TradeAction::BuyerDeposit { from, .. }
            | TradeAction::SellerDeposit { from, .. }
            | TradeAction::MarkItemReleased { from }
            | TradeAction::ConfirmDelivery { from }
            | TradeAction::RefundTimeout { from }
            | TradeAction::EmergencyWithdrawBuyer { from } => from,
        }
    }

    /// The only state in which this action is legal.
    pub fn required_state(&self) -> TradeState {
        match self {
            TradeAction::BuyerDeposit { .. } => TradeState::Created,
            TradeAction::SellerDeposit { .. } => TradeState::BuyerStaked,
            TradeAction::MarkItemReleased { .. }
            | TradeAction::RefundTimeout { .. }
            | TradeAction::EmergencyWithdrawBuyer { .. } => TradeState::Active,
            TradeAction::ConfirmDelivery { .. } => TradeState::Released,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} by {}", self.name(), self.caller())
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Escrow movement that accompanies a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CustodyEffect {
    None,
    Lock(Decimal),
    /// Pay out the trade's whole escrow.
    Settle(Vec<Payout>),
}

/// A validated transition, ready to be committed.
#[derive(Debug, Clone)]
pub struct Transition {
    pub next: Trade,
    pub custody: CustodyEffect,
    pub event: TradeEventKind,
}

// ---------------------------------------------------------------------------
// Transition engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionEngine {
    timeout: TimeoutPolicy,
    refund_access: RefundAccess,
}

impl TransitionEngine {
    pub fn new(timeout: TimeoutPolicy, refund_access: RefundAccess) -> Self {
        Self {
            timeout,
            refund_access,
        }
    }

    pub fn timeout(&self) -> &TimeoutPolicy {
        &self.timeout
    }

    pub fn refund_access(&self) -> RefundAccess {
        self.refund_access
    }

    /// Check every guard of `action` against `trade` and build the plan.
    pub fn plan(
        &self,
        trade: &Trade,
        action: &TradeAction,
        now: DateTime<Utc>,
    ) -> Result<Transition, TradeError> {
        let required = action.required_state();
        if trade.state != required {
            return Err(TradeError::InvalidState {
                trade_id: trade.id,
                state: trade.state,
                action: action.name(),
            });
        }

        let stakes = StakeCalculator::required(trade.price)?;
        let mut next = trade.clone();
        next.updated_at = now;

        match action {
            TradeAction::BuyerDeposit { from, value } => {
                if trade.is_seller(from) {
                    return Err(unauthorized(trade, from, Role::NotSeller));
                }
                expect_amount(trade, stakes.buyer, *value)?;

                next.buyer = Some(from.clone());
                next.buyer_stake = *value;
                next.state = TradeState::BuyerStaked;
                Ok(Transition {
                    next,
                    custody: CustodyEffect::Lock(*value),
                    event: TradeEventKind::BuyerStaked {
                        buyer: from.clone(),
                        amount: *value,
                    },
                })
            }

            TradeAction::SellerDeposit { from, value } => {
                if !trade.is_seller(from) {
                    return Err(unauthorized(trade, from, Role::Seller));
                }
                expect_amount(trade, stakes.seller, *value)?;

                next.seller_stake = *value;
                next.activation_time = Some(now);
                next.state = TradeState::Active;
                Ok(Transition {
                    next,
                    custody: CustodyEffect::Lock(*value),
                    event: TradeEventKind::Active { timestamp: now },
                })
            }

            TradeAction::MarkItemReleased { from } => {
                if !trade.is_seller(from) {
                    return Err(unauthorized(trade, from, Role::Seller));
                }
                next.state = TradeState::Released;
                Ok(Transition {
                    next,
                    custody: CustodyEffect::None,
                    event: TradeEventKind::ItemReleased,
                })
            }

            TradeAction::ConfirmDelivery { from } => {
                if !trade.is_buyer(from) {
                    return Err(unauthorized(trade, from, Role::Buyer));
                }
                let buyer = buyer_of(trade)?;
                let seller_payout = trade.price + trade.seller_stake;
                let buyer_payout = trade.buyer_stake - trade.price;

                next.state = TradeState::Completed;
                Ok(Transition {
                    next,
                    custody: CustodyEffect::Settle(vec![
                        Payout::new(trade.seller.clone(), seller_payout),
                        Payout::new(buyer, buyer_payout),
                    ]),
                    event: TradeEventKind::TradeCompleted {
                        seller_payout,
                        buyer_payout,
                    },
                })
            }

            TradeAction::RefundTimeout { from } => {
                if self.refund_access == RefundAccess::Participants && !trade.is_participant(from) {
                    return Err(unauthorized(trade, from, Role::Participant));
                }
                self.expect_window_elapsed(trade, now)?;
                self.refund(trade, next, RefundReason::ActivationTimeout)
            }

            TradeAction::EmergencyWithdrawBuyer { from } => {
                if !trade.is_buyer(from) {
                    return Err(unauthorized(trade, from, Role::Buyer));
                }
                self.expect_window_elapsed(trade, now)?;
                self.refund(trade, next, RefundReason::BuyerEmergencyWithdraw)
            }
        }
    }

    fn expect_window_elapsed(&self, trade: &Trade, now: DateTime<Utc>) -> Result<(), TradeError> {
        let activation = trade
            .activation_time
            .ok_or_else(|| TradeError::InvariantViolation {
                trade_id: trade.id,
                detail: "active trade without activation time".to_string(),
            })?;
        if !self.timeout.has_elapsed(activation, now) {
            let remaining = self.timeout.remaining(activation, now);
            // Round up so "0s remaining" never appears on a rejection.
            let remaining_secs = (remaining.num_milliseconds() + 999) / 1000;
            return Err(TradeError::TimeoutNotElapsed {
                trade_id: trade.id,
                remaining_secs,
            });
        }
        Ok(())
    }

    fn refund(
        &self,
        trade: &Trade,
        mut next: Trade,
        reason: RefundReason,
    ) -> Result<Transition, TradeError> {
        let buyer = buyer_of(trade)?;
        next.state = TradeState::Cancelled;
        Ok(Transition {
            next,
            custody: CustodyEffect::Settle(vec![
                Payout::new(buyer, trade.buyer_stake),
                Payout::new(trade.seller.clone(), trade.seller_stake),
            ]),
            event: TradeEventKind::Refunded {
                reason,
                buyer_refund: trade.buyer_stake,
                seller_refund: trade.seller_stake,
            },
        })
    }
}

fn unauthorized(trade: &Trade, caller: &Identity, required: Role) -> TradeError {
    TradeError::Unauthorized {
        trade_id: trade.id,
        caller: caller.clone(),
        required,
    }
}

fn expect_amount(trade: &Trade, expected: Decimal, received: Decimal) -> Result<(), TradeError> {
    if received != expected {
        return Err(TradeError::InvalidAmount {
            trade_id: trade.id,
            expected,
            received,
        });
    }
    Ok(())
}

fn buyer_of(trade: &Trade) -> Result<Identity, TradeError> {
    trade.buyer.clone().ok_or_else(|| TradeError::InvariantViolation {
        trade_id: trade.id,
        detail: format!("{} trade without a buyer", trade.state),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
