//! Shared types for the DUALSTAKE engine.
//!
//! These types form the data model used across all modules. Record
//! invariants lean on the stake calculator for the required amounts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::engine::stake::StakeCalculator;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Trade identifier. Allocated from 1 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(pub u64);

impl TradeId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TradeId {
    fn from(value: u64) -> Self {
        TradeId(value)
    }
}

/// A participant address (seller, buyer or any third-party caller).
///
/// Addresses are trimmed and lowercased on construction so that
/// `0xAbC` and `0xabc` name the same participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(address: impl AsRef<str>) -> Self {
        Identity(address.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Identity::new(value)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a trade.
///
/// Forward-only graph:
/// `Created -> BuyerStaked -> Active -> Released -> Completed`,
/// plus `Active -> Cancelled` once the activation window has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeState {
    Created,
    BuyerStaked,
    Active,
    Released,
    Completed,
    Cancelled,
}

impl TradeState {
    /// All states, in lifecycle order.
    pub const ALL: &'static [TradeState] = &[
        TradeState::Created,
        TradeState::BuyerStaked,
        TradeState::Active,
        TradeState::Released,
        TradeState::Completed,
        TradeState::Cancelled,
    ];

    /// Terminal states reject every further commit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeState::Completed | TradeState::Cancelled)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TradeState) -> bool {
        matches!(
            (self, next),
            (TradeState::Created, TradeState::BuyerStaked)
                | (TradeState::BuyerStaked, TradeState::Active)
                | (TradeState::Active, TradeState::Released)
                | (TradeState::Active, TradeState::Cancelled)
                | (TradeState::Released, TradeState::Completed)
        )
    }

    /// Whether a trade in this state must carry an activation time.
    pub fn requires_activation_time(&self) -> bool {
        match self {
            TradeState::Created | TradeState::BuyerStaked => false,
            TradeState::Active
            | TradeState::Released
            | TradeState::Completed
            | TradeState::Cancelled => true,
        }
    }

    /// Numeric state code (`uint8 state`) as exposed to clients.
    pub fn code(&self) -> u8 {
        match self {
            TradeState::Created => 0,
            TradeState::BuyerStaked => 1,
            TradeState::Active => 2,
            TradeState::Released => 3,
            TradeState::Completed => 4,
            TradeState::Cancelled => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Created => "CREATED",
            TradeState::BuyerStaked => "BUYER_STAKED",
            TradeState::Active => "ACTIVE",
            TradeState::Released => "RELEASED",
            TradeState::Completed => "COMPLETED",
            TradeState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The role an action demands of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Seller,
    Buyer,
    /// Anyone except the seller (a seller cannot buy their own listing).
    NotSeller,
    /// Seller or buyer of the trade.
    Participant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Seller => write!(f, "seller"),
            Role::Buyer => write!(f, "buyer"),
            Role::NotSeller => write!(f, "non-seller"),
            Role::Participant => write!(f, "participant"),
        }
    }
}

/// Why a trade was refunded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    /// `refundTimeout` after the activation window elapsed.
    ActivationTimeout,
    /// `emergencyWithdrawBuyer` after the activation window elapsed.
    BuyerEmergencyWithdraw,
}

impl fmt::Display for RefundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefundReason::ActivationTimeout => write!(f, "activation_timeout"),
            RefundReason::BuyerEmergencyWithdraw => write!(f, "buyer_emergency_withdraw"),
        }
    }
}

// ---------------------------------------------------------------------------
// Listing metadata
// ---------------------------------------------------------------------------

/// Opaque listing metadata. Stored next to the trade and never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingMetadata {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    /// Image location (IPFS CID, URL, ...).
    #[serde(default)]
    pub image_ref: Option<String>,
}

impl ListingMetadata {
    pub fn new(title: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            category: category.into(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// The central trade record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub seller: Identity,
    /// Unset until `buyerDeposit` succeeds.
    pub buyer: Option<Identity>,
    /// Fixed at creation.
    pub price: Decimal,
    pub seller_stake: Decimal,
    pub buyer_stake: Decimal,
    /// Set exactly once, on entry to `Active`.
    pub activation_time: Option<DateTime<Utc>>,
    pub state: TradeState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token, bumped by every commit.
    pub version: u64,
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buyer = self
            .buyer
            .as_ref()
            .map(|b| b.as_str())
            .unwrap_or("-");
        write!(
            f,
            "Trade {} [{}] price={} seller={} (stake {}) buyer={} (stake {}) v{}",
            self.id,
            self.state,
            self.price,
            self.seller,
            self.seller_stake,
            buyer,
            self.buyer_stake,
            self.version,
        )
    }
}

impl Trade {
    /// A fresh `Created` record.
    pub fn new(id: TradeId, seller: Identity, price: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id,
            seller,
            buyer: None,
            price,
            seller_stake: Decimal::ZERO,
            buyer_stake: Decimal::ZERO,
            activation_time: None,
            state: TradeState::Created,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_seller(&self, who: &Identity) -> bool {
        &self.seller == who
    }

    pub fn is_buyer(&self, who: &Identity) -> bool {
        self.buyer.as_ref() == Some(who)
    }

    pub fn is_participant(&self, who: &Identity) -> bool {
        self.is_seller(who) || self.is_buyer(who)
    }

    /// Amount this record says is held in escrow for it.
    pub fn total_staked(&self) -> Decimal {
        self.buyer_stake + self.seller_stake
    }

    /// Check the record-level invariants. Each stake is either zero or
    /// exactly the amount the price requires, depending on the state.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.price <= Decimal::ZERO {
            return Err(format!("non-positive price {}", self.price));
        }
        let required = StakeCalculator::required(self.price).map_err(|e| e.to_string())?;

        let has_buyer = self.state != TradeState::Created;
        if self.buyer.is_some() != has_buyer {
            return Err(format!("buyer presence does not match state {}", self.state));
        }
        let buyer_expected = if has_buyer { required.buyer } else { Decimal::ZERO };
        if self.buyer_stake != buyer_expected {
            return Err(format!(
                "buyer stake {} in state {} (expected {})",
                self.buyer_stake, self.state, buyer_expected
            ));
        }

        let seller_expected = if self.state.requires_activation_time() {
            required.seller
        } else {
            Decimal::ZERO
        };
        if self.seller_stake != seller_expected {
            return Err(format!(
                "seller stake {} in state {} (expected {})",
                self.seller_stake, self.state, seller_expected
            ));
        }
        if self.activation_time.is_some() != self.state.requires_activation_time() {
            return Err(format!(
                "activation time does not match state {}",
                self.state
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain errors returned by the trade engine.
///
/// Everything except `InvariantViolation` and `Halted` is a recoverable
/// rejection: nothing was applied and the caller must re-read the trade
/// before trying again.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TradeError {
    #[error("Invalid amount for trade {trade_id}: expected {expected}, received {received}")]
    InvalidAmount {
        trade_id: TradeId,
        expected: Decimal,
        received: Decimal,
    },

    #[error("Invalid price: {0} (must be positive)")]
    InvalidPrice(Decimal),

    #[error("Trade {trade_id} is {state}; {action} is not allowed")]
    InvalidState {
        trade_id: TradeId,
        state: TradeState,
        action: &'static str,
    },

    #[error("Caller {caller} is not the {required} of trade {trade_id}")]
    Unauthorized {
        trade_id: TradeId,
        caller: Identity,
        required: Role,
    },

    #[error("Trade not found: {0}")]
    NotFound(TradeId),

    #[error("Activation window of trade {trade_id} has not elapsed ({remaining_secs}s remaining)")]
    TimeoutNotElapsed { trade_id: TradeId, remaining_secs: i64 },

    #[error("Stale commit on trade {trade_id}: observed v{observed}, current v{current}")]
    StaleCommit {
        trade_id: TradeId,
        observed: u64,
        current: u64,
    },

    #[error("Invariant violation on trade {trade_id}: {detail}")]
    InvariantViolation { trade_id: TradeId, detail: String },

    #[error("Trade {0} is halted after an invariant violation")]
    Halted(TradeId),
}

impl TradeError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::InvalidAmount { .. } => "INVALID_AMOUNT",
            TradeError::InvalidPrice(_) => "INVALID_PRICE",
            TradeError::InvalidState { .. } => "INVALID_STATE",
            TradeError::Unauthorized { .. } => "UNAUTHORIZED",
            TradeError::NotFound(_) => "NOT_FOUND",
            TradeError::TimeoutNotElapsed { .. } => "TIMEOUT_NOT_ELAPSED",
            TradeError::StaleCommit { .. } => "STALE_COMMIT",
            TradeError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            TradeError::Halted(_) => "HALTED",
        }
    }

    /// Engine defects, as opposed to caller mistakes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TradeError::InvariantViolation { .. } | TradeError::Halted(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
