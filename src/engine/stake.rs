//! Stake requirements.
//!
//! The buyer locks twice the price and the seller one and a half times
//! the price. Deposits must match these amounts exactly.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::TradeError;

/// Stakes both parties must lock for a given price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredStakes {
    pub buyer: Decimal,
    pub seller: Decimal,
}

impl RequiredStakes {
    /// Total escrow held once both stakes are locked.
    pub fn total(&self) -> Decimal {
        self.buyer + self.seller
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StakeCalculator;

impl StakeCalculator {
    pub fn buyer_multiplier() -> Decimal {
        dec!(2)
    }

    pub fn seller_multiplier() -> Decimal {
        dec!(1.5)
    }

    /// Required stakes for `price`. Rejects non-positive prices and prices
    /// whose stakes would overflow or need rounding to fit a `Decimal`.
    pub fn required(price: Decimal) -> Result<RequiredStakes, TradeError> {
        if price <= Decimal::ZERO {
            return Err(TradeError::InvalidPrice(price));
        }
        let buyer = exact_product(price, Self::buyer_multiplier())
            .ok_or(TradeError::InvalidPrice(price))?;
        let seller = exact_product(price, Self::seller_multiplier())
            .ok_or(TradeError::InvalidPrice(price))?;
        // Escrow for a trade must itself be representable.
        buyer
            .checked_add(seller)
            .ok_or(TradeError::InvalidPrice(price))?;

        Ok(RequiredStakes {
            buyer: buyer.normalize(),
            seller: seller.normalize(),
        })
    }

    pub fn required_buyer_stake(price: Decimal) -> Result<Decimal, TradeError> {
        Ok(Self::required(price)?.buyer)
    }

    pub fn required_seller_stake(price: Decimal) -> Result<Decimal, TradeError> {
        Ok(Self::required(price)?.seller)
    }
}

/// `value * multiplier`, or `None` when the product overflows or had to be
/// rounded. An exact product carries the sum of both scales; a smaller
/// scale means digits were dropped.
fn exact_product(value: Decimal, multiplier: Decimal) -> Option<Decimal> {
    let value = value.normalize();
    let product = value.checked_mul(multiplier)?;
    (product.scale() == value.scale() + multiplier.scale()).then_some(product)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
