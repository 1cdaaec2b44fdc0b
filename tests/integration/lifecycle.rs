//! Full trade lifecycles through the engine facade.

use chrono::Duration;
use dualstake::engine::events::TradeEventKind;
use dualstake::storage;
use dualstake::types::{Identity, RefundReason, TradeError, TradeState};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::{buyer, engine, list, seller};

#[test]
fn test_happy_path() {
    let (engine, _) = engine();
    let id = list(&engine, dec!(1.0));

    engine.buyer_deposit(id, buyer(), dec!(2.0)).unwrap();
    engine.seller_deposit(id, seller(), dec!(1.5)).unwrap();
    engine.mark_item_released(id, seller()).unwrap();
    let done = engine.confirm_delivery(id, buyer()).unwrap();

    assert_eq!(done.state, TradeState::Completed);
    assert_eq!(engine.paid_to(&seller()), dec!(2.5));
    assert_eq!(engine.paid_to(&buyer()), dec!(1.0));
    assert_eq!(engine.total_held(), Decimal::ZERO);

    let events = engine.events_for(id);
    assert_eq!(events.len(), 5);
    assert!(matches!(
        events[4].kind,
        TradeEventKind::TradeCompleted { seller_payout, buyer_payout }
            if seller_payout == dec!(2.5) && buyer_payout == dec!(1.0)
    ));
}

#[test]
fn test_timeout_refund_boundary() {
    let (engine, clock) = engine();
    let id = list(&engine, dec!(1.0));
    engine.buyer_deposit(id, buyer(), dec!(2.0)).unwrap();
    engine.seller_deposit(id, seller(), dec!(1.5)).unwrap();

    clock.advance(Duration::minutes(4) + Duration::seconds(59));
    let err = engine.refund_timeout(id, Identity::new("0xkeeper")).unwrap_err();
    assert_eq!(err.code(), "TIMEOUT_NOT_ELAPSED");

    clock.advance(Duration::seconds(1));
    let cancelled = engine.refund_timeout(id, Identity::new("0xkeeper")).unwrap();
    assert_eq!(cancelled.state, TradeState::Cancelled);
    assert_eq!(engine.paid_to(&buyer()), dec!(2.0));
    assert_eq!(engine.paid_to(&seller()), dec!(1.5));

    let last = engine.events_for(id).pop().unwrap();
    assert!(matches!(
        last.kind,
        TradeEventKind::Refunded { reason: RefundReason::ActivationTimeout, .. }
    ));
}

#[test]
fn test_release_then_refund_attempt_is_locked() {
    let (engine, clock) = engine();
    let id = list(&engine, dec!(1.0));
    engine.buyer_deposit(id, buyer(), dec!(2.0)).unwrap();
    engine.seller_deposit(id, seller(), dec!(1.5)).unwrap();
    engine.mark_item_released(id, seller()).unwrap();

    clock.advance(Duration::minutes(10));
    assert!(matches!(
        engine.refund_timeout(id, buyer()),
        Err(TradeError::InvalidState { state: TradeState::Released, .. })
    ));
    assert_eq!(engine.custody_balance(id), dec!(3.5));
    assert!(engine.paid_to(&buyer()).is_zero());
}

#[test]
fn test_refund_before_seller_stakes_is_invalid() {
    let (engine, clock) = engine();
    let id = list(&engine, dec!(1.0));
    engine.buyer_deposit(id, buyer(), dec!(2.0)).unwrap();

    clock.advance(Duration::days(1));
    assert!(matches!(
        engine.refund_timeout(id, buyer()),
        Err(TradeError::InvalidState { state: TradeState::BuyerStaked, .. })
    ));
    assert_eq!(engine.custody_balance(id), dec!(2.0));
}

#[test]
fn test_odd_prices_settle_exactly() {
    let (engine, _) = engine();
    let price = dec!(0.333333333333333333);
    let id = list(&engine, price);

    engine.buyer_deposit(id, buyer(), price * dec!(2)).unwrap();
    engine.seller_deposit(id, seller(), price * dec!(1.5)).unwrap();
    engine.mark_item_released(id, seller()).unwrap();
    engine.confirm_delivery(id, buyer()).unwrap();

    assert_eq!(engine.paid_to(&seller()), price * dec!(2.5));
    assert_eq!(engine.paid_to(&buyer()), price);
    assert_eq!(engine.custody_balance(id), Decimal::ZERO);
}

#[test]
fn test_many_trades_keep_custody_balanced() {
    let (engine, clock) = engine();
    let mut ids = Vec::new();
    for i in 1..=10u32 {
        let price = Decimal::from(i);
        let id = list(&engine, price);
        engine.buyer_deposit(id, buyer(), price * dec!(2)).unwrap();
        engine.seller_deposit(id, seller(), price * dec!(1.5)).unwrap();
        ids.push(id);
    }
    assert_eq!(engine.total_held(), dec!(3.5) * dec!(55));

    for id in ids.iter().step_by(2) {
        engine.mark_item_released(*id, seller()).unwrap();
        engine.confirm_delivery(*id, buyer()).unwrap();
    }
    clock.advance(Duration::minutes(5));
    for id in ids.iter().skip(1).step_by(2) {
        engine.refund_timeout(*id, seller()).unwrap();
    }

    assert_eq!(engine.total_held(), Decimal::ZERO);
    let paid = engine.paid_to(&seller()) + engine.paid_to(&buyer());
    assert_eq!(paid, dec!(3.5) * dec!(55));
}

#[test]
fn test_snapshot_file_round_trip() {
    let (engine, clock) = engine();
    let id = list(&engine, dec!(2));
    engine.buyer_deposit(id, buyer(), dec!(4)).unwrap();
    engine.seller_deposit(id, seller(), dec!(3)).unwrap();

    let mut path = std::env::temp_dir();
    path.push(format!("dualstake_it_{}.json", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();

    storage::save_snapshot(&engine.snapshot(), Some(&path)).unwrap();
    let snapshot = storage::load_snapshot(Some(&path)).unwrap().unwrap();
    let restored = dualstake::engine::TradeEngine::restore(
        &dualstake::config::EngineConfig::default(),
        clock.clone(),
        snapshot,
    );
    storage::delete_snapshot(Some(&path)).unwrap();

    clock.advance(Duration::minutes(5));
    restored.refund_timeout(id, buyer()).unwrap();
    assert_eq!(restored.paid_to(&buyer()), dec!(4));
    assert_eq!(restored.paid_to(&seller()), dec!(3));
    assert_eq!(restored.events_for(id).len(), 4);
}
