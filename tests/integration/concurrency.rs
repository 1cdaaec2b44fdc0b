//! Racing callers against the same and against different trades.

use dualstake::config::EngineConfig;
use dualstake::engine::TradeEngine;
use dualstake::storage::EngineSnapshot;
use dualstake::types::{Identity, TradeError, TradeState};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crate::{buyer, engine, list, seller};

#[test]
fn test_racing_buyers_exactly_one_wins() {
    let (engine, _) = engine();
    let id = list(&engine, dec!(1));
    let wins = AtomicUsize::new(0);

    thread::scope(|s| {
        for i in 0..16 {
            let engine = &engine;
            let wins = &wins;
            s.spawn(move || {
                let who = Identity::new(format!("0xbuyer{i}"));
                match engine.buyer_deposit(id, who, dec!(2)) {
                    Ok(_) => {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(TradeError::InvalidState { .. }) | Err(TradeError::StaleCommit { .. }) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    let trade = engine.trade(id).unwrap();
    assert_eq!(trade.state, TradeState::BuyerStaked);
    assert_eq!(engine.custody_balance(id), dec!(2));
    assert_eq!(engine.events_for(id).len(), 2);
}

#[test]
fn test_release_races_refund() {
    let (engine, clock) = engine();
    let id = list(&engine, dec!(1));
    engine.buyer_deposit(id, buyer(), dec!(2)).unwrap();
    engine.seller_deposit(id, seller(), dec!(1.5)).unwrap();
    clock.advance(chrono::Duration::minutes(5));

    let (released, refunded) = thread::scope(|s| {
        let a = s.spawn(|| engine.mark_item_released(id, seller()).is_ok());
        let b = s.spawn(|| engine.refund_timeout(id, buyer()).is_ok());
        (a.join().unwrap(), b.join().unwrap())
    });

    assert!(released ^ refunded, "exactly one transition must win");
    let state = engine.trade(id).unwrap().state;
    if released {
        assert_eq!(state, TradeState::Released);
        assert_eq!(engine.custody_balance(id), dec!(3.5));
    } else {
        assert_eq!(state, TradeState::Cancelled);
        assert_eq!(engine.custody_balance(id), Decimal::ZERO);
    }
}

#[test]
fn test_double_confirm_pays_once() {
    let (engine, _) = engine();
    let id = list(&engine, dec!(1));
    engine.buyer_deposit(id, buyer(), dec!(2)).unwrap();
    engine.seller_deposit(id, seller(), dec!(1.5)).unwrap();
    engine.mark_item_released(id, seller()).unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let _ = engine.confirm_delivery(id, buyer());
            });
        }
    });

    assert_eq!(engine.paid_to(&seller()), dec!(2.5));
    assert_eq!(engine.paid_to(&buyer()), dec!(1));
    assert!(!engine.is_halted(id));
}

#[test]
fn test_independent_trades_in_parallel() {
    let (engine, _) = engine();

    thread::scope(|s| {
        for i in 0..8u32 {
            let engine = &engine;
            s.spawn(move || {
                let who = Identity::new(format!("0xs{i}"));
                let buyer = Identity::new(format!("0xb{i}"));
                let id = engine
                    .create_listing(who.clone(), dec!(1), Default::default())
                    .unwrap();
                engine.buyer_deposit(id, buyer.clone(), dec!(2)).unwrap();
                engine.seller_deposit(id, who.clone(), dec!(1.5)).unwrap();
                engine.mark_item_released(id, who).unwrap();
                engine.confirm_delivery(id, buyer).unwrap();
            });
        }
    });

    assert_eq!(engine.trade_count(), 8);
    assert_eq!(engine.total_held(), Decimal::ZERO);
    assert!(engine
        .all_trades()
        .iter()
        .all(|t| t.state == TradeState::Completed));

    // Sequence numbers are unique and gap-free across all trades.
    let sequences: Vec<u64> = engine.events_since(0).iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=40).collect::<Vec<_>>());
}

/// Every record's escrow matches its state, and payouts and events match
/// the number of completed trades.
fn assert_consistent(snapshot: &EngineSnapshot) -> usize {
    let held: HashMap<_, _> = snapshot
        .custody
        .iter()
        .map(|account| (account.trade_id, account.balance()))
        .collect();

    let mut completed = 0;
    for trade in &snapshot.trades {
        let balance = held.get(&trade.id).copied().unwrap_or(Decimal::ZERO);
        match trade.state {
            TradeState::Released => assert_eq!(balance, dec!(3.5), "trade {}", trade.id),
            TradeState::Completed => {
                assert!(balance.is_zero(), "trade {} still holds {balance}", trade.id);
                completed += 1;
            }
            other => panic!("unexpected state {other}"),
        }
    }

    let paid: Decimal = snapshot.payouts.iter().map(|(_, amount)| *amount).sum();
    assert_eq!(paid, dec!(3.5) * Decimal::from(completed));
    let announced = snapshot
        .events
        .iter()
        .filter(|e| e.kind.name() == "TradeCompleted")
        .count();
    assert_eq!(announced, completed);
    completed
}

#[test]
fn test_snapshots_during_settlement_are_consistent() {
    let (engine, clock) = engine();
    let ids: Vec<_> = (0..64)
        .map(|_| {
            let id = list(&engine, dec!(1));
            engine.buyer_deposit(id, buyer(), dec!(2)).unwrap();
            engine.seller_deposit(id, seller(), dec!(1.5)).unwrap();
            engine.mark_item_released(id, seller()).unwrap();
            id
        })
        .collect();
    let settled = AtomicBool::new(false);

    let first = thread::scope(|s| {
        s.spawn(|| {
            for &id in &ids {
                engine.confirm_delivery(id, buyer()).unwrap();
            }
            settled.store(true, Ordering::SeqCst);
        });

        let first = engine.snapshot();
        assert_consistent(&first);
        while !settled.load(Ordering::SeqCst) {
            assert_consistent(&engine.snapshot());
        }
        first
    });

    assert_eq!(assert_consistent(&engine.snapshot()), ids.len());

    // A snapshot taken mid-settlement restores without halting anything,
    // and the trades it caught in Released still settle.
    let restored = TradeEngine::restore(&EngineConfig::default(), clock, first.clone());
    for trade in &first.trades {
        assert!(!restored.is_halted(trade.id), "trade {} halted", trade.id);
        if trade.state == TradeState::Released {
            restored.confirm_delivery(trade.id, buyer()).unwrap();
        }
    }
    assert_eq!(restored.total_held(), Decimal::ZERO);
}
