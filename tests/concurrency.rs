//! Concurrent callers racing on the same wallets and requests

mod common;

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use common::*;
use futures::future::join_all;
use rust_decimal::Decimal;

use wallet_ledger::billing::UserDirectory;
use wallet_ledger::error::LedgerError;
use wallet_ledger::funding::ExternalStatus;
use wallet_ledger::models::{Role, TransactionType};
use wallet_ledger::store::LedgerStore;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_never_overdraw() {
    let h = Arc::new(Harness::new().await);
    let wallet = h.fund(CUSTOMER, "1000.00").await;

    let tasks = (0..40).map(|i| {
        let h = h.clone();
        tokio::spawn(async move {
            h.services
                .executor
                .debit(
                    wallet.id,
                    dec("75.00"),
                    TransactionType::Withdrawal,
                    &format!("race:{}", i),
                    "concurrent debit",
                )
                .await
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let short = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
        .count();
    assert_eq!(ok, 13);
    assert_eq!(ok + short, 40);
    assert_eq!(h.balance(CUSTOMER).await, dec("25.00"));
    h.assert_conserved().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_webhooks_credit_once() {
    let h = Arc::new(Harness::new().await);
    let request = h
        .services
        .deposits
        .initiate(CUSTOMER, dec("250.00"), &inr())
        .await
        .unwrap();
    let gateway_tx_id = request.gateway_tx_id.clone().unwrap();

    let deliveries = (0..16).map(|_| {
        let h = h.clone();
        let gateway_tx_id = gateway_tx_id.clone();
        tokio::spawn(async move {
            h.services
                .deposits
                .verify(request.id, ExternalStatus::Success, &gateway_tx_id)
                .await
        })
    });
    let results: Vec<_> = join_all(deliveries)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(LedgerError::AlreadyProcessed(_))))
    );
    assert_eq!(h.balance(CUSTOMER).await, dec("250.00"));
    h.assert_conserved().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_purchases_in_one_scope_charge_once() {
    let h = Arc::new(Harness::new().await);
    h.fund(CUSTOMER, "1000.00").await;

    let attempts = (0..8).map(|i| {
        let h = h.clone();
        tokio::spawn(async move {
            h.services
                .billing
                .purchase(CUSTOMER, TRADER_PLAN, dec("100.00"), &format!("pay_race_{}", i))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::AlreadySubscribed { .. })))
            .count(),
        7
    );
    assert_eq!(h.balance(CUSTOMER).await, dec("900.00"));
    assert_eq!(h.balance(PLATFORM).await, dec("20.00"));
    assert_eq!(h.balance(TRADER).await, dec("80.00"));
    assert_eq!(
        h.services.billing.active_subscriptions(CUSTOMER).await.unwrap().len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposing_transfers_do_not_deadlock() {
    let h = Arc::new(Harness::new().await);
    let a = h.fund(CUSTOMER, "500.00").await;
    let b = h.fund(TRADER, "500.00").await;

    let transfers = (0..30).map(|i| {
        let h = h.clone();
        let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
        tokio::spawn(async move {
            h.services
                .executor
                .transfer(
                    from,
                    to,
                    dec("10.00"),
                    TransactionType::ReferralCommission,
                    &format!("xfer:{}", i),
                    "rebalance",
                )
                .await
        })
    });
    let results = tokio::time::timeout(std::time::Duration::from_secs(10), join_all(transfers))
        .await
        .expect("transfers deadlocked");

    for joined in results {
        joined.unwrap().unwrap();
    }
    assert_eq!(h.balance(CUSTOMER).await, dec("500.00"));
    assert_eq!(h.balance(TRADER).await, dec("500.00"));
    assert_eq!(
        h.balance(CUSTOMER).await + h.balance(TRADER).await,
        Decimal::from(1000)
    );
    h.assert_conserved().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_overlapping_with_itself_is_skipped() {
    let h = Arc::new(Harness::new().await);
    let sweeps = (0..4).map(|_| {
        let scheduler = h.services.scheduler.clone();
        tokio::spawn(async move { scheduler.run_expiry_sweep().await })
    });
    let reports: Vec<_> = join_all(sweeps)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    // at least one ran; none ran twice at once (skipped ones did nothing)
    assert!(reports.iter().any(|r| !r.skipped));
    assert!(reports.iter().filter(|r| r.skipped).all(|r| r.scanned == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn purchase_racing_expiry_keeps_granted_role() {
    let h = Arc::new(Harness::new().await);

    for round in 0..20 {
        let user_id = 5_000 + round;
        h.fund(user_id, "250.00").await;
        h.seed_subscription(user_id, Utc::now() - TimeDelta::hours(1), Some(Role::Trader))
            .await;
        h.directory.set_role(user_id, Role::Trader).await.unwrap();

        let sweep = {
            let scheduler = h.services.scheduler.clone();
            tokio::spawn(async move { scheduler.run_expiry_sweep().await })
        };
        let purchase = {
            let h = h.clone();
            tokio::spawn(async move {
                h.services
                    .billing
                    .purchase(user_id, PLATFORM_PLAN, dec("250.00"), &format!("pay_race_{}", round))
                    .await
            })
        };

        let report = sweep.await.unwrap();
        purchase.await.unwrap().unwrap();
        assert_eq!(report.expired, 1, "round {}", round);
        assert_eq!(
            h.directory.role(user_id).await.unwrap(),
            Role::Trader,
            "round {}: demoted while a granting subscription is active",
            round
        );
    }

    assert!(h.store.pending_role_syncs(100).await.unwrap().is_empty());
    h.assert_conserved().await;
}
