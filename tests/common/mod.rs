//! Shared harness: every component over one in-memory store

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;

use wallet_ledger::app::LedgerServices;
use wallet_ledger::billing::InMemoryUserDirectory;
use wallet_ledger::config::AppConfig;
use wallet_ledger::currency::CurrencyCode;
use wallet_ledger::funding::MockGateway;
use wallet_ledger::models::{
    Beneficiary, NewSubscription, PlanScope, Role, TransactionType, Wallet,
};
use wallet_ledger::store::{LedgerStore, MemoryLedgerStore};

pub const PLATFORM: i64 = 1;
pub const TRADER: i64 = 7;
pub const CUSTOMER: i64 = 100;

/// Trader plan: 100.00 INR, 20% commission, one month
pub const TRADER_PLAN: i64 = 10;
/// Platform plan: 250.00 INR, 30 days, grants the trader role
pub const PLATFORM_PLAN: i64 = 20;

const CONFIG: &str = r#"
log_level: info
log_dir: ./logs
log_file: test.log
use_json: false
rotation: never
platform_user_id: 1
default_currency: INR
currencies: [INR]
gateway:
  timeout_ms: 200
plans:
  - id: 10
    name: Signals Monthly
    price: "100.00"
    currency: INR
    duration: 1
    interval: month
    commission_rate: "0.20"
    trader_id: 7
  - id: 20
    name: Trader Access
    price: "250.00"
    currency: INR
    duration: 30
    interval: day
    commission_rate: "1"
    grants_role: trader
"#;

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn inr() -> CurrencyCode {
    CurrencyCode::new("INR").unwrap()
}

pub fn beneficiary() -> Beneficiary {
    Beneficiary {
        account_holder: "Asha Rao".into(),
        account_number: "001234567890".into(),
        bank_code: "HDFC0001234".into(),
    }
}

pub struct Harness {
    pub config: AppConfig,
    pub store: MemoryLedgerStore,
    pub gateway: Arc<MockGateway>,
    pub directory: Arc<InMemoryUserDirectory>,
    pub services: LedgerServices,
}

impl Harness {
    pub async fn new() -> Self {
        let config = AppConfig::from_yaml(CONFIG).unwrap();
        let store = MemoryLedgerStore::new();
        let gateway = Arc::new(MockGateway::new());
        let directory = Arc::new(InMemoryUserDirectory::new());
        let services = LedgerServices::build(
            &config,
            Arc::new(store.clone()),
            gateway.clone(),
            directory.clone(),
        )
        .unwrap();
        services.provision_platform_wallets(&config).await.unwrap();

        Self {
            config,
            store,
            gateway,
            directory,
            services,
        }
    }

    /// Wallet of `user_id` in INR, created if missing
    pub async fn wallet(&self, user_id: i64) -> Wallet {
        self.services.executor.provision_wallet(user_id, &inr()).await.unwrap()
    }

    pub async fn balance(&self, user_id: i64) -> Decimal {
        self.store
            .find_wallet(user_id, &inr())
            .await
            .unwrap()
            .map(|w| w.balance)
            .unwrap_or(Decimal::ZERO)
    }

    /// Credit `user_id` directly, bypassing the deposit flow
    pub async fn fund(&self, user_id: i64, amount: &str) -> Wallet {
        let wallet = self.wallet(user_id).await;
        self.services
            .executor
            .credit(
                wallet.id,
                dec(amount),
                TransactionType::Deposit,
                &format!("seed:{}:{}", user_id, amount),
                "test funding",
            )
            .await
            .unwrap();
        self.wallet(user_id).await
    }

    /// Insert an active subscription to the trader plan ending at `end_date`,
    /// bypassing payment
    pub async fn seed_subscription(
        &self,
        user_id: i64,
        end_date: DateTime<Utc>,
        grants_role: Option<Role>,
    ) -> i64 {
        let mut uow = self.store.begin().await.unwrap();
        let sub = uow
            .insert_subscription(NewSubscription {
                user_id,
                plan_id: TRADER_PLAN,
                scope: PlanScope::Trader(TRADER),
                start_date: end_date - TimeDelta::days(30),
                end_date,
                amount_paid: dec("100.00"),
                currency: inr(),
                admin_share: dec("20.00"),
                counterpart_share: dec("80.00"),
                external_tx_id: format!("pay_{}", user_id),
                transaction_id: 1,
                grants_role,
            })
            .await
            .unwrap();
        uow.commit().await.unwrap();
        sub.id
    }

    /// Every wallet's balance equals the sum of its successful deltas
    pub async fn assert_conserved(&self) {
        let transactions = self.store.all_transactions().await;
        let mut wallet_ids: Vec<i64> = transactions.iter().map(|t| t.wallet_id).collect();
        wallet_ids.sort_unstable();
        wallet_ids.dedup();
        for wallet_id in wallet_ids {
            let report = self.services.wallets.reconcile_wallet(wallet_id).await.unwrap();
            assert!(
                report.is_consistent(),
                "wallet {} drifted: balance {} vs ledger {}",
                wallet_id,
                report.balance,
                report.ledger_sum
            );
            assert!(report.balance >= Decimal::ZERO);
        }
    }
}
