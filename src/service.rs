//! Wallet Service
//!
//! Read-side surface used by controllers: balances, the paginated
//! transaction log, and the ledger audit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::core_types::{UserId, WalletId};
use crate::currency::CurrencyCode;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::LedgerExecutor;
use crate::models::WalletTransaction;
use crate::store::{Page, PageRequest};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletSummary {
    pub wallet_id: WalletId,
    pub balance: Decimal,
    pub currency: CurrencyCode,
    pub last_updated: DateTime<Utc>,
}

/// Result of comparing a cached balance with its transaction log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub wallet_id: WalletId,
    pub balance: Decimal,
    pub ledger_sum: Decimal,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum
    }

    pub fn drift(&self) -> Decimal {
        self.balance - self.ledger_sum
    }
}

#[derive(Clone)]
pub struct WalletService {
    executor: LedgerExecutor,
    default_currency: CurrencyCode,
}

impl WalletService {
    pub fn new(executor: LedgerExecutor, default_currency: CurrencyCode) -> Self {
        Self {
            executor,
            default_currency,
        }
    }

    /// Summary of the user's wallet in the default currency
    pub async fn get_wallet_summary(&self, user_id: UserId) -> LedgerResult<WalletSummary> {
        self.wallet_summary_in(user_id, &self.default_currency).await
    }

    /// Summary of the user's wallet in `currency`, creating an empty wallet
    /// on first access
    pub async fn wallet_summary_in(
        &self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<WalletSummary> {
        let wallet = match self.executor.store().find_wallet(user_id, currency).await? {
            Some(wallet) => wallet,
            None => self.executor.provision_wallet(user_id, currency).await?,
        };

        Ok(WalletSummary {
            wallet_id: wallet.id,
            balance: wallet.balance,
            currency: wallet.currency,
            last_updated: wallet.updated_at,
        })
    }

    /// Newest-first transaction log across all of the user's wallets
    ///
    /// `page` is 1-based; out-of-range values are clamped.
    pub async fn list_transactions(
        &self,
        user_id: UserId,
        page: u32,
        limit: u32,
    ) -> LedgerResult<Page<WalletTransaction>> {
        self.executor
            .store()
            .list_transactions(user_id, PageRequest::new(page, limit))
            .await
    }

    /// Recompute the wallet balance from its successful transactions
    ///
    /// A mismatch is reported, never repaired.
    pub async fn reconcile_wallet(&self, wallet_id: WalletId) -> LedgerResult<ReconcileReport> {
        let store = self.executor.store();
        let wallet = store
            .wallet(wallet_id)
            .await?
            .ok_or_else(|| LedgerError::InvalidRequest(format!("wallet {} not found", wallet_id)))?;
        let ledger_sum = store.sum_success_deltas(wallet_id).await?;

        let report = ReconcileReport {
            wallet_id,
            balance: wallet.balance,
            ledger_sum,
        };
        if report.is_consistent() {
            tracing::debug!(wallet_id, balance = %report.balance, "Wallet reconciled");
        } else {
            tracing::error!(
                wallet_id,
                user_id = wallet.user_id,
                balance = %report.balance,
                ledger_sum = %report.ledger_sum,
                drift = %report.drift(),
                "Wallet balance diverges from transaction log"
            );
        }
        Ok(report)
    }
}
