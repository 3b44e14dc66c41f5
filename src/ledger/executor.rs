//! Ledger Executor
//!
//! Debit/credit primitives over a [`UnitOfWork`], plus self-contained
//! `credit`, `debit` and `transfer` operations that open and commit their own
//! unit.
//!
//! # Locking
//!
//! Every primitive re-reads the wallet under its row lock before computing
//! `balance_before`/`balance_after`. Callers that touch several wallets in one
//! unit take all locks up front with [`LedgerExecutor::lock_in_order`]
//! (ascending wallet id) so two units never wait on each other in a cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::core_types::{UserId, WalletId};
use crate::currency::CurrencyCode;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{NewTransaction, TransactionStatus, TransactionType, Wallet, WalletTransaction};
use crate::money::validate_amount;
use crate::store::{LedgerStore, UnitOfWork};

/// One balance movement, before the executor assigns its sign and snapshots
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub amount: Decimal,
    pub tx_type: TransactionType,
    pub reference_id: String,
    pub description: String,
}

impl Posting {
    pub fn new(
        amount: Decimal,
        tx_type: TransactionType,
        reference_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            tx_type,
            reference_id: reference_id.into(),
            description: description.into(),
        }
    }
}

/// Sole writer of wallet balances
#[derive(Clone)]
pub struct LedgerExecutor {
    store: Arc<dyn LedgerStore>,
}

impl LedgerExecutor {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    // ========================================================================
    // Self-contained operations
    // ========================================================================

    /// Credit a wallet in its own unit of work
    pub async fn credit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        tx_type: TransactionType,
        reference_id: &str,
        description: &str,
    ) -> LedgerResult<WalletTransaction> {
        let mut uow = self.store.begin().await?;
        let tx = Self::credit_in(
            uow.as_mut(),
            wallet_id,
            Posting::new(amount, tx_type, reference_id, description),
        )
        .await?;
        uow.commit().await?;
        Ok(tx)
    }

    /// Debit a wallet in its own unit of work
    ///
    /// Fails with `InsufficientFunds` when `balance < amount`; nothing is
    /// written in that case.
    pub async fn debit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        tx_type: TransactionType,
        reference_id: &str,
        description: &str,
    ) -> LedgerResult<WalletTransaction> {
        let mut uow = self.store.begin().await?;
        let tx = Self::debit_in(
            uow.as_mut(),
            wallet_id,
            Posting::new(amount, tx_type, reference_id, description),
        )
        .await?;
        uow.commit().await?;
        Ok(tx)
    }

    /// Move `amount` from one wallet to another atomically
    ///
    /// Both wallets are locked in ascending id order before either balance is
    /// read. If the credit leg fails the debit leg is rolled back with it.
    pub async fn transfer(
        &self,
        from: WalletId,
        to: WalletId,
        amount: Decimal,
        tx_type: TransactionType,
        reference_id: &str,
        description: &str,
    ) -> LedgerResult<(WalletTransaction, WalletTransaction)> {
        if from == to {
            return Err(LedgerError::InvalidRequest(
                "transfer source and destination are the same wallet".into(),
            ));
        }

        let mut uow = self.store.begin().await?;
        let locked = Self::lock_in_order(uow.as_mut(), &[from, to]).await?;
        let (source, dest) = match (locked.get(&from), locked.get(&to)) {
            (Some(s), Some(d)) => (s, d),
            _ => return Err(LedgerError::Internal("transfer wallets not locked".into())),
        };
        if source.currency != dest.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: source.currency.clone(),
                got: dest.currency.clone(),
            });
        }

        let posting = Posting::new(amount, tx_type, reference_id, description);
        let debit = Self::debit_in(uow.as_mut(), from, posting.clone()).await?;
        let credit = Self::credit_in(uow.as_mut(), to, posting).await?;
        uow.commit().await?;

        tracing::info!(
            from_wallet = from,
            to_wallet = to,
            amount = %amount,
            reference_id,
            "Transfer committed"
        );
        Ok((debit, credit))
    }

    /// Create the wallet for (user, currency) if missing and return it
    ///
    /// Used at boot for wallets that are later looked up without lazy
    /// creation (the platform wallets).
    pub async fn provision_wallet(
        &self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<Wallet> {
        let mut uow = self.store.begin().await?;
        let wallet = uow.get_or_create_wallet(user_id, currency).await?;
        uow.commit().await?;

        tracing::info!(user_id, wallet_id = wallet.id, currency = %currency, "Wallet provisioned");
        Ok(wallet)
    }

    // ========================================================================
    // Unit-scoped primitives
    // ========================================================================

    /// Lock every listed wallet in ascending id order
    ///
    /// Duplicate ids are locked once.
    pub async fn lock_in_order(
        uow: &mut dyn UnitOfWork,
        wallet_ids: &[WalletId],
    ) -> LedgerResult<BTreeMap<WalletId, Wallet>> {
        let mut ordered = wallet_ids.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut locked = BTreeMap::new();
        for wallet_id in ordered {
            let wallet = uow.lock_wallet(wallet_id).await?;
            locked.insert(wallet_id, wallet);
        }
        Ok(locked)
    }

    /// Resolve an existing wallet without creating one
    pub async fn require_wallet(
        uow: &mut dyn UnitOfWork,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<WalletId> {
        uow.find_wallet_id(user_id, currency)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound {
                user_id,
                currency: currency.clone(),
            })
    }

    /// Credit inside an open unit
    pub async fn credit_in(
        uow: &mut dyn UnitOfWork,
        wallet_id: WalletId,
        posting: Posting,
    ) -> LedgerResult<WalletTransaction> {
        let wallet = uow.lock_wallet(wallet_id).await?;
        validate_amount(posting.amount, &wallet.currency)?;

        let balance_after = wallet.balance + posting.amount;
        Self::append(uow, &wallet, posting.amount, balance_after, posting).await
    }

    /// Debit inside an open unit; `InsufficientFunds` writes nothing
    pub async fn debit_in(
        uow: &mut dyn UnitOfWork,
        wallet_id: WalletId,
        posting: Posting,
    ) -> LedgerResult<WalletTransaction> {
        let wallet = uow.lock_wallet(wallet_id).await?;
        validate_amount(posting.amount, &wallet.currency)?;

        if wallet.balance < posting.amount {
            tracing::warn!(
                wallet_id,
                available = %wallet.balance,
                requested = %posting.amount,
                reference_id = %posting.reference_id,
                "Debit rejected: insufficient funds"
            );
            return Err(LedgerError::insufficient_funds(
                wallet_id,
                wallet.balance,
                posting.amount,
            ));
        }

        let balance_after = wallet.balance - posting.amount;
        Self::append(uow, &wallet, -posting.amount, balance_after, posting).await
    }

    async fn append(
        uow: &mut dyn UnitOfWork,
        wallet: &Wallet,
        delta: Decimal,
        balance_after: Decimal,
        posting: Posting,
    ) -> LedgerResult<WalletTransaction> {
        let tx = uow
            .append_transaction(NewTransaction {
                wallet_id: wallet.id,
                user_id: wallet.user_id,
                tx_type: posting.tx_type,
                amount: delta,
                currency: wallet.currency.clone(),
                status: TransactionStatus::Success,
                reference_id: posting.reference_id,
                description: posting.description,
                balance_before: wallet.balance,
                balance_after,
            })
            .await?;

        tracing::debug!(
            wallet_id = wallet.id,
            tx_id = tx.id,
            tx_type = %tx.tx_type,
            delta = %delta,
            balance_after = %balance_after,
            "Ledger entry appended"
        );
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;
    use std::str::FromStr;

    fn inr() -> CurrencyCode {
        CurrencyCode::new("INR").unwrap()
    }

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    async fn setup() -> (MemoryLedgerStore, LedgerExecutor) {
        let store = MemoryLedgerStore::new();
        let executor = LedgerExecutor::new(Arc::new(store.clone()));
        (store, executor)
    }

    #[tokio::test]
    async fn test_credit_then_debit_conserves_balance() {
        let (store, executor) = setup().await;
        let wallet = executor.provision_wallet(1, &inr()).await.unwrap();

        executor
            .credit(wallet.id, d("500.00"), TransactionType::Deposit, "deposit:1", "dep")
            .await
            .unwrap();
        let tx = executor
            .debit(wallet.id, d("120.50"), TransactionType::Withdrawal, "withdraw:1", "wd")
            .await
            .unwrap();

        assert_eq!(tx.amount, d("-120.50"));
        assert_eq!(tx.balance_before, d("500.00"));
        assert_eq!(tx.balance_after, d("379.50"));

        let wallet = store.wallet(wallet.id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, d("379.50"));
        assert_eq!(store.sum_success_deltas(wallet.id).await.unwrap(), wallet.balance);
    }

    #[tokio::test]
    async fn test_debit_insufficient_funds_writes_nothing() {
        let (store, executor) = setup().await;
        let wallet = executor.provision_wallet(1, &inr()).await.unwrap();
        executor
            .credit(wallet.id, d("10.00"), TransactionType::Deposit, "deposit:1", "dep")
            .await
            .unwrap();

        let err = executor
            .debit(wallet.id, d("10.01"), TransactionType::Withdrawal, "withdraw:1", "wd")
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(store.all_transactions().await.len(), 1);
        assert_eq!(
            store.wallet(wallet.id).await.unwrap().unwrap().balance,
            d("10.00")
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_amounts() {
        let (_store, executor) = setup().await;
        let wallet = executor.provision_wallet(1, &inr()).await.unwrap();

        for amount in ["0", "-1", "0.001"] {
            let err = executor
                .credit(wallet.id, d(amount), TransactionType::Deposit, "x", "x")
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)), "amount {}", amount);
        }
    }

    #[tokio::test]
    async fn test_duplicate_reference_applies_once() {
        let (store, executor) = setup().await;
        let wallet = executor.provision_wallet(1, &inr()).await.unwrap();

        executor
            .credit(wallet.id, d("5"), TransactionType::Deposit, "deposit:9", "dep")
            .await
            .unwrap();
        let err = executor
            .credit(wallet.id, d("5"), TransactionType::Deposit, "deposit:9", "dep")
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::DuplicateReference { .. }));
        assert_eq!(store.wallet(wallet.id).await.unwrap().unwrap().balance, d("5"));
    }

    #[tokio::test]
    async fn test_transfer_moves_funds() {
        let (store, executor) = setup().await;
        let a = executor.provision_wallet(1, &inr()).await.unwrap();
        let b = executor.provision_wallet(2, &inr()).await.unwrap();
        executor
            .credit(a.id, d("100"), TransactionType::Deposit, "deposit:1", "dep")
            .await
            .unwrap();

        let (debit, credit) = executor
            .transfer(a.id, b.id, d("40"), TransactionType::Fee, "fee:1", "fee")
            .await
            .unwrap();

        assert_eq!(debit.amount, d("-40"));
        assert_eq!(credit.amount, d("40"));
        assert_eq!(store.wallet(a.id).await.unwrap().unwrap().balance, d("60"));
        assert_eq!(store.wallet(b.id).await.unwrap().unwrap().balance, d("40"));
    }

    #[tokio::test]
    async fn test_transfer_credit_failure_rolls_back_debit() {
        let (store, executor) = setup().await;
        let a = executor.provision_wallet(1, &inr()).await.unwrap();
        let b = executor.provision_wallet(2, &inr()).await.unwrap();
        executor
            .credit(a.id, d("100"), TransactionType::Deposit, "deposit:1", "dep")
            .await
            .unwrap();

        store.fail_appends_to_wallet(b.id);
        let err = executor
            .transfer(a.id, b.id, d("40"), TransactionType::Fee, "fee:1", "fee")
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Database(_)));
        assert_eq!(store.wallet(a.id).await.unwrap().unwrap().balance, d("100"));
        assert_eq!(store.wallet(b.id).await.unwrap().unwrap().balance, d("0"));
        assert_eq!(store.all_transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_currency_mismatch() {
        let (_store, executor) = setup().await;
        let a = executor.provision_wallet(1, &inr()).await.unwrap();
        let b = executor
            .provision_wallet(2, &CurrencyCode::new("USD").unwrap())
            .await
            .unwrap();

        let err = executor
            .transfer(a.id, b.id, d("1"), TransactionType::Fee, "fee:1", "fee")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
    }

    #[tokio::test]
    async fn test_require_wallet_does_not_create() {
        let (store, _executor) = setup().await;
        let mut uow = store.begin().await.unwrap();

        let err = LedgerExecutor::require_wallet(uow.as_mut(), 42, &inr())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::WalletNotFound { user_id: 42, .. }));
    }

    #[tokio::test]
    async fn test_lock_in_order_dedups() {
        let (store, executor) = setup().await;
        let a = executor.provision_wallet(1, &inr()).await.unwrap();
        let b = executor.provision_wallet(2, &inr()).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let locked = LedgerExecutor::lock_in_order(uow.as_mut(), &[b.id, a.id, b.id])
            .await
            .unwrap();
        assert_eq!(locked.keys().copied().collect::<Vec<_>>(), vec![a.id, b.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_overdraw() {
        let (store, executor) = setup().await;
        let wallet = executor.provision_wallet(1, &inr()).await.unwrap();
        executor
            .credit(wallet.id, d("1000"), TransactionType::Deposit, "deposit:1", "dep")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..25 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .debit(
                        wallet.id,
                        d("100"),
                        TransactionType::SubscriptionPayment,
                        &format!("purchase:{}", i),
                        "concurrent",
                    )
                    .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 10);
        let wallet = store.wallet(wallet.id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, d("0"));
        assert_eq!(store.sum_success_deltas(wallet.id).await.unwrap(), d("0"));
    }
}
