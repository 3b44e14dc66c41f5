//! In-memory ledger store
//!
//! Units of work are serialized through one owned async mutex. A unit mutates
//! a private copy of the state and publishes it on commit; dropping the unit
//! discards the copy.
//!
//! Used by the test suites and by local runs without PostgreSQL. Write
//! failures can be injected per wallet to exercise rollback paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{HISTORY_LIMIT, LedgerStore, Page, PageRequest, UnitOfWork};
use crate::core_types::{DepositId, SubscriptionId, UserId, WalletId, WithdrawId};
use crate::currency::CurrencyCode;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    DepositRequest, DepositStatus, NewDepositRequest, NewSubscription, NewTransaction,
    NewWithdrawRequest, PlanScope, Role, RoleSync, Subscription, SubscriptionStatus,
    TransactionStatus, Wallet, WalletTransaction, WithdrawRequest, WithdrawStatus,
};

#[derive(Debug, Clone, Default)]
struct Sequences {
    wallet: i64,
    transaction: i64,
    deposit: i64,
    withdraw: i64,
    subscription: i64,
}

fn next(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

#[derive(Debug, Clone, Default)]
struct State {
    wallets: BTreeMap<WalletId, Wallet>,
    wallet_index: HashMap<(UserId, CurrencyCode), WalletId>,
    transactions: Vec<WalletTransaction>,
    references: HashSet<(WalletId, String)>,
    deposits: BTreeMap<DepositId, DepositRequest>,
    withdrawals: BTreeMap<WithdrawId, WithdrawRequest>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    /// Role-sync markers in insertion order
    role_syncs: Vec<RoleSync>,
    seq: Sequences,
}

#[derive(Debug, Default)]
struct Faults {
    failing_wallets: DashSet<WalletId>,
}

/// Ledger store backed by process memory
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
    commits: Arc<AtomicUsize>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transaction append against `wallet_id` fail with a
    /// database error until [`clear_faults`](Self::clear_faults)
    pub fn fail_appends_to_wallet(&self, wallet_id: WalletId) {
        self.faults.failing_wallets.insert(wallet_id);
    }

    pub fn clear_faults(&self) {
        self.faults.failing_wallets.clear();
    }

    /// Number of units committed so far
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Every transaction in the log, oldest first
    pub async fn all_transactions(&self) -> Vec<WalletTransaction> {
        self.state.lock().await.transactions.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnit {
            guard,
            working,
            faults: self.faults.clone(),
            commits: self.commits.clone(),
        }))
    }

    async fn wallet(&self, wallet_id: WalletId) -> LedgerResult<Option<Wallet>> {
        Ok(self.state.lock().await.wallets.get(&wallet_id).cloned())
    }

    async fn find_wallet(
        &self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<Option<Wallet>> {
        let state = self.state.lock().await;
        Ok(state
            .wallet_index
            .get(&(user_id, currency.clone()))
            .and_then(|id| state.wallets.get(id))
            .cloned())
    }

    async fn list_transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> LedgerResult<Page<WalletTransaction>> {
        let state = self.state.lock().await;
        let mine: Vec<&WalletTransaction> = state
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == user_id)
            .collect();

        Ok(Page {
            total: mine.len() as i64,
            items: mine
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.limit as usize)
                .cloned()
                .collect(),
            page: page.page,
            limit: page.limit,
        })
    }

    async fn sum_success_deltas(&self, wallet_id: WalletId) -> LedgerResult<Decimal> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|tx| tx.wallet_id == wallet_id && tx.status == TransactionStatus::Success)
            .map(|tx| tx.amount)
            .sum())
    }

    async fn deposit(&self, id: DepositId) -> LedgerResult<Option<DepositRequest>> {
        Ok(self.state.lock().await.deposits.get(&id).cloned())
    }

    async fn deposits_for_user(&self, user_id: UserId) -> LedgerResult<Vec<DepositRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .deposits
            .values()
            .rev()
            .filter(|d| d.user_id == user_id)
            .take(HISTORY_LIMIT as usize)
            .cloned()
            .collect())
    }

    async fn withdrawal(&self, id: WithdrawId) -> LedgerResult<Option<WithdrawRequest>> {
        Ok(self.state.lock().await.withdrawals.get(&id).cloned())
    }

    async fn withdrawals_for_user(&self, user_id: UserId) -> LedgerResult<Vec<WithdrawRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .withdrawals
            .values()
            .rev()
            .filter(|w| w.user_id == user_id)
            .take(HISTORY_LIMIT as usize)
            .cloned()
            .collect())
    }

    async fn withdrawals_with_status(
        &self,
        status: WithdrawStatus,
        limit: i64,
    ) -> LedgerResult<Vec<WithdrawRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .withdrawals
            .values()
            .filter(|w| w.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn subscription(&self, id: SubscriptionId) -> LedgerResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn active_subscriptions(&self, user_id: UserId) -> LedgerResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active)
            .cloned()
            .collect())
    }

    async fn expired_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut expired: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|s| (s.end_date, s.id));
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn pending_role_syncs(&self, limit: i64) -> LedgerResult<Vec<RoleSync>> {
        let state = self.state.lock().await;
        Ok(state
            .role_syncs
            .iter()
            .take(limit.max(0) as usize)
            .copied()
            .collect())
    }
}

/// Exclusive unit over a private copy of the store state
struct MemoryUnit {
    guard: OwnedMutexGuard<State>,
    working: State,
    faults: Arc<Faults>,
    commits: Arc<AtomicUsize>,
}

impl MemoryUnit {
    fn wallet_mut(&mut self, wallet_id: WalletId) -> LedgerResult<&mut Wallet> {
        self.working
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| LedgerError::Internal(format!("wallet {} does not exist", wallet_id)))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn find_wallet_id(
        &mut self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<Option<WalletId>> {
        Ok(self
            .working
            .wallet_index
            .get(&(user_id, currency.clone()))
            .copied())
    }

    async fn ensure_wallet(
        &mut self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<WalletId> {
        if let Some(id) = self.find_wallet_id(user_id, currency).await? {
            return Ok(id);
        }

        let now = Utc::now();
        let id = next(&mut self.working.seq.wallet);
        self.working.wallets.insert(
            id,
            Wallet {
                id,
                user_id,
                currency: currency.clone(),
                balance: Decimal::ZERO,
                created_at: now,
                updated_at: now,
            },
        );
        self.working
            .wallet_index
            .insert((user_id, currency.clone()), id);
        Ok(id)
    }

    async fn lock_wallet(&mut self, wallet_id: WalletId) -> LedgerResult<Wallet> {
        Ok(self.wallet_mut(wallet_id)?.clone())
    }

    async fn append_transaction(
        &mut self,
        entry: NewTransaction,
    ) -> LedgerResult<WalletTransaction> {
        if self.faults.failing_wallets.contains(&entry.wallet_id) {
            return Err(LedgerError::Database(format!(
                "injected write failure on wallet {}",
                entry.wallet_id
            )));
        }

        let key = (entry.wallet_id, entry.reference_id.clone());
        if self.working.references.contains(&key) {
            return Err(LedgerError::DuplicateReference {
                wallet_id: entry.wallet_id,
                reference_id: entry.reference_id,
            });
        }

        let now = Utc::now();
        if entry.status == TransactionStatus::Success {
            let wallet = self.wallet_mut(entry.wallet_id)?;
            if wallet.balance != entry.balance_before {
                return Err(LedgerError::Internal(format!(
                    "stale balance on wallet {}: stored {}, entry {}",
                    wallet.id, wallet.balance, entry.balance_before
                )));
            }
            if entry.balance_after < Decimal::ZERO {
                return Err(LedgerError::insufficient_funds(
                    wallet.id,
                    wallet.balance,
                    -entry.amount,
                ));
            }
            wallet.balance = entry.balance_after;
            wallet.updated_at = now;
        }

        let tx = WalletTransaction {
            id: next(&mut self.working.seq.transaction),
            wallet_id: entry.wallet_id,
            user_id: entry.user_id,
            tx_type: entry.tx_type,
            amount: entry.amount,
            currency: entry.currency,
            status: entry.status,
            reference_id: entry.reference_id,
            description: entry.description,
            balance_before: entry.balance_before,
            balance_after: entry.balance_after,
            created_at: now,
        };
        self.working.references.insert(key);
        self.working.transactions.push(tx.clone());
        Ok(tx)
    }

    async fn insert_deposit(&mut self, new: NewDepositRequest) -> LedgerResult<DepositRequest> {
        let now = Utc::now();
        let request = DepositRequest {
            id: next(&mut self.working.seq.deposit),
            user_id: new.user_id,
            amount: new.amount,
            currency: new.currency,
            status: DepositStatus::Pending,
            gateway_tx_id: None,
            redirect_url: None,
            transaction_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.working.deposits.insert(request.id, request.clone());
        Ok(request)
    }

    async fn lock_deposit(&mut self, id: DepositId) -> LedgerResult<Option<DepositRequest>> {
        Ok(self.working.deposits.get(&id).cloned())
    }

    async fn save_deposit(&mut self, request: &DepositRequest) -> LedgerResult<()> {
        let slot = self
            .working
            .deposits
            .get_mut(&request.id)
            .ok_or(LedgerError::DepositNotFound(request.id))?;
        *slot = DepositRequest {
            updated_at: Utc::now(),
            ..request.clone()
        };
        Ok(())
    }

    async fn insert_withdrawal(
        &mut self,
        new: NewWithdrawRequest,
    ) -> LedgerResult<WithdrawRequest> {
        let now = Utc::now();
        let request = WithdrawRequest {
            id: next(&mut self.working.seq.withdraw),
            user_id: new.user_id,
            wallet_id: new.wallet_id,
            amount: new.amount,
            currency: new.currency,
            beneficiary: new.beneficiary,
            status: WithdrawStatus::Pending,
            hold_transaction_id: None,
            reversal_transaction_id: None,
            payout_reference: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.working.withdrawals.insert(request.id, request.clone());
        Ok(request)
    }

    async fn lock_withdrawal(&mut self, id: WithdrawId) -> LedgerResult<Option<WithdrawRequest>> {
        Ok(self.working.withdrawals.get(&id).cloned())
    }

    async fn save_withdrawal(&mut self, request: &WithdrawRequest) -> LedgerResult<()> {
        let slot = self
            .working
            .withdrawals
            .get_mut(&request.id)
            .ok_or(LedgerError::WithdrawalNotFound(request.id))?;
        *slot = WithdrawRequest {
            updated_at: Utc::now(),
            ..request.clone()
        };
        Ok(())
    }

    async fn lock_active_subscription(
        &mut self,
        user_id: UserId,
        scope: PlanScope,
    ) -> LedgerResult<Option<Subscription>> {
        Ok(self
            .working
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.scope == scope && s.is_active)
            .cloned())
    }

    async fn insert_subscription(&mut self, new: NewSubscription) -> LedgerResult<Subscription> {
        if self
            .lock_active_subscription(new.user_id, new.scope)
            .await?
            .is_some()
        {
            return Err(LedgerError::AlreadySubscribed {
                user_id: new.user_id,
                scope: new.scope.to_string(),
            });
        }

        let now = Utc::now();
        let subscription = Subscription {
            id: next(&mut self.working.seq.subscription),
            user_id: new.user_id,
            plan_id: new.plan_id,
            scope: new.scope,
            start_date: new.start_date,
            end_date: new.end_date,
            is_active: true,
            status: SubscriptionStatus::Paid,
            amount_paid: new.amount_paid,
            currency: new.currency,
            admin_share: new.admin_share,
            counterpart_share: new.counterpart_share,
            external_tx_id: new.external_tx_id,
            transaction_id: new.transaction_id,
            grants_role: new.grants_role,
            created_at: now,
            updated_at: now,
        };
        self.working
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn lock_subscription(
        &mut self,
        id: SubscriptionId,
    ) -> LedgerResult<Option<Subscription>> {
        Ok(self.working.subscriptions.get(&id).cloned())
    }

    async fn save_subscription(&mut self, subscription: &Subscription) -> LedgerResult<()> {
        let slot = self
            .working
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or(LedgerError::SubscriptionNotFound(subscription.id))?;
        *slot = Subscription {
            updated_at: Utc::now(),
            ..subscription.clone()
        };
        Ok(())
    }

    async fn count_active_with_role(&mut self, user_id: UserId, role: Role) -> LedgerResult<i64> {
        Ok(self
            .working
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active && s.grants_role == Some(role))
            .count() as i64)
    }

    async fn mark_role_sync(&mut self, user_id: UserId, role: Role) -> LedgerResult<()> {
        let marker = RoleSync { user_id, role };
        if !self.working.role_syncs.contains(&marker) {
            self.working.role_syncs.push(marker);
        }
        Ok(())
    }

    async fn clear_role_sync(&mut self, user_id: UserId, role: Role) -> LedgerResult<()> {
        self.working
            .role_syncs
            .retain(|m| !(m.user_id == user_id && m.role == role));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let MemoryUnit {
            mut guard,
            working,
            commits,
            ..
        } = *self;
        *guard = working;
        commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
