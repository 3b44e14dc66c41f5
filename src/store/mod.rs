//! Ledger Store
//!
//! Durable record of wallets, the append-only transaction log, deposit and
//! withdraw requests, and subscriptions.
//!
//! # Atomic units
//!
//! Every mutation happens inside a [`UnitOfWork`] obtained from
//! [`LedgerStore::begin`]. A unit either commits as a whole or, when dropped
//! without [`UnitOfWork::commit`], leaves no trace. Row reads that precede a
//! write take an exclusive lock held until the unit ends.
//!
//! # Invariants enforced here
//!
//! 1. A `Success` transaction append updates the wallet balance in the same unit
//! 2. `(wallet_id, reference_id)` is unique across the transaction log
//! 3. A wallet balance never goes negative
//! 4. At most one active subscription per (user, scope)
//! 5. At most one role-sync marker per (user, role)

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::core_types::{DepositId, SubscriptionId, UserId, WalletId, WithdrawId};
use crate::currency::CurrencyCode;
use crate::error::LedgerResult;
use crate::models::{
    DepositRequest, NewDepositRequest, NewSubscription, NewTransaction, NewWithdrawRequest,
    PlanScope, Role, RoleSync, Subscription, Wallet, WalletTransaction, WithdrawRequest,
    WithdrawStatus,
};

/// Default and maximum page sizes for list queries
pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Cap on history queries, newest first
pub const HISTORY_LIMIT: i64 = 50;

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    /// Clamp to a valid page (`page >= 1`, `1 <= limit <= MAX_PAGE_LIMIT`)
    pub fn new(page: u32, limit: u32) -> Self {
        let limit = match limit {
            0 => DEFAULT_PAGE_LIMIT,
            l => l.min(MAX_PAGE_LIMIT),
        };
        Self {
            page: page.max(1),
            limit,
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.limit as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        (self.page as i64) * (self.limit as i64) < self.total
    }
}

/// Store entry point: opens units of work and serves read-only queries
///
/// Read queries do not lock anything and must not be issued by a task that
/// currently holds an open unit.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a new atomic unit of work
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>>;

    async fn wallet(&self, wallet_id: WalletId) -> LedgerResult<Option<Wallet>>;

    async fn find_wallet(
        &self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<Option<Wallet>>;

    /// Transaction log of all of a user's wallets, newest first
    async fn list_transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> LedgerResult<Page<WalletTransaction>>;

    /// Sum of `Success` deltas recorded against a wallet
    async fn sum_success_deltas(&self, wallet_id: WalletId) -> LedgerResult<Decimal>;

    async fn deposit(&self, id: DepositId) -> LedgerResult<Option<DepositRequest>>;

    async fn deposits_for_user(&self, user_id: UserId) -> LedgerResult<Vec<DepositRequest>>;

    async fn withdrawal(&self, id: WithdrawId) -> LedgerResult<Option<WithdrawRequest>>;

    async fn withdrawals_for_user(&self, user_id: UserId) -> LedgerResult<Vec<WithdrawRequest>>;

    /// Withdrawals in `status`, oldest first
    async fn withdrawals_with_status(
        &self,
        status: WithdrawStatus,
        limit: i64,
    ) -> LedgerResult<Vec<WithdrawRequest>>;

    async fn subscription(&self, id: SubscriptionId) -> LedgerResult<Option<Subscription>>;

    async fn active_subscriptions(&self, user_id: UserId) -> LedgerResult<Vec<Subscription>>;

    /// Active subscriptions whose end date is strictly before `now`
    async fn expired_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<Subscription>>;

    /// Outstanding role reconciliations, oldest first
    async fn pending_role_syncs(&self, limit: i64) -> LedgerResult<Vec<RoleSync>>;
}

/// One atomic unit of work
///
/// Dropping a unit without committing rolls back everything done through it.
#[async_trait]
pub trait UnitOfWork: Send {
    // === Wallets ===

    /// Resolve a wallet id without creating or locking anything
    async fn find_wallet_id(
        &mut self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<Option<WalletId>>;

    /// Resolve a wallet id, creating a zero-balance wallet if none exists
    async fn ensure_wallet(
        &mut self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<WalletId>;

    /// Take the exclusive row lock on a wallet and return its current state
    async fn lock_wallet(&mut self, wallet_id: WalletId) -> LedgerResult<Wallet>;

    /// Lazily create and lock the wallet for (user, currency)
    async fn get_or_create_wallet(
        &mut self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<Wallet> {
        let wallet_id = self.ensure_wallet(user_id, currency).await?;
        self.lock_wallet(wallet_id).await
    }

    /// Append to the transaction log; a `Success` entry also moves the wallet
    /// balance to `entry.balance_after`.
    ///
    /// Fails with `DuplicateReference` if the wallet already has a transaction
    /// with the same reference id.
    async fn append_transaction(&mut self, entry: NewTransaction)
    -> LedgerResult<WalletTransaction>;

    // === Deposits ===

    async fn insert_deposit(&mut self, new: NewDepositRequest) -> LedgerResult<DepositRequest>;

    async fn lock_deposit(&mut self, id: DepositId) -> LedgerResult<Option<DepositRequest>>;

    async fn save_deposit(&mut self, request: &DepositRequest) -> LedgerResult<()>;

    // === Withdrawals ===

    async fn insert_withdrawal(&mut self, new: NewWithdrawRequest)
    -> LedgerResult<WithdrawRequest>;

    async fn lock_withdrawal(&mut self, id: WithdrawId) -> LedgerResult<Option<WithdrawRequest>>;

    async fn save_withdrawal(&mut self, request: &WithdrawRequest) -> LedgerResult<()>;

    // === Subscriptions ===

    async fn lock_active_subscription(
        &mut self,
        user_id: UserId,
        scope: PlanScope,
    ) -> LedgerResult<Option<Subscription>>;

    /// Fails with `AlreadySubscribed` if an active subscription for the same
    /// (user, scope) exists.
    async fn insert_subscription(&mut self, new: NewSubscription) -> LedgerResult<Subscription>;

    async fn lock_subscription(&mut self, id: SubscriptionId)
    -> LedgerResult<Option<Subscription>>;

    async fn save_subscription(&mut self, subscription: &Subscription) -> LedgerResult<()>;

    /// Number of active subscriptions of a user that grant `role`
    async fn count_active_with_role(&mut self, user_id: UserId, role: Role) -> LedgerResult<i64>;

    // === Role reconciliation ===

    /// Record (or touch) the marker for (user, role) and hold its lock until
    /// the unit ends
    async fn mark_role_sync(&mut self, user_id: UserId, role: Role) -> LedgerResult<()>;

    async fn clear_role_sync(&mut self, user_id: UserId, role: Role) -> LedgerResult<()>;

    /// Make every mutation of this unit durable and visible
    async fn commit(self: Box<Self>) -> LedgerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_clamps() {
        assert_eq!(PageRequest::new(0, 0), PageRequest { page: 1, limit: 20 });
        assert_eq!(PageRequest::new(3, 500).limit, MAX_PAGE_LIMIT);
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
    }

    #[test]
    fn test_page_has_more() {
        let page = Page::<u8> {
            items: vec![],
            page: 1,
            limit: 10,
            total: 11,
        };
        assert!(page.has_more());

        let last = Page::<u8> {
            items: vec![],
            page: 2,
            limit: 10,
            total: 11,
        };
        assert!(!last.has_more());
    }
}
