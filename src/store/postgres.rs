//! PostgreSQL ledger store
//!
//! A unit of work is one database transaction. Locks are row locks taken with
//! `SELECT ... FOR UPDATE`; uniqueness is enforced by constraints declared in
//! `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{HISTORY_LIMIT, LedgerStore, Page, PageRequest, UnitOfWork};
use crate::core_types::{DepositId, SubscriptionId, UserId, WalletId, WithdrawId};
use crate::currency::CurrencyCode;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Beneficiary, DepositRequest, DepositStatus, NewDepositRequest, NewSubscription,
    NewTransaction, NewWithdrawRequest, PlanScope, Role, RoleSync, Subscription,
    SubscriptionStatus, TransactionStatus, TransactionType, Wallet, WalletTransaction,
    WithdrawRequest, WithdrawStatus,
};

const WALLET_COLUMNS: &str = "id, user_id, currency, balance, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, wallet_id, user_id, tx_type, amount, currency, status, \
     reference_id, description, balance_before, balance_after, created_at";

const DEPOSIT_COLUMNS: &str = "id, user_id, amount, currency, status, gateway_tx_id, \
     redirect_url, transaction_id, failure_reason, created_at, updated_at";

const WITHDRAW_COLUMNS: &str = "id, user_id, wallet_id, amount, currency, account_holder, \
     account_number, bank_code, status, hold_transaction_id, reversal_transaction_id, \
     payout_reference, rejection_reason, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, trader_id, start_date, end_date, \
     is_active, status, amount_paid, currency, admin_share, counterpart_share, external_tx_id, \
     transaction_id, grants_role, created_at, updated_at";

/// Ledger store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnit { tx }))
    }

    async fn wallet(&self, wallet_id: WalletId) -> LedgerResult<Option<Wallet>> {
        let row = sqlx::query(&format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE id = $1"))
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn find_wallet(
        &self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = $1 AND currency = $2"
        ))
        .bind(user_id)
        .bind(currency.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn list_transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> LedgerResult<Page<WalletTransaction>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM wallet_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(user_id)
        .bind(page.limit as i64)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows
                .iter()
                .map(row_to_transaction)
                .collect::<LedgerResult<_>>()?,
            page: page.page,
            limit: page.limit,
            total,
        })
    }

    async fn sum_success_deltas(&self, wallet_id: WalletId) -> LedgerResult<Decimal> {
        let sum: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM wallet_transactions WHERE wallet_id = $1 AND status = $2",
        )
        .bind(wallet_id)
        .bind(TransactionStatus::Success.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn deposit(&self, id: DepositId) -> LedgerResult<Option<DepositRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposit_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn deposits_for_user(&self, user_id: UserId) -> LedgerResult<Vec<DepositRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposit_requests WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(HISTORY_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_deposit).collect()
    }

    async fn withdrawal(&self, id: WithdrawId) -> LedgerResult<Option<WithdrawRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {WITHDRAW_COLUMNS} FROM withdraw_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_withdrawal).transpose()
    }

    async fn withdrawals_for_user(&self, user_id: UserId) -> LedgerResult<Vec<WithdrawRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {WITHDRAW_COLUMNS} FROM withdraw_requests WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(HISTORY_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_withdrawal).collect()
    }

    async fn withdrawals_with_status(
        &self,
        status: WithdrawStatus,
        limit: i64,
    ) -> LedgerResult<Vec<WithdrawRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {WITHDRAW_COLUMNS} FROM withdraw_requests WHERE status = $1 ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.id())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_withdrawal).collect()
    }

    async fn subscription(&self, id: SubscriptionId) -> LedgerResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn active_subscriptions(&self, user_id: UserId) -> LedgerResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 AND is_active ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn expired_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE is_active AND end_date < $1
            ORDER BY end_date ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn pending_role_syncs(&self, limit: i64) -> LedgerResult<Vec<RoleSync>> {
        let rows = sqlx::query(
            "SELECT user_id, role FROM role_syncs ORDER BY created_at ASC, user_id ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RoleSync {
                    user_id: row.try_get("user_id")?,
                    role: enum_col(row, "role", Role::from_id)?,
                })
            })
            .collect()
    }
}

/// Unit of work over one PostgreSQL transaction; rolls back on drop
struct PgUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn find_wallet_id(
        &mut self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<Option<WalletId>> {
        let id = sqlx::query_scalar("SELECT id FROM wallets WHERE user_id = $1 AND currency = $2")
            .bind(user_id)
            .bind(currency.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(id)
    }

    async fn ensure_wallet(
        &mut self,
        user_id: UserId,
        currency: &CurrencyCode,
    ) -> LedgerResult<WalletId> {
        // Concurrent creators race on the unique (user_id, currency) key;
        // the loser reads the winner's row.
        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, currency, balance, created_at, updated_at)
            VALUES ($1, $2, 0, NOW(), NOW())
            ON CONFLICT (user_id, currency) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(currency.as_str())
        .execute(&mut *self.tx)
        .await?;

        self.find_wallet_id(user_id, currency)
            .await?
            .ok_or_else(|| {
                LedgerError::Internal(format!(
                    "wallet for user {} ({}) vanished after insert",
                    user_id, currency
                ))
            })
    }

    async fn lock_wallet(&mut self, wallet_id: WalletId) -> LedgerResult<Wallet> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE id = $1 FOR UPDATE"
        ))
        .bind(wallet_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| LedgerError::Internal(format!("wallet {} does not exist", wallet_id)))?;
        row_to_wallet(&row)
    }

    async fn append_transaction(
        &mut self,
        entry: NewTransaction,
    ) -> LedgerResult<WalletTransaction> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO wallet_transactions
                (wallet_id, user_id, tx_type, amount, currency, status, reference_id,
                 description, balance_before, balance_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(entry.wallet_id)
        .bind(entry.user_id)
        .bind(entry.tx_type.id())
        .bind(entry.amount)
        .bind(entry.currency.as_str())
        .bind(entry.status.id())
        .bind(&entry.reference_id)
        .bind(&entry.description)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .fetch_one(&mut *self.tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(LedgerError::DuplicateReference {
                    wallet_id: entry.wallet_id,
                    reference_id: entry.reference_id,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if entry.status == TransactionStatus::Success {
            let updated = sqlx::query(
                r#"
                UPDATE wallets
                SET balance = $1, updated_at = NOW()
                WHERE id = $2 AND balance = $3
                "#,
            )
            .bind(entry.balance_after)
            .bind(entry.wallet_id)
            .bind(entry.balance_before)
            .execute(&mut *self.tx)
            .await?;

            if updated.rows_affected() == 0 {
                return Err(LedgerError::Internal(format!(
                    "stale balance on wallet {}: expected {}",
                    entry.wallet_id, entry.balance_before
                )));
            }
        }

        row_to_transaction(&row)
    }

    async fn insert_deposit(&mut self, new: NewDepositRequest) -> LedgerResult<DepositRequest> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO deposit_requests (user_id, amount, currency, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING {DEPOSIT_COLUMNS}
            "#
        ))
        .bind(new.user_id)
        .bind(new.amount)
        .bind(new.currency.as_str())
        .bind(DepositStatus::Pending.id())
        .fetch_one(&mut *self.tx)
        .await?;
        row_to_deposit(&row)
    }

    async fn lock_deposit(&mut self, id: DepositId) -> LedgerResult<Option<DepositRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposit_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn save_deposit(&mut self, request: &DepositRequest) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deposit_requests
            SET status = $1, gateway_tx_id = $2, redirect_url = $3, transaction_id = $4,
                failure_reason = $5, updated_at = NOW()
            WHERE id = $6
            "#,
        )
        .bind(request.status.id())
        .bind(&request.gateway_tx_id)
        .bind(&request.redirect_url)
        .bind(request.transaction_id)
        .bind(&request.failure_reason)
        .bind(request.id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::DepositNotFound(request.id));
        }
        Ok(())
    }

    async fn insert_withdrawal(
        &mut self,
        new: NewWithdrawRequest,
    ) -> LedgerResult<WithdrawRequest> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO withdraw_requests
                (user_id, wallet_id, amount, currency, account_holder, account_number, bank_code,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            RETURNING {WITHDRAW_COLUMNS}
            "#
        ))
        .bind(new.user_id)
        .bind(new.wallet_id)
        .bind(new.amount)
        .bind(new.currency.as_str())
        .bind(&new.beneficiary.account_holder)
        .bind(&new.beneficiary.account_number)
        .bind(&new.beneficiary.bank_code)
        .bind(WithdrawStatus::Pending.id())
        .fetch_one(&mut *self.tx)
        .await?;
        row_to_withdrawal(&row)
    }

    async fn lock_withdrawal(&mut self, id: WithdrawId) -> LedgerResult<Option<WithdrawRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {WITHDRAW_COLUMNS} FROM withdraw_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_withdrawal).transpose()
    }

    async fn save_withdrawal(&mut self, request: &WithdrawRequest) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE withdraw_requests
            SET status = $1, hold_transaction_id = $2, reversal_transaction_id = $3,
                payout_reference = $4, rejection_reason = $5, updated_at = NOW()
            WHERE id = $6
            "#,
        )
        .bind(request.status.id())
        .bind(request.hold_transaction_id)
        .bind(request.reversal_transaction_id)
        .bind(&request.payout_reference)
        .bind(&request.rejection_reason)
        .bind(request.id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::WithdrawalNotFound(request.id));
        }
        Ok(())
    }

    async fn lock_active_subscription(
        &mut self,
        user_id: UserId,
        scope: PlanScope,
    ) -> LedgerResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1 AND trader_id IS NOT DISTINCT FROM $2 AND is_active
            FOR UPDATE
            "#
        ))
        .bind(user_id)
        .bind(scope.trader_id())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn insert_subscription(&mut self, new: NewSubscription) -> LedgerResult<Subscription> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, trader_id, start_date, end_date, is_active, status,
                 amount_paid, currency, admin_share, counterpart_share, external_tx_id,
                 transaction_id, grants_role, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(new.user_id)
        .bind(new.plan_id)
        .bind(new.scope.trader_id())
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(SubscriptionStatus::Paid.id())
        .bind(new.amount_paid)
        .bind(new.currency.as_str())
        .bind(new.admin_share)
        .bind(new.counterpart_share)
        .bind(&new.external_tx_id)
        .bind(new.transaction_id)
        .bind(new.grants_role.map(|r| r.id()))
        .fetch_one(&mut *self.tx)
        .await;

        match inserted {
            Ok(row) => row_to_subscription(&row),
            // uq_subscriptions_one_active
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(LedgerError::AlreadySubscribed {
                    user_id: new.user_id,
                    scope: new.scope.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lock_subscription(
        &mut self,
        id: SubscriptionId,
    ) -> LedgerResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn save_subscription(&mut self, subscription: &Subscription) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET is_active = $1, status = $2, end_date = $3, updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(subscription.is_active)
        .bind(subscription.status.id())
        .bind(subscription.end_date)
        .bind(subscription.id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::SubscriptionNotFound(subscription.id));
        }
        Ok(())
    }

    async fn count_active_with_role(&mut self, user_id: UserId, role: Role) -> LedgerResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE user_id = $1 AND is_active AND grants_role = $2",
        )
        .bind(user_id)
        .bind(role.id())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn mark_role_sync(&mut self, user_id: UserId, role: Role) -> LedgerResult<()> {
        // The upsert takes the row lock, so reconcilers of one (user, role)
        // run one at a time.
        sqlx::query(
            r#"
            INSERT INTO role_syncs (user_id, role, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (user_id, role) DO UPDATE SET updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(role.id())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn clear_role_sync(&mut self, user_id: UserId, role: Role) -> LedgerResult<()> {
        sqlx::query("DELETE FROM role_syncs WHERE user_id = $1 AND role = $2")
            .bind(user_id)
            .bind(role.id())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let PgUnit { tx } = *self;
        tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn currency_col(row: &PgRow) -> LedgerResult<CurrencyCode> {
    let raw: String = row.try_get("currency")?;
    CurrencyCode::new(&raw)
        .map_err(|e| LedgerError::Internal(format!("Invalid currency in database: {}", e)))
}

fn enum_col<T>(row: &PgRow, column: &str, from_id: fn(i16) -> Option<T>) -> LedgerResult<T> {
    let id: i16 = row.try_get(column)?;
    from_id(id).ok_or_else(|| LedgerError::Internal(format!("Invalid {} ID: {}", column, id)))
}

fn row_to_wallet(row: &PgRow) -> LedgerResult<Wallet> {
    Ok(Wallet {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        currency: currency_col(row)?,
        balance: row.try_get("balance")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_transaction(row: &PgRow) -> LedgerResult<WalletTransaction> {
    Ok(WalletTransaction {
        id: row.try_get("id")?,
        wallet_id: row.try_get("wallet_id")?,
        user_id: row.try_get("user_id")?,
        tx_type: enum_col(row, "tx_type", TransactionType::from_id)?,
        amount: row.try_get("amount")?,
        currency: currency_col(row)?,
        status: enum_col(row, "status", TransactionStatus::from_id)?,
        reference_id: row.try_get("reference_id")?,
        description: row.try_get("description")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_deposit(row: &PgRow) -> LedgerResult<DepositRequest> {
    Ok(DepositRequest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        currency: currency_col(row)?,
        status: enum_col(row, "status", DepositStatus::from_id)?,
        gateway_tx_id: row.try_get("gateway_tx_id")?,
        redirect_url: row.try_get("redirect_url")?,
        transaction_id: row.try_get("transaction_id")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_withdrawal(row: &PgRow) -> LedgerResult<WithdrawRequest> {
    Ok(WithdrawRequest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        wallet_id: row.try_get("wallet_id")?,
        amount: row.try_get("amount")?,
        currency: currency_col(row)?,
        beneficiary: Beneficiary {
            account_holder: row.try_get("account_holder")?,
            account_number: row.try_get("account_number")?,
            bank_code: row.try_get("bank_code")?,
        },
        status: enum_col(row, "status", WithdrawStatus::from_id)?,
        hold_transaction_id: row.try_get("hold_transaction_id")?,
        reversal_transaction_id: row.try_get("reversal_transaction_id")?,
        payout_reference: row.try_get("payout_reference")?,
        rejection_reason: row.try_get("rejection_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_subscription(row: &PgRow) -> LedgerResult<Subscription> {
    let trader_id: Option<UserId> = row.try_get("trader_id")?;
    let grants_role = match row.try_get::<Option<i16>, _>("grants_role")? {
        Some(id) => Some(
            Role::from_id(id)
                .ok_or_else(|| LedgerError::Internal(format!("Invalid grants_role ID: {}", id)))?,
        ),
        None => None,
    };

    Ok(Subscription {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        plan_id: row.try_get("plan_id")?,
        scope: PlanScope::from_trader(trader_id),
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        is_active: row.try_get("is_active")?,
        status: enum_col(row, "status", SubscriptionStatus::from_id)?,
        amount_paid: row.try_get("amount_paid")?,
        currency: currency_col(row)?,
        admin_share: row.try_get("admin_share")?,
        counterpart_share: row.try_get("counterpart_share")?,
        external_tx_id: row.try_get("external_tx_id")?,
        transaction_id: row.try_get("transaction_id")?,
        grants_role,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
