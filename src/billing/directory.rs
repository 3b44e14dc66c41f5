//! User directory collaborator
//!
//! Role read/update. Callers go through
//! [`RoleReconciler`](super::entitlement::RoleReconciler), which decides
//! between [`promote`] and [`demote`] from the committed subscription count.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;

use crate::core_types::UserId;
use crate::error::{LedgerError, LedgerResult};
use crate::models::Role;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Current role; unknown users are customers
    async fn role(&self, user_id: UserId) -> LedgerResult<Role>;

    async fn set_role(&self, user_id: UserId, role: Role) -> LedgerResult<()>;
}

/// Raise `user_id` to `granted` unless they already hold it or a higher role
///
/// Returns whether the role changed.
pub async fn promote(
    directory: &dyn UserDirectory,
    user_id: UserId,
    granted: Role,
) -> LedgerResult<bool> {
    let current = directory.role(user_id).await?;
    if current.id() >= granted.id() {
        return Ok(false);
    }
    directory.set_role(user_id, granted).await?;
    tracing::info!(user_id, from = %current, to = %granted, "Role granted");
    Ok(true)
}

/// Return `user_id` to the base role if they still hold `granted`
///
/// Callers decide entitlement; a role the subscription did not grant (e.g. an
/// admin) is left alone. Returns whether the role changed.
pub async fn demote(
    directory: &dyn UserDirectory,
    user_id: UserId,
    granted: Role,
) -> LedgerResult<bool> {
    let current = directory.role(user_id).await?;
    if current != granted {
        return Ok(false);
    }
    directory.set_role(user_id, Role::default()).await?;
    tracing::info!(user_id, from = %current, to = %Role::default(), "Role revoked");
    Ok(true)
}

// ============================================================================
// In-memory directory
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    roles: DashMap<UserId, Role>,
    failing_writes: AtomicUsize,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(self, user_id: UserId, role: Role) -> Self {
        self.roles.insert(user_id, role);
        self
    }

    /// Make the next `count` calls to `set_role` fail without writing
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn role(&self, user_id: UserId) -> LedgerResult<Role> {
        Ok(self.roles.get(&user_id).map(|r| *r).unwrap_or_default())
    }

    async fn set_role(&self, user_id: UserId, role: Role) -> LedgerResult<()> {
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Database(format!(
                "directory unavailable while updating user {}",
                user_id
            )));
        }
        self.roles.insert(user_id, role);
        Ok(())
    }
}

// ============================================================================
// PostgreSQL directory (users_tb.role)
// ============================================================================

pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn role(&self, user_id: UserId) -> LedgerResult<Role> {
        let id: Option<i16> = sqlx::query_scalar("SELECT role FROM users_tb WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match id {
            Some(id) => Role::from_id(id)
                .ok_or_else(|| LedgerError::Internal(format!("Invalid role ID: {}", id))),
            None => Ok(Role::default()),
        }
    }

    async fn set_role(&self, user_id: UserId, role: Role) -> LedgerResult<()> {
        let result =
            sqlx::query("UPDATE users_tb SET role = $1, updated_at = NOW() WHERE user_id = $2")
                .bind(role.id())
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::InvalidRequest(format!(
                "user {} not found",
                user_id
            )));
        }
        Ok(())
    }
}
