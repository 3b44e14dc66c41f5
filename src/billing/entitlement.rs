//! Role entitlement
//!
//! A user holds a subscription-granted role exactly while at least one of
//! their active subscriptions grants it. Every unit that activates or
//! deactivates such a subscription also writes a role-sync marker for
//! (user, role) before it commits. The marker is cleared only in the unit
//! that brought the directory in line with the committed count, so a
//! directory failure leaves it behind for [`RoleReconciler::retry_pending`].
//!
//! Reconciliation takes the marker's lock before counting, which serializes
//! it against any purchase, cancel or expiry touching the same (user, role).

use std::sync::Arc;

use serde::Serialize;

use super::directory::{UserDirectory, demote, promote};
use crate::core_types::UserId;
use crate::error::LedgerResult;
use crate::models::{Role, RoleSync};
use crate::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoleChange {
    Granted,
    Revoked,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoleSyncReport {
    pub granted: usize,
    pub revoked: usize,
    pub failed: usize,
}

impl RoleSyncReport {
    pub fn record(&mut self, outcome: &LedgerResult<RoleChange>) {
        match outcome {
            Ok(RoleChange::Granted) => self.granted += 1,
            Ok(RoleChange::Revoked) => self.revoked += 1,
            Ok(RoleChange::Unchanged) => {}
            Err(_) => self.failed += 1,
        }
    }
}

pub struct RoleReconciler {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn UserDirectory>,
}

impl RoleReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { store, directory }
    }

    /// Bring `user_id`'s directory role in line with their active
    /// subscriptions granting `role`, then clear the marker
    ///
    /// On error the marker stays and the next retry pass picks it up.
    pub async fn reconcile(&self, user_id: UserId, role: Role) -> LedgerResult<RoleChange> {
        let mut uow = self.store.begin().await?;
        uow.mark_role_sync(user_id, role).await?;
        let entitled = uow.count_active_with_role(user_id, role).await? > 0;

        let change = if entitled {
            if promote(self.directory.as_ref(), user_id, role).await? {
                RoleChange::Granted
            } else {
                RoleChange::Unchanged
            }
        } else if demote(self.directory.as_ref(), user_id, role).await? {
            RoleChange::Revoked
        } else {
            RoleChange::Unchanged
        };

        uow.clear_role_sync(user_id, role).await?;
        uow.commit().await?;
        Ok(change)
    }

    /// Reconcile up to `limit` users whose earlier role change did not land
    pub async fn retry_pending(&self, limit: i64) -> RoleSyncReport {
        let mut report = RoleSyncReport::default();
        let pending = match self.store.pending_role_syncs(limit).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Role sync: failed to load pending markers");
                return report;
            }
        };

        for RoleSync { user_id, role } in pending {
            let outcome = self.reconcile(user_id, role).await;
            if let Err(e) = &outcome {
                tracing::warn!(user_id, %role, error = %e, "Role sync retry failed");
            }
            report.record(&outcome);
        }

        if report != RoleSyncReport::default() {
            tracing::info!(
                granted = report.granted,
                revoked = report.revoked,
                failed = report.failed,
                "Role sync retry finished"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::directory::InMemoryUserDirectory;
    use crate::core_types::SubscriptionId;
    use crate::currency::CurrencyCode;
    use crate::models::{NewSubscription, PlanScope};
    use crate::store::MemoryLedgerStore;
    use chrono::{TimeDelta, Utc};
    use rust_decimal::Decimal;

    async fn seed_active(
        store: &MemoryLedgerStore,
        user_id: UserId,
        scope: PlanScope,
    ) -> SubscriptionId {
        let now = Utc::now();
        let mut uow = store.begin().await.unwrap();
        let sub = uow
            .insert_subscription(NewSubscription {
                user_id,
                plan_id: 1,
                scope,
                start_date: now,
                end_date: now + TimeDelta::days(30),
                amount_paid: Decimal::from(100),
                currency: CurrencyCode::new("INR").unwrap(),
                admin_share: Decimal::from(20),
                counterpart_share: Decimal::from(80),
                external_tx_id: format!("pay_{}_{}", user_id, scope),
                transaction_id: 1,
                grants_role: Some(Role::Trader),
            })
            .await
            .unwrap();
        uow.mark_role_sync(user_id, Role::Trader).await.unwrap();
        uow.commit().await.unwrap();
        sub.id
    }

    #[tokio::test]
    async fn test_reconcile_follows_active_count() {
        let store = MemoryLedgerStore::new();
        let directory = Arc::new(InMemoryUserDirectory::new());
        let roles = RoleReconciler::new(Arc::new(store.clone()), directory.clone());

        seed_active(&store, 5, PlanScope::Platform).await;
        assert_eq!(roles.reconcile(5, Role::Trader).await.unwrap(), RoleChange::Granted);
        assert_eq!(roles.reconcile(5, Role::Trader).await.unwrap(), RoleChange::Unchanged);
        assert_eq!(directory.role(5).await.unwrap(), Role::Trader);
        assert!(store.pending_role_syncs(10).await.unwrap().is_empty());

        // nobody entitled
        assert_eq!(roles.reconcile(6, Role::Trader).await.unwrap(), RoleChange::Unchanged);
        assert_eq!(directory.role(6).await.unwrap(), Role::Customer);
    }

    #[tokio::test]
    async fn test_failed_grant_is_retried() {
        let store = MemoryLedgerStore::new();
        let directory = Arc::new(InMemoryUserDirectory::new());
        let roles = RoleReconciler::new(Arc::new(store.clone()), directory.clone());

        seed_active(&store, 5, PlanScope::Platform).await;
        directory.fail_next_writes(1);
        assert!(roles.reconcile(5, Role::Trader).await.is_err());
        assert_eq!(directory.role(5).await.unwrap(), Role::Customer);
        assert_eq!(
            store.pending_role_syncs(10).await.unwrap(),
            vec![RoleSync { user_id: 5, role: Role::Trader }]
        );

        let report = roles.retry_pending(10).await;
        assert_eq!(report, RoleSyncReport { granted: 1, revoked: 0, failed: 0 });
        assert_eq!(directory.role(5).await.unwrap(), Role::Trader);
        assert!(store.pending_role_syncs(10).await.unwrap().is_empty());

        assert_eq!(roles.retry_pending(10).await, RoleSyncReport::default());
    }

    #[tokio::test]
    async fn test_stale_revocation_sees_new_subscription() {
        let store = MemoryLedgerStore::new();
        let directory = Arc::new(InMemoryUserDirectory::new().with_role(5, Role::Trader));
        let roles = RoleReconciler::new(Arc::new(store.clone()), directory.clone());

        // A revocation queued while the user had nothing active...
        let mut uow = store.begin().await.unwrap();
        uow.mark_role_sync(5, Role::Trader).await.unwrap();
        uow.commit().await.unwrap();

        // ...runs only after a new granting subscription committed.
        seed_active(&store, 5, PlanScope::Trader(9)).await;

        let report = roles.retry_pending(10).await;
        assert_eq!(report, RoleSyncReport::default());
        assert_eq!(directory.role(5).await.unwrap(), Role::Trader);
    }
}
