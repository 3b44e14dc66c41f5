//! Expiry Scheduler
//!
//! Periodic sweep that deactivates subscriptions whose end date has passed
//! and revokes roles nobody is entitled to anymore. Each sweep first retries
//! role syncs left behind by earlier directory failures.
//!
//! - Monotone: an inactive subscription is never revisited
//! - Log-and-continue: one failing subscription does not stop the sweep
//! - Not reentrant: a sweep requested while another runs is skipped

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::directory::UserDirectory;
use super::entitlement::{RoleReconciler, RoleSyncReport};
use crate::core_types::SubscriptionId;
use crate::error::LedgerResult;
use crate::models::{Subscription, SubscriptionStatus};
use crate::store::LedgerStore;

/// Subscriptions fetched per query
pub const SWEEP_BATCH: i64 = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Candidates returned by the store
    pub scanned: usize,
    pub expired: usize,
    pub failed: usize,
    pub roles_granted: usize,
    pub roles_revoked: usize,
    /// Role syncs that failed and stay queued
    pub role_sync_failed: usize,
    /// Another sweep was in flight; nothing was done
    pub skipped: bool,
}

impl SweepReport {
    fn add_roles(&mut self, roles: &RoleSyncReport) {
        self.roles_granted += roles.granted;
        self.roles_revoked += roles.revoked;
        self.role_sync_failed += roles.failed;
    }
}

/// Resets the in-flight flag when a sweep ends, including on panic
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ExpiryScheduler {
    store: Arc<dyn LedgerStore>,
    roles: RoleReconciler,
    interval: Duration,
    running: AtomicBool,
}

impl ExpiryScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn UserDirectory>,
        interval: Duration,
    ) -> Self {
        Self {
            roles: RoleReconciler::new(store.clone(), directory),
            store,
            interval,
            running: AtomicBool::new(false),
        }
    }

    pub async fn run_expiry_sweep(&self) -> SweepReport {
        self.run_expiry_sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`
    pub async fn run_expiry_sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::debug!("Expiry sweep already running, skipping");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        }
        let _guard = SweepGuard(&self.running);

        let mut report = SweepReport::default();
        report.add_roles(&self.roles.retry_pending(SWEEP_BATCH).await);

        loop {
            let batch = match self.store.expired_subscriptions(now, SWEEP_BATCH).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Expiry sweep: failed to load candidates");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let full = batch.len() as i64 == SWEEP_BATCH;
            let before = report.expired;
            report.scanned += batch.len();

            for subscription in batch {
                match self.expire_one(subscription.id, now).await {
                    Ok(Some(expired)) => {
                        report.expired += 1;
                        if let Some(role) = expired.grants_role {
                            let mut roles = RoleSyncReport::default();
                            let outcome = self.roles.reconcile(expired.user_id, role).await;
                            if let Err(e) = &outcome {
                                tracing::warn!(
                                    subscription_id = expired.id,
                                    user_id = expired.user_id,
                                    role = %role,
                                    error = %e,
                                    "Role revocation deferred to the next sweep"
                                );
                            }
                            roles.record(&outcome);
                            report.add_roles(&roles);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(
                            subscription_id = subscription.id,
                            user_id = subscription.user_id,
                            error = %e,
                            "Failed to expire subscription"
                        );
                    }
                }
            }

            // Failed rows stay eligible; stop instead of refetching them forever.
            if !full || report.expired == before {
                break;
            }
        }

        if report.expired > 0 || report.failed > 0 || report.role_sync_failed > 0 {
            tracing::info!(
                scanned = report.scanned,
                expired = report.expired,
                failed = report.failed,
                roles_granted = report.roles_granted,
                roles_revoked = report.roles_revoked,
                role_sync_failed = report.role_sync_failed,
                "Expiry sweep finished"
            );
        }
        report
    }

    /// Deactivate one subscription if it is still active and past its end
    ///
    /// Returns the expired subscription, or `None` when there was nothing to
    /// do. A granted role is queued for sync in the same unit.
    async fn expire_one(
        &self,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<Subscription>> {
        let mut uow = self.store.begin().await?;
        let Some(mut subscription) = uow.lock_subscription(subscription_id).await? else {
            return Ok(None);
        };
        if !subscription.is_expired_at(now) {
            return Ok(None);
        }

        subscription.is_active = false;
        subscription.status = SubscriptionStatus::Expired;
        uow.save_subscription(&subscription).await?;
        if let Some(role) = subscription.grants_role {
            uow.mark_role_sync(subscription.user_id, role).await?;
        }
        uow.commit().await?;

        tracing::debug!(
            subscription_id,
            user_id = subscription.user_id,
            end_date = %subscription.end_date,
            "Subscription expired"
        );
        Ok(Some(subscription))
    }

    /// Run the sweep every `interval` on a background task until stopped
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = scheduler.interval.as_secs(),
                "Expiry scheduler started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = scheduler.run_expiry_sweep().await;
                        tracing::debug!(?report, "Expiry tick");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Expiry scheduler stopped");
        });

        SchedulerHandle { shutdown_tx, task }
    }
}

/// Handle to a running scheduler task
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the task and wait for the in-flight sweep (if any) to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Expiry scheduler task ended abnormally");
        }
    }
}
