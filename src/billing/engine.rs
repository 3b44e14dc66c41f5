//! Billing Engine
//!
//! A purchase is one atomic multi-party transfer:
//!
//! 1. debit the customer by `amount_paid`
//! 2. credit the platform wallet with the admin share
//! 3. credit the trader wallet with the counterpart share (trader plans only)
//! 4. insert the active subscription
//!
//! All four steps share one unit of work and one `purchase:{external_tx_id}`
//! reference, so a failure anywhere leaves nothing behind and a replayed
//! external transaction is refused. A plan that grants a role also queues a
//! role sync in the same unit; the directory is updated after commit by
//! [`RoleReconciler`] and retried by the expiry sweep if that fails.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::directory::UserDirectory;
use super::entitlement::{RoleChange, RoleReconciler};
use super::plan::{Plan, PlanCatalog};
use crate::core_types::{PlanId, SubscriptionId, TransactionId, UserId};
use crate::currency::CurrencyCode;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::LedgerExecutor;
use crate::ledger::executor::Posting;
use crate::models::{
    NewSubscription, PlanScope, Role, Subscription, SubscriptionStatus, TransactionType,
};
use crate::money::{CommissionSplit, split_commission, validate_amount};
use crate::store::LedgerStore;

/// What the caller gets back from a successful purchase
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchaseReceipt {
    pub subscription_id: SubscriptionId,
    pub plan_id: PlanId,
    pub plan_name: String,
    pub amount_paid: Decimal,
    pub currency: CurrencyCode,
    pub admin_share: Decimal,
    pub counterpart_share: Decimal,
    /// Customer debit
    pub transaction_id: TransactionId,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub role_granted: Option<Role>,
}

pub struct BillingEngine {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<dyn PlanCatalog>,
    roles: RoleReconciler,
    platform_user_id: UserId,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<dyn PlanCatalog>,
        directory: Arc<dyn UserDirectory>,
        platform_user_id: UserId,
    ) -> Self {
        Self {
            roles: RoleReconciler::new(store.clone(), directory),
            store,
            catalog,
            platform_user_id,
        }
    }

    /// Split for a plan: the platform keeps everything when there is no trader
    pub fn split_for(plan: &Plan, amount_paid: Decimal) -> CommissionSplit {
        match plan.trader_id {
            Some(_) => split_commission(amount_paid, plan.commission_rate, &plan.currency),
            None => CommissionSplit {
                admin_share: amount_paid,
                counterpart_share: Decimal::ZERO,
            },
        }
    }

    pub async fn purchase(
        &self,
        customer_id: UserId,
        plan_id: PlanId,
        amount_paid: Decimal,
        external_tx_id: &str,
    ) -> LedgerResult<PurchaseReceipt> {
        let plan = self
            .catalog
            .plan(plan_id)
            .await?
            .ok_or(LedgerError::PlanNotFound(plan_id))?;
        if !plan.is_active {
            return Err(LedgerError::PlanInactive(plan_id));
        }

        let external_tx_id = external_tx_id.trim();
        if external_tx_id.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "external transaction id is required".into(),
            ));
        }
        validate_amount(amount_paid, &plan.currency)?;
        if amount_paid != plan.price {
            return Err(LedgerError::PriceMismatch {
                paid: amount_paid.to_string(),
                price: plan.price.to_string(),
            });
        }
        if plan.trader_id == Some(self.platform_user_id) {
            return Err(LedgerError::InvalidRequest(format!(
                "plan {} is sold by the platform user; its commission has no separate wallet",
                plan_id
            )));
        }
        if customer_id == self.platform_user_id || plan.trader_id == Some(customer_id) {
            return Err(LedgerError::InvalidRequest(format!(
                "user {} cannot subscribe to plan {}",
                customer_id, plan_id
            )));
        }

        let scope = plan.scope();
        let split = Self::split_for(&plan, amount_paid);
        let start_date = Utc::now();
        let end_date = plan.end_date_from(start_date)?;
        let reference = format!("purchase:{}", external_tx_id);

        let mut uow = self.store.begin().await?;

        if let Some(existing) = uow.lock_active_subscription(customer_id, scope).await? {
            if existing.external_tx_id == external_tx_id {
                return Err(LedgerError::AlreadyProcessed(format!(
                    "external transaction {}",
                    external_tx_id
                )));
            }
            return Err(LedgerError::AlreadySubscribed {
                user_id: customer_id,
                scope: scope.to_string(),
            });
        }

        let customer_wallet = uow.ensure_wallet(customer_id, &plan.currency).await?;
        let platform_wallet =
            LedgerExecutor::require_wallet(uow.as_mut(), self.platform_user_id, &plan.currency)
                .await?;
        let trader_wallet = match scope {
            PlanScope::Trader(trader_id) => {
                Some(uow.ensure_wallet(trader_id, &plan.currency).await?)
            }
            PlanScope::Platform => None,
        };

        let mut wallets = vec![customer_wallet, platform_wallet];
        wallets.extend(trader_wallet);
        LedgerExecutor::lock_in_order(uow.as_mut(), &wallets).await?;

        let replayed = |e: LedgerError| match e {
            LedgerError::DuplicateReference { .. } => {
                LedgerError::AlreadyProcessed(format!("external transaction {}", external_tx_id))
            }
            other => other,
        };

        let debit = LedgerExecutor::debit_in(
            uow.as_mut(),
            customer_wallet,
            Posting::new(
                amount_paid,
                TransactionType::SubscriptionPayment,
                reference.clone(),
                format!("Subscription to {}", plan.name),
            ),
        )
        .await
        .map_err(replayed)?;

        if !split.admin_share.is_zero() {
            LedgerExecutor::credit_in(
                uow.as_mut(),
                platform_wallet,
                Posting::new(
                    split.admin_share,
                    TransactionType::Fee,
                    reference.clone(),
                    format!("Commission on {} (user {})", plan.name, customer_id),
                ),
            )
            .await
            .map_err(replayed)?;
        }

        if let Some(trader_wallet) = trader_wallet.filter(|_| !split.counterpart_share.is_zero()) {
            LedgerExecutor::credit_in(
                uow.as_mut(),
                trader_wallet,
                Posting::new(
                    split.counterpart_share,
                    TransactionType::SubscriptionPayment,
                    reference.clone(),
                    format!("Subscriber {} on {}", customer_id, plan.name),
                ),
            )
            .await
            .map_err(replayed)?;
        }

        let subscription = uow
            .insert_subscription(NewSubscription {
                user_id: customer_id,
                plan_id,
                scope,
                start_date,
                end_date,
                amount_paid,
                currency: plan.currency.clone(),
                admin_share: split.admin_share,
                counterpart_share: split.counterpart_share,
                external_tx_id: external_tx_id.to_string(),
                transaction_id: debit.id,
                grants_role: plan.grants_role,
            })
            .await?;

        if let Some(role) = plan.grants_role {
            uow.mark_role_sync(customer_id, role).await?;
        }
        uow.commit().await?;

        tracing::info!(
            subscription_id = subscription.id,
            customer_id,
            plan_id,
            scope = %scope,
            amount = %amount_paid,
            admin_share = %split.admin_share,
            counterpart_share = %split.counterpart_share,
            "Subscription purchased"
        );

        let role_granted = match plan.grants_role {
            Some(role) => match self.roles.reconcile(customer_id, role).await {
                Ok(RoleChange::Granted) => Some(role),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(
                        subscription_id = subscription.id,
                        customer_id,
                        role = %role,
                        error = %e,
                        "Role grant deferred to the next sync pass"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(PurchaseReceipt {
            subscription_id: subscription.id,
            plan_id,
            plan_name: plan.name,
            amount_paid,
            currency: plan.currency,
            admin_share: split.admin_share,
            counterpart_share: split.counterpart_share,
            transaction_id: debit.id,
            start_date,
            end_date,
            role_granted,
        })
    }

    /// End a subscription now; no refund
    pub async fn cancel(
        &self,
        subscription_id: SubscriptionId,
        user_id: UserId,
    ) -> LedgerResult<Subscription> {
        let mut uow = self.store.begin().await?;
        let mut subscription = uow
            .lock_subscription(subscription_id)
            .await?
            .ok_or(LedgerError::SubscriptionNotFound(subscription_id))?;

        if subscription.user_id != user_id {
            return Err(LedgerError::NotAuthorized {
                subscription_id,
                user_id,
            });
        }
        if !subscription.is_active {
            return Err(LedgerError::AlreadyProcessed(format!(
                "subscription {} is {}",
                subscription_id, subscription.status
            )));
        }

        subscription.is_active = false;
        subscription.status = SubscriptionStatus::Cancelled;
        subscription.end_date = Utc::now();
        uow.save_subscription(&subscription).await?;

        if let Some(role) = subscription.grants_role {
            uow.mark_role_sync(user_id, role).await?;
        }
        uow.commit().await?;

        tracing::info!(subscription_id, user_id, "Subscription cancelled");

        if let Some(role) = subscription.grants_role {
            if let Err(e) = self.roles.reconcile(user_id, role).await {
                tracing::warn!(
                    subscription_id,
                    user_id,
                    role = %role,
                    error = %e,
                    "Role revocation deferred to the next sync pass"
                );
            }
        }

        Ok(subscription)
    }

    pub async fn active_subscriptions(&self, user_id: UserId) -> LedgerResult<Vec<Subscription>> {
        self.store.active_subscriptions(user_id).await
    }
}
