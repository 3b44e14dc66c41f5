//! Deposit Flow
//!
//! `PENDING → SUCCESS | FAILED`, driven by the payment gateway.
//!
//! Initiation writes the request before calling the gateway, so a request id
//! exists for every gateway session. Verification credits the wallet and
//! closes the request in one unit; the `deposit:{id}` reference makes a second
//! credit impossible even if the status guard were bypassed.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::gateway::{PaymentGateway, call_with_timeout};
use crate::core_types::{DepositId, UserId};
use crate::currency::CurrencyCode;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::LedgerExecutor;
use crate::ledger::executor::Posting;
use crate::models::{DepositRequest, DepositStatus, NewDepositRequest, TransactionType};
use crate::money::validate_amount;
use crate::store::{LedgerStore, UnitOfWork};

/// Outcome reported by the gateway (webhook or poll)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalStatus {
    Success,
    Failed,
}

pub struct DepositFlow {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    gateway_timeout: Duration,
}

impl DepositFlow {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            gateway_timeout,
        }
    }

    /// Create a PENDING request and open a gateway session for it
    ///
    /// A gateway failure or timeout closes the request as FAILED and is
    /// returned to the caller; no PENDING request is left without a session.
    pub async fn initiate(
        &self,
        user_id: UserId,
        amount: Decimal,
        currency: &CurrencyCode,
    ) -> LedgerResult<DepositRequest> {
        validate_amount(amount, currency)?;

        let mut uow = self.store.begin().await?;
        let mut request = uow
            .insert_deposit(NewDepositRequest {
                user_id,
                amount,
                currency: currency.clone(),
            })
            .await?;
        uow.commit().await?;

        let user_ref = format!("user:{}:deposit:{}", user_id, request.id);
        let session = call_with_timeout(
            self.gateway_timeout,
            self.gateway.initiate_deposit(amount, currency, &user_ref),
        )
        .await;

        let mut uow = self.store.begin().await?;
        match session {
            Ok(session) => {
                request.gateway_tx_id = Some(session.gateway_tx_id);
                request.redirect_url = session.redirect_url;
                uow.save_deposit(&request).await?;
                uow.commit().await?;

                tracing::info!(
                    request_id = request.id,
                    user_id,
                    amount = %amount,
                    gateway = self.gateway.name(),
                    gateway_tx_id = ?request.gateway_tx_id,
                    "Deposit initiated"
                );
                Ok(request)
            }
            Err(e) => {
                request.status = DepositStatus::Failed;
                request.failure_reason = Some(e.to_string());
                if let Err(save_err) = save_and_commit(uow, &request).await {
                    tracing::error!(
                        request_id = request.id,
                        error = %save_err,
                        "Failed to close deposit after gateway error"
                    );
                }

                tracing::warn!(
                    request_id = request.id,
                    user_id,
                    error = %e,
                    "Deposit initiation failed"
                );
                Err(e.into())
            }
        }
    }

    /// Apply the gateway's verdict to a PENDING request
    ///
    /// Fails with `AlreadyProcessed` once the request is terminal, so
    /// duplicate webhook deliveries credit at most once.
    pub async fn verify(
        &self,
        request_id: DepositId,
        status: ExternalStatus,
        external_tx_id: &str,
    ) -> LedgerResult<DepositRequest> {
        let mut uow = self.store.begin().await?;
        let mut request = uow
            .lock_deposit(request_id)
            .await?
            .ok_or(LedgerError::DepositNotFound(request_id))?;

        if request.status.is_terminal() {
            tracing::info!(
                request_id,
                status = %request.status,
                "Deposit verification ignored: already processed"
            );
            return Err(LedgerError::AlreadyProcessed(format!(
                "deposit {} is {}",
                request_id, request.status
            )));
        }

        match request.gateway_tx_id.as_deref() {
            Some(known) if known != external_tx_id => {
                return Err(LedgerError::InvalidRequest(format!(
                    "gateway transaction {} does not belong to deposit {}",
                    external_tx_id, request_id
                )));
            }
            Some(_) => {}
            None => request.gateway_tx_id = Some(external_tx_id.to_string()),
        }

        match status {
            ExternalStatus::Success => {
                let wallet_id = uow.ensure_wallet(request.user_id, &request.currency).await?;
                let tx = LedgerExecutor::credit_in(
                    uow.as_mut(),
                    wallet_id,
                    Posting::new(
                        request.amount,
                        TransactionType::Deposit,
                        format!("deposit:{}", request_id),
                        format!("Deposit via gateway {}", external_tx_id),
                    ),
                )
                .await
                .map_err(|e| match e {
                    LedgerError::DuplicateReference { .. } => {
                        LedgerError::AlreadyProcessed(format!("deposit {}", request_id))
                    }
                    other => other,
                })?;

                request.status = DepositStatus::Success;
                request.transaction_id = Some(tx.id);
            }
            ExternalStatus::Failed => {
                request.status = DepositStatus::Failed;
                request.failure_reason = Some("reported failed by gateway".into());
            }
        }

        save_and_commit(uow, &request).await?;

        tracing::info!(
            request_id,
            user_id = request.user_id,
            amount = %request.amount,
            status = %request.status,
            transaction_id = ?request.transaction_id,
            "Deposit verified"
        );
        Ok(request)
    }

    /// Poll the gateway for a PENDING request and apply the answer
    ///
    /// Gateway errors are returned and leave the request PENDING.
    pub async fn reconcile(&self, request_id: DepositId) -> LedgerResult<DepositRequest> {
        let request = self.get(request_id).await?;
        if request.status.is_terminal() {
            return Err(LedgerError::AlreadyProcessed(format!(
                "deposit {} is {}",
                request_id, request.status
            )));
        }
        let gateway_tx_id = request.gateway_tx_id.ok_or_else(|| {
            LedgerError::InvalidRequest(format!(
                "deposit {} has no gateway transaction",
                request_id
            ))
        })?;

        let paid = call_with_timeout(
            self.gateway_timeout,
            self.gateway.verify_deposit(&gateway_tx_id),
        )
        .await
        .inspect_err(|e| {
            tracing::warn!(request_id, error = %e, "Deposit reconcile: gateway unavailable");
        })?;

        let status = if paid {
            ExternalStatus::Success
        } else {
            ExternalStatus::Failed
        };
        self.verify(request_id, status, &gateway_tx_id).await
    }

    pub async fn get(&self, request_id: DepositId) -> LedgerResult<DepositRequest> {
        self.store
            .deposit(request_id)
            .await?
            .ok_or(LedgerError::DepositNotFound(request_id))
    }

    /// A user's deposits, newest first
    pub async fn history(&self, user_id: UserId) -> LedgerResult<Vec<DepositRequest>> {
        self.store.deposits_for_user(user_id).await
    }
}

async fn save_and_commit(
    mut uow: Box<dyn UnitOfWork>,
    request: &DepositRequest,
) -> LedgerResult<()> {
    uow.save_deposit(request).await?;
    uow.commit().await
}
