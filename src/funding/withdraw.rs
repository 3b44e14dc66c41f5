//! Withdrawal Flow
//!
//! `PENDING → PAYOUT_PENDING → SUCCESS`, or `PENDING → REJECTED`
//!
//! 1. `request`: debit the wallet (hold) and create the PENDING request in one unit
//! 2. `approve`: mark PAYOUT_PENDING, pay out through the gateway, then mark SUCCESS
//! 3. `reject`: credit the hold back with a REVERSAL transaction, mark REJECTED
//!
//! The original hold debit is never modified. A request whose payout outcome
//! is unknown can be neither approved nor rejected until `resolve_payout`.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use super::gateway::{GatewayError, PaymentGateway, call_with_timeout};
use crate::core_types::{UserId, WithdrawId};
use crate::currency::CurrencyCode;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::LedgerExecutor;
use crate::ledger::executor::Posting;
use crate::models::{
    Beneficiary, NewWithdrawRequest, TransactionType, WithdrawRequest, WithdrawStatus,
};
use crate::money::validate_amount;
use crate::store::LedgerStore;

/// Manual settlement of a payout whose outcome was unknown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutResolution {
    /// The gateway executed the transfer under this reference
    Paid { payout_reference: String },
    /// The gateway never executed it
    NotPaid,
}

pub struct WithdrawalFlow {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    gateway_timeout: Duration,
}

impl WithdrawalFlow {
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

    /// Hold the funds and open a PENDING request
    ///
    /// `InsufficientFunds` leaves no request row and no transaction.
    pub async fn request(
        &self,
        user_id: UserId,
        amount: Decimal,
        currency: &CurrencyCode,
        beneficiary: Beneficiary,
    ) -> LedgerResult<WithdrawRequest> {
        validate_amount(amount, currency)?;
        beneficiary.validate().map_err(LedgerError::InvalidRequest)?;

        let mut uow = self.store.begin().await?;
        let wallet_id = uow.ensure_wallet(user_id, currency).await?;
        let mut request = uow
            .insert_withdrawal(NewWithdrawRequest {
                user_id,
                wallet_id,
                amount,
                currency: currency.clone(),
                beneficiary,
            })
            .await?;

        let hold = LedgerExecutor::debit_in(
            uow.as_mut(),
            wallet_id,
            Posting::new(
                amount,
                TransactionType::Withdrawal,
                format!("withdraw:{}", request.id),
                format!(
                    "Withdrawal hold to {}",
                    request.beneficiary.masked_account()
                ),
            ),
        )
        .await?;

        request.hold_transaction_id = Some(hold.id);
        uow.save_withdrawal(&request).await?;
        uow.commit().await?;

        tracing::info!(
            request_id = request.id,
            user_id,
            wallet_id,
            amount = %amount,
            balance_after = %hold.balance_after,
            "Withdrawal requested, funds held"
        );
        Ok(request)
    }

    /// Pay out a PENDING request and mark it SUCCESS
    ///
    /// The request is committed as PAYOUT_PENDING before the gateway is
    /// called; no lock is held during the call.
    ///
    /// - declined by the gateway: back to PENDING, `GatewayFailure`
    /// - timeout or transport error: stays PAYOUT_PENDING, `PayoutUnconfirmed`
    ///   until [`resolve_payout`](Self::resolve_payout) settles it
    pub async fn approve(&self, request_id: WithdrawId) -> LedgerResult<WithdrawRequest> {
        let request = self.claim_payout(request_id).await?;

        let outcome = call_with_timeout(
            self.gateway_timeout,
            self.gateway
                .process_withdrawal(request.amount, &request.currency, &request.beneficiary),
        )
        .await;

        let payout_reference = match outcome {
            Ok(payout_reference) => payout_reference,
            Err(declined @ GatewayError::Declined(_)) => {
                tracing::warn!(request_id, error = %declined, "Payout declined, request back to pending");
                if let Err(e) = self.settle_payout(request_id, None).await {
                    tracing::error!(
                        request_id,
                        error = %e,
                        "Declined payout could not be released"
                    );
                }
                return Err(declined.into());
            }
            Err(unknown) => {
                tracing::error!(
                    request_id,
                    user_id = request.user_id,
                    amount = %request.amount,
                    error = %unknown,
                    "Payout outcome unknown, withdrawal needs manual resolution"
                );
                return Err(LedgerError::PayoutUnconfirmed(request_id));
            }
        };

        let approved = self
            .settle_payout(request_id, Some(payout_reference.clone()))
            .await
            .map_err(|e| {
                tracing::error!(
                    request_id,
                    payout_reference = %payout_reference,
                    error = %e,
                    "Payout sent but approval not recorded"
                );
                LedgerError::PayoutUnconfirmed(request_id)
            })?;

        tracing::info!(
            request_id,
            user_id = approved.user_id,
            amount = %approved.amount,
            payout_reference = %payout_reference,
            "Withdrawal approved"
        );
        Ok(approved)
    }

    /// Settle a PAYOUT_PENDING request once the gateway outcome is known
    ///
    /// `Paid` completes it; `NotPaid` returns it to PENDING so it can be
    /// approved again or rejected.
    pub async fn resolve_payout(
        &self,
        request_id: WithdrawId,
        resolution: PayoutResolution,
    ) -> LedgerResult<WithdrawRequest> {
        let payout_reference = match resolution {
            PayoutResolution::Paid { payout_reference } => {
                let payout_reference = payout_reference.trim().to_string();
                if payout_reference.is_empty() {
                    return Err(LedgerError::InvalidRequest(
                        "payout reference is required".into(),
                    ));
                }
                Some(payout_reference)
            }
            PayoutResolution::NotPaid => None,
        };

        let request = self.settle_payout(request_id, payout_reference).await?;
        tracing::info!(
            request_id,
            status = %request.status,
            payout_reference = ?request.payout_reference,
            "Unconfirmed payout resolved"
        );
        Ok(request)
    }

    /// Move a PENDING request to PAYOUT_PENDING and commit
    async fn claim_payout(&self, request_id: WithdrawId) -> LedgerResult<WithdrawRequest> {
        let mut uow = self.store.begin().await?;
        let mut request = uow
            .lock_withdrawal(request_id)
            .await?
            .ok_or(LedgerError::WithdrawalNotFound(request_id))?;
        ensure_pending(&request)?;

        request.status = WithdrawStatus::PayoutPending;
        uow.save_withdrawal(&request).await?;
        uow.commit().await?;
        Ok(request)
    }

    /// PAYOUT_PENDING → SUCCESS with a reference, or back to PENDING without
    async fn settle_payout(
        &self,
        request_id: WithdrawId,
        payout_reference: Option<String>,
    ) -> LedgerResult<WithdrawRequest> {
        let mut uow = self.store.begin().await?;
        let mut request = uow
            .lock_withdrawal(request_id)
            .await?
            .ok_or(LedgerError::WithdrawalNotFound(request_id))?;
        if request.status != WithdrawStatus::PayoutPending {
            return Err(LedgerError::InvalidRequest(format!(
                "withdrawal {} has no payout awaiting confirmation ({})",
                request_id, request.status
            )));
        }

        request.status = match payout_reference {
            Some(_) => WithdrawStatus::Success,
            None => WithdrawStatus::Pending,
        };
        request.payout_reference = payout_reference;
        uow.save_withdrawal(&request).await?;
        uow.commit().await?;
        Ok(request)
    }

    /// Return the held funds and mark the request REJECTED
    pub async fn reject(
        &self,
        request_id: WithdrawId,
        reason: Option<&str>,
    ) -> LedgerResult<WithdrawRequest> {
        let mut uow = self.store.begin().await?;
        let mut request = uow
            .lock_withdrawal(request_id)
            .await?
            .ok_or(LedgerError::WithdrawalNotFound(request_id))?;
        ensure_pending(&request)?;

        let reversal = LedgerExecutor::credit_in(
            uow.as_mut(),
            request.wallet_id,
            Posting::new(
                request.amount,
                TransactionType::Reversal,
                format!("withdraw-reversal:{}", request_id),
                format!("Reversal of withdrawal {}", request_id),
            ),
        )
        .await
        .map_err(|e| match e {
            LedgerError::DuplicateReference { .. } => {
                LedgerError::AlreadyProcessed(format!("withdrawal {}", request_id))
            }
            other => other,
        })?;

        request.status = WithdrawStatus::Rejected;
        request.reversal_transaction_id = Some(reversal.id);
        request.rejection_reason = reason.map(str::to_string);
        uow.save_withdrawal(&request).await?;
        uow.commit().await?;

        tracing::info!(
            request_id,
            user_id = request.user_id,
            amount = %request.amount,
            balance_after = %reversal.balance_after,
            "Withdrawal rejected, funds returned"
        );
        Ok(request)
    }

    pub async fn get(&self, request_id: WithdrawId) -> LedgerResult<WithdrawRequest> {
        self.store
            .withdrawal(request_id)
            .await?
            .ok_or(LedgerError::WithdrawalNotFound(request_id))
    }

    /// Requests awaiting an admin decision, oldest first
    pub async fn pending(&self, limit: i64) -> LedgerResult<Vec<WithdrawRequest>> {
        self.store
            .withdrawals_with_status(WithdrawStatus::Pending, limit)
            .await
    }

    /// Payouts sent without a recorded outcome, oldest first
    pub async fn unconfirmed(&self, limit: i64) -> LedgerResult<Vec<WithdrawRequest>> {
        self.store
            .withdrawals_with_status(WithdrawStatus::PayoutPending, limit)
            .await
    }

    /// A user's withdrawals, newest first
    pub async fn history(&self, user_id: UserId) -> LedgerResult<Vec<WithdrawRequest>> {
        self.store.withdrawals_for_user(user_id).await
    }
}

fn ensure_pending(request: &WithdrawRequest) -> LedgerResult<()> {
    match request.status {
        WithdrawStatus::Pending => Ok(()),
        WithdrawStatus::PayoutPending => Err(LedgerError::PayoutUnconfirmed(request.id)),
        status => Err(LedgerError::AlreadyProcessed(format!(
            "withdrawal {} is {}",
            request.id, status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::gateway::MockGateway;
    use crate::store::MemoryLedgerStore;
    use std::str::FromStr;

    fn inr() -> CurrencyCode {
        CurrencyCode::new("INR").unwrap()
    }

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn beneficiary() -> Beneficiary {
        Beneficiary {
            account_holder: "Ravi Kumar".into(),
            account_number: "004512345678".into(),
            bank_code: "SBIN0000456".into(),
        }
    }

    async fn setup(initial: &str) -> (MemoryLedgerStore, Arc<MockGateway>, WithdrawalFlow) {
        let store = MemoryLedgerStore::new();
        let executor = LedgerExecutor::new(Arc::new(store.clone()));
        let wallet = executor.provision_wallet(1, &inr()).await.unwrap();
        executor
            .credit(wallet.id, d(initial), TransactionType::Deposit, "deposit:seed", "seed")
            .await
            .unwrap();

        let gateway = Arc::new(MockGateway::new());
        let flow = WithdrawalFlow::new(
            Arc::new(store.clone()),
            gateway.clone(),
            Duration::from_millis(100),
        );
        (store, gateway, flow)
    }

    async fn balance(store: &MemoryLedgerStore) -> Decimal {
        store.find_wallet(1, &inr()).await.unwrap().unwrap().balance
    }

    #[tokio::test]
    async fn test_request_holds_funds() {
        let (store, _gateway, flow) = setup("500.00").await;
        let request = flow
            .request(1, d("200.00"), &inr(), beneficiary())
            .await
            .unwrap();

        assert_eq!(request.status, WithdrawStatus::Pending);
        assert!(request.hold_transaction_id.is_some());
        assert_eq!(balance(&store).await, d("300.00"));
    }

    #[tokio::test]
    async fn test_approve_pays_out_without_wallet_change() {
        let (store, gateway, flow) = setup("500.00").await;
        let request = flow
            .request(1, d("200.00"), &inr(), beneficiary())
            .await
            .unwrap();

        let approved = flow.approve(request.id).await.unwrap();
        assert_eq!(approved.status, WithdrawStatus::Success);
        assert_eq!(approved.payout_reference.as_deref(), Some("mock_po_1"));
        assert_eq!(gateway.payout_calls(), 1);
        assert_eq!(balance(&store).await, d("300.00"));

        let err = flow.approve(request.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyProcessed(_)));
        let err = flow.reject(request.id, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyProcessed(_)));
        assert_eq!(gateway.payout_calls(), 1);
    }

    #[tokio::test]
    async fn test_declined_payout_back_to_pending() {
        let (store, gateway, flow) = setup("500.00").await;
        let request = flow
            .request(1, d("200.00"), &inr(), beneficiary())
            .await
            .unwrap();

        gateway.set_fail_payout(true);
        let err = flow.approve(request.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::GatewayFailure(_)));
        assert_eq!(err.disposition(), crate::error::Disposition::Retry);
        assert_eq!(flow.get(request.id).await.unwrap().status, WithdrawStatus::Pending);

        gateway.set_fail_payout(false);
        let approved = flow.approve(request.id).await.unwrap();
        assert_eq!(approved.status, WithdrawStatus::Success);
        assert_eq!(gateway.payout_calls(), 2);
        assert_eq!(balance(&store).await, d("300.00"));
    }

    #[tokio::test]
    async fn test_timed_out_payout_blocks_reject_and_reapprove() {
        let (store, gateway, flow) = setup("500.00").await;
        let request = flow
            .request(1, d("200.00"), &inr(), beneficiary())
            .await
            .unwrap();

        gateway.set_latency(Duration::from_millis(500));
        let err = flow.approve(request.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::PayoutUnconfirmed(id) if id == request.id));
        assert_eq!(err.disposition(), crate::error::Disposition::ContactSupport);
        assert_eq!(gateway.payout_calls(), 1);
        assert_eq!(
            flow.get(request.id).await.unwrap().status,
            WithdrawStatus::PayoutPending
        );

        // the money may already be at the bank: no refund, no second payout
        gateway.set_latency(Duration::ZERO);
        let err = flow.reject(request.id, Some("changed mind")).await.unwrap_err();
        assert!(matches!(err, LedgerError::PayoutUnconfirmed(_)));
        let err = flow.approve(request.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::PayoutUnconfirmed(_)));
        assert_eq!(gateway.payout_calls(), 1);
        assert_eq!(balance(&store).await, d("300.00"));

        assert!(flow.pending(10).await.unwrap().is_empty());
        let unconfirmed: Vec<_> = flow.unconfirmed(10).await.unwrap().iter().map(|w| w.id).collect();
        assert_eq!(unconfirmed, vec![request.id]);

        let settled = flow
            .resolve_payout(
                request.id,
                PayoutResolution::Paid {
                    payout_reference: "bank_ref_881".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(settled.status, WithdrawStatus::Success);
        assert_eq!(settled.payout_reference.as_deref(), Some("bank_ref_881"));
        assert_eq!(balance(&store).await, d("300.00"));

        let err = flow
            .resolve_payout(request.id, PayoutResolution::NotPaid)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unpaid_resolution_allows_reject() {
        let (store, gateway, flow) = setup("500.00").await;
        let request = flow
            .request(1, d("200.00"), &inr(), beneficiary())
            .await
            .unwrap();

        gateway.set_latency(Duration::from_millis(500));
        flow.approve(request.id).await.unwrap_err();

        let err = flow
            .resolve_payout(
                request.id,
                PayoutResolution::Paid {
                    payout_reference: "  ".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));

        let released = flow
            .resolve_payout(request.id, PayoutResolution::NotPaid)
            .await
            .unwrap();
        assert_eq!(released.status, WithdrawStatus::Pending);

        let rejected = flow.reject(request.id, Some("bank confirms no transfer")).await.unwrap();
        assert_eq!(rejected.status, WithdrawStatus::Rejected);
        assert_eq!(balance(&store).await, d("500.00"));
    }

    #[tokio::test]
    async fn test_reject_twice_credits_once() {
        let (store, _gateway, flow) = setup("500.00").await;
        let request = flow
            .request(1, d("200.00"), &inr(), beneficiary())
            .await
            .unwrap();

        flow.reject(request.id, Some("kyc mismatch")).await.unwrap();
        let err = flow.reject(request.id, None).await.unwrap_err();

        assert!(matches!(err, LedgerError::AlreadyProcessed(_)));
        assert_eq!(balance(&store).await, d("500.00"));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let (store, _gateway, flow) = setup("500.00").await;

        let bad = Beneficiary {
            account_number: "12".into(),
            ..beneficiary()
        };
        let err = flow.request(1, d("10"), &inr(), bad).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));

        let err = flow
            .request(1, d("0"), &inr(), beneficiary())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert!(flow.history(1).await.unwrap().is_empty());
        assert_eq!(balance(&store).await, d("500.00"));
    }

    #[tokio::test]
    async fn test_request_without_wallet_creates_nothing() {
        let (store, _gateway, flow) = setup("500.00").await;
        let err = flow
            .request(2, d("1"), &inr(), beneficiary())
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert!(store.find_wallet(2, &inr()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_lists_oldest_first() {
        let (_store, _gateway, flow) = setup("500.00").await;
        let first = flow.request(1, d("10"), &inr(), beneficiary()).await.unwrap();
        let second = flow.request(1, d("20"), &inr(), beneficiary()).await.unwrap();
        flow.reject(first.id, None).await.unwrap();
        let third = flow.request(1, d("30"), &inr(), beneficiary()).await.unwrap();

        let pending: Vec<_> = flow.pending(10).await.unwrap().iter().map(|w| w.id).collect();
        assert_eq!(pending, vec![second.id, third.id]);

        let history: Vec<_> = flow.history(1).await.unwrap().iter().map(|w| w.id).collect();
        assert_eq!(history, vec![third.id, second.id, first.id]);
    }
}
