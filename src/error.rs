//! Ledger Error Types
//!
//! One error enum for the ledger, the funding flows and billing. Every
//! ledger-mutating error aborts the enclosing unit of work.

use thiserror::Error;

use crate::core_types::{DepositId, PlanId, SubscriptionId, UserId, WalletId, WithdrawId};
use crate::currency::CurrencyCode;
use crate::money::MoneyError;

/// How a caller should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The request itself was invalid; retrying it unchanged will fail again
    Invalid,
    /// Transient failure; the same request may be retried
    Retry,
    /// External state may be unreconciled; a human has to look at it
    ContactSupport,
}

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Currency mismatch: expected {expected}, got {got}")]
    CurrencyMismatch {
        expected: CurrencyCode,
        got: CurrencyCode,
    },

    #[error("Amount paid {paid} does not match plan price {price}")]
    PriceMismatch { paid: String, price: String },

    // === Balance Errors ===
    #[error("Insufficient funds in wallet {wallet_id}: available {available}, requested {requested}")]
    InsufficientFunds {
        wallet_id: WalletId,
        available: String,
        requested: String,
    },

    #[error("Wallet not found for user {user_id} ({currency})")]
    WalletNotFound {
        user_id: UserId,
        currency: CurrencyCode,
    },

    // === Idempotency Errors ===
    #[error("Request already processed: {0}")]
    AlreadyProcessed(String),

    #[error("Duplicate reference {reference_id} on wallet {wallet_id}")]
    DuplicateReference {
        wallet_id: WalletId,
        reference_id: String,
    },

    // === Lookup Errors ===
    #[error("Deposit request not found: {0}")]
    DepositNotFound(DepositId),

    #[error("Withdraw request not found: {0}")]
    WithdrawalNotFound(WithdrawId),

    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Plan is inactive: {0}")]
    PlanInactive(PlanId),

    #[error("User {user_id} already holds an active subscription for {scope}")]
    AlreadySubscribed { user_id: UserId, scope: String },

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Subscription {subscription_id} does not belong to user {user_id}")]
    NotAuthorized {
        subscription_id: SubscriptionId,
        user_id: UserId,
    },

    // === Gateway Errors ===
    #[error("Payment gateway timed out")]
    GatewayTimeout,

    #[error("Payment gateway failure: {0}")]
    GatewayFailure(String),

    /// A payout left for the gateway and its outcome was never confirmed
    #[error("Payout for withdrawal {0} was sent but its outcome is unconfirmed")]
    PayoutUnconfirmed(WithdrawId),

    // === System Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal system error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidRequest(_) => "INVALID_REQUEST",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::PriceMismatch { .. } => "PRICE_MISMATCH",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::WalletNotFound { .. } => "WALLET_NOT_FOUND",
            LedgerError::AlreadyProcessed(_) => "ALREADY_PROCESSED",
            LedgerError::DuplicateReference { .. } => "DUPLICATE_REFERENCE",
            LedgerError::DepositNotFound(_) => "DEPOSIT_NOT_FOUND",
            LedgerError::WithdrawalNotFound(_) => "WITHDRAWAL_NOT_FOUND",
            LedgerError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            LedgerError::PlanInactive(_) => "PLAN_INACTIVE",
            LedgerError::AlreadySubscribed { .. } => "ALREADY_SUBSCRIBED",
            LedgerError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            LedgerError::NotAuthorized { .. } => "NOT_AUTHORIZED",
            LedgerError::GatewayTimeout => "GATEWAY_TIMEOUT",
            LedgerError::GatewayFailure(_) => "GATEWAY_FAILURE",
            LedgerError::PayoutUnconfirmed(_) => "PAYOUT_UNCONFIRMED",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Internal(_) => "SYSTEM_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidRequest(_)
            | LedgerError::CurrencyMismatch { .. }
            | LedgerError::PriceMismatch { .. } => 400,
            LedgerError::NotAuthorized { .. } => 403,
            LedgerError::WalletNotFound { .. }
            | LedgerError::DepositNotFound(_)
            | LedgerError::WithdrawalNotFound(_)
            | LedgerError::PlanNotFound(_)
            | LedgerError::SubscriptionNotFound(_) => 404,
            LedgerError::AlreadyProcessed(_)
            | LedgerError::DuplicateReference { .. }
            | LedgerError::AlreadySubscribed { .. }
            | LedgerError::PayoutUnconfirmed(_) => 409,
            LedgerError::InsufficientFunds { .. } | LedgerError::PlanInactive(_) => 422,
            LedgerError::GatewayFailure(_) => 502,
            LedgerError::Database(_) => 503,
            LedgerError::GatewayTimeout => 504,
            LedgerError::Internal(_) => 500,
        }
    }

    /// Distinguish "invalid" from "try again" from "contact support"
    ///
    /// Gateway errors surface as `GatewayTimeout`/`GatewayFailure` only where
    /// nothing is left open at the gateway; an unknown payout outcome is
    /// `PayoutUnconfirmed`.
    pub fn disposition(&self) -> Disposition {
        match self {
            LedgerError::GatewayTimeout
            | LedgerError::GatewayFailure(_)
            | LedgerError::Database(_) => Disposition::Retry,
            LedgerError::PayoutUnconfirmed(_) | LedgerError::Internal(_) => {
                Disposition::ContactSupport
            }
            _ => Disposition::Invalid,
        }
    }

    pub fn insufficient_funds(
        wallet_id: WalletId,
        available: rust_decimal::Decimal,
        requested: rust_decimal::Decimal,
    ) -> Self {
        LedgerError::InsufficientFunds {
            wallet_id,
            available: available.to_string(),
            requested: requested.to_string(),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

impl From<MoneyError> for LedgerError {
    fn from(e: MoneyError) -> Self {
        LedgerError::InvalidAmount(e.to_string())
    }
}

impl From<anyhow::Error> for LedgerError {
    fn from(e: anyhow::Error) -> Self {
        LedgerError::Internal(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
