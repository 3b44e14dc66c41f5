//! Ledger records
//!
//! Passive data: nothing in here mutates a balance. Wallet balances change only
//! through [`crate::ledger::LedgerExecutor`].
//!
//! Status enums are closed per state machine and stored as SMALLINT ids.
//! Terminal states are never left once reached.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::{
    DepositId, PlanId, SubscriptionId, TransactionId, UserId, WalletId, WithdrawId,
};
use crate::currency::CurrencyCode;

/// Implements `id()`, `from_id()`, `as_str()`, `Display` and `TryFrom<i16>`
/// for a `#[repr(i16)]` status enum.
macro_rules! smallint_enum {
    ($name:ident { $($variant:ident = $id:literal => $label:literal),+ $(,)? }) => {
        impl $name {
            /// Get the numeric ID for PostgreSQL storage
            #[inline]
            pub fn id(&self) -> i16 {
                *self as i16
            }

            /// Convert from PostgreSQL ID
            pub fn from_id(id: i16) -> Option<Self> {
                match id {
                    $($id => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl TryFrom<i16> for $name {
            type Error = ();

            fn try_from(value: i16) -> Result<Self, Self::Error> {
                $name::from_id(value).ok_or(())
            }
        }
    };
}

// ============================================================================
// Wallet & transaction log
// ============================================================================

/// One mutable balance per (user, currency)
///
/// `balance` is a cached projection of the transaction log: it always equals
/// the sum of the `Success` deltas recorded against the wallet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub currency: CurrencyCode,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionType {
    Deposit = 1,
    Withdrawal = 2,
    SubscriptionPayment = 3,
    Fee = 4,
    Reversal = 5,
    TradeProfit = 6,
    TradeLoss = 7,
    ReferralCommission = 8,
}

smallint_enum!(TransactionType {
    Deposit = 1 => "DEPOSIT",
    Withdrawal = 2 => "WITHDRAWAL",
    SubscriptionPayment = 3 => "SUBSCRIPTION_PAYMENT",
    Fee = 4 => "FEE",
    Reversal = 5 => "REVERSAL",
    TradeProfit = 6 => "TRADE_PROFIT",
    TradeLoss = 7 => "TRADE_LOSS",
    ReferralCommission = 8 => "REFERRAL_COMMISSION",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionStatus {
    Pending = 0,
    Success = 1,
    Failed = -1,
}

smallint_enum!(TransactionStatus {
    Pending = 0 => "PENDING",
    Success = 1 => "SUCCESS",
    Failed = -1 => "FAILED",
});

/// Immutable fact in the append-only transaction log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletTransaction {
    pub id: TransactionId,
    pub wallet_id: WalletId,
    pub user_id: UserId,
    pub tx_type: TransactionType,
    /// Signed delta: positive for credits, negative for debits
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub status: TransactionStatus,
    /// Idempotency key, unique per wallet
    pub reference_id: String,
    pub description: String,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Transaction row as handed to the store for appending
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub wallet_id: WalletId,
    pub user_id: UserId,
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub status: TransactionStatus,
    pub reference_id: String,
    pub description: String,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
}

// ============================================================================
// Deposits
// ============================================================================

/// Deposit FSM: `PENDING → SUCCESS | FAILED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum DepositStatus {
    Pending = 0,
    Success = 1,
    Failed = -1,
}

smallint_enum!(DepositStatus {
    Pending = 0 => "PENDING",
    Success = 1 => "SUCCESS",
    Failed = -1 => "FAILED",
});

impl DepositStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DepositStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositRequest {
    pub id: DepositId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub status: DepositStatus,
    pub gateway_tx_id: Option<String>,
    pub redirect_url: Option<String>,
    /// Credit produced by a successful verification
    pub transaction_id: Option<TransactionId>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDepositRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
}

// ============================================================================
// Withdrawals
// ============================================================================

/// Withdrawal FSM
///
/// ```text
/// PENDING ──approve──▶ PAYOUT_PENDING ──confirmed──▶ SUCCESS
///    │                      │
///    │                      └──declined / released──▶ PENDING
///    └──reject──▶ REJECTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum WithdrawStatus {
    Pending = 0,
    Success = 1,
    /// Payout handed to the gateway; outcome not yet recorded
    PayoutPending = 2,
    Rejected = -1,
}

smallint_enum!(WithdrawStatus {
    Pending = 0 => "PENDING",
    Success = 1 => "SUCCESS",
    PayoutPending = 2 => "PAYOUT_PENDING",
    Rejected = -1 => "REJECTED",
});

impl WithdrawStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawStatus::Success | WithdrawStatus::Rejected)
    }
}

/// Bank details of the payout recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beneficiary {
    pub account_holder: String,
    pub account_number: String,
    /// Bank routing code (IFSC, sort code, ...)
    pub bank_code: String,
}

impl Beneficiary {
    /// Check the fields a payout cannot be attempted without
    pub fn validate(&self) -> Result<(), String> {
        let holder = self.account_holder.trim();
        if holder.is_empty() || holder.len() > 128 {
            return Err("account holder must be 1-128 characters".into());
        }

        let number = self.account_number.trim();
        if !(6..=34).contains(&number.len()) || !number.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err("account number must be 6-34 alphanumeric characters".into());
        }

        let code = self.bank_code.trim();
        if code.is_empty() || code.len() > 16 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err("bank code must be 1-16 alphanumeric characters".into());
        }

        Ok(())
    }

    /// Account number with all but the last four characters hidden, for logs
    pub fn masked_account(&self) -> String {
        let number = self.account_number.trim();
        let visible = number.len().saturating_sub(4);
        format!("{}{}", "*".repeat(visible), &number[visible..])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithdrawRequest {
    pub id: WithdrawId,
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub beneficiary: Beneficiary,
    pub status: WithdrawStatus,
    /// Debit that earmarked the funds; set in the same unit that inserts the request
    pub hold_transaction_id: Option<TransactionId>,
    /// Credit that returned the funds on rejection
    pub reversal_transaction_id: Option<TransactionId>,
    pub payout_reference: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWithdrawRequest {
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub beneficiary: Beneficiary,
}

// ============================================================================
// Roles & subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum Role {
    /// Base role every user falls back to
    #[default]
    Customer = 1,
    Trader = 2,
    Admin = 3,
}

smallint_enum!(Role {
    Customer = 1 => "customer",
    Trader = 2 => "trader",
    Admin = 3 => "admin",
});

/// Payment status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum SubscriptionStatus {
    Paid = 1,
    Cancelled = -1,
    Expired = -2,
}

smallint_enum!(SubscriptionStatus {
    Paid = 1 => "paid",
    Cancelled = -1 => "cancelled",
    Expired = -2 => "expired",
});

/// What an active subscription is counted against
///
/// A user holds at most one active subscription per scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlanScope {
    /// Platform plan, sold by the platform itself
    Platform,
    /// Plan sold by a trader; the trader receives the counterpart share
    Trader(UserId),
}

impl PlanScope {
    pub fn from_trader(trader_id: Option<UserId>) -> Self {
        match trader_id {
            Some(id) => PlanScope::Trader(id),
            None => PlanScope::Platform,
        }
    }

    pub fn trader_id(&self) -> Option<UserId> {
        match self {
            PlanScope::Platform => None,
            PlanScope::Trader(id) => Some(*id),
        }
    }
}

impl fmt::Display for PlanScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanScope::Platform => write!(f, "platform"),
            PlanScope::Trader(id) => write!(f, "trader:{}", id),
        }
    }
}

/// Time-boxed entitlement created together with its payment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub scope: PlanScope,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
    pub status: SubscriptionStatus,
    pub amount_paid: Decimal,
    pub currency: CurrencyCode,
    pub admin_share: Decimal,
    pub counterpart_share: Decimal,
    pub external_tx_id: String,
    /// Customer debit that paid for this subscription
    pub transaction_id: TransactionId,
    /// Role the subscription entitles its holder to, if any
    pub grants_role: Option<Role>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active and past its end date at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.end_date < now
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub scope: PlanScope,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub amount_paid: Decimal,
    pub currency: CurrencyCode,
    pub admin_share: Decimal,
    pub counterpart_share: Decimal,
    pub external_tx_id: String,
    pub transaction_id: TransactionId,
    pub grants_role: Option<Role>,
}

/// A user whose role has to be brought in line with the active
/// subscriptions granting `role`
///
/// Written in the same unit as the subscription change; removed once the
/// directory agrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RoleSync {
    pub user_id: UserId,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!DepositStatus::Pending.is_terminal());
        assert!(DepositStatus::Success.is_terminal());
        assert!(DepositStatus::Failed.is_terminal());

        assert!(!WithdrawStatus::Pending.is_terminal());
        assert!(!WithdrawStatus::PayoutPending.is_terminal());
        assert!(WithdrawStatus::Success.is_terminal());
        assert!(WithdrawStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_state_ids() {
        assert_eq!(TransactionType::from_id(5), Some(TransactionType::Reversal));
        assert_eq!(TransactionStatus::from_id(-1), Some(TransactionStatus::Failed));
        assert_eq!(WithdrawStatus::from_id(-1), Some(WithdrawStatus::Rejected));
        assert_eq!(WithdrawStatus::from_id(2), Some(WithdrawStatus::PayoutPending));
        assert_eq!(SubscriptionStatus::from_id(-2), Some(SubscriptionStatus::Expired));
        assert_eq!(Role::from_id(2), Some(Role::Trader));
    }

    #[test]
    fn test_invalid_state_id() {
        assert!(DepositStatus::from_id(7).is_none());
        assert!(TransactionType::from_id(0).is_none());
        assert!(Role::try_from(0).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransactionType::SubscriptionPayment.to_string(), "SUBSCRIPTION_PAYMENT");
        assert_eq!(SubscriptionStatus::Expired.to_string(), "expired");
        assert_eq!(PlanScope::Trader(42).to_string(), "trader:42");
        assert_eq!(PlanScope::Platform.to_string(), "platform");
    }

    #[test]
    fn test_beneficiary_validation() {
        let ok = Beneficiary {
            account_holder: "Asha Rao".into(),
            account_number: "000123456789".into(),
            bank_code: "HDFC0001234".into(),
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.masked_account(), "********6789");

        let short = Beneficiary {
            account_number: "123".into(),
            ..ok.clone()
        };
        assert!(short.validate().is_err());

        let no_holder = Beneficiary {
            account_holder: "  ".into(),
            ..ok
        };
        assert!(no_holder.validate().is_err());
    }

    #[test]
    fn test_plan_scope_roundtrip() {
        assert_eq!(PlanScope::from_trader(None), PlanScope::Platform);
        assert_eq!(PlanScope::from_trader(Some(9)).trader_id(), Some(9));
    }
}
