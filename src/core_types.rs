//! Core types used throughout the system
//!
//! Identifier aliases shared by the ledger, the funding flows and billing.
//! All of them map onto PostgreSQL `BIGINT` / `BIGSERIAL` columns.

/// User ID - owner of wallets, requests and subscriptions.
///
/// Assigned by the user directory; the ledger never allocates user ids.
pub type UserId = i64;

/// Wallet ID - one wallet per (user, currency).
///
/// Wallet locks are always taken in ascending `WalletId` order.
pub type WalletId = i64;

/// Wallet transaction ID - row in the append-only transaction log
pub type TransactionId = i64;

/// Deposit request ID
pub type DepositId = i64;

/// Withdraw request ID
pub type WithdrawId = i64;

/// Subscription ID
pub type SubscriptionId = i64;

/// Plan ID - key into the plan catalog
pub type PlanId = i64;
