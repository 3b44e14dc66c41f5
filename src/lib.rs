//! Wallet Ledger - wallet ledger and subscription billing engine
//!
//! Moves money between customers, the platform and traders, keeps an
//! append-only transaction log, drives deposit and withdrawal flows to a
//! terminal state, and expires time-boxed subscriptions.
//!
//! # Modules
//!
//! - [`core_types`] - Id aliases (UserId, WalletId, etc.)
//! - [`currency`] - Validated currency codes and minor units
//! - [`money`] - Amount validation, rounding and commission split
//! - [`models`] - Wallets, transactions, requests, subscriptions
//! - [`error`] - Shared error taxonomy
//! - [`store`] - Ledger store and atomic units of work
//! - [`ledger`] - Credit/debit/transfer primitives
//! - [`funding`] - Deposit and withdrawal flows over a payment gateway
//! - [`billing`] - Subscription purchase, cancellation and expiry
//! - [`service`] - Wallet summaries, transaction log, ledger audit

// Core types - must be first!
pub mod core_types;

pub mod currency;
pub mod error;
pub mod models;
pub mod money;

// Ledger
pub mod ledger;
pub mod store;

// Flows
pub mod billing;
pub mod funding;
pub mod service;

// Process plumbing
pub mod app;
pub mod config;
pub mod db;
pub mod logging;

// Convenient re-exports at crate root
pub use billing::{BillingEngine, ExpiryScheduler, SweepReport};
pub use core_types::{SubscriptionId, UserId, WalletId};
pub use currency::CurrencyCode;
pub use error::{Disposition, LedgerError, LedgerResult};
pub use funding::{DepositFlow, ExternalStatus, WithdrawalFlow};
pub use ledger::LedgerExecutor;
pub use service::WalletService;
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore, UnitOfWork};
