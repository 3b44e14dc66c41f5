//! Ledger
//!
//! [`LedgerExecutor`] is the only component that writes wallet balances. Flows
//! and billing compose its unit-scoped primitives inside one [`UnitOfWork`]
//! and commit once.
//!
//! [`UnitOfWork`]: crate::store::UnitOfWork

pub mod executor;

pub use executor::LedgerExecutor;
