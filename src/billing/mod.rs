//! Subscription billing
//!
//! - [`engine`] - purchase and cancel, with the three-way commission split
//! - [`expiry`] - periodic deactivation of lapsed subscriptions
//! - [`plan`] - plan catalog
//! - [`directory`] - user roles granted by subscriptions
//! - [`entitlement`] - keeps those roles in line with active subscriptions

pub mod directory;
pub mod engine;
pub mod entitlement;
pub mod expiry;
pub mod plan;

pub use directory::{InMemoryUserDirectory, PgUserDirectory, UserDirectory};
pub use engine::{BillingEngine, PurchaseReceipt};
pub use entitlement::{RoleChange, RoleReconciler, RoleSyncReport};
pub use expiry::{ExpiryScheduler, SchedulerHandle, SweepReport};
pub use plan::{BillingInterval, Plan, PlanCatalog, StaticPlanCatalog};
