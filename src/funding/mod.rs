//! Funding flows
//!
//! Inbound ([`deposit`]) and outbound ([`withdraw`]) money, both driven through
//! the [`gateway::PaymentGateway`] collaborator.

pub mod deposit;
pub mod gateway;
pub mod withdraw;

pub use deposit::{DepositFlow, ExternalStatus};
pub use gateway::{DepositSession, GatewayError, MockGateway, PaymentGateway, SandboxGateway};
pub use withdraw::{PayoutResolution, WithdrawalFlow};
