//! Payment gateway collaborator
//!
//! The external gateway is opaque: three fallible, latency-bearing calls.
//! Flows never call it directly; they go through [`call_with_timeout`] so every
//! call is time-bounded.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use ulid::Ulid;

use crate::currency::CurrencyCode;
use crate::error::LedgerError;
use crate::models::Beneficiary;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Gateway declined: {0}")]
    Declined(String),
    #[error("Gateway network error: {0}")]
    Network(String),
}

impl From<GatewayError> for LedgerError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Timeout(_) => LedgerError::GatewayTimeout,
            other => LedgerError::GatewayFailure(other.to_string()),
        }
    }
}

/// Result of a deposit initiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositSession {
    pub gateway_tx_id: String,
    /// Where the user completes payment, if the gateway uses a redirect
    pub redirect_url: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync + Debug {
    /// Gateway name for logging
    fn name(&self) -> &'static str;

    async fn initiate_deposit(
        &self,
        amount: Decimal,
        currency: &CurrencyCode,
        user_ref: &str,
    ) -> Result<DepositSession, GatewayError>;

    /// Whether the gateway reports the deposit as paid
    async fn verify_deposit(&self, gateway_tx_id: &str) -> Result<bool, GatewayError>;

    /// Send a payout; returns the gateway's payout reference
    async fn process_withdrawal(
        &self,
        amount: Decimal,
        currency: &CurrencyCode,
        beneficiary: &Beneficiary,
    ) -> Result<String, GatewayError>;
}

/// Bound a gateway call by `limit`
pub async fn call_with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}

// ============================================================================
// Sandbox gateway
// ============================================================================

/// Local gateway for development runs
///
/// Deposits it issued verify as paid; unknown ids verify as unpaid. Payouts
/// always succeed.
#[derive(Debug, Default)]
pub struct SandboxGateway {
    issued: DashMap<String, Decimal>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn initiate_deposit(
        &self,
        amount: Decimal,
        _currency: &CurrencyCode,
        _user_ref: &str,
    ) -> Result<DepositSession, GatewayError> {
        let gateway_tx_id = format!("sbx_dep_{}", Ulid::new());
        self.issued.insert(gateway_tx_id.clone(), amount);
        Ok(DepositSession {
            redirect_url: Some(format!("https://sandbox.invalid/checkout/{}", gateway_tx_id)),
            gateway_tx_id,
        })
    }

    async fn verify_deposit(&self, gateway_tx_id: &str) -> Result<bool, GatewayError> {
        Ok(self.issued.contains_key(gateway_tx_id))
    }

    async fn process_withdrawal(
        &self,
        _amount: Decimal,
        _currency: &CurrencyCode,
        _beneficiary: &Beneficiary,
    ) -> Result<String, GatewayError> {
        Ok(format!("sbx_po_{}", Ulid::new()))
    }
}

// ============================================================================
// Mock gateway
// ============================================================================

/// Scriptable gateway for tests: per-call failure toggles, artificial latency
/// and call counters
#[derive(Debug)]
pub struct MockGateway {
    initiate_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    payout_calls: AtomicUsize,
    fail_initiate: AtomicBool,
    fail_verify: AtomicBool,
    fail_payout: AtomicBool,
    deposit_paid: AtomicBool,
    latency_ms: AtomicU64,
    seq: AtomicU64,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            initiate_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            payout_calls: AtomicUsize::new(0),
            fail_initiate: AtomicBool::new(false),
            fail_verify: AtomicBool::new(false),
            fail_payout: AtomicBool::new(false),
            deposit_paid: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        }
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_initiate(&self, fail: bool) {
        self.fail_initiate.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_verify(&self, fail: bool) {
        self.fail_verify.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_payout(&self, fail: bool) {
        self.fail_payout.store(fail, Ordering::SeqCst);
    }

    /// What `verify_deposit` reports (default: paid)
    pub fn set_deposit_paid(&self, paid: bool) {
        self.deposit_paid.store(paid, Ordering::SeqCst);
    }

    /// Delay applied to every call, to provoke timeouts
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn payout_calls(&self) -> usize {
        self.payout_calls.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn initiate_deposit(
        &self,
        _amount: Decimal,
        _currency: &CurrencyCode,
        _user_ref: &str,
    ) -> Result<DepositSession, GatewayError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_initiate.load(Ordering::SeqCst) {
            return Err(GatewayError::Declined("initiation refused".into()));
        }
        let gateway_tx_id = self.next_id("mock_dep");
        Ok(DepositSession {
            redirect_url: Some(format!("https://mock.invalid/pay/{}", gateway_tx_id)),
            gateway_tx_id,
        })
    }

    async fn verify_deposit(&self, _gateway_tx_id: &str) -> Result<bool, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_verify.load(Ordering::SeqCst) {
            return Err(GatewayError::Network("connection reset".into()));
        }
        Ok(self.deposit_paid.load(Ordering::SeqCst))
    }

    async fn process_withdrawal(
        &self,
        _amount: Decimal,
        _currency: &CurrencyCode,
        _beneficiary: &Beneficiary,
    ) -> Result<String, GatewayError> {
        self.payout_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_payout.load(Ordering::SeqCst) {
            return Err(GatewayError::Declined("beneficiary bank rejected payout".into()));
        }
        Ok(self.next_id("mock_po"))
    }
}
