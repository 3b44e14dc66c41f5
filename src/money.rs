//! Money Module
//!
//! Fixed-point arithmetic for wallet amounts. All amounts are `rust_decimal::Decimal`
//! values whose scale never exceeds the currency's minor unit.
//!
//! ## Design Principles
//! 1. No floats anywhere on the money path
//! 2. Explicit Error Handling: No silent truncation of client input
//! 3. Rounding happens in exactly one place (`round_to_minor`), half-up
//!
//! ## Usage
//! ```rust
//! use rust_decimal::Decimal;
//! use wallet_ledger::currency::CurrencyCode;
//! use wallet_ledger::money::{parse_amount, split_commission};
//!
//! let inr = CurrencyCode::new("INR").unwrap();
//! let paid = parse_amount("100.00", &inr).unwrap();
//! let split = split_commission(paid, Decimal::new(20, 2), &inr);
//! assert_eq!(split.admin_share, Decimal::new(2000, 2));
//! assert_eq!(split.counterpart_share, Decimal::new(8000, 2));
//! ```

use crate::currency::CurrencyCode;
use rust_decimal::prelude::*;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Commission rate must be within [0, 1], got {0}")]
    InvalidRate(Decimal),
}

// ============================================================================
// Parse & Validate: Client → Internal
// ============================================================================

/// Parse a client-provided amount string for the given currency
///
/// Formats like ".5", "5.", "1e2" and "+1" are rejected. More fractional digits
/// than the currency's minor unit is an error, never a truncation.
pub fn parse_amount(amount_str: &str, currency: &CurrencyCode) -> Result<Decimal, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    let parts: Vec<&str> = amount_str.split('.').collect();
    match parts.as_slice() {
        [whole] => check_digits(whole, "whole part")?,
        [whole, frac] => {
            if whole.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing leading zero (e.g., use 0.5 instead of .5)".into(),
                ));
            }
            if frac.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing fractional part (e.g., use 5.0 instead of 5.)".into(),
                ));
            }
            check_digits(whole, "whole part")?;
            check_digits(frac, "fractional part")?;
        }
        _ => return Err(MoneyError::InvalidFormat("multiple decimal points".into())),
    }

    let amount = Decimal::from_str(amount_str)
        .map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;

    validate_amount(amount, currency)
}

fn check_digits(part: &str, what: &str) -> Result<(), MoneyError> {
    if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
        return Err(MoneyError::InvalidFormat(format!(
            "invalid character in {}: {}",
            what, part
        )));
    }
    Ok(())
}

/// Validate an already-typed amount: strictly positive and representable in
/// the currency's minor unit. Trailing zeros are ignored.
pub fn validate_amount(amount: Decimal, currency: &CurrencyCode) -> Result<Decimal, MoneyError> {
    if amount.is_sign_negative() || amount.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }

    let normalized = amount.normalize();
    let max = currency.minor_units();
    if normalized.scale() > max {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max,
        });
    }

    Ok(amount)
}

/// Validate a commission rate (fraction of the payment kept by the platform)
pub fn validate_rate(rate: Decimal) -> Result<Decimal, MoneyError> {
    if rate.is_sign_negative() || rate > Decimal::ONE {
        return Err(MoneyError::InvalidRate(rate));
    }
    Ok(rate)
}

// ============================================================================
// Rounding & Commission Split
// ============================================================================

/// Round to the currency's minor unit, half away from zero (half-up for the
/// non-negative amounts the ledger deals in)
pub fn round_to_minor(amount: Decimal, currency: &CurrencyCode) -> Decimal {
    amount.round_dp_with_strategy(
        currency.minor_units(),
        RoundingStrategy::MidpointAwayFromZero,
    )
}

/// Division of a subscription payment between the platform and the counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommissionSplit {
    pub admin_share: Decimal,
    pub counterpart_share: Decimal,
}

impl CommissionSplit {
    pub fn total(&self) -> Decimal {
        self.admin_share + self.counterpart_share
    }
}

/// Split `amount_paid` by `rate`
///
/// `admin_share` is rounded half-up to the minor unit and `counterpart_share`
/// is the exact complement, so `admin_share + counterpart_share == amount_paid`
/// for every input.
pub fn split_commission(
    amount_paid: Decimal,
    rate: Decimal,
    currency: &CurrencyCode,
) -> CommissionSplit {
    let admin_share = round_to_minor(amount_paid * rate, currency);
    CommissionSplit {
        admin_share,
        counterpart_share: amount_paid - admin_share,
    }
}

// ============================================================================
// Format: Internal → Client
// ============================================================================

/// Render an amount with exactly the currency's minor-unit precision
pub fn format_amount(amount: Decimal, currency: &CurrencyCode) -> String {
    format!(
        "{:.prec$}",
        round_to_minor(amount, currency),
        prec = currency.minor_units() as usize
    )
}
