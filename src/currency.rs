//! Validated currency codes
//!
//! Every wallet, request and plan carries a `CurrencyCode`. The inner string is
//! private so a code can only be obtained through validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Validation Errors
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CurrencyError {
    #[error("Currency code must be uppercase: got '{got}', expected '{expected}'")]
    NotUppercase { got: String, expected: String },

    #[error("Invalid length for currency code: expected 3, got {actual}")]
    InvalidLength { actual: usize },

    #[error("Invalid currency code '{value}' (expected: ASCII letters only)")]
    InvalidFormat { value: String },
}

// ============================================================================
// CurrencyCode
// ============================================================================

/// Validated ISO-4217 style currency code (three uppercase ASCII letters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Create a new validated CurrencyCode
    ///
    /// # Examples
    /// ```
    /// use wallet_ledger::currency::CurrencyCode;
    ///
    /// let inr = CurrencyCode::new("INR").unwrap();
    /// assert_eq!(inr.as_str(), "INR");
    /// assert_eq!(inr.minor_units(), 2);
    ///
    /// assert!(CurrencyCode::new("inr").is_err());
    /// ```
    pub fn new(code: &str) -> Result<Self, CurrencyError> {
        let code = code.trim();

        if code.len() != 3 {
            return Err(CurrencyError::InvalidLength { actual: code.len() });
        }

        if !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CurrencyError::InvalidFormat {
                value: code.to_string(),
            });
        }

        let expected = code.to_ascii_uppercase();
        if code != expected {
            return Err(CurrencyError::NotUppercase {
                got: code.to_string(),
                expected,
            });
        }

        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of decimal places in the currency's minor unit
    pub fn minor_units(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
            "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CurrencyCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for CurrencyCode {
    type Err = CurrencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = CurrencyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> String {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_code_valid() {
        assert!(CurrencyCode::new("INR").is_ok());
        assert!(CurrencyCode::new("USD").is_ok());
        assert_eq!(CurrencyCode::new(" EUR ").unwrap().as_str(), "EUR");
    }

    #[test]
    fn test_currency_code_uppercase_required() {
        let err = CurrencyCode::new("inr").unwrap_err();
        assert!(matches!(err, CurrencyError::NotUppercase { .. }));

        let err = CurrencyCode::new("Usd").unwrap_err();
        assert!(matches!(err, CurrencyError::NotUppercase { .. }));
    }

    #[test]
    fn test_currency_code_invalid_length() {
        assert_eq!(
            CurrencyCode::new("").unwrap_err(),
            CurrencyError::InvalidLength { actual: 0 }
        );
        assert_eq!(
            CurrencyCode::new("USDT").unwrap_err(),
            CurrencyError::InvalidLength { actual: 4 }
        );
    }

    #[test]
    fn test_currency_code_invalid_chars() {
        let err = CurrencyCode::new("U$D").unwrap_err();
        assert!(matches!(err, CurrencyError::InvalidFormat { .. }));

        let err = CurrencyCode::new("12A").unwrap_err();
        assert!(matches!(err, CurrencyError::InvalidFormat { .. }));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(CurrencyCode::new("INR").unwrap().minor_units(), 2);
        assert_eq!(CurrencyCode::new("JPY").unwrap().minor_units(), 0);
        assert_eq!(CurrencyCode::new("KWD").unwrap().minor_units(), 3);
    }

    #[test]
    fn test_serde_validates() {
        let code: CurrencyCode = serde_json::from_str("\"INR\"").unwrap();
        assert_eq!(code.as_str(), "INR");
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"INR\"");

        assert!(serde_json::from_str::<CurrencyCode>("\"inr\"").is_err());
    }
}
