use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::billing::Plan;
use crate::core_types::UserId;
use crate::currency::CurrencyCode;

/// Overrides `postgres_url` when set
pub const DATABASE_URL_ENV: &str = "WALLET_DATABASE_URL";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Owner of the admin wallets that collect commission
    pub platform_user_id: UserId,
    pub default_currency: CurrencyCode,
    /// Currencies the platform holds a wallet in; provisioned at boot
    #[serde(default)]
    pub currencies: Vec<CurrencyCode>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Deadline for every payment gateway call
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`, then apply environment overrides
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;

        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            config.postgres_url = Some(url);
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.gateway.timeout_ms == 0 {
            bail!("gateway.timeout_ms must be positive");
        }
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be positive");
        }
        for plan in &self.plans {
            // Commission and counterpart share would land on the same wallet
            if plan.trader_id == Some(self.platform_user_id) {
                bail!(
                    "plan {} is sold by the platform user {}; leave trader_id unset for platform plans",
                    plan.id,
                    self.platform_user_id
                );
            }
            if !self.platform_currencies().contains(&plan.currency) {
                bail!(
                    "plan {} is priced in {} but the platform holds no wallet in it",
                    plan.id,
                    plan.currency
                );
            }
        }
        Ok(())
    }

    /// Configured currencies plus the default, without duplicates
    pub fn platform_currencies(&self) -> Vec<CurrencyCode> {
        let mut all = vec![self.default_currency.clone()];
        for currency in &self.currencies {
            if !all.contains(currency) {
                all.push(currency.clone());
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
log_level: info
log_dir: ./logs
log_file: wallet.log
use_json: false
rotation: daily
platform_user_id: 1
default_currency: INR
currencies: [INR, USD]
"#;

    #[test]
    fn test_defaults_applied() {
        let config = AppConfig::from_yaml(BASE).unwrap();
        assert_eq!(config.scheduler.interval(), Duration::from_secs(60));
        assert_eq!(config.gateway.timeout(), Duration::from_secs(10));
        assert!(config.postgres_url.is_none());
        assert_eq!(config.platform_currencies().len(), 2);
    }

    #[test]
    fn test_plan_in_unknown_currency_rejected() {
        let yaml = format!(
            "{}{}",
            BASE,
            r#"
plans:
  - id: 1
    name: Yen Plan
    price: "1000"
    currency: JPY
    duration: 1
    interval: month
    commission_rate: "0.1"
"#
        );
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_plan_sold_by_platform_user_rejected() {
        let yaml = format!(
            "{}{}",
            BASE,
            r#"
plans:
  - id: 1
    name: House Signals
    price: "100.00"
    currency: INR
    duration: 1
    interval: month
    commission_rate: "0.2"
    trader_id: 1
"#
        );
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("platform user"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = format!("{}scheduler:\n  interval_secs: 0\n", BASE);
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }
}
