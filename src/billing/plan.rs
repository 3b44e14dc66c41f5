//! Plan catalog
//!
//! Read-only from the engine's point of view. The static catalog is loaded
//! from configuration and validated once at boot.

use async_trait::async_trait;
use chrono::{DateTime, Months, TimeDelta, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{PlanId, UserId};
use crate::currency::CurrencyCode;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{PlanScope, Role};
use crate::money::{validate_amount, validate_rate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Month,
    Year,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub price: Decimal,
    pub currency: CurrencyCode,
    /// Number of `interval`s a subscription lasts
    pub duration: u32,
    pub interval: BillingInterval,
    /// Fraction of the price kept by the platform, in `[0, 1]`
    pub commission_rate: Decimal,
    /// Trader selling the plan; `None` for platform plans
    #[serde(default)]
    pub trader_id: Option<UserId>,
    #[serde(default)]
    pub grants_role: Option<Role>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl Plan {
    pub fn scope(&self) -> PlanScope {
        PlanScope::from_trader(self.trader_id)
    }

    /// End of a subscription starting at `start`
    ///
    /// Month and year intervals follow the calendar (Jan 31 + 1 month is the
    /// last day of February).
    pub fn end_date_from(&self, start: DateTime<Utc>) -> LedgerResult<DateTime<Utc>> {
        let end = match self.interval {
            BillingInterval::Day => {
                TimeDelta::try_days(self.duration as i64).and_then(|d| start.checked_add_signed(d))
            }
            BillingInterval::Month => start.checked_add_months(Months::new(self.duration)),
            BillingInterval::Year => self
                .duration
                .checked_mul(12)
                .and_then(|months| start.checked_add_months(Months::new(months))),
        };
        end.ok_or_else(|| {
            LedgerError::Internal(format!("plan {} duration overflows the calendar", self.id))
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err(format!("plan {}: name is empty", self.id));
        }
        if self.duration == 0 {
            return Err(format!("plan {}: duration must be positive", self.id));
        }
        validate_amount(self.price, &self.currency)
            .map_err(|e| format!("plan {}: price: {}", self.id, e))?;
        validate_rate(self.commission_rate)
            .map_err(|e| format!("plan {}: {}", self.id, e))?;
        Ok(())
    }
}

#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn plan(&self, plan_id: PlanId) -> LedgerResult<Option<Plan>>;
}

/// In-process catalog built from configuration
#[derive(Debug, Default)]
pub struct StaticPlanCatalog {
    plans: DashMap<PlanId, Plan>,
}

impl StaticPlanCatalog {
    /// Build a catalog, rejecting invalid plans and duplicate ids
    pub fn new(plans: Vec<Plan>) -> Result<Self, String> {
        let catalog = Self::default();
        for plan in plans {
            plan.validate()?;
            if catalog.plans.contains_key(&plan.id) {
                return Err(format!("duplicate plan id {}", plan.id));
            }
            catalog.plans.insert(plan.id, plan);
        }
        Ok(catalog)
    }

    pub fn upsert(&self, plan: Plan) -> Result<(), String> {
        plan.validate()?;
        self.plans.insert(plan.id, plan);
        Ok(())
    }

    /// Returns false if the plan does not exist
    pub fn set_active(&self, plan_id: PlanId, active: bool) -> bool {
        match self.plans.get_mut(&plan_id) {
            Some(mut plan) => {
                plan.is_active = active;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

#[async_trait]
impl PlanCatalog for StaticPlanCatalog {
    async fn plan(&self, plan_id: PlanId) -> LedgerResult<Option<Plan>> {
        Ok(self.plans.get(&plan_id).map(|p| p.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn plan(interval: BillingInterval, duration: u32) -> Plan {
        Plan {
            id: 1,
            name: "Signals Pro".into(),
            price: Decimal::from_str("100.00").unwrap(),
            currency: CurrencyCode::new("INR").unwrap(),
            duration,
            interval,
            commission_rate: Decimal::from_str("0.20").unwrap(),
            trader_id: Some(7),
            grants_role: None,
            is_active: true,
        }
    }

    #[test]
    fn test_end_date_interval_aware() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 10, 0, 0).unwrap();

        let days = plan(BillingInterval::Day, 30).end_date_from(start).unwrap();
        assert_eq!(days, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());

        let month = plan(BillingInterval::Month, 1).end_date_from(start).unwrap();
        assert_eq!(month, Utc.with_ymd_and_hms(2024, 2, 29, 10, 0, 0).unwrap());

        let year = plan(BillingInterval::Year, 1).end_date_from(start).unwrap();
        assert_eq!(year, Utc.with_ymd_and_hms(2025, 1, 31, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_plan_validation() {
        assert!(plan(BillingInterval::Month, 1).validate().is_ok());
        assert!(plan(BillingInterval::Month, 0).validate().is_err());

        let mut bad_rate = plan(BillingInterval::Month, 1);
        bad_rate.commission_rate = Decimal::from_str("1.5").unwrap();
        assert!(bad_rate.validate().is_err());

        let mut bad_price = plan(BillingInterval::Month, 1);
        bad_price.price = Decimal::from_str("9.999").unwrap();
        assert!(bad_price.validate().is_err());
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let a = plan(BillingInterval::Month, 1);
        let b = a.clone();
        assert!(StaticPlanCatalog::new(vec![a, b]).is_err());
    }

    #[tokio::test]
    async fn test_catalog_lookup_and_deactivate() {
        let catalog = StaticPlanCatalog::new(vec![plan(BillingInterval::Month, 1)]).unwrap();
        assert!(catalog.plan(1).await.unwrap().unwrap().is_active);
        assert!(catalog.plan(2).await.unwrap().is_none());

        assert!(catalog.set_active(1, false));
        assert!(!catalog.plan(1).await.unwrap().unwrap().is_active);
        assert!(!catalog.set_active(2, false));
    }

    #[test]
    fn test_plan_from_yaml() {
        let yaml = r#"
id: 3
name: Copy Trading Monthly
price: "499.00"
currency: INR
duration: 1
interval: month
commission_rate: "0.15"
trader_id: 42
grants_role: trader
"#;
        let plan: Plan = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(plan.scope(), PlanScope::Trader(42));
        assert_eq!(plan.grants_role, Some(Role::Trader));
        assert!(plan.is_active);
        assert_eq!(plan.price, Decimal::from_str("499.00").unwrap());
    }
}
