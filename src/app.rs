//! Service wiring
//!
//! Builds every component over one store, one gateway and one user
//! directory so the binary and the integration tests share a single
//! construction path.

use std::sync::Arc;

use anyhow::Context;

use crate::billing::{
    BillingEngine, ExpiryScheduler, PlanCatalog, StaticPlanCatalog, UserDirectory,
};
use crate::config::AppConfig;
use crate::funding::{DepositFlow, PaymentGateway, WithdrawalFlow};
use crate::ledger::LedgerExecutor;
use crate::models::Wallet;
use crate::service::WalletService;
use crate::store::LedgerStore;

pub struct LedgerServices {
    pub executor: LedgerExecutor,
    pub wallets: WalletService,
    pub deposits: DepositFlow,
    pub withdrawals: WithdrawalFlow,
    pub billing: BillingEngine,
    pub scheduler: Arc<ExpiryScheduler>,
}

impl LedgerServices {
    pub fn build(
        config: &AppConfig,
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn UserDirectory>,
    ) -> anyhow::Result<Self> {
        let catalog: Arc<dyn PlanCatalog> = Arc::new(
            StaticPlanCatalog::new(config.plans.clone())
                .map_err(anyhow::Error::msg)
                .context("Invalid plan catalog")?,
        );
        let executor = LedgerExecutor::new(store.clone());
        let timeout = config.gateway.timeout();

        Ok(Self {
            wallets: WalletService::new(executor.clone(), config.default_currency.clone()),
            deposits: DepositFlow::new(store.clone(), gateway.clone(), timeout),
            withdrawals: WithdrawalFlow::new(store.clone(), gateway, timeout),
            billing: BillingEngine::new(
                store.clone(),
                catalog,
                directory.clone(),
                config.platform_user_id,
            ),
            scheduler: Arc::new(ExpiryScheduler::new(
                store,
                directory,
                config.scheduler.interval(),
            )),
            executor,
        })
    }

    /// Create the platform's commission wallets; safe to repeat
    pub async fn provision_platform_wallets(
        &self,
        config: &AppConfig,
    ) -> anyhow::Result<Vec<Wallet>> {
        let mut wallets = Vec::new();
        for currency in config.platform_currencies() {
            let wallet = self
                .executor
                .provision_wallet(config.platform_user_id, &currency)
                .await
                .with_context(|| format!("Failed to provision platform wallet in {}", currency))?;
            wallets.push(wallet);
        }
        Ok(wallets)
    }
}
