//! Wallet Ledger - service entry point
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌──────────────┐
//! │  Config  │───▶│ Postgres │───▶│ Ledger Store │───▶│ Flows/Billing│
//! │  (YAML)  │    │(migrate) │    │  (UoW/locks) │    │  + Scheduler │
//! └──────────┘    └──────────┘    └──────────────┘    └──────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;

use wallet_ledger::app::LedgerServices;
use wallet_ledger::billing::{InMemoryUserDirectory, PgUserDirectory, UserDirectory};
use wallet_ledger::config::AppConfig;
use wallet_ledger::db::Database;
use wallet_ledger::funding::{PaymentGateway, SandboxGateway};
use wallet_ledger::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = wallet_ledger::logging::init_logging(&app_config);

    tracing::info!("Starting wallet ledger in {} mode", env);

    let (store, directory): (Arc<dyn LedgerStore>, Arc<dyn UserDirectory>) =
        match &app_config.postgres_url {
            Some(url) => {
                let db = Database::connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                db.migrate().await.context("Failed to apply migrations")?;
                (
                    Arc::new(PgLedgerStore::new(db.pool().clone())),
                    Arc::new(PgUserDirectory::new(db.pool().clone())),
                )
            }
            None => {
                tracing::warn!("postgres_url not set, using the in-memory ledger store");
                (
                    Arc::new(MemoryLedgerStore::new()),
                    Arc::new(InMemoryUserDirectory::new()),
                )
            }
        };

    let gateway: Arc<dyn PaymentGateway> = Arc::new(SandboxGateway::new());
    tracing::info!(gateway = gateway.name(), "Payment gateway configured");

    let services = LedgerServices::build(&app_config, store, gateway, directory)?;
    let platform_wallets = services.provision_platform_wallets(&app_config).await?;
    tracing::info!(
        platform_user_id = app_config.platform_user_id,
        wallets = platform_wallets.len(),
        plans = app_config.plans.len(),
        "Ledger ready"
    );

    let scheduler = services.scheduler.clone().start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    scheduler.stop().await;
    tracing::info!("Wallet ledger stopped");
    Ok(())
}
