//! ledgerd - wallet ledger daemon
//!
//! Loads `config/{env}.yaml`, wires the storage backend and runs the
//! maintenance worker until Ctrl-C.
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Storage  │───▶│  Engine  │───▶│  Worker  │
//! │  (YAML)  │    │(PG / mem)│    │ (ledger) │    │(sweeps)  │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;

use wallet_ledger::account::{AccountDirectory, PgAccountDirectory, StaticDirectory};
use wallet_ledger::config::AppConfig;
use wallet_ledger::db::Database;
use wallet_ledger::store::{MemoryStorage, PgStorage, Storage};
use wallet_ledger::{LedgerEngine, MaintenanceWorker};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn open_backend(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn Storage>, Arc<dyn AccountDirectory>)> {
    match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url, &config.database)
                .await
                .context("connecting to PostgreSQL")?;
            let latency = db.health_check().await.context("PostgreSQL health check")?;
            tracing::info!(latency_ms = latency.as_millis() as u64, "PostgreSQL reachable");

            let storage = PgStorage::new(db.pool().clone());
            storage
                .ensure_schema()
                .await
                .context("creating ledger schema")?;
            tracing::info!("Using PostgreSQL storage");
            Ok((
                Arc::new(storage),
                Arc::new(PgAccountDirectory::new(db.pool().clone())),
            ))
        }
        None => {
            tracing::warn!(
                accounts = config.accounts.len(),
                "No postgres_url configured, balances live in memory only"
            );
            Ok((
                Arc::new(MemoryStorage::new()),
                Arc::new(StaticDirectory::new(config.accounts.iter().copied())),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).with_context(|| format!("loading {} config", env))?;
    let _log_guard = wallet_ledger::logging::init_logging(&app_config);

    tracing::info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        currencies = app_config.currencies.len(),
        "Starting ledgerd"
    );

    let (storage, accounts) = open_backend(&app_config).await?;
    let engine = Arc::new(LedgerEngine::new(
        storage,
        accounts,
        app_config.currency_registry(),
        app_config.engine_config(),
    ));

    let worker = MaintenanceWorker::new(engine, app_config.worker_config());
    worker
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await;

    tracing::info!("ledgerd stopped");
    Ok(())
}
