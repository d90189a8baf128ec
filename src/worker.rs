//! Maintenance Worker
//!
//! Background worker that purges expired idempotency records and sweeps
//! wallets for drift between balance rows and the ledger.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::audit::{self, ReconcileReport};
use crate::engine::LedgerEngine;
use crate::error::LedgerError;
use crate::wallet::WalletKey;

/// Configuration for the maintenance worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to purge settled idempotency records
    pub purge_interval: Duration,
    /// How long settled records are kept
    pub idempotency_retention: Duration,
    /// How often to reconcile the next batch of wallets
    pub reconcile_interval: Duration,
    /// Wallets checked per sweep step
    pub reconcile_batch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            purge_interval: Duration::from_secs(3600),
            idempotency_retention: Duration::from_secs(7 * 24 * 3600),
            reconcile_interval: Duration::from_secs(60),
            reconcile_batch: 100,
        }
    }
}

/// Result of one reconciliation step.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub checked: usize,
    pub inconsistent: Vec<ReconcileReport>,
    /// The sweep reached the last wallet and starts over next time
    pub wrapped: bool,
}

pub struct MaintenanceWorker {
    engine: Arc<LedgerEngine>,
    config: WorkerConfig,
    /// Last wallet reconciled by the sweep
    cursor: Mutex<Option<WalletKey>>,
}

impl MaintenanceWorker {
    pub fn new(engine: Arc<LedgerEngine>, config: WorkerConfig) -> Self {
        Self {
            engine,
            config,
            cursor: Mutex::new(None),
        }
    }

    pub fn with_defaults(engine: Arc<LedgerEngine>) -> Self {
        Self::new(engine, WorkerConfig::default())
    }

    /// Run both schedules until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            purge_interval_secs = self.config.purge_interval.as_secs(),
            retention_secs = self.config.idempotency_retention.as_secs(),
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting maintenance worker"
        );

        let mut purge = tokio::time::interval(self.config.purge_interval);
        let mut reconcile = tokio::time::interval(self.config.reconcile_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Maintenance worker stopping");
                    return;
                }
                _ = purge.tick() => {
                    if let Err(e) = self.purge_once().await {
                        error!(error = %e, "Idempotency purge failed");
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "Reconciliation sweep failed");
                    }
                }
            }
        }
    }

    /// Remove settled idempotency records past the retention window.
    pub async fn purge_once(&self) -> Result<u64, LedgerError> {
        let removed = self
            .engine
            .guard()
            .purge(self.config.idempotency_retention)
            .await?;
        debug!(removed, "Idempotency purge done");
        Ok(removed)
    }

    /// Reconcile the next batch of wallets, continuing where the last call stopped.
    pub async fn reconcile_once(&self) -> Result<SweepReport, LedgerError> {
        let after = self.cursor_position();
        let keys = self
            .engine
            .storage()
            .wallet_keys(after.as_ref(), self.config.reconcile_batch.max(1))
            .await?;

        let mut report = SweepReport {
            wrapped: keys.len() < self.config.reconcile_batch.max(1),
            ..SweepReport::default()
        };

        for key in &keys {
            let wallet_report =
                audit::reconcile_wallet(self.engine.wallets(), self.engine.ledger(), key).await?;
            report.checked += 1;
            if !wallet_report.is_consistent() {
                warn!(
                    wallet = %key,
                    issues = ?wallet_report.issues,
                    "CRITICAL: wallet balance drifted from ledger"
                );
                report.inconsistent.push(wallet_report);
            }
        }

        let next = if report.wrapped { None } else { keys.last().cloned() };
        self.set_cursor(next);

        if report.checked > 0 {
            info!(
                checked = report.checked,
                inconsistent = report.inconsistent.len(),
                "Reconciled wallets this sweep"
            );
        }
        Ok(report)
    }

    fn cursor_position(&self) -> Option<WalletKey> {
        self.cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_cursor(&self, key: Option<WalletKey>) {
        *self
            .cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = key;
    }
}
