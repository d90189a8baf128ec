use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use crate::core_types::OwnerId;
use crate::currency::{CurrencyRegistry, CurrencySpec, MAX_CODE_LEN, default_currencies};
use crate::db::PoolSettings;
use crate::engine::EngineConfig;
use crate::idempotency::GuardConfig;
use crate::money::MAX_DECIMALS;
use crate::worker::WorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// PostgreSQL backend; in-memory storage when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub database: PoolSettings,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub worker: MaintenanceConfig,
    #[serde(default = "default_currencies")]
    pub currencies: Vec<CurrencySpec>,
    /// Owners known to the static account directory
    #[serde(default)]
    pub accounts: Vec<OwnerId>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub lock_timeout_ms: u64,
    pub busy_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub reservation_ttl_secs: u64,
    pub idempotency_retention_secs: u64,
    pub fee_collector: Option<OwnerId>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff_ms: 5,
            lock_timeout_ms: 2000,
            busy_wait_ms: 500,
            poll_interval_ms: 10,
            reservation_ttl_secs: 30,
            idempotency_retention_secs: 7 * 24 * 3600,
            fee_collector: None,
        }
    }
}

impl LedgerConfig {
    /// Longest a request holds its reservation before committing: the lock
    /// wait plus every backoff between attempts.
    pub fn worst_case_hold_ms(&self) -> u64 {
        let attempts = u64::from(self.max_attempts);
        let backoff_steps = attempts.saturating_mul(attempts.saturating_sub(1)) / 2;
        self.lock_timeout_ms
            .saturating_add(self.retry_backoff_ms.saturating_mul(backoff_steps))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub purge_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_batch: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: 3600,
            reconcile_interval_secs: 60,
            reconcile_batch: 100,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ledger.max_attempts must be at least 1".into(),
            ));
        }
        if self.ledger.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "ledger.poll_interval_ms must be positive".into(),
            ));
        }
        // A live request must never look abandoned to a retry of itself.
        let worst_hold_ms = self.ledger.worst_case_hold_ms();
        if self.ledger.reservation_ttl_secs.saturating_mul(1000) <= worst_hold_ms {
            return Err(ConfigError::Invalid(format!(
                "ledger.reservation_ttl_secs must exceed the longest request hold of {} ms",
                worst_hold_ms
            )));
        }
        if self.worker.purge_interval_secs == 0 || self.worker.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker intervals must be positive".into(),
            ));
        }
        if self.currencies.is_empty() {
            return Err(ConfigError::Invalid("no currencies configured".into()));
        }
        let mut seen = HashSet::new();
        for spec in &self.currencies {
            let code = spec.code.trim().to_ascii_uppercase();
            if code.is_empty() {
                return Err(ConfigError::Invalid("empty currency code".into()));
            }
            if code.len() > MAX_CODE_LEN {
                return Err(ConfigError::Invalid(format!(
                    "currency code {} longer than {} bytes",
                    code, MAX_CODE_LEN
                )));
            }
            if spec.decimals > MAX_DECIMALS {
                return Err(ConfigError::Invalid(format!(
                    "currency {} has {} decimals, max {}",
                    code, spec.decimals, MAX_DECIMALS
                )));
            }
            if !seen.insert(code.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate currency code {}",
                    code
                )));
            }
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let ledger = &self.ledger;
        EngineConfig {
            max_attempts: ledger.max_attempts,
            retry_backoff: Duration::from_millis(ledger.retry_backoff_ms),
            lock_timeout: Duration::from_millis(ledger.lock_timeout_ms),
            guard: GuardConfig {
                busy_wait: Duration::from_millis(ledger.busy_wait_ms),
                poll_interval: Duration::from_millis(ledger.poll_interval_ms),
                reservation_ttl: Duration::from_secs(ledger.reservation_ttl_secs),
            },
            fee_collector: ledger.fee_collector,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            purge_interval: Duration::from_secs(self.worker.purge_interval_secs),
            idempotency_retention: Duration::from_secs(self.ledger.idempotency_retention_secs),
            reconcile_interval: Duration::from_secs(self.worker.reconcile_interval_secs),
            reconcile_batch: self.worker.reconcile_batch,
        }
    }

    pub fn currency_registry(&self) -> CurrencyRegistry {
        CurrencyRegistry::new(&self.currencies)
    }
}
