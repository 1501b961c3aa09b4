//! Engine configuration
use super::types::Money;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Engine settings. Every field can be overridden from the environment:
///
/// | Variable | Default | Meaning |
/// |----------|---------|---------|
/// | REPLENISH_DB_PATH | ./replenishment.db | sled database directory |
/// | REPLENISH_INITIAL_BUDGET | 1000 | opening budget of a fresh ledger |
/// | REPLENISH_DEFAULT_WAREHOUSE | main | warehouse used when an order names none |
/// | REPLENISH_REMOTE_TIMEOUT_MS | 5000 | bound on each remote ledger call |
/// | REPLENISH_LOG_LEVEL | info | tracing filter when RUST_LOG is unset |
/// | REPLENISH_LOG_JSON | false | emit JSON log lines |
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub initial_budget: Money,
    pub default_warehouse: String,
    pub remote_timeout: Duration,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./replenishment.db"),
            initial_budget: Money::new(Decimal::new(1000, 0)),
            default_warehouse: "main".into(),
            remote_timeout: Duration::from_millis(5_000),
            log_level: "info".into(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// Loads from environment variables, falling back to defaults for anything unset
    /// or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("REPLENISH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            initial_budget: std::env::var("REPLENISH_INITIAL_BUDGET")
                .ok()
                .and_then(|v| Money::from_str(&v).ok())
                .unwrap_or(defaults.initial_budget),
            default_warehouse: std::env::var("REPLENISH_DEFAULT_WAREHOUSE")
                .unwrap_or(defaults.default_warehouse),
            remote_timeout: std::env::var("REPLENISH_REMOTE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.remote_timeout),
            log_level: std::env::var("REPLENISH_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: std::env::var("REPLENISH_LOG_JSON")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.log_json),
        }
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_initial_budget(mut self, budget: Money) -> Self {
        self.initial_budget = budget;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn open_db(&self) -> anyhow::Result<sled::Db> {
        Ok(sled::open(&self.db_path)?)
    }
}
