//! YAML deployment configuration: which backend holds the ledger, how
//! received flags are summarized, and how long items stay listed.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use groupbuy_core::{
    ReceivedPolicy, RetentionPolicy, DEFAULT_RETENTION_DAYS, MAX_RETENTION_DAYS,
};
use groupbuy_store::{
    CsvFileStore, LedgerStore, MemoryStore, RemoteConfig, RemoteFileStore, DEFAULT_TOKEN_ENV,
};
use groupbuy_store_sqlite::SqliteLedgerStore;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DATA_DIR: &str = "./groupbuy-data";

pub type DynStore = Box<dyn LedgerStore + Send>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory,
    Csv { dir: PathBuf },
    Sqlite { path: PathBuf },
    Remote(RemoteBackendConfig),
}

impl BackendConfig {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Csv { .. } => "csv",
            Self::Sqlite { .. } => "sqlite",
            Self::Remote(_) => "remote",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteBackendConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_items_path")]
    pub items_path: String,
    #[serde(default = "default_orders_path")]
    pub orders_path: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_items_path() -> String {
    "items.csv".to_string()
}

fn default_orders_path() -> String {
    "orders.csv".to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub received_policy: ReceivedPolicy,
    /// `None` keeps items forever.
    #[serde(default)]
    pub retention_days: Option<i64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Csv { dir: PathBuf::from(DEFAULT_DATA_DIR) },
            received_policy: ReceivedPolicy::default(),
            retention_days: Some(DEFAULT_RETENTION_DAYS),
        }
    }
}

impl LedgerConfig {
    /// Read and validate a YAML config file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Pick the config source for a binary: an explicit file, else the CSV
    /// backend in `data_dir`, else the defaults.
    ///
    /// # Errors
    /// Returns an error when the config file cannot be loaded.
    pub fn resolve(config_path: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        match (config_path, data_dir) {
            (Some(path), _) => Self::from_path(path),
            (None, Some(dir)) => Ok(Self {
                backend: BackendConfig::Csv { dir: dir.to_path_buf() },
                ..Self::default()
            }),
            (None, None) => Ok(Self::default()),
        }
    }

    /// Apply command-line overrides and validate the result.
    ///
    /// # Errors
    /// Returns an error when the overridden retention is out of range.
    pub fn with_overrides(mut self, per_item: bool, retention_days: Option<i64>) -> Result<Self> {
        if per_item {
            self.received_policy = ReceivedPolicy::PerItem;
        }
        if let Some(days) = retention_days {
            self.retention_days = Some(days);
        }
        self.validate()?;
        Ok(self)
    }

    /// Parse and validate YAML config text.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed or a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(days) = self.retention_days {
            if !(0..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(anyhow!(
                    "retention_days MUST be between 0 and {MAX_RETENTION_DAYS}, got {days}"
                ));
            }
        }
        match &self.backend {
            BackendConfig::Remote(remote) => {
                if remote.owner.trim().is_empty() || remote.repo.trim().is_empty() {
                    return Err(anyhow!("remote backend MUST name an owner and a repo"));
                }
                if remote.items_path == remote.orders_path {
                    return Err(anyhow!("remote items_path and orders_path MUST differ"));
                }
            }
            BackendConfig::Csv { dir } if dir.as_os_str().is_empty() => {
                return Err(anyhow!("csv backend MUST name a directory"));
            }
            _ => {}
        }
        Ok(())
    }

    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        self.retention_days.map_or_else(RetentionPolicy::keep_forever, RetentionPolicy::days)
    }

    /// Open the configured backend. `SQLite` databases are migrated on open.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be opened.
    pub fn open_store(&self) -> Result<DynStore> {
        let store: DynStore = match &self.backend {
            BackendConfig::Memory => Box::new(MemoryStore::new()),
            BackendConfig::Csv { dir } => Box::new(CsvFileStore::new(dir)),
            BackendConfig::Sqlite { path } => Box::new(SqliteLedgerStore::open_migrated(path)?),
            BackendConfig::Remote(remote) => {
                let token = std::env::var(&remote.token_env)
                    .ok()
                    .filter(|token| !token.trim().is_empty());
                if token.is_none() {
                    tracing::warn!(
                        token_env = %remote.token_env,
                        "no remote token set; requests are unauthenticated"
                    );
                }
                Box::new(RemoteFileStore::new(RemoteConfig {
                    api_base: remote.api_base.clone(),
                    owner: remote.owner.clone(),
                    repo: remote.repo.clone(),
                    branch: remote.branch.clone(),
                    items_path: remote.items_path.clone(),
                    orders_path: remote.orders_path.clone(),
                    token,
                    timeout_ms: remote.timeout_ms,
                }))
            }
        };
        tracing::debug!(backend = store.backend(), "ledger store opened");
        Ok(store)
    }
}
