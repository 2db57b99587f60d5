//! Fleet Configuration
//!
//! JSON fleet definition: accounts, services, scan limits and rule selection.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::agents::fleet_scan::backoff::{
    BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MAX_SERVER_ERROR_ATTEMPTS,
};
use crate::agents::fleet_scan::coordinator::DEFAULT_PER_ACCOUNT_CONCURRENCY;
use crate::agents::fleet_scan::orchestrator::{FleetOptions, DEFAULT_MAX_PARALLEL_ACCOUNTS};
use crate::agents::fleet_scan::rules::RuleSelection;
use crate::agents::fleet_scan::types::AccountTarget;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid fleet configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub accounts: Vec<AccountTarget>,
    pub services: Vec<String>,
    pub scan: ScanSettings,
    #[serde(default)]
    pub rules: RuleSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_max_parallel_accounts")]
    pub max_parallel_accounts: usize,
    #[serde(default = "default_per_account_concurrency")]
    pub per_account_concurrency: usize,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Required: refresh credentials this long before they expire
    pub credential_safety_margin_secs: u64,
    #[serde(default)]
    pub backoff: BackoffSettings,
}

fn default_max_parallel_accounts() -> usize {
    DEFAULT_MAX_PARALLEL_ACCOUNTS
}

fn default_per_account_concurrency() -> usize {
    DEFAULT_PER_ACCOUNT_CONCURRENCY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub max_server_error_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_server_error_attempts: DEFAULT_MAX_SERVER_ERROR_ATTEMPTS,
        }
    }
}

impl BackoffSettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
        .with_server_error_attempts(self.max_server_error_attempts)
    }
}

impl FleetConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, Path::new("<inline>"))
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: FleetConfig = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check limits and account definitions; de-duplicates region lists in place
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::Invalid("services must not be empty".to_string()));
        }
        if self.scan.max_parallel_accounts == 0 {
            return Err(ConfigError::Invalid("max_parallel_accounts must be at least 1".to_string()));
        }
        if self.scan.per_account_concurrency == 0 {
            return Err(ConfigError::Invalid("per_account_concurrency must be at least 1".to_string()));
        }
        if self.scan.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid("backoff.max_attempts must be at least 1".to_string()));
        }

        let mut seen = HashSet::new();
        for account in &mut self.accounts {
            if account.account_id.trim().is_empty() {
                return Err(ConfigError::Invalid("account_id must not be empty".to_string()));
            }
            if !seen.insert(account.account_id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate account_id {}", account.account_id)));
            }

            let mut regions = HashSet::new();
            account.regions.retain(|region| regions.insert(region.clone()));
            if account.enabled && account.regions.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account {} is enabled but has no regions",
                    account.account_id
                )));
            }
        }
        Ok(())
    }

    pub fn fleet_options(&self) -> FleetOptions {
        FleetOptions {
            max_parallel_accounts: self.scan.max_parallel_accounts,
            timeout: self.scan.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.scan.credential_safety_margin_secs)
    }
}
