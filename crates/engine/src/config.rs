//! Manager configuration via `covenant.toml`
//!
//! Every field has a default, so an empty file is a valid configuration.
//! On [`TransactionManager::open`](crate::TransactionManager::open) a default
//! `covenant.toml` is written if the directory has none.

use covenant_concurrency::RollForwardPolicy;
use covenant_core::{LeasePolicy, Result, TxnError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the manager's directory.
pub const CONFIG_FILE_NAME: &str = "covenant.toml";

/// Manager configuration loaded from `covenant.toml`.
///
/// # Example
///
/// ```toml
/// default_lease_ms = 3600000
/// # max_lease_ms = 86400000
/// sweep_interval_ms = 1000
/// retention_ms = 60000
/// roll_forward_retries = 0
/// roll_forward_backoff_ms = 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Lease granted for a request of "any" duration, in milliseconds.
    #[serde(default = "default_lease_ms")]
    pub default_lease_ms: u64,
    /// Upper bound on every grant, in milliseconds. Absent means a
    /// transaction may hold its lease forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lease_ms: Option<u64>,
    /// Interval between background expiration sweeps. `0` disables the sweeper.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// How long a settled transaction stays queryable.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Extra commit attempts for a participant unreachable during roll-forward.
    #[serde(default)]
    pub roll_forward_retries: u32,
    /// Pause between roll-forward attempts.
    #[serde(default = "default_roll_forward_backoff_ms")]
    pub roll_forward_backoff_ms: u64,
}

fn default_lease_ms() -> u64 {
    3_600_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_retention_ms() -> u64 {
    60_000
}

fn default_roll_forward_backoff_ms() -> u64 {
    100
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_lease_ms: default_lease_ms(),
            max_lease_ms: None,
            sweep_interval_ms: default_sweep_interval_ms(),
            retention_ms: default_retention_ms(),
            roll_forward_retries: 0,
            roll_forward_backoff_ms: default_roll_forward_backoff_ms(),
        }
    }
}

impl ManagerConfig {
    /// Check the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero default lease, a zero maximum, or a
    /// default longer than the maximum.
    pub fn validate(&self) -> Result<()> {
        if self.default_lease_ms == 0 {
            return Err(TxnError::InvalidConfig(
                "default_lease_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(max) = self.max_lease_ms {
            if max == 0 {
                return Err(TxnError::InvalidConfig(
                    "max_lease_ms must be greater than 0".to_string(),
                ));
            }
            if self.default_lease_ms > max {
                return Err(TxnError::InvalidConfig(format!(
                    "default_lease_ms ({}) exceeds max_lease_ms ({})",
                    self.default_lease_ms, max
                )));
            }
        }
        Ok(())
    }

    /// Lease grant rules
    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            default_duration: Duration::from_millis(self.default_lease_ms),
            max_duration: self.max_lease_ms.map(Duration::from_millis),
        }
    }

    /// Roll-forward retry rule
    pub fn roll_forward_policy(&self) -> RollForwardPolicy {
        RollForwardPolicy {
            max_retries: self.roll_forward_retries,
            backoff: Duration::from_millis(self.roll_forward_backoff_ms),
        }
    }

    /// Sweep interval, `None` when the sweeper is disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.sweep_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Retention of settled records
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Covenant transaction manager configuration
#
# Lease granted when a client asks for "any" duration (default: 1 hour)
default_lease_ms = 3600000

# Upper bound on every lease grant. Leave unset to allow leases that never expire.
# max_lease_ms = 86400000

# Interval between background lease-expiration sweeps (0 disables the sweeper)
sweep_interval_ms = 1000

# How long a committed or aborted transaction stays queryable
retention_ms = 60000

# Extra commit attempts for a participant unreachable after the commit decision
roll_forward_retries = 0
roll_forward_backoff_ms = 100
"#
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the document does not parse or validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ManagerConfig = toml::from_str(content)
            .map_err(|e| TxnError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `InvalidConfig` if it
    /// cannot be parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            TxnError::InvalidConfig(msg) => {
                TxnError::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Read the config at `path`, or the defaults if there is no file.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TxnError::InvalidConfig(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
