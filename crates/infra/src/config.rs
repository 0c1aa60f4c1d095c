//! Storage options.
//!
//! Options are plain data with defaults; processes may overlay them from
//! environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `JOBSTORE_SCHEMA` | `schema_name` |
//! | `JOBSTORE_LOCK_POLICY` | `lock_policy` (`transactional_insert` / `insert_then_claim`) |
//! | `JOBSTORE_LOCK_TIMEOUT_SECS` | `distributed_lock_timeout` |
//! | `JOBSTORE_MAX_CONNECTIONS` | `max_connections` |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use jobstore_core::{DomainError, DomainResult, ensure_not_blank};

use crate::lock::LockPolicy;

pub const DEFAULT_SCHEMA_NAME: &str = "jobstore";

/// Options shared by the job storage components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Schema holding the storage tables.
    pub schema_name: String,
    /// How distributed locks are acquired.
    pub lock_policy: LockPolicy,
    /// Timeout used when a caller does not pass one to the lock.
    pub distributed_lock_timeout: Duration,
    /// Pool size used by `PostgresStore::connect`.
    pub max_connections: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            schema_name: DEFAULT_SCHEMA_NAME.to_string(),
            lock_policy: LockPolicy::default(),
            distributed_lock_timeout: Duration::from_secs(600),
            max_connections: 10,
        }
    }
}

impl StorageOptions {
    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn with_distributed_lock_timeout(mut self, timeout: Duration) -> Self {
        self.distributed_lock_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Defaults overlaid with `JOBSTORE_*` environment variables.
    pub fn from_env() -> DomainResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with the variables `lookup` resolves.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DomainResult<Self> {
        let mut options = Self::default();

        if let Some(schema) = lookup("JOBSTORE_SCHEMA") {
            options.schema_name = schema;
        }
        if let Some(policy) = lookup("JOBSTORE_LOCK_POLICY") {
            options.lock_policy = policy.parse()?;
        }
        if let Some(secs) = lookup("JOBSTORE_LOCK_TIMEOUT_SECS") {
            options.distributed_lock_timeout =
                Duration::from_secs(parse_number("JOBSTORE_LOCK_TIMEOUT_SECS", &secs)?);
        }
        if let Some(max) = lookup("JOBSTORE_MAX_CONNECTIONS") {
            options.max_connections = parse_number("JOBSTORE_MAX_CONNECTIONS", &max)?;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> DomainResult<()> {
        ensure_not_blank("schema name", &self.schema_name)?;
        if self.schema_name.contains('"') {
            return Err(DomainError::validation(format!(
                "schema name '{}' must not contain double quotes",
                self.schema_name
            )));
        }
        if self.distributed_lock_timeout.is_zero() {
            return Err(DomainError::validation(
                "distributed lock timeout must be positive",
            ));
        }
        if self.max_connections == 0 {
            return Err(DomainError::validation("max connections must be positive"));
        }
        Ok(())
    }

    /// Write the effective options to the log.
    pub fn log_options(&self) {
        info!(
            schema = %self.schema_name,
            lock_policy = ?self.lock_policy,
            distributed_lock_timeout_secs = self.distributed_lock_timeout.as_secs_f64(),
            max_connections = self.max_connections,
            "job storage options"
        );
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> DomainResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| DomainError::validation(format!("{name}='{raw}': {e}")))
}
