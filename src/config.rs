//! Externally supplied lock configuration.
//!
//! ```text
//! REMOTE_LOCK__LOCK_TTL_MS=180000
//! REMOTE_LOCK__KEEP_LOCK_ALIVE_INTERVAL_MS=10000
//! REMOTE_LOCK__LOCAL_RIVAL_OPTIMIZATION=false
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::lease::{LocalRivalOptimization, LockerSettings};
use crate::lock::settings::{
    LockSettings, DEFAULT_CHANGE_LOCK_ROW_THRESHOLD, DEFAULT_KEEP_LOCK_ALIVE_INTERVAL, DEFAULT_LOCK_METADATA_TTL,
    DEFAULT_LOCK_TTL,
};
use crate::lock::timestamp::SystemTimestampProvider;
use crate::util::exception::{Exception, LockResult};

pub const DEFAULT_ENV_PREFIX: &str = "REMOTE_LOCK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteLockConfig {
    pub lock_ttl_ms: u64,
    pub lock_metadata_ttl_ms: u64,
    pub keep_lock_alive_interval_ms: u64,
    pub change_lock_row_threshold: u32,
    pub local_rival_optimization: bool,
    pub tolerate_storage_failures: bool,
    /// Keyspace and column family naming the lock table, see
    /// [`crate::storage::dynamo::DynamoColumnStore::new`].
    pub keyspace: String,
    pub column_family: String,
}

impl Default for RemoteLockConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEFAULT_LOCK_TTL.as_millis() as u64,
            lock_metadata_ttl_ms: DEFAULT_LOCK_METADATA_TTL.as_millis() as u64,
            keep_lock_alive_interval_ms: DEFAULT_KEEP_LOCK_ALIVE_INTERVAL.as_millis() as u64,
            change_lock_row_threshold: DEFAULT_CHANGE_LOCK_ROW_THRESHOLD,
            local_rival_optimization: true,
            tolerate_storage_failures: true,
            keyspace: "remote_lock".to_string(),
            column_family: "locks".to_string(),
        }
    }
}

impl RemoteLockConfig {
    /// Reads `{prefix}__{FIELD}` variables; missing ones keep their defaults.
    pub fn from_env_with_prefix(prefix: &str) -> LockResult<Self> {
        Self::load(prefix, None)
    }

    pub fn from_env() -> LockResult<Self> {
        Self::from_env_with_prefix(DEFAULT_ENV_PREFIX)
    }

    fn load(prefix: &str, vars: Option<HashMap<String, String>>) -> LockResult<Self> {
        Config::builder()
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .and_then(|config| config.try_deserialize::<Self>())
            .map_err(|e| Exception::InvalidArgument(format!("Failed to load lock configuration: {}", e)))
    }

    /// Engine settings on the system clock.
    pub fn lock_settings(&self) -> LockResult<LockSettings> {
        LockSettings::new(
            Arc::new(SystemTimestampProvider::new()),
            Duration::from_millis(self.lock_ttl_ms),
            Duration::from_millis(self.lock_metadata_ttl_ms),
            Duration::from_millis(self.keep_lock_alive_interval_ms),
            self.change_lock_row_threshold,
        )
    }

    pub fn locker_settings(&self) -> LockerSettings {
        LockerSettings {
            local_rival_optimization: if self.local_rival_optimization {
                LocalRivalOptimization::Enabled
            } else {
                LocalRivalOptimization::Disabled
            },
            tolerate_storage_failures: self.tolerate_storage_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn missing_variables_keep_defaults() {
        let config = RemoteLockConfig::load("REMOTE_LOCK", Some(HashMap::new())).unwrap();
        assert_eq!(config, RemoteLockConfig::default());

        let settings = config.lock_settings().unwrap();
        assert_eq!(settings.lock_ttl(), Duration::from_secs(180));
        assert_eq!(settings.keep_lock_alive_interval(), Duration::from_secs(10));
        assert_eq!(
            config.locker_settings().local_rival_optimization,
            LocalRivalOptimization::Enabled
        );
    }

    #[test]
    fn prefixed_variables_override_defaults() {
        let config = RemoteLockConfig::load(
            "REMOTE_LOCK",
            Some(vars(&[
                ("REMOTE_LOCK__LOCK_TTL_MS", "10000"),
                ("REMOTE_LOCK__KEEP_LOCK_ALIVE_INTERVAL_MS", "3000"),
                ("REMOTE_LOCK__CHANGE_LOCK_ROW_THRESHOLD", "10"),
                ("REMOTE_LOCK__LOCAL_RIVAL_OPTIMIZATION", "false"),
                ("REMOTE_LOCK__COLUMN_FAMILY", "leases"),
                ("OTHER__LOCK_TTL_MS", "1"),
            ])),
        )
        .unwrap();

        assert_eq!(config.lock_ttl_ms, 10_000);
        assert_eq!(config.keep_lock_alive_interval_ms, 3_000);
        assert_eq!(config.change_lock_row_threshold, 10);
        assert_eq!(config.column_family, "leases");
        assert_eq!(config.keyspace, "remote_lock");

        let locker = config.locker_settings();
        assert_eq!(locker.local_rival_optimization, LocalRivalOptimization::Disabled);
        assert!(locker.tolerate_storage_failures);
        assert_eq!(config.lock_settings().unwrap().change_lock_row_threshold(), 10);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = RemoteLockConfig::load(
            "REMOTE_LOCK",
            Some(vars(&[("REMOTE_LOCK__LOCK_TTL_MS", "soon")])),
        );
        assert!(matches!(config, Err(Exception::InvalidArgument(_))));

        let config = RemoteLockConfig {
            change_lock_row_threshold: 0,
            ..RemoteLockConfig::default()
        };
        assert!(matches!(config.lock_settings(), Err(Exception::InvalidArgument(_))));
    }
}
