//! Configuration for opening an SDL storage instance.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::sled::SledConfig;
use crate::error::{SdlError, SdlResult};

/// Default pause between lock acquisition attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default total time budget for lock acquisition.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Which backend adapter to place under the storage contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local map; contents vanish with the process.
    #[default]
    Memory,
    /// Persistent sled database on local disk.
    Sled,
}

impl FromStr for BackendKind {
    type Err = SdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "sled" => Ok(BackendKind::Sled),
            _ => Err(SdlError::invalid(format!(
                "unknown backend '{}', expected 'memory' or 'sled'",
                s
            ))),
        }
    }
}

/// Retry parameters applied by scoped lock acquisition and `acquire_default`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Pause between acquisition attempts.
    pub retry_interval: Duration,

    /// Acquisition gives up once this much time has elapsed.
    pub retry_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

/// Top-level SDL configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdlConfig {
    pub backend: BackendKind,
    pub sled: SledConfig,
    pub lock: LockConfig,
}

impl SdlConfig {
    /// Convenience constructor for a sled-backed configuration rooted at `data_dir`.
    pub fn sled(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Sled,
            sled: SledConfig {
                data_dir: data_dir.into(),
                ..SledConfig::default()
            },
            lock: LockConfig::default(),
        }
    }

    /// Checks the configuration for values no backend can work with.
    pub fn validate(&self) -> SdlResult<()> {
        if self.lock.retry_interval.is_zero() {
            return Err(SdlError::invalid("lock retry_interval must be non-zero"));
        }
        if self.backend == BackendKind::Sled && self.sled.cache_size_mb == 0 {
            return Err(SdlError::invalid("sled cache_size_mb must be non-zero"));
        }
        Ok(())
    }
}
