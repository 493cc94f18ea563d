use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::store::StoreOptions;
use crate::types::{NdError, Result};

/// Tunables for a database handle.
///
/// Every field has a default, so a TOML document only needs the keys it changes:
///
/// ```toml
/// max_version = 3
/// debug_locks = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NdOptions {
    /// Oldest on-disk version this build can read.
    pub min_version: u32,
    /// Newest on-disk version this build can read.
    pub max_version: u32,
    /// Version stamped on newly created files.
    pub current_version: u32,
    /// How often a waiting writer re-checks its cancel token.
    pub cancellation_check_interval_ms: u64,
    /// Entries kept in the result cache.
    pub result_cache_capacity: usize,
    /// Assert lock discipline on every field access.
    pub debug_locks: bool,
    /// Persist the store every time the write lock is released.
    pub flush_on_write_release: bool,
}

impl Default for NdOptions {
    fn default() -> Self {
        Self {
            min_version: 1,
            max_version: 1,
            current_version: 1,
            cancellation_check_interval_ms: 100,
            result_cache_capacity: 1024,
            debug_locks: false,
            flush_on_write_release: false,
        }
    }
}

impl NdOptions {
    /// Defaults plus lock assertions and a short cancel poll; meant for tests.
    pub fn strict() -> Self {
        Self {
            cancellation_check_interval_ms: 5,
            debug_locks: true,
            ..Self::default()
        }
    }

    /// Parses options from a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(contents).map_err(|err| NdError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| NdError::Config(err.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.min_version > self.max_version {
            return Err(NdError::Config(format!(
                "min_version {} exceeds max_version {}",
                self.min_version, self.max_version
            )));
        }
        if !(self.min_version..=self.max_version).contains(&self.current_version) {
            return Err(NdError::Config(format!(
                "current_version {} outside {}..={}",
                self.current_version, self.min_version, self.max_version
            )));
        }
        Ok(())
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancellation_check_interval_ms.max(1))
    }

    pub(crate) fn store_options(&self) -> StoreOptions {
        StoreOptions {
            current_version: self.current_version,
            min_version: self.min_version,
            max_version: self.max_version,
        }
    }
}
