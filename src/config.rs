//! Engine configuration.
//!
//! Configuration comes from environment variables, a JSON file, or
//! [`PkiConfig::default`]. Values that fail to parse from the environment
//! fall back to their defaults.

use crate::crypto::keygen::KeyAlgorithm;
use crate::error::{PkiError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const ENV_LOCK_TIMEOUT_MS: &str = "PKI_LOCK_TIMEOUT_MS";
pub const ENV_KEY_PASSPHRASE: &str = "PKI_KEY_PASSPHRASE";
pub const ENV_LEAF_VALIDITY_DAYS: &str = "PKI_LEAF_VALIDITY_DAYS";
pub const ENV_ROOT_VALIDITY_YEARS: &str = "PKI_ROOT_VALIDITY_YEARS";

/// Tunables for one PKI instance.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PkiConfig {
    /// Bounded wait for the instance lock, in milliseconds.
    pub lock_timeout_ms: u64,
    pub root_key_algorithm: KeyAlgorithm,
    pub leaf_key_algorithm: KeyAlgorithm,
    /// Root validity when the request carries no expiration.
    pub root_validity_years: u32,
    /// Leaf validity when the request carries no expiration.
    pub leaf_validity_days: u32,
    /// Distance between `thisUpdate` and `nextUpdate` of rendered CRLs.
    pub crl_validity_days: u32,
    /// When set, persisted private keys are sealed with this passphrase.
    pub key_passphrase: Option<String>,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            root_key_algorithm: KeyAlgorithm::default(),
            leaf_key_algorithm: KeyAlgorithm::default(),
            root_validity_years: 10,
            leaf_validity_days: 365,
            crl_validity_days: 30,
            key_passphrase: None,
        }
    }
}

// The passphrase must never reach logs.
impl fmt::Debug for PkiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkiConfig")
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("root_key_algorithm", &self.root_key_algorithm)
            .field("leaf_key_algorithm", &self.leaf_key_algorithm)
            .field("root_validity_years", &self.root_validity_years)
            .field("leaf_validity_days", &self.leaf_validity_days)
            .field("crl_validity_days", &self.crl_validity_days)
            .field(
                "key_passphrase",
                &self.key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl PkiConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            lock_timeout_ms: parsed(ENV_LOCK_TIMEOUT_MS).unwrap_or(defaults.lock_timeout_ms),
            leaf_validity_days: parsed(ENV_LEAF_VALIDITY_DAYS)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.leaf_validity_days),
            root_validity_years: parsed(ENV_ROOT_VALIDITY_YEARS)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.root_validity_years),
            key_passphrase: lookup(ENV_KEY_PASSPHRASE).filter(|p| !p.is_empty()),
            ..defaults
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(PkiError::ValidationError(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.root_validity_years == 0 {
            return Err(PkiError::ValidationError(
                "root_validity_years must be greater than zero".to_string(),
            ));
        }
        if self.leaf_validity_days == 0 {
            return Err(PkiError::ValidationError(
                "leaf_validity_days must be greater than zero".to_string(),
            ));
        }
        if self.crl_validity_days == 0 {
            return Err(PkiError::ValidationError(
                "crl_validity_days must be greater than zero".to_string(),
            ));
        }
        self.root_key_algorithm.check_supported()?;
        self.leaf_key_algorithm.check_supported()?;
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
