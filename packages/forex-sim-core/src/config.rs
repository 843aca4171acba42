//! Simulation configuration.
//!
//! Loaded from a TOML file; every field has a default so an absent or
//! partial file is valid.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable pointing at an alternate config file.
pub const CONFIG_ENV: &str = "FOREX_SIM_CONFIG";
/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FOREX_SIM_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    /// Directory holding the JSON records
    pub data_dir: PathBuf,
    /// Cash credited to every new account
    pub starting_balance: f64,
    /// Trades per calendar day on the free plan
    pub daily_trade_limit: u32,
    /// Margin reserved per lot
    pub margin_per_lot: f64,
    /// Account currency per pip per lot
    pub pip_value_per_lot: f64,
    /// Timer period of the tick driver
    pub tick_interval_ms: u64,
    /// Half-width of the uniform random walk step
    pub max_tick_move: f64,
    /// Validate stop-loss / take-profit sides when opening trades
    pub risk_management: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            starting_balance: 100_000.0,
            daily_trade_limit: 50,
            margin_per_lot: 1_000.0,
            pip_value_per_lot: 10.0,
            tick_interval_ms: 3_000,
            max_tick_move: 0.0001,
            risk_management: true,
        }
    }
}

fn base_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".isaac/forex-sim"))
        .unwrap_or_else(|| PathBuf::from(".forex-sim"))
}

fn default_data_dir() -> PathBuf {
    base_dir().join("data")
}

impl SimConfig {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        base_dir().join("config.toml")
    }

    /// Load from the default path, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_path(&Self::default_path())?;
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific path. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let positive = |value: f64| value.is_finite() && value > 0.0;

        if !positive(self.starting_balance) {
            return Err(Error::Config("starting_balance must be positive".to_string()));
        }
        if !(positive(self.margin_per_lot) && positive(self.pip_value_per_lot)) {
            return Err(Error::Config(
                "margin_per_lot and pip_value_per_lot must be positive".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be non-zero".to_string()));
        }
        if !(self.max_tick_move.is_finite() && self.max_tick_move >= 0.0) {
            return Err(Error::Config(
                "max_tick_move must be a finite, non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}
