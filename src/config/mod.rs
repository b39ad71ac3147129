//! Configuration management for the position sentinel.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler cadence and maximization window parameters
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Risk gate limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Price oracle behavior
    #[serde(default)]
    pub oracle: OracleConfig,
    /// Virtual balance ledger settings
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// State persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Base monitoring loop interval in seconds
    #[serde(default = "default_base_interval_seconds")]
    pub base_interval_seconds: u64,
    /// Maximization window polling interval in seconds
    #[serde(default = "default_maximization_interval_seconds")]
    pub maximization_interval_seconds: u64,
    /// Maximum iterations per maximization window
    #[serde(default = "default_maximization_max_iterations")]
    pub maximization_max_iterations: u32,
    /// Price rebound (in percent) from the best seen that ends a window
    #[serde(default = "default_rebound_threshold_pct")]
    pub rebound_threshold_pct: Decimal,
    /// Distance (in percent) from an entry target that switches a waiting
    /// position to high-frequency monitoring
    #[serde(default = "default_proximity_band_pct")]
    pub proximity_band_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum unrealized drawdown as a fraction of equity (0.0-1.0)
    #[serde(default = "default_max_drawdown_ratio")]
    pub max_drawdown_ratio: Decimal,
    /// Maximum total invested notional across active positions
    #[serde(default = "default_max_exposure")]
    pub max_exposure: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Consecutive unrecoverable oracle failures before a position is failed
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Attempts per ledger write before the transition is abandoned this tick
    #[serde(default = "default_ledger_retry_attempts")]
    pub retry_attempts: u32,
    /// Starting virtual balance credited to new demo users
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_base_interval_seconds() -> u64 {
    30
}

fn default_maximization_interval_seconds() -> u64 {
    5
}

fn default_maximization_max_iterations() -> u32 {
    60 // 5 minutes at the default 5s interval
}

fn default_rebound_threshold_pct() -> Decimal {
    Decimal::new(2, 1) // 0.2%
}

fn default_proximity_band_pct() -> Decimal {
    Decimal::new(20, 1) // 2.0%
}

fn default_max_drawdown_ratio() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_max_exposure() -> Decimal {
    Decimal::new(1000, 0) // 1000 notional units
}

fn default_retry_budget() -> u32 {
    5
}

fn default_ledger_retry_attempts() -> u32 {
    3
}

fn default_initial_balance() -> Decimal {
    Decimal::new(10000, 0) // 10,000 quote units for demo accounts
}

fn default_db_path() -> String {
    "data/positions.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("PSL"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.tracker.base_interval_seconds > 0,
            "base_interval_seconds must be positive"
        );

        anyhow::ensure!(
            self.tracker.maximization_interval_seconds > 0
                && self.tracker.maximization_max_iterations > 0,
            "maximization window must have a positive interval and iteration budget"
        );

        anyhow::ensure!(
            self.tracker.rebound_threshold_pct > Decimal::ZERO
                && self.tracker.rebound_threshold_pct < Decimal::new(100, 0),
            "rebound_threshold_pct must be between 0 and 100"
        );

        anyhow::ensure!(
            self.tracker.proximity_band_pct > Decimal::ZERO
                && self.tracker.proximity_band_pct < Decimal::new(100, 0),
            "proximity_band_pct must be between 0 and 100"
        );

        anyhow::ensure!(
            self.risk.max_drawdown_ratio > Decimal::ZERO
                && self.risk.max_drawdown_ratio <= Decimal::ONE,
            "max_drawdown_ratio must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.max_exposure > Decimal::ZERO,
            "max_exposure must be positive"
        );

        anyhow::ensure!(
            self.ledger.retry_attempts >= 1,
            "ledger retry_attempts must be at least 1"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            risk: RiskConfig::default(),
            oracle: OracleConfig::default(),
            ledger: LedgerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: default_base_interval_seconds(),
            maximization_interval_seconds: default_maximization_interval_seconds(),
            maximization_max_iterations: default_maximization_max_iterations(),
            rebound_threshold_pct: default_rebound_threshold_pct(),
            proximity_band_pct: default_proximity_band_pct(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_ratio: default_max_drawdown_ratio(),
            max_exposure: default_max_exposure(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_ledger_retry_attempts(),
            initial_balance: default_initial_balance(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
