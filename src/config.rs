//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section except `[marketplace]` has defaults, so a minimal file
//! only names the marketplace.

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub marketplace: MarketplaceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketplaceConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_url: "sqlite://adsim.db?mode=rwc".into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReportingConfig {
    /// Offset of the marketplace's "local" day from UTC.
    pub utc_offset_minutes: i32,
    pub default_window_days: u32,
    pub max_window_days: u32,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            default_window_days: 7,
            max_window_days: 90,
        }
    }
}

impl ReportingConfig {
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .with_context(|| format!("UTC offset out of range: {} minutes", self.utc_offset_minutes))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimulationConfig {
    pub max_batch: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { max_batch: 1000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SeedConfig {
    pub enabled: bool,
    pub opportunities: u32,
    pub history_days: u32,
    /// Fixed RNG seed for reproducible demo data.
    pub rng_seed: Option<u64>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            opportunities: 1000,
            history_days: 30,
            rng_seed: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let r = &self.reporting;
        if r.max_window_days == 0 {
            bail!("reporting.max_window_days must be at least 1");
        }
        if r.default_window_days == 0 || r.default_window_days > r.max_window_days {
            bail!(
                "reporting.default_window_days must be between 1 and {}",
                r.max_window_days
            );
        }
        r.utc_offset()?;
        if self.simulation.max_batch == 0 {
            bail!("simulation.max_batch must be at least 1");
        }
        if self.seed.enabled && self.seed.history_days == 0 {
            bail!("seed.history_days must be at least 1");
        }
        Ok(())
    }
}
