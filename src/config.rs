//! Configuration for fleetpace.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// fleetpace configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the rate-limit ledger and logs.
    pub data_dir: PathBuf,
    /// Seed for identity selection and jitter (random when unset).
    pub seed: Option<u64>,
    /// Campaign task pacing.
    pub pacing: PacingSettings,
    /// Convergence reconciler settings.
    pub reconciler: ReconcilerSettings,
    /// Distribution scheduler settings.
    pub scheduler: SchedulerSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fleetpace");

        Self {
            data_dir,
            seed: None,
            pacing: PacingSettings::default(),
            reconciler: ReconcilerSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Primary location: ~/.config/fleetpace/fleetpace.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join("fleetpace").join("fleetpace.yml");
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        let fallback_config = PathBuf::from("fleetpace.yml");
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pacing.min_delay_secs > self.pacing.max_delay_secs {
            eyre::bail!("pacing.min_delay_secs must not exceed pacing.max_delay_secs");
        }
        if self.reconciler.join_delay_min_ms > self.reconciler.join_delay_max_ms {
            eyre::bail!("reconciler.join_delay_min_ms must not exceed reconciler.join_delay_max_ms");
        }
        if self.reconciler.interval_secs == 0 {
            eyre::bail!("reconciler.interval_secs must be positive");
        }
        Ok(())
    }

    /// Path of the rate-limit ledger file.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("rate_limits.jsonl")
    }

    /// Directory for log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Delay between consecutive steps of a campaign task.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PacingSettings {
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            min_delay_secs: 30,
            max_delay_secs: 120,
        }
    }
}

impl PacingSettings {
    pub fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Convergence reconciler settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    /// Lower bound of the pause between consecutive joins.
    pub join_delay_min_ms: u64,
    /// Upper bound of the pause between consecutive joins.
    pub join_delay_max_ms: u64,
    /// Interval between periodic sweeps.
    pub interval_secs: u64,
    /// Leave the resource before dropping a participation record when trimming.
    pub unsubscribe_on_trim: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            join_delay_min_ms: 1_000,
            join_delay_max_ms: 5_000,
            interval_secs: 600,
            unsubscribe_on_trim: false,
        }
    }
}

impl ReconcilerSettings {
    pub fn join_delay_min(&self) -> Duration {
        Duration::from_millis(self.join_delay_min_ms)
    }

    pub fn join_delay_max(&self) -> Duration {
        Duration::from_millis(self.join_delay_max_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Distribution scheduler settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Upper bound on timers waiting at once; posts that would exceed it are refused.
    pub max_pending: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { max_pending: 10_000 }
    }
}
