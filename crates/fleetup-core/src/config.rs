// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FleetUp.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Configuration module for the upgrade engine

use crate::error::{Result, UpgradeError};
use crate::phase::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_3() -> u32 {
    3
}

fn default_30() -> u32 {
    30
}

fn default_40() -> u32 {
    40
}

fn default_60() -> u64 {
    60
}

fn default_30_secs() -> u64 {
    30
}

fn default_120() -> u64 {
    120
}

fn default_threads() -> usize {
    10
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("assurance")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Retries for one-shot device reads and the reboot command
    #[serde(default)]
    pub query: PhaseConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub install: PhaseConfig,

    #[serde(default)]
    pub reboot: RebootConfig,

    #[serde(default)]
    pub ha_resync: PhaseConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub snapshots: SnapshotConfig,

    #[serde(default)]
    pub reports: ReportsConfig,
}

/// Attempt budget shared by device queries, install and HA resync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(default = "default_3")]
    pub max_tries: u32,

    #[serde(default = "default_60")]
    pub retry_interval_secs: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            retry_interval_secs: 60,
        }
    }
}

impl PhaseConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_tries, Duration::from_secs(self.retry_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_3")]
    pub max_tries: u32,

    #[serde(default = "default_60")]
    pub retry_interval_secs: u64,

    /// How often the device's image list is polled while a download runs
    #[serde(default = "default_30_secs")]
    pub poll_interval_secs: u64,

    /// Polls per attempt before the attempt is given up
    #[serde(default = "default_40")]
    pub poll_limit: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            retry_interval_secs: 60,
            poll_interval_secs: 30,
            poll_limit: 40,
        }
    }
}

impl DownloadConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_tries, Duration::from_secs(self.retry_interval_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootConfig {
    #[serde(default = "default_30")]
    pub max_tries: u32,

    #[serde(default = "default_60")]
    pub retry_interval_secs: u64,

    /// Sleep after issuing the reboot before the first version poll
    #[serde(default = "default_120")]
    pub grace_period_secs: u64,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            max_tries: 30,
            retry_interval_secs: 60,
            grace_period_secs: 120,
        }
    }
}

impl RebootConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_tries, Duration::from_secs(self.retry_interval_secs))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { threads: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait after the device is back on the target version before the post snapshot
    #[serde(default = "default_60")]
    pub post_upgrade_settle_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            post_upgrade_settle_secs: 60,
        }
    }
}

impl TimingConfig {
    pub fn post_upgrade_settle(&self) -> Duration {
        Duration::from_secs(self.post_upgrade_settle_secs)
    }
}

/// Enable map for readiness checks; checks missing from the map use the catalog default
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub checks: BTreeMap<String, bool>,
}

/// Enable map for snapshot sections; sections missing from the map are enabled
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub sections: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_reports_dir")]
    pub directory: PathBuf,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            directory: default_reports_dir(),
        }
    }
}

/// Load the TOML config at `path`, falling back to defaults when it does not exist
pub fn load_config(path: &Path) -> Result<FleetConfig> {
    if !path.exists() {
        tracing::info!("No config at {}, using defaults", path.display());
        return Ok(FleetConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<FleetConfig> {
    let config: FleetConfig = toml::from_str(content)
        .map_err(|e| UpgradeError::Config(format!("Failed to parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}

impl FleetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency.threads == 0 {
            return Err(UpgradeError::Config(
                "concurrency.threads must be at least 1".to_owned(),
            ));
        }
        if self.download.poll_limit == 0 {
            return Err(UpgradeError::Config(
                "download.poll_limit must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
