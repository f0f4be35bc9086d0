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

//! Capability interface of a managed appliance
//!
//! The engine never talks to hardware directly. Everything it needs from a
//! device goes through [`DeviceClient`]; the API binding (or the simulator in
//! [`crate::sim`]) implements it.

use crate::error::DeviceError;
use crate::ha::HaPairState;
use crate::snapshot::Snapshot;
use crate::version::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Stable identifier of a device (hostname or serial)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Family of appliance; selects HA role vocabulary and payload layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Firewall,
    Manager,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firewall => f.write_str("firewall"),
            Self::Manager => f.write_str("manager"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceRole {
    Standalone,
    Active,
    Passive,
    Initial,
    PrimaryActive,
    SecondaryPassive,
    SecondarySuspended,
    SecondaryNonFunctional,
}

impl DeviceRole {
    /// Upgrading an active-class member first would force a failover
    pub fn is_active_class(self) -> bool {
        matches!(self, Self::Active | Self::PrimaryActive)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Active => "active",
            Self::Passive => "passive",
            Self::Initial => "initial",
            Self::PrimaryActive => "primary-active",
            Self::SecondaryPassive => "secondary-passive",
            Self::SecondarySuspended => "secondary-suspended",
            Self::SecondaryNonFunctional => "secondary-non-functional",
        }
    }

    /// Whether this role belongs to the HA vocabulary of `kind`
    pub fn is_valid_for(self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Firewall => matches!(self, Self::Active | Self::Passive | Self::Initial),
            DeviceKind::Manager => matches!(
                self,
                Self::PrimaryActive
                    | Self::SecondaryPassive
                    | Self::SecondarySuspended
                    | Self::SecondaryNonFunctional
            ),
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let role = match s.trim().to_lowercase().replace('_', "-").as_str() {
            "standalone" => Self::Standalone,
            "active" => Self::Active,
            "passive" => Self::Passive,
            "initial" => Self::Initial,
            "primary-active" => Self::PrimaryActive,
            "secondary-passive" => Self::SecondaryPassive,
            "secondary-suspended" => Self::SecondarySuspended,
            "secondary-non-functional" => Self::SecondaryNonFunctional,
            other => return Err(DeviceError::Malformed(format!("unknown HA role: {other}"))),
        };
        Ok(role)
    }
}

/// Download state of one software image on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageStatus {
    pub downloaded: bool,
}

/// Result of one readiness check as reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    #[serde(default)]
    pub reason: String,
}

impl CheckResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: String::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn id(&self) -> &DeviceId;

    fn kind(&self) -> DeviceKind;

    /// Current HA state; `None` for a standalone device
    async fn ha_state(&self) -> Result<Option<HaPairState>, DeviceError>;

    async fn version(&self) -> Result<Version, DeviceError>;

    /// Images known to the device, keyed by version string
    async fn available_versions(&self) -> Result<BTreeMap<String, ImageStatus>, DeviceError>;

    /// Starts an asynchronous download; progress shows up in [`Self::available_versions`]
    async fn download_version(&self, version: &str) -> Result<(), DeviceError>;

    async fn install(&self, version: &str) -> Result<bool, DeviceError>;

    async fn reboot(&self) -> Result<(), DeviceError>;

    /// Suspends this device's HA membership so its peer takes over
    async fn suspend_ha(&self) -> Result<bool, DeviceError>;

    async fn take_snapshot(&self, sections: &[String]) -> Result<Snapshot, DeviceError>;

    async fn run_readiness_checks(
        &self,
        checks: &[String],
    ) -> Result<BTreeMap<String, CheckResult>, DeviceError>;

    /// Raw running configuration export
    async fn backup_config(&self) -> Result<Vec<u8>, DeviceError>;
}

/// Opens a [`DeviceClient`] for a device identifier
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, id: &DeviceId) -> Result<Arc<dyn DeviceClient>, DeviceError>;
}
