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

//! Pre-upgrade readiness checks
//!
//! The device runs the checks; this module decides which ones to ask for and
//! what a failure means for the pipeline.

use crate::config::ReadinessConfig;
use crate::device::{CheckResult, DeviceId};
use crate::error::{Result, UpgradeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPolicy {
    pub severity: Severity,
    pub exit_on_failure: bool,
}

impl CheckPolicy {
    const BLOCKING: Self = Self {
        severity: Severity::Error,
        exit_on_failure: true,
    };

    const ADVISORY: Self = Self {
        severity: Severity::Warn,
        exit_on_failure: false,
    };

    pub fn blocks(self) -> bool {
        self.severity == Severity::Error && self.exit_on_failure
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessCheck {
    pub name: &'static str,
    pub policy: CheckPolicy,
    pub enabled_by_default: bool,
}

const fn check(name: &'static str, policy: CheckPolicy, enabled_by_default: bool) -> ReadinessCheck {
    ReadinessCheck {
        name,
        policy,
        enabled_by_default,
    }
}

pub const READINESS_CHECKS: &[ReadinessCheck] = &[
    check("active_support", CheckPolicy::BLOCKING, true),
    check("arp_entry_exist", CheckPolicy::ADVISORY, false),
    check("candidate_config", CheckPolicy::BLOCKING, true),
    check("certificates_requirements", CheckPolicy::ADVISORY, false),
    check("content_version", CheckPolicy::BLOCKING, true),
    check("dynamic_updates", CheckPolicy::ADVISORY, true),
    check("expired_licenses", CheckPolicy::BLOCKING, true),
    check("free_disk_space", CheckPolicy::BLOCKING, true),
    check("ha", CheckPolicy::BLOCKING, true),
    check("ip_sec_tunnel_status", CheckPolicy::ADVISORY, false),
    check("jobs", CheckPolicy::BLOCKING, true),
    check("ntp_sync", CheckPolicy::ADVISORY, true),
    check("panorama", CheckPolicy::ADVISORY, true),
    check("planes_clock_sync", CheckPolicy::BLOCKING, true),
    check("session_exist", CheckPolicy::ADVISORY, false),
];

pub fn lookup(name: &str) -> Option<&'static ReadinessCheck> {
    READINESS_CHECKS.iter().find(|c| c.name == name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub reason: String,
    pub policy: CheckPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub checks: Vec<CheckOutcome>,
}

impl ReadinessReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// First failed check whose policy stops the upgrade
    pub fn blocking_failure(&self) -> Option<&CheckOutcome> {
        self.checks
            .iter()
            .find(|c| !c.passed && c.policy.blocks())
    }

    pub fn ensure_ready(&self) -> Result<()> {
        match self.blocking_failure() {
            Some(check) => Err(UpgradeError::ReadinessFailed {
                check: check.name.clone(),
                reason: check.reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Enabled readiness checks and how to weigh their results
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    checks: Vec<&'static ReadinessCheck>,
}

impl ReadinessGate {
    /// Resolve the enabled checks; config entries override catalog defaults
    pub fn from_config(config: &ReadinessConfig) -> Result<Self> {
        if let Some(unknown) = config.checks.keys().find(|name| lookup(name).is_none()) {
            return Err(UpgradeError::UnknownReadinessCheck(unknown.clone()));
        }

        let checks = READINESS_CHECKS
            .iter()
            .filter(|c| {
                config
                    .checks
                    .get(c.name)
                    .copied()
                    .unwrap_or(c.enabled_by_default)
            })
            .collect();
        Ok(Self { checks })
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let checks = names
            .iter()
            .map(|name| {
                lookup(name.as_ref())
                    .ok_or_else(|| UpgradeError::UnknownReadinessCheck(name.as_ref().to_owned()))
            })
            .collect::<Result<_>>()?;
        Ok(Self { checks })
    }

    pub fn names(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name.to_owned()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Weigh the device's results; a check the device did not report counts as failed
    pub fn evaluate(
        &self,
        device: &DeviceId,
        results: &BTreeMap<String, CheckResult>,
    ) -> ReadinessReport {
        let checks = self
            .checks
            .iter()
            .map(|c| {
                let (passed, reason) = match results.get(c.name) {
                    Some(result) => (result.passed, result.reason.clone()),
                    None => (false, "no result reported".to_owned()),
                };

                if passed {
                    info!(device = %device, check = c.name, "Readiness check passed");
                } else if c.policy.blocks() {
                    error!(device = %device, check = c.name, "Readiness check failed: {reason}");
                } else {
                    warn!(device = %device, check = c.name, "Readiness check failed, continuing: {reason}");
                }

                CheckOutcome {
                    name: c.name.to_owned(),
                    passed,
                    reason,
                    policy: c.policy,
                }
            })
            .collect();

        ReadinessReport { checks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(pairs: &[(&str, CheckResult)]) -> BTreeMap<String, CheckResult> {
        pairs
            .iter()
            .map(|(name, r)| ((*name).to_owned(), r.clone()))
            .collect()
    }

    #[test]
    fn test_catalog_is_sorted_and_unique() {
        let names: Vec<_> = READINESS_CHECKS.iter().map(|c| c.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_defaults_and_overrides() {
        let gate = ReadinessGate::from_config(&ReadinessConfig::default()).unwrap();
        let names = gate.names();
        assert!(names.contains(&"free_disk_space".to_owned()));
        assert!(!names.contains(&"session_exist".to_owned()));

        let mut config = ReadinessConfig::default();
        config.checks.insert("session_exist".to_owned(), true);
        config.checks.insert("ntp_sync".to_owned(), false);
        let names = ReadinessGate::from_config(&config).unwrap().names();
        assert!(names.contains(&"session_exist".to_owned()));
        assert!(!names.contains(&"ntp_sync".to_owned()));
    }

    #[test]
    fn test_unknown_check_is_contract_error() {
        let mut config = ReadinessConfig::default();
        config.checks.insert("vibes".to_owned(), true);
        assert!(matches!(
            ReadinessGate::from_config(&config),
            Err(UpgradeError::UnknownReadinessCheck(name)) if name == "vibes"
        ));
        assert!(ReadinessGate::from_names(&["ha", "nope"]).is_err());
    }

    #[test]
    fn test_blocking_failure_stops_upgrade() {
        let gate = ReadinessGate::from_names(&["free_disk_space", "ntp_sync"]).unwrap();
        let report = gate.evaluate(
            &DeviceId::from("fw-01"),
            &results(&[
                ("free_disk_space", CheckResult::fail("2 GB free, 5 GB needed")),
                ("ntp_sync", CheckResult::pass()),
            ]),
        );
        assert!(!report.passed());
        match report.ensure_ready() {
            Err(UpgradeError::ReadinessFailed { check, reason }) => {
                assert_eq!(check, "free_disk_space");
                assert_eq!(reason, "2 GB free, 5 GB needed");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_advisory_failure_is_logged_only() {
        let gate = ReadinessGate::from_names(&["ha", "ntp_sync"]).unwrap();
        let report = gate.evaluate(
            &DeviceId::from("fw-01"),
            &results(&[
                ("ha", CheckResult::pass()),
                ("ntp_sync", CheckResult::fail("drift 4s")),
            ]),
        );
        assert!(!report.passed());
        assert!(report.blocking_failure().is_none());
        assert!(report.ensure_ready().is_ok());
    }

    #[test]
    fn test_missing_result_counts_as_failed() {
        let gate = ReadinessGate::from_names(&["jobs"]).unwrap();
        let report = gate.evaluate(&DeviceId::from("fw-01"), &BTreeMap::new());
        assert_eq!(report.checks[0].reason, "no result reported");
        assert!(report.ensure_ready().is_err());
    }
}
