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

//! Telemetry module for reporting upgrade events

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpgradeEvent {
    UpgradeStarted {
        device: String,
        from_version: String,
        to_version: String,
        dry_run: bool,
    },
    Deferred {
        device: String,
        peer: Option<String>,
    },
    HaSuspended {
        device: String,
    },
    UpgradeCompleted {
        device: String,
        from_version: String,
        to_version: String,
        duration_secs: u64,
        diff_passed: bool,
    },
    DryRunCompleted {
        device: String,
        from_version: String,
        to_version: String,
    },
    UpgradeFailed {
        device: String,
        to_version: String,
        error: String,
    },
}

/// Report an upgrade event
///
/// Fire-and-forget: a serialization problem is logged, never returned to the
/// pipeline.
pub fn report_event(event: &UpgradeEvent) {
    match serde_json::to_string(event) {
        Ok(event_json) => tracing::info!(target: "fleetup::telemetry", "Telemetry event: {event_json}"),
        Err(e) => tracing::warn!("Failed to serialize telemetry event: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_event_serialization() {
        let event = UpgradeEvent::UpgradeStarted {
            device: "fw-01".to_owned(),
            from_version: "10.1.9".to_owned(),
            to_version: "10.2.4-h1".to_owned(),
            dry_run: false,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "upgrade_started");
        assert_eq!(json["device"], "fw-01");
        assert_eq!(json["from_version"], "10.1.9");
        assert_eq!(json["to_version"], "10.2.4-h1");
        assert_eq!(json["dry_run"], false);
    }

    #[test]
    fn test_upgrade_completed_serialization() {
        let event = UpgradeEvent::UpgradeCompleted {
            device: "fw-01".to_owned(),
            from_version: "10.1.9".to_owned(),
            to_version: "10.2.4".to_owned(),
            duration_secs: 1260,
            diff_passed: true,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "upgrade_completed");
        assert_eq!(json["duration_secs"], 1260);
        assert_eq!(json["diff_passed"], true);
    }

    #[test]
    fn test_deferred_serialization() {
        let event = UpgradeEvent::Deferred {
            device: "fw-01".to_owned(),
            peer: Some("fw-02".to_owned()),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "deferred");
        assert_eq!(json["peer"], "fw-02");
    }

    #[test]
    fn test_report_event() {
        report_event(&UpgradeEvent::HaSuspended {
            device: "fw-01".to_owned(),
        });
    }
}
