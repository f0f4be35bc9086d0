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

//! Error types for the upgrade engine

use crate::phase::Phase;
use thiserror::Error;

/// Errors reported by a device capability call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("software manager busy")]
    Busy,

    #[error("device rejected request: {0}")]
    Rejected(String),

    #[error("malformed device response: {0}")]
    Malformed(String),
}

impl DeviceError {
    /// Transport hiccups and a busy software manager are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Busy)
    }
}

/// How an error affects the run it occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried within the phase's attempt budget
    Transient,
    /// Aborts the pipeline of one device
    FatalDevice,
    /// Aborts before (or instead of) any device pipeline
    FatalProcess,
    /// Invalid input from the caller, never skipped
    Contract,
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("invalid version format: {0}")]
    InvalidVersionFormat(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("device stopped responding: {0}")]
    Unresponsive(DeviceError),

    #[error("HA coordinator refused upgrade: {0}")]
    HaRefused(String),

    #[error("still deferred: HA peer {peer} has not moved ahead")]
    StillDeferred { peer: String },

    #[error("requested version {requested} is not newer than installed {installed}")]
    Downgrade { installed: String, requested: String },

    #[error("version {requested} is not available (closest: {})", .closest.join(", "))]
    VersionUnavailable {
        requested: String,
        closest: Vec<String>,
    },

    #[error("{phase} failed after {attempts} attempts: {last}")]
    PhaseExhausted {
        phase: Phase,
        attempts: u32,
        last: String,
    },

    #[error("install of {version} reported failure")]
    InstallFailed { version: String },

    #[error("device came back on {actual}, expected {expected}")]
    UnexpectedVersion { expected: String, actual: String },

    #[error("readiness check {check} failed: {reason}")]
    ReadinessFailed { check: String, reason: String },

    #[error("unknown readiness check: {0}")]
    UnknownReadinessCheck(String),

    #[error("unknown snapshot section: {0}")]
    UnknownSnapshotSection(String),

    #[error("cannot connect to {device}: {source}")]
    Connect {
        device: String,
        #[source]
        source: DeviceError,
    },

    #[error("device task panicked: {0}")]
    Panicked(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UpgradeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Device(e) if e.is_transient() => ErrorClass::Transient,
            Self::Device(_)
            | Self::Unresponsive(_)
            | Self::HaRefused(_)
            | Self::StillDeferred { .. }
            | Self::Downgrade { .. }
            | Self::VersionUnavailable { .. }
            | Self::PhaseExhausted { .. }
            | Self::InstallFailed { .. }
            | Self::UnexpectedVersion { .. }
            | Self::ReadinessFailed { .. }
            | Self::Panicked(_)
            | Self::Artifact(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorClass::FatalDevice,
            Self::Connect { .. } | Self::Cancelled | Self::Config(_) => ErrorClass::FatalProcess,
            Self::InvalidVersionFormat(_)
            | Self::UnknownReadinessCheck(_)
            | Self::UnknownSnapshotSection(_) => ErrorClass::Contract,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// A transient error that ends a pipeline is fatal for that device
    #[must_use]
    pub fn escalate(self) -> Self {
        if let Self::Device(e) = &self {
            if e.is_transient() {
                return Self::Unresponsive(e.clone());
            }
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, UpgradeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_transience() {
        assert!(DeviceError::Transport("timeout".to_owned()).is_transient());
        assert!(DeviceError::Busy.is_transient());
        assert!(!DeviceError::Rejected("no".to_owned()).is_transient());
        assert!(!DeviceError::Malformed("xml".to_owned()).is_transient());
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            UpgradeError::from(DeviceError::Busy).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            UpgradeError::Downgrade {
                installed: "10.1.0".to_owned(),
                requested: "10.0.0".to_owned(),
            }
            .class(),
            ErrorClass::FatalDevice
        );
        assert_eq!(UpgradeError::Cancelled.class(), ErrorClass::FatalProcess);
        assert_eq!(
            UpgradeError::UnknownSnapshotSection("bogus".to_owned()).class(),
            ErrorClass::Contract
        );
    }

    #[test]
    fn test_escalate_only_touches_transient_errors() {
        let escalated = UpgradeError::from(DeviceError::Transport("timeout".to_owned())).escalate();
        assert!(matches!(escalated, UpgradeError::Unresponsive(DeviceError::Transport(_))));
        assert_eq!(escalated.class(), ErrorClass::FatalDevice);

        let rejected = UpgradeError::from(DeviceError::Rejected("no".to_owned())).escalate();
        assert!(matches!(rejected, UpgradeError::Device(DeviceError::Rejected(_))));
        assert_eq!(UpgradeError::Cancelled.escalate().class(), ErrorClass::FatalProcess);
    }

    #[test]
    fn test_unavailable_message_lists_closest() {
        let err = UpgradeError::VersionUnavailable {
            requested: "10.1.4".to_owned(),
            closest: vec!["10.1.3".to_owned(), "10.1.5".to_owned()],
        };
        assert_eq!(
            err.to_string(),
            "version 10.1.4 is not available (closest: 10.1.3, 10.1.5)"
        );
    }
}
