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

//! High-availability pair state
//!
//! Devices report HA status as a nested document whose layout depends on the
//! device kind. [`HaFieldPaths`] describes where each field lives, so one
//! parser (and one decision algorithm in [`coordinator`]) serves every kind.

pub mod coordinator;

pub use coordinator::{Decision, HaCoordinator};

use crate::device::{DeviceId, DeviceKind, DeviceRole};
use crate::error::DeviceError;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synchronized,
    Unsynchronized,
}

/// Typed view of a device's HA pair, fetched fresh at every decision point
#[derive(Debug, Clone, PartialEq)]
pub struct HaPairState {
    pub local_role: DeviceRole,
    pub local_version: Version,
    pub peer_version: Version,
    pub peer_role: Option<DeviceRole>,
    pub peer_id: Option<DeviceId>,
    pub sync_state: SyncState,
    /// Payload the state was parsed from, kept for reports
    pub raw: Value,
}

/// Location of each HA field inside a device kind's status document
#[derive(Debug, Clone, Copy)]
pub struct HaFieldPaths {
    pub enabled: &'static [&'static str],
    pub local_role: &'static [&'static str],
    pub local_version: &'static [&'static str],
    pub peer_role: &'static [&'static str],
    pub peer_version: &'static [&'static str],
    pub peer_id: &'static [&'static str],
    pub sync_state: &'static [&'static str],
}

impl HaFieldPaths {
    pub const FIREWALL: Self = Self {
        enabled: &["enabled"],
        local_role: &["group", "local-info", "state"],
        local_version: &["group", "local-info", "build-rel"],
        peer_role: &["group", "peer-info", "state"],
        peer_version: &["group", "peer-info", "build-rel"],
        peer_id: &["group", "peer-info", "serial-num"],
        sync_state: &["group", "running-sync"],
    };

    pub const MANAGER: Self = Self {
        enabled: &["enabled"],
        local_role: &["local-info", "state"],
        local_version: &["local-info", "build-rel"],
        peer_role: &["peer-info", "state"],
        peer_version: &["peer-info", "build-rel"],
        peer_id: &["peer-info", "serial-num"],
        sync_state: &["running-sync"],
    };

    pub fn for_kind(kind: DeviceKind) -> &'static Self {
        match kind {
            DeviceKind::Firewall => &Self::FIREWALL,
            DeviceKind::Manager => &Self::MANAGER,
        }
    }
}

fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(payload, |node, key| node.get(*key))
}

fn required_str<'a>(payload: &'a Value, path: &[&str]) -> Result<&'a str, DeviceError> {
    lookup(payload, path)
        .and_then(Value::as_str)
        .ok_or_else(|| DeviceError::Malformed(format!("missing HA field {}", path.join("."))))
}

fn optional_str<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a str> {
    lookup(payload, path).and_then(Value::as_str)
}

fn parse_version_field(payload: &Value, path: &[&str]) -> Result<Version, DeviceError> {
    let raw = required_str(payload, path)?;
    Version::parse(raw)
        .map_err(|e| DeviceError::Malformed(format!("HA field {}: {e}", path.join("."))))
}

fn set_path(payload: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut node = payload;
    for key in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry((*key).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Value::Object(map) = node {
        map.insert((*last).to_owned(), value);
    }
}

impl HaPairState {
    /// Parse a device kind's HA status document
    ///
    /// Returns `Ok(None)` when HA is not enabled. Missing or malformed
    /// required fields are errors, never defaults.
    pub fn from_payload(kind: DeviceKind, payload: &Value) -> Result<Option<Self>, DeviceError> {
        let paths = HaFieldPaths::for_kind(kind);

        let enabled = match lookup(payload, paths.enabled) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("yes"),
            Some(other) => {
                return Err(DeviceError::Malformed(format!(
                    "unexpected HA enabled flag: {other}"
                )));
            }
            None => {
                return Err(DeviceError::Malformed(
                    "missing HA field enabled".to_owned(),
                ));
            }
        };
        if !enabled {
            return Ok(None);
        }

        let local_role: DeviceRole = required_str(payload, paths.local_role)?.parse()?;
        let local_version = parse_version_field(payload, paths.local_version)?;
        let peer_version = parse_version_field(payload, paths.peer_version)?;
        let peer_role = optional_str(payload, paths.peer_role)
            .map(str::parse::<DeviceRole>)
            .transpose()?;
        let peer_id = optional_str(payload, paths.peer_id).map(DeviceId::from);
        let sync_state = match optional_str(payload, paths.sync_state) {
            Some(s) if s.eq_ignore_ascii_case("synchronized") => SyncState::Synchronized,
            _ => SyncState::Unsynchronized,
        };

        Ok(Some(Self {
            local_role,
            local_version,
            peer_version,
            peer_role,
            peer_id,
            sync_state,
            raw: payload.clone(),
        }))
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync_state == SyncState::Synchronized
    }

    /// Render this state in `kind`'s status layout
    pub fn to_payload(&self, kind: DeviceKind) -> Value {
        let paths = HaFieldPaths::for_kind(kind);
        let mut payload = Value::Object(Map::new());

        set_path(&mut payload, paths.enabled, Value::from("yes"));
        set_path(&mut payload, paths.local_role, Value::from(self.local_role.as_str()));
        set_path(
            &mut payload,
            paths.local_version,
            Value::from(self.local_version.to_string()),
        );
        set_path(
            &mut payload,
            paths.peer_version,
            Value::from(self.peer_version.to_string()),
        );
        if let Some(role) = self.peer_role {
            set_path(&mut payload, paths.peer_role, Value::from(role.as_str()));
        }
        if let Some(id) = &self.peer_id {
            set_path(&mut payload, paths.peer_id, Value::from(id.as_str()));
        }
        let sync = match self.sync_state {
            SyncState::Synchronized => "synchronized",
            SyncState::Unsynchronized => "unsynchronized",
        };
        set_path(&mut payload, paths.sync_state, Value::from(sync));

        payload
    }
}
