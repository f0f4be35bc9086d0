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

//! Device state snapshots and their structural diff

use crate::error::{Result, UpgradeError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Sections a device can capture
pub const SNAPSHOT_SECTIONS: &[&str] = &[
    "arp_table",
    "content_version",
    "ip_sec_tunnels",
    "license",
    "nics",
    "routes",
    "session_stats",
];

/// Structured point-in-time device state, one JSON object per section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sections: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.sections.get(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDiff {
    pub passed: bool,
    pub missing_keys: Vec<String>,
    pub added_keys: Vec<String>,
    pub changed_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub sections: BTreeMap<String, SectionDiff>,
}

impl SnapshotDiff {
    pub fn passed(&self) -> bool {
        self.sections.values().all(|s| s.passed)
    }

    /// Names of sections with at least one difference
    pub fn failed_sections(&self) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|(_, s)| !s.passed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Check section names against [`SNAPSHOT_SECTIONS`]
pub fn validate_sections<S: AsRef<str>>(sections: &[S]) -> Result<()> {
    for name in sections {
        let name = name.as_ref();
        if !SNAPSHOT_SECTIONS.contains(&name) {
            return Err(UpgradeError::UnknownSnapshotSection(name.to_owned()));
        }
    }
    Ok(())
}

/// Resolve the enabled sections from a config enable map
///
/// Sections missing from the map are enabled. Unknown names in the map are
/// rejected rather than ignored.
pub fn enabled_sections(overrides: &BTreeMap<String, bool>) -> Result<Vec<String>> {
    validate_sections(&overrides.keys().collect::<Vec<_>>())?;
    Ok(SNAPSHOT_SECTIONS
        .iter()
        .filter(|name| overrides.get(**name).copied().unwrap_or(true))
        .map(|name| (*name).to_owned())
        .collect())
}

/// Compare two snapshots over `sections`
///
/// A section absent from either snapshot is compared as an empty object.
pub fn diff<S: AsRef<str>>(pre: &Snapshot, post: &Snapshot, sections: &[S]) -> SnapshotDiff {
    let empty = Value::Object(Map::new());
    let sections = sections
        .iter()
        .map(|name| {
            let name = name.as_ref();
            let before = pre.sections.get(name).unwrap_or(&empty);
            let after = post.sections.get(name).unwrap_or(&empty);
            (name.to_owned(), diff_section(before, after))
        })
        .collect();

    SnapshotDiff { sections }
}

fn diff_section(before: &Value, after: &Value) -> SectionDiff {
    let mut out = SectionDiff::default();
    walk("", before, after, &mut out);
    out.missing_keys.sort();
    out.added_keys.sort();
    out.changed_keys.sort();
    out.passed =
        out.missing_keys.is_empty() && out.added_keys.is_empty() && out.changed_keys.is_empty();
    out
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

fn walk(prefix: &str, before: &Value, after: &Value, out: &mut SectionDiff) {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old) in a {
                let path = join(prefix, key);
                match b.get(key) {
                    Some(new) => walk(&path, old, new, out),
                    None => out.missing_keys.push(path),
                }
            }
            for key in b.keys().filter(|k| !a.contains_key(*k)) {
                out.added_keys.push(join(prefix, key));
            }
        }
        (a, b) if a == b => {}
        _ => {
            // A scalar at the section root has no key of its own
            let path = if prefix.is_empty() { "." } else { prefix };
            out.changed_keys.push(path.to_owned());
        }
    }
}
