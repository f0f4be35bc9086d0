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

//! Version parsing and comparison module
//!
//! Appliance firmware versions look like `10.1.9`, `10.1.9-h3` (hotfix) or
//! `10.1.9-c12` (custom build). Both suffixes live on the same hotfix axis.
//! Transfer images carry a trailing `.xfr` and compare equal to the plain
//! release.

use crate::error::{Result, UpgradeError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

const XFR_SUFFIX: &str = ".xfr";

/// Marker used in front of the hotfix number, display only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HotfixMarker {
    #[default]
    None,
    Hotfix,
    Custom,
}

#[derive(Debug, Clone, Copy)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub maintenance: u32,
    pub hotfix: u32,
    marker: HotfixMarker,
}

/// Result of comparing a local version against another one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Older,
    Equal,
    Newer,
}

impl From<Ordering> for Comparison {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Less => Self::Older,
            Ordering::Equal => Self::Equal,
            Ordering::Greater => Self::Newer,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Older => "older",
            Self::Equal => "equal",
            Self::Newer => "newer",
        };
        f.write_str(s)
    }
}

impl Version {
    pub fn new(major: u32, minor: u32, maintenance: u32, hotfix: u32) -> Self {
        let marker = if hotfix > 0 {
            HotfixMarker::Hotfix
        } else {
            HotfixMarker::None
        };
        Self {
            major,
            minor,
            maintenance,
            hotfix,
            marker,
        }
    }

    /// Parse a firmware version string such as `10.1.9-h3` or `9.0.9.xfr`
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_suffix(XFR_SUFFIX).unwrap_or(trimmed);
        let invalid = |detail: &str| UpgradeError::InvalidVersionFormat(format!("{s}: {detail}"));

        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid("expected major.minor[.maintenance[-hN|-cN]]"));
        }

        let major = parse_number(parts[0]).ok_or_else(|| invalid("invalid major component"))?;
        let minor = parse_number(parts[1]).ok_or_else(|| invalid("invalid minor component"))?;

        let (maintenance, hotfix, marker) = match parts.get(2) {
            None => (0, 0, HotfixMarker::None),
            Some(segment) => parse_maintenance(segment).ok_or_else(|| {
                invalid("invalid maintenance component or hotfix marker")
            })?,
        };

        Ok(Self {
            major,
            minor,
            maintenance,
            hotfix,
            marker,
        })
    }

    /// The `major.minor.0` release a point release is installed on top of
    pub fn base(&self) -> Self {
        Self::new(self.major, self.minor, 0, 0)
    }

    pub fn is_base(&self) -> bool {
        self.maintenance == 0 && self.hotfix == 0
    }

    fn key(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.maintenance, self.hotfix)
    }

    /// Weighted distance used to rank near-miss versions for operators
    fn distance(&self, other: &Self) -> u64 {
        u64::from(self.major.abs_diff(other.major)) * 1000
            + u64::from(self.minor.abs_diff(other.minor)) * 100
            + u64::from(self.maintenance.abs_diff(other.maintenance)) * 10
            + u64::from(self.hotfix.abs_diff(other.hotfix))
    }
}

fn parse_number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_maintenance(segment: &str) -> Option<(u32, u32, HotfixMarker)> {
    let Some((maintenance, suffix)) = segment.split_once('-') else {
        return Some((parse_number(segment)?, 0, HotfixMarker::None));
    };

    let maintenance = parse_number(maintenance)?;
    let (marker, digits) = if let Some(digits) = suffix.strip_prefix('h') {
        (HotfixMarker::Hotfix, digits)
    } else if let Some(digits) = suffix.strip_prefix('c') {
        (HotfixMarker::Custom, digits)
    } else {
        return None;
    };

    Some((maintenance, parse_number(digits)?, marker))
}

/// Compare `local` against `other`: `Older` means `local` is behind
pub fn compare(local: &Version, other: &Version) -> Comparison {
    local.cmp(other).into()
}

/// Compare two version strings, returns true if `requested` is newer than `installed`
pub fn is_newer(installed: &str, requested: &str) -> Result<bool> {
    let installed = Version::parse(installed)?;
    let requested = Version::parse(requested)?;
    Ok(requested > installed)
}

/// Rank `candidates` by weighted distance to `target` and return the best `limit`
///
/// Unparseable candidates are ignored, and so is an unparseable target (the
/// result is then empty). Ties are broken by the candidate string so the
/// output is stable.
pub fn closest_matches<I, S>(candidates: I, target: &str, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let Ok(target) = Version::parse(target) else {
        return Vec::new();
    };

    let mut ranked: Vec<(u64, String)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let candidate = candidate.as_ref();
            Version::parse(candidate)
                .ok()
                .map(|v| (v.distance(&target), candidate.to_owned()))
        })
        .collect();

    ranked.sort();
    ranked.truncate(limit);
    ranked.into_iter().map(|(_, candidate)| candidate).collect()
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.maintenance)?;
        match (self.marker, self.hotfix) {
            (HotfixMarker::Custom, n) => write!(f, "-c{n}"),
            (HotfixMarker::Hotfix, n) => write!(f, "-h{n}"),
            (HotfixMarker::None, 0) => Ok(()),
            (HotfixMarker::None, n) => write!(f, "-h{n}"),
        }
    }
}

impl FromStr for Version {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
