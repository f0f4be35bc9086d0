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

//! Upgrade assurance artifacts
//!
//! Layout: `<root>/<device>/<timestamp>/<artifact>` plus
//! `<root>/fleet-summary.json` for batch runs.

use crate::device::DeviceId;
use crate::error::{Result, UpgradeError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const FLEET_SUMMARY: &str = "fleet-summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Readiness,
    PreSnapshot,
    ConfigBackup,
    ConfigBackupDigest,
    PostSnapshot,
    Diff,
}

impl ArtifactKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Readiness => "readiness.json",
            Self::PreSnapshot => "snapshot-pre.json",
            Self::ConfigBackup => "config-backup.xml",
            Self::ConfigBackupDigest => "config-backup.sha256",
            Self::PostSnapshot => "snapshot-post.json",
            Self::Diff => "diff.json",
        }
    }
}

/// Root of the artifact tree
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory for one device run started at `started`
    pub fn device_run(&self, device: &DeviceId, started: DateTime<Utc>) -> Result<DeviceArtifacts> {
        let device_dir = self.root.join(sanitize(device.as_str()));
        fs::create_dir_all(&device_dir)?;

        let stamp = started.format("%Y-%m-%dT%H-%M-%SZ").to_string();
        let mut dir = device_dir.join(&stamp);
        let mut suffix = 1;
        // Two runs of the same device within one second get distinct directories
        while dir.exists() {
            dir = device_dir.join(format!("{stamp}-{suffix}"));
            suffix += 1;
        }
        fs::create_dir(&dir)?;

        tracing::debug!("Artifacts for {device} go to {}", dir.display());
        Ok(DeviceArtifacts { dir })
    }

    pub fn write_fleet_summary<T: Serialize>(&self, summary: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(FLEET_SUMMARY);
        write_atomic(&path, &serde_json::to_vec_pretty(summary)?)?;
        tracing::info!("Fleet summary written to {}", path.display());
        Ok(path)
    }
}

/// Artifact directory of one device run
#[derive(Debug, Clone)]
pub struct DeviceArtifacts {
    dir: PathBuf,
}

impl DeviceArtifacts {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    pub fn write_json<T: Serialize>(&self, kind: ArtifactKind, value: &T) -> Result<PathBuf> {
        let path = self.path(kind);
        write_atomic(&path, &serde_json::to_vec_pretty(value)?)?;
        Ok(path)
    }

    /// Store the raw config export next to its SHA-256 digest; returns the hex digest
    pub fn write_config_backup(&self, config: &[u8]) -> Result<String> {
        if config.is_empty() {
            return Err(UpgradeError::Artifact(
                "device returned an empty configuration".to_owned(),
            ));
        }

        let digest = format!("{:x}", Sha256::digest(config));
        write_atomic(&self.path(ArtifactKind::ConfigBackup), config)?;
        let line = format!("{digest}  {}\n", ArtifactKind::ConfigBackup.file_name());
        write_atomic(&self.path(ArtifactKind::ConfigBackupDigest), line.as_bytes())?;

        tracing::info!("Config backup saved ({} bytes, sha256 {digest})", config.len());
        Ok(digest)
    }
}

/// Write `bytes` to a temp sibling, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes)
        .map_err(|e| UpgradeError::Artifact(format!("{}: {e}", temp_path.display())))?;
    fs::rename(&temp_path, path)
        .map_err(|e| UpgradeError::Artifact(format!("{}: {e}", path.display())))?;
    Ok(())
}

/// Keep device ids usable as a single path component
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn test_device_run_layout() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());

        let run = store.device_run(&"fw-01".into(), started()).unwrap();
        assert_eq!(run.dir(), temp.path().join("fw-01").join("2026-03-14T09-26-53Z"));

        let path = run
            .write_json(ArtifactKind::Readiness, &json!({ "ok": true }))
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "readiness.json");
        let back: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, json!({ "ok": true }));
        assert!(!run.dir().join("readiness.tmp").exists());
    }

    #[test]
    fn test_same_second_runs_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let first = store.device_run(&"fw-01".into(), started()).unwrap();
        let second = store.device_run(&"fw-01".into(), started()).unwrap();
        assert_ne!(first.dir(), second.dir());
        assert!(second.dir().ends_with("2026-03-14T09-26-53Z-1"));
    }

    #[test]
    fn test_config_backup_digest() {
        let temp = TempDir::new().unwrap();
        let run = ArtifactStore::new(temp.path())
            .device_run(&"fw-01".into(), started())
            .unwrap();

        let digest = run.write_config_backup(b"abc").unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            fs::read(run.path(ArtifactKind::ConfigBackup)).unwrap(),
            b"abc"
        );
        let line = fs::read_to_string(run.path(ArtifactKind::ConfigBackupDigest)).unwrap();
        assert_eq!(line, format!("{digest}  config-backup.xml\n"));
    }

    #[test]
    fn test_empty_backup_rejected() {
        let temp = TempDir::new().unwrap();
        let run = ArtifactStore::new(temp.path())
            .device_run(&"fw-01".into(), started())
            .unwrap();
        assert!(matches!(
            run.write_config_backup(b""),
            Err(UpgradeError::Artifact(_))
        ));
    }

    #[test]
    fn test_fleet_summary_and_sanitized_ids() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path().join("reports"));

        let path = store.write_fleet_summary(&json!([{ "device": "a" }])).unwrap();
        assert_eq!(path, temp.path().join("reports").join("fleet-summary.json"));

        let run = store.device_run(&"mgr:01/a".into(), started()).unwrap();
        assert!(run.dir().starts_with(temp.path().join("reports").join("mgr_01_a")));
    }
}
