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

//! In-memory device fleet
//!
//! Every simulated device lives in one shared table, so HA peers see each
//! other's version and role changes as they happen. Fault injection covers
//! the failure modes the engine has to survive: unreachable hosts, a busy
//! software manager, slow downloads, long reboots and devices that come
//! back on the wrong image.

use crate::device::{
    CheckResult, DeviceClient, DeviceConnector, DeviceId, DeviceKind, DeviceRole, ImageStatus,
};
use crate::error::{DeviceError, Result, UpgradeError};
use crate::ha::{HaPairState, SyncState};
use crate::snapshot::{SNAPSHOT_SECTIONS, Snapshot};
use crate::version::Version;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimHaSpec {
    pub role: DeviceRole,
    pub peer: DeviceId,

    /// Version of a peer that is not part of the simulated fleet
    #[serde(default)]
    pub peer_version: Option<Version>,

    #[serde(default)]
    pub peer_role: Option<DeviceRole>,

    #[serde(default = "default_true")]
    pub synchronized: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimFaults {
    /// Connecting fails with a transport error
    pub unreachable: bool,

    /// Number of install calls answered with "software manager busy"
    pub busy_installs: u32,

    /// Install completes but reports failure
    pub install_fails: bool,

    /// The install call crashes the worker
    pub panic_on_install: bool,

    /// Image listings before a started download completes
    pub download_polls: u32,

    pub reject_downloads: bool,

    /// Version reads that time out before the device answers
    pub query_timeouts: u32,

    /// Version polls answered with a transport error after a reboot
    pub reboot_downtime_polls: u32,

    /// Image the device boots into instead of the installed one
    pub boots_into: Option<Version>,

    /// Readiness checks that fail, with their reason
    pub failing_checks: BTreeMap<String, String>,

    pub suspend_rejected: bool,

    /// Snapshot sections replaced after the upgrade reboot
    pub post_upgrade_drift: BTreeMap<String, Value>,
}

/// Inventory description of one simulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDeviceSpec {
    pub id: DeviceId,

    #[serde(default)]
    pub kind: DeviceKind,

    pub version: Version,

    /// Images listed by the device; the value tells whether it is already downloaded
    #[serde(default)]
    pub images: BTreeMap<String, bool>,

    /// Releases listed only once their base image is downloaded
    #[serde(default)]
    pub gated_images: Vec<String>,

    #[serde(default)]
    pub ha: Option<SimHaSpec>,

    #[serde(default)]
    pub faults: SimFaults,

    /// Snapshot sections overriding the generated ones
    #[serde(default)]
    pub snapshot: BTreeMap<String, Value>,
}

impl SimDeviceSpec {
    pub fn new(id: &str, kind: DeviceKind, version: Version) -> Self {
        Self {
            id: DeviceId::from(id),
            kind,
            version,
            images: BTreeMap::new(),
            gated_images: Vec::new(),
            ha: None,
            faults: SimFaults::default(),
            snapshot: BTreeMap::new(),
        }
    }

    /// List `version` as an image; `downloaded` marks it as already on disk
    pub fn with_image(mut self, version: &str, downloaded: bool) -> Self {
        self.images.insert(version.to_owned(), downloaded);
        self
    }

    pub fn with_ha(mut self, role: DeviceRole, peer: &str) -> Self {
        self.ha = Some(SimHaSpec {
            role,
            peer: DeviceId::from(peer),
            peer_version: None,
            peer_role: None,
            synchronized: true,
        });
        self
    }
}

/// Calls the engine made against one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub download_calls: u32,
    pub install_calls: u32,
    pub reboot_calls: u32,
    pub suspend_calls: u32,
    pub snapshot_calls: u32,
    pub readiness_calls: u32,
    pub backup_calls: u32,
}

#[derive(Debug, Clone)]
pub struct SimDeviceState {
    pub kind: DeviceKind,
    pub version: Version,
    pub images: BTreeMap<String, bool>,
    pub gated_images: Vec<String>,
    pub ha: Option<SimHaSpec>,
    pub faults: SimFaults,
    pub snapshot: BTreeMap<String, Value>,
    pub counters: SimCounters,
    /// Running downloads and the listings left before each completes
    downloads: BTreeMap<String, u32>,
    pending_install: Option<Version>,
    downtime_left: u32,
}

impl SimDeviceState {
    fn from_spec(spec: SimDeviceSpec) -> Self {
        let mut snapshot: BTreeMap<String, Value> = SNAPSHOT_SECTIONS
            .iter()
            .map(|name| ((*name).to_owned(), generated_section(name)))
            .collect();
        snapshot.extend(spec.snapshot);

        Self {
            kind: spec.kind,
            version: spec.version,
            images: spec.images,
            gated_images: spec.gated_images,
            ha: spec.ha,
            faults: spec.faults,
            snapshot,
            counters: SimCounters::default(),
            downloads: BTreeMap::new(),
            pending_install: None,
            downtime_left: 0,
        }
    }

    /// Images visible right now, downloaded flag included
    fn listing(&self) -> BTreeMap<String, bool> {
        let mut listing = self.images.clone();
        for gated in &self.gated_images {
            let unlocked = Version::parse(gated)
                .ok()
                .is_some_and(|v| self.images.get(&v.base().to_string()) == Some(&true));
            if unlocked {
                listing.entry(gated.clone()).or_insert(false);
            }
        }
        listing
    }

    fn advance_downloads(&mut self) {
        let mut finished = Vec::new();
        for (version, left) in &mut self.downloads {
            if *left == 0 {
                finished.push(version.clone());
            } else {
                *left -= 1;
            }
        }
        for version in finished {
            self.downloads.remove(&version);
            self.images.insert(version, true);
        }
    }
}

fn generated_section(name: &str) -> Value {
    match name {
        "arp_table" => json!({
            "10.0.0.1": { "interface": "ethernet1/1", "mac": "00:1b:17:00:01:01" },
            "10.0.1.1": { "interface": "ethernet1/2", "mac": "00:1b:17:00:02:01" }
        }),
        "content_version" => json!({ "version": "8799-8509" }),
        "license" => json!({
            "threat-prevention": { "expires": "2027-12-31", "expired": "no" },
            "url-filtering": { "expires": "2027-12-31", "expired": "no" }
        }),
        "nics" => json!({ "ethernet1/1": "up", "ethernet1/2": "up", "mgmt": "up" }),
        "routes" => json!({
            "0.0.0.0/0": { "nexthop": "10.0.0.1", "interface": "ethernet1/1" },
            "10.0.1.0/24": { "nexthop": "0.0.0.0", "interface": "ethernet1/2" }
        }),
        "session_stats" => json!({ "num-max": 262_144, "supported-vsys": 1 }),
        _ => json!({}),
    }
}

fn suspended_role(role: DeviceRole) -> DeviceRole {
    match role {
        DeviceRole::Active | DeviceRole::Passive | DeviceRole::Initial => DeviceRole::Passive,
        DeviceRole::Standalone
        | DeviceRole::PrimaryActive
        | DeviceRole::SecondaryPassive
        | DeviceRole::SecondarySuspended
        | DeviceRole::SecondaryNonFunctional => DeviceRole::SecondarySuspended,
    }
}

fn promoted_role(kind: DeviceKind) -> DeviceRole {
    match kind {
        DeviceKind::Firewall => DeviceRole::Active,
        DeviceKind::Manager => DeviceRole::PrimaryActive,
    }
}

#[derive(Debug, Deserialize)]
struct Inventory {
    #[serde(default, rename = "device")]
    devices: Vec<SimDeviceSpec>,
}

/// Shared table of simulated devices; clones see the same fleet
#[derive(Debug, Clone, Default)]
pub struct SimFleet {
    devices: Arc<Mutex<BTreeMap<DeviceId, SimDeviceState>>>,
}

impl SimFleet {
    pub fn from_specs(specs: Vec<SimDeviceSpec>) -> Self {
        let devices = specs
            .into_iter()
            .map(|spec| (spec.id.clone(), SimDeviceState::from_spec(spec)))
            .collect();
        Self {
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    /// Parse an inventory of `[[device]]` tables
    pub fn from_toml(content: &str) -> Result<Self> {
        let inventory: Inventory = toml::from_str(content)
            .map_err(|e| UpgradeError::Config(format!("Failed to parse inventory: {e}")))?;

        let mut seen = BTreeSet::new();
        for spec in &inventory.devices {
            if !seen.insert(spec.id.clone()) {
                return Err(UpgradeError::Config(format!(
                    "device {} listed twice in inventory",
                    spec.id
                )));
            }
        }
        for spec in &inventory.devices {
            let Some(ha) = &spec.ha else {
                continue;
            };
            if ha.peer_version.is_none() && !seen.contains(&ha.peer) {
                return Err(UpgradeError::Config(format!(
                    "device {}: HA peer {} is not in the inventory and has no peer_version",
                    spec.id, ha.peer
                )));
            }
        }

        Ok(Self::from_specs(inventory.devices))
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.lock().keys().cloned().collect()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.lock().contains_key(id)
    }

    pub fn version_of(&self, id: &DeviceId) -> Option<Version> {
        self.devices.lock().get(id).map(|s| s.version)
    }

    pub fn role_of(&self, id: &DeviceId) -> Option<DeviceRole> {
        self.devices
            .lock()
            .get(id)
            .and_then(|s| s.ha.as_ref().map(|ha| ha.role))
    }

    pub fn counters(&self, id: &DeviceId) -> Option<SimCounters> {
        self.devices.lock().get(id).map(|s| s.counters)
    }

    /// Mutate a device in place, e.g. to inject a fault mid-run
    pub fn update(&self, id: &DeviceId, f: impl FnOnce(&mut SimDeviceState)) {
        if let Some(state) = self.devices.lock().get_mut(id) {
            f(state);
        }
    }
}

#[async_trait]
impl DeviceConnector for SimFleet {
    async fn connect(&self, id: &DeviceId) -> DeviceResult<Arc<dyn DeviceClient>> {
        let kind = {
            let devices = self.devices.lock();
            let state = devices
                .get(id)
                .ok_or_else(|| DeviceError::Transport(format!("{id}: unknown host")))?;
            if state.faults.unreachable {
                return Err(DeviceError::Transport(format!("{id}: connection timed out")));
            }
            state.kind
        };

        Ok(Arc::new(SimDevice {
            id: id.clone(),
            kind,
            fleet: self.clone(),
        }))
    }
}

/// Client handle onto one device of a [`SimFleet`]
#[derive(Debug, Clone)]
pub struct SimDevice {
    id: DeviceId,
    kind: DeviceKind,
    fleet: SimFleet,
}

type DeviceResult<T> = std::result::Result<T, DeviceError>;

impl SimDevice {
    fn with_state<T>(&self, f: impl FnOnce(&mut SimDeviceState) -> DeviceResult<T>) -> DeviceResult<T> {
        let mut devices = self.fleet.devices.lock();
        let state = devices
            .get_mut(&self.id)
            .ok_or_else(|| DeviceError::Transport(format!("{}: unknown host", self.id)))?;
        f(state)
    }

    fn ha_payload(&self) -> DeviceResult<Value> {
        let devices = self.fleet.devices.lock();
        let state = devices
            .get(&self.id)
            .ok_or_else(|| DeviceError::Transport(format!("{}: unknown host", self.id)))?;

        let Some(ha) = &state.ha else {
            return Ok(json!({ "enabled": "no" }));
        };

        let peer = devices.get(&ha.peer);
        let peer_version = peer
            .map(|p| p.version)
            .or(ha.peer_version)
            .ok_or_else(|| DeviceError::Malformed(format!("peer {} version unknown", ha.peer)))?;
        let peer_role = peer
            .and_then(|p| p.ha.as_ref().map(|h| h.role))
            .or(ha.peer_role);

        let pair = HaPairState {
            local_role: ha.role,
            local_version: state.version,
            peer_version,
            peer_role,
            peer_id: Some(ha.peer.clone()),
            sync_state: if ha.synchronized {
                SyncState::Synchronized
            } else {
                SyncState::Unsynchronized
            },
            raw: Value::Null,
        };
        Ok(pair.to_payload(self.kind))
    }
}

#[async_trait]
impl DeviceClient for SimDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn ha_state(&self) -> DeviceResult<Option<HaPairState>> {
        let payload = self.ha_payload()?;
        HaPairState::from_payload(self.kind, &payload)
    }

    async fn version(&self) -> DeviceResult<Version> {
        self.with_state(|state| {
            if state.faults.query_timeouts > 0 {
                state.faults.query_timeouts -= 1;
                return Err(DeviceError::Transport("read timed out".to_owned()));
            }
            if state.downtime_left > 0 {
                state.downtime_left -= 1;
                return Err(DeviceError::Transport("connection refused".to_owned()));
            }
            Ok(state.version)
        })
    }

    async fn available_versions(&self) -> DeviceResult<BTreeMap<String, ImageStatus>> {
        self.with_state(|state| {
            state.advance_downloads();
            Ok(state
                .listing()
                .into_iter()
                .map(|(version, downloaded)| (version, ImageStatus { downloaded }))
                .collect())
        })
    }

    async fn download_version(&self, version: &str) -> DeviceResult<()> {
        self.with_state(|state| {
            state.counters.download_calls += 1;
            if state.faults.reject_downloads {
                return Err(DeviceError::Rejected(format!(
                    "download of {version} refused"
                )));
            }
            match state.listing().get(version) {
                None => Err(DeviceError::Rejected(format!(
                    "{version} not found on update server"
                ))),
                Some(true) => Ok(()),
                Some(false) => {
                    let polls = state.faults.download_polls;
                    state.downloads.entry(version.to_owned()).or_insert(polls);
                    state.images.entry(version.to_owned()).or_insert(false);
                    Ok(())
                }
            }
        })
    }

    async fn install(&self, version: &str) -> DeviceResult<bool> {
        let crash = self.with_state(|state| {
            state.counters.install_calls += 1;
            Ok(state.faults.panic_on_install)
        })?;
        if crash {
            panic!("simulated crash installing {version} on {}", self.id);
        }

        let target = Version::parse(version).map_err(|e| DeviceError::Rejected(e.to_string()))?;
        self.with_state(|state| {
            if state.faults.busy_installs > 0 {
                state.faults.busy_installs -= 1;
                return Err(DeviceError::Busy);
            }
            if state.images.get(version) != Some(&true) {
                return Err(DeviceError::Rejected(format!(
                    "image {version} is not downloaded"
                )));
            }
            if state.faults.install_fails {
                return Ok(false);
            }
            state.pending_install = Some(target);
            Ok(true)
        })
    }

    async fn reboot(&self) -> DeviceResult<()> {
        self.with_state(|state| {
            state.counters.reboot_calls += 1;
            if let Some(installed) = state.pending_install.take() {
                state.version = state.faults.boots_into.unwrap_or(installed);
                let drift = std::mem::take(&mut state.faults.post_upgrade_drift);
                state.snapshot.extend(drift);
            }
            state.downtime_left = state.faults.reboot_downtime_polls;
            Ok(())
        })
    }

    async fn suspend_ha(&self) -> DeviceResult<bool> {
        let mut devices = self.fleet.devices.lock();
        let state = devices
            .get_mut(&self.id)
            .ok_or_else(|| DeviceError::Transport(format!("{}: unknown host", self.id)))?;
        state.counters.suspend_calls += 1;
        if state.faults.suspend_rejected {
            return Ok(false);
        }

        let kind = state.kind;
        let Some(ha) = state.ha.as_mut() else {
            return Err(DeviceError::Rejected("HA is not enabled".to_owned()));
        };
        let was_active = ha.role.is_active_class();
        ha.role = suspended_role(ha.role);
        let peer = ha.peer.clone();

        if was_active {
            match devices.get_mut(&peer).and_then(|p| p.ha.as_mut()) {
                Some(peer_ha) => peer_ha.role = promoted_role(kind),
                None => {
                    if let Some(ha) = devices.get_mut(&self.id).and_then(|s| s.ha.as_mut()) {
                        ha.peer_role = Some(promoted_role(kind));
                    }
                }
            }
        }
        Ok(true)
    }

    async fn take_snapshot(&self, sections: &[String]) -> DeviceResult<Snapshot> {
        self.with_state(|state| {
            state.counters.snapshot_calls += 1;
            let sections = sections
                .iter()
                .filter_map(|name| {
                    state
                        .snapshot
                        .get(name)
                        .map(|value| (name.clone(), value.clone()))
                })
                .collect();
            Ok(Snapshot { sections })
        })
    }

    async fn run_readiness_checks(
        &self,
        checks: &[String],
    ) -> DeviceResult<BTreeMap<String, CheckResult>> {
        self.with_state(|state| {
            state.counters.readiness_calls += 1;
            Ok(checks
                .iter()
                .map(|name| {
                    let result = match state.faults.failing_checks.get(name) {
                        Some(reason) => CheckResult::fail(reason.clone()),
                        None => CheckResult::pass(),
                    };
                    (name.clone(), result)
                })
                .collect())
        })
    }

    async fn backup_config(&self) -> DeviceResult<Vec<u8>> {
        self.with_state(|state| {
            state.counters.backup_calls += 1;
            Ok(format!(
                "<?xml version=\"1.0\"?>\n<config version=\"{}\">\n  <devices>\n    <entry name=\"{}\"/>\n  </devices>\n</config>\n",
                state.version, self.id
            )
            .into_bytes())
        })
    }
}
