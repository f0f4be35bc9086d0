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

//! HA upgrade decision
//!
//! Decides whether one member of an HA pair may be upgraded right now. The
//! same algorithm serves firewall and manager pairs; only
//! [`DeviceRole::is_active_class`] and the payload field paths differ.

use super::HaPairState;
use crate::device::{DeviceClient, DeviceId};
use crate::error::{Result, UpgradeError};
use crate::phase::{Phase, PhaseRunner, RetryPolicy, Step};
use crate::revisit::RevisitSet;
use crate::version::{Comparison, compare};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Standalone, or no HA action needed before upgrading
    Proceed,
    /// This device's HA membership was suspended; upgrade may continue
    ProceedAfterSuspend,
    /// Upgrade later; the device was recorded in the revisit set
    Defer { peer: Option<DeviceId> },
    /// Fail safe: the state does not allow a safe upgrade
    Refuse(String),
}

impl Decision {
    pub fn proceed(&self) -> bool {
        matches!(self, Self::Proceed | Self::ProceedAfterSuspend)
    }
}

#[derive(Debug, Clone)]
pub struct HaCoordinator {
    resync: RetryPolicy,
    runner: PhaseRunner,
}

impl HaCoordinator {
    pub fn new(resync: RetryPolicy, runner: PhaseRunner) -> Self {
        Self { resync, runner }
    }

    /// Decide whether `device` may be upgraded now
    ///
    /// `state` must have been fetched right before the call. When the device
    /// is being revisited, the peer is given time to move ahead first.
    pub async fn decide(
        &self,
        device: &dyn DeviceClient,
        state: Option<HaPairState>,
        dry_run: bool,
        revisit: &RevisitSet,
    ) -> Result<Decision> {
        let id = device.id();

        let Some(mut state) = state else {
            info!(device = %id, "Standalone device, no HA coordination needed");
            return Ok(Decision::Proceed);
        };

        if revisit.is_revisiting(id) {
            if dry_run {
                info!(device = %id, "Dry run: skipping wait for HA peer to move ahead");
            } else {
                match self.wait_for_peer(device).await? {
                    Some(fresh) => state = fresh,
                    None => {
                        info!(device = %id, "HA disabled while waiting, treating as standalone");
                        return Ok(Decision::Proceed);
                    }
                }
            }
        }

        if !state.is_synchronized() {
            warn!(device = %id, "HA pair is not synchronized, configuration may differ between members");
        }

        let role = state.local_role;
        if !role.is_valid_for(device.kind()) {
            let reason = format!("role {role} is not a {} HA role", device.kind());
            error!(device = %id, "{reason}");
            return Ok(Decision::Refuse(reason));
        }

        let cmp = compare(&state.local_version, &state.peer_version);
        let active = role.is_active_class();
        info!(
            device = %id,
            role = %role,
            local = %state.local_version,
            peer = %state.peer_version,
            "Local version is {cmp} relative to HA peer"
        );

        match cmp {
            Comparison::Equal if active => {
                if revisit.insert(id) {
                    warn!(device = %id, "Active member matches peer version, deferring until peer is upgraded");
                } else {
                    warn!(device = %id, "Active member still matches peer version, remains deferred");
                }
                Ok(Decision::Defer {
                    peer: state.peer_id.clone(),
                })
            }
            Comparison::Equal => {
                info!(device = %id, "Passive member matches peer version, proceeding");
                Ok(Decision::Proceed)
            }
            Comparison::Older if active => {
                self.suspend(device, dry_run, "active member is behind its peer")
                    .await
            }
            Comparison::Newer if !active => {
                self.suspend(device, dry_run, "passive member is ahead of its peer")
                    .await
            }
            Comparison::Older | Comparison::Newer => Ok(Decision::Proceed),
        }
    }

    async fn suspend(&self, device: &dyn DeviceClient, dry_run: bool, why: &str) -> Result<Decision> {
        let id = device.id();
        if dry_run {
            info!(device = %id, "Dry run: would suspend HA membership ({why})");
            return Ok(Decision::Proceed);
        }

        info!(device = %id, "Suspending HA membership ({why})");
        if device.suspend_ha().await? {
            info!(device = %id, "HA membership suspended");
            Ok(Decision::ProceedAfterSuspend)
        } else {
            error!(device = %id, "Device rejected HA suspend");
            Ok(Decision::Refuse("device rejected HA suspend".to_owned()))
        }
    }

    /// Poll HA state until the peer's version differs from ours or the budget runs out
    async fn wait_for_peer(&self, device: &dyn DeviceClient) -> Result<Option<HaPairState>> {
        let id = device.id();
        info!(device = %id, "Revisiting deferred device, waiting for HA peer to move ahead");

        let outcome = self
            .runner
            .run(Phase::HaResync, self.resync, |_| poll_peer(device))
            .await;

        match outcome.result {
            Ok(state) => Ok(state),
            Err(e @ UpgradeError::PhaseExhausted { .. }) => {
                warn!(device = %id, "{e}; re-evaluating with current HA state");
                Ok(device.ha_state().await?)
            }
            Err(e) => Err(e),
        }
    }
}

async fn poll_peer(device: &dyn DeviceClient) -> Result<Step<Option<HaPairState>>> {
    match device.ha_state().await? {
        Some(state) if state.peer_version == state.local_version => Ok(Step::Pending(format!(
            "peer still on {}",
            state.peer_version
        ))),
        other => Ok(Step::Done(other)),
    }
}
