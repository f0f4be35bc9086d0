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

//! Fleet fan-out
//!
//! A run is made of up to three passes over a bounded worker pool:
//!
//! 1. **First**: every requested device.
//! 2. **Handoff**: HA peers of deferred devices that were not requested
//!    themselves, each at most once. A failed hand-off is logged, left out
//!    of the report and never halts the run.
//! 3. **Revisit**: devices deferred by the earlier passes, once those have
//!    fully drained.
//!
//! Every device pipeline runs in its own spawned task, so a panic is recorded
//! as that device's failure and never takes the run down.

use crate::device::{DeviceConnector, DeviceId};
use crate::error::{Result, UpgradeError};
use crate::orchestrator::{DeviceOutcome, RunContext, UpgradeOrchestrator};
use crate::revisit::RevisitSet;
use crate::version::Version;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What a fatal device error does to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFatal {
    /// Cancel the run; queued devices report `Cancelled`
    HaltProcess,
    /// Record the failure and keep going
    IsolateDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pass {
    First,
    Handoff,
    Revisit,
}

#[derive(Debug)]
pub struct DeviceResult {
    pub device: DeviceId,
    pub pass: Pass,
    pub outcome: Result<DeviceOutcome>,
}

impl DeviceResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    fn deferred_peer(&self) -> Option<&DeviceId> {
        match &self.outcome {
            Ok(DeviceOutcome::Deferred { peer }) => peer.as_ref(),
            Ok(_) | Err(_) => None,
        }
    }
}

/// Pass boundary hooks
pub trait FleetObserver: Send + Sync {
    fn task_started(&self, _device: &DeviceId, _pass: Pass) {}

    fn task_finished(&self, _device: &DeviceId, _pass: Pass, _outcome: &Result<DeviceOutcome>) {}
}

#[derive(Debug)]
struct NoopObserver;

impl FleetObserver for NoopObserver {}

#[derive(Debug, Default)]
pub struct FleetReport {
    /// One entry per device, sorted by id
    pub results: Vec<DeviceResult>,
    /// The run was cancelled, by an operator or by `OnFatal::HaltProcess`
    pub halted: bool,
}

impl FleetReport {
    pub fn get(&self, device: &DeviceId) -> Option<&DeviceResult> {
        self.results.iter().find(|r| &r.device == device)
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        !self.halted && self.failed() == 0
    }

    pub fn summary(&self, target: Version, dry_run: bool) -> FleetSummary {
        FleetSummary {
            target,
            dry_run,
            halted: self.halted,
            succeeded: self.succeeded(),
            failed: self.failed(),
            devices: self
                .results
                .iter()
                .map(|r| DeviceSummary {
                    device: r.device.clone(),
                    pass: r.pass,
                    outcome: r.outcome.as_ref().ok().cloned(),
                    error: r.outcome.as_ref().err().map(ToString::to_string),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub target: Version,
    pub dry_run: bool,
    pub halted: bool,
    pub succeeded: usize,
    pub failed: usize,
    pub devices: Vec<DeviceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device: DeviceId,
    pub pass: Pass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DeviceOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BatchScheduler {
    orchestrator: Arc<UpgradeOrchestrator>,
    connector: Arc<dyn DeviceConnector>,
    on_fatal: OnFatal,
    observer: Arc<dyn FleetObserver>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("orchestrator", &self.orchestrator)
            .field("on_fatal", &self.on_fatal)
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    pub fn new(
        orchestrator: UpgradeOrchestrator,
        connector: Arc<dyn DeviceConnector>,
        on_fatal: OnFatal,
    ) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            connector,
            on_fatal,
            observer: Arc::new(NoopObserver),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn FleetObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use `cancel` as the run token, e.g. one tied to Ctrl-C
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn orchestrator(&self) -> &UpgradeOrchestrator {
        &self.orchestrator
    }

    /// Upgrade `devices` to `target`; one device failing never fails the call
    pub async fn run_fleet(&self, devices: &[DeviceId], target: Version, dry_run: bool) -> FleetReport {
        let ctx = RunContext {
            dry_run,
            revisit: RevisitSet::new(),
            cancel: self.cancel.clone(),
        };

        let mut requested = BTreeSet::new();
        let first: Vec<DeviceId> = devices
            .iter()
            .filter(|id| requested.insert((*id).clone()))
            .cloned()
            .collect();

        info!(
            "Upgrading {} device(s) to {target}{}",
            first.len(),
            if dry_run { " (dry run)" } else { "" }
        );

        let mut results: BTreeMap<DeviceId, DeviceResult> = BTreeMap::new();
        merge(&mut results, self.run_pass(Pass::First, &first, target, &ctx).await);

        let handoff = handoff_targets(&results, &requested);
        if !handoff.is_empty() && !ctx.cancel.is_cancelled() {
            info!(
                "Hand-off pass: upgrading HA peers outside this run: {}",
                join_ids(&handoff)
            );
            let handed_off = self.run_pass(Pass::Handoff, &handoff, target, &ctx).await;
            merge(&mut results, drop_failed_handoffs(handed_off));
        }

        if !ctx.revisit.is_empty() && !ctx.cancel.is_cancelled() {
            let revisit = ctx.revisit.begin_revisit();
            info!("Revisit pass: {}", join_ids(&revisit));
            merge(&mut results, self.run_pass(Pass::Revisit, &revisit, target, &ctx).await);
        }
        ctx.revisit.clear();

        let halted = ctx.cancel.is_cancelled();
        let results = results
            .into_values()
            .map(|mut result| {
                if let Some(peer) = result.deferred_peer().cloned() {
                    result.outcome = if halted {
                        Err(UpgradeError::Cancelled)
                    } else {
                        warn!(device = %result.device, "Still deferred after revisit pass");
                        Err(UpgradeError::StillDeferred {
                            peer: peer.to_string(),
                        })
                    };
                } else if matches!(result.outcome, Ok(DeviceOutcome::Deferred { peer: None })) {
                    result.outcome = Err(UpgradeError::StillDeferred {
                        peer: "unknown".to_owned(),
                    });
                }
                result
            })
            .collect();

        let report = FleetReport { results, halted };
        info!(
            "Fleet run finished: {} succeeded, {} failed{}",
            report.succeeded(),
            report.failed(),
            if halted { " (halted)" } else { "" }
        );
        report
    }

    /// Write `<reports>/fleet-summary.json`
    pub fn write_summary(&self, report: &FleetReport, target: Version, dry_run: bool) -> Result<PathBuf> {
        self.orchestrator
            .artifacts()
            .write_fleet_summary(&report.summary(target, dry_run))
    }

    async fn run_pass(
        &self,
        pass: Pass,
        devices: &[DeviceId],
        target: Version,
        ctx: &RunContext,
    ) -> Vec<DeviceResult> {
        let threads = self.orchestrator.config().concurrency.threads.max(1);
        let semaphore = Arc::new(Semaphore::new(threads));
        let mut set = JoinSet::new();
        let mut task_ids = HashMap::new();

        for id in devices {
            let semaphore = Arc::clone(&semaphore);
            let orchestrator = Arc::clone(&self.orchestrator);
            let connector = Arc::clone(&self.connector);
            let observer = Arc::clone(&self.observer);
            let ctx = ctx.clone();
            let device = id.clone();
            let on_fatal = self.on_fatal;

            let handle = set.spawn(async move {
                // Hold the permit until the device pipeline finishes
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return DeviceResult {
                        device,
                        pass,
                        outcome: Err(UpgradeError::Cancelled),
                    };
                };
                observer.task_started(&device, pass);

                let worker = tokio::spawn(run_device(
                    orchestrator,
                    connector,
                    device.clone(),
                    target,
                    ctx.clone(),
                ));
                let outcome = match worker.await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        let message = panic_message(e.into_panic());
                        error!(device = %device, "Device task panicked: {message}");
                        Err(UpgradeError::Panicked(message))
                    }
                    Err(e) => Err(UpgradeError::Panicked(e.to_string())),
                };

                if let Err(e) = &outcome {
                    if pass != Pass::Handoff {
                        halt_if_needed(on_fatal, &ctx.cancel, &device, e);
                    }
                }
                observer.task_finished(&device, pass, &outcome);

                DeviceResult {
                    device,
                    pass,
                    outcome,
                }
            });
            task_ids.insert(handle.id(), id.clone());
        }

        let mut results = Vec::with_capacity(devices.len());
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, result)) => results.push(result),
                Err(e) => {
                    let device = task_ids
                        .get(&e.id())
                        .cloned()
                        .unwrap_or_else(|| DeviceId::from("unknown"));
                    error!(device = %device, "Scheduler task failed: {e}");
                    results.push(DeviceResult {
                        device,
                        pass,
                        outcome: Err(UpgradeError::Panicked(e.to_string())),
                    });
                }
            }
        }
        results
    }
}

async fn run_device(
    orchestrator: Arc<UpgradeOrchestrator>,
    connector: Arc<dyn DeviceConnector>,
    id: DeviceId,
    target: Version,
    ctx: RunContext,
) -> Result<DeviceOutcome> {
    let device = connector.connect(&id).await.map_err(|source| {
        error!(device = %id, "Cannot connect: {source}");
        UpgradeError::Connect {
            device: id.to_string(),
            source,
        }
    })?;
    orchestrator.upgrade(device.as_ref(), target, &ctx).await
}

/// Later passes replace earlier entries
fn merge(results: &mut BTreeMap<DeviceId, DeviceResult>, pass: Vec<DeviceResult>) {
    for result in pass {
        results.insert(result.device.clone(), result);
    }
}

/// Hand-off targets were not requested, so their failures are not reported
fn drop_failed_handoffs(results: Vec<DeviceResult>) -> Vec<DeviceResult> {
    results
        .into_iter()
        .filter(|result| match &result.outcome {
            Ok(_) => true,
            Err(e) => {
                warn!(device = %result.device, "Hand-off upgrade failed, leaving peer as is: {e}");
                false
            }
        })
        .collect()
}

/// Any error that ended a pipeline is fatal for that device
fn halt_if_needed(on_fatal: OnFatal, cancel: &CancellationToken, device: &DeviceId, e: &UpgradeError) {
    if on_fatal != OnFatal::HaltProcess || cancel.is_cancelled() {
        return;
    }
    error!(device = %device, class = ?e.class(), "Fatal error, halting run: {e}");
    cancel.cancel();
}

/// Peers of deferred devices that were not requested, deduplicated
fn handoff_targets(
    results: &BTreeMap<DeviceId, DeviceResult>,
    requested: &BTreeSet<DeviceId>,
) -> Vec<DeviceId> {
    let mut visited = requested.clone();
    results
        .values()
        .filter_map(DeviceResult::deferred_peer)
        .filter(|peer| visited.insert((*peer).clone()))
        .cloned()
        .collect()
}

fn join_ids(ids: &[DeviceId]) -> String {
    ids.iter()
        .map(DeviceId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
