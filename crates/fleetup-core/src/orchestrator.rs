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

//! Single-device upgrade pipeline
//!
//! HA check, readiness, version check, download, pre-upgrade snapshot and
//! config backup, then install, reboot, verification and the post-upgrade
//! diff. Cancellation is honoured up to the start of install; after that the
//! pipeline always runs through reboot verification so a device is never
//! abandoned mid-upgrade.

use crate::artifacts::{ArtifactKind, ArtifactStore, DeviceArtifacts};
use crate::config::FleetConfig;
use crate::device::{DeviceClient, DeviceId, ImageStatus};
use crate::error::{DeviceError, Result, UpgradeError};
use crate::ha::{Decision, HaCoordinator};
use crate::phase::{Phase, PhaseRunner, RetryPolicy, Step};
use crate::readiness::ReadinessGate;
use crate::revisit::RevisitSet;
use crate::snapshot::{self, Snapshot};
use crate::telemetry::{UpgradeEvent, report_event};
use crate::version::{Version, closest_matches};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// How a device pipeline ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum DeviceOutcome {
    Upgraded {
        from: Version,
        to: Version,
        diff_passed: bool,
    },
    DryRunComplete {
        from: Version,
        to: Version,
    },
    Deferred {
        peer: Option<DeviceId>,
    },
}

/// State shared by every device pipeline of one run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub dry_run: bool,
    pub revisit: RevisitSet,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!("Run cancelled, stopping before next phase");
            return Err(UpgradeError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeOrchestrator {
    config: FleetConfig,
    readiness: ReadinessGate,
    sections: Vec<String>,
    artifacts: ArtifactStore,
}

impl UpgradeOrchestrator {
    /// Build an orchestrator; unknown readiness checks or snapshot sections are rejected here
    pub fn new(config: FleetConfig) -> Result<Self> {
        config.validate()?;
        let readiness = ReadinessGate::from_config(&config.readiness)?;
        let sections = snapshot::enabled_sections(&config.snapshots.sections)?;
        let artifacts = ArtifactStore::new(config.reports.directory.clone());
        Ok(Self {
            config,
            readiness,
            sections,
            artifacts,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run the whole pipeline for one device
    pub async fn upgrade(
        &self,
        device: &dyn DeviceClient,
        target: Version,
        ctx: &RunContext,
    ) -> Result<DeviceOutcome> {
        let id = device.id().clone();
        let span = info_span!("device", id = %id);

        let result = self
            .pipeline(device, target, ctx)
            .instrument(span.clone())
            .await
            .map_err(UpgradeError::escalate);
        if let Err(e) = &result {
            span.in_scope(|| error!("Upgrade to {target} failed: {e}"));
            report_event(&UpgradeEvent::UpgradeFailed {
                device: id.to_string(),
                to_version: target.to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn pipeline(
        &self,
        device: &dyn DeviceClient,
        target: Version,
        ctx: &RunContext,
    ) -> Result<DeviceOutcome> {
        let id = device.id().clone();
        let started = tokio::time::Instant::now();
        let runner = PhaseRunner::cancellable(ctx.cancel.clone());
        let query = self.config.query.policy();

        ctx.checkpoint()?;
        let ha_state = retry_call(&runner, Phase::Query, query, || device.ha_state()).await?;
        let coordinator = HaCoordinator::new(self.config.ha_resync.policy(), runner.clone());
        match coordinator
            .decide(device, ha_state, ctx.dry_run, &ctx.revisit)
            .await?
        {
            Decision::Proceed => {}
            Decision::ProceedAfterSuspend => report_event(&UpgradeEvent::HaSuspended {
                device: id.to_string(),
            }),
            Decision::Defer { peer } => {
                report_event(&UpgradeEvent::Deferred {
                    device: id.to_string(),
                    peer: peer.as_ref().map(ToString::to_string),
                });
                return Ok(DeviceOutcome::Deferred { peer });
            }
            Decision::Refuse(reason) => return Err(UpgradeError::HaRefused(reason)),
        }

        ctx.checkpoint()?;
        let artifacts = self.artifacts.device_run(&id, Utc::now())?;
        self.check_readiness(device, &artifacts, &runner).await?;

        let installed = retry_call(&runner, Phase::Query, query, || device.version()).await?;
        if target <= installed {
            error!("Requested {target} is not newer than installed {installed}");
            return Err(UpgradeError::Downgrade {
                installed: installed.to_string(),
                requested: target.to_string(),
            });
        }
        info!("Upgrading from {installed} to {target}");
        report_event(&UpgradeEvent::UpgradeStarted {
            device: id.to_string(),
            from_version: installed.to_string(),
            to_version: target.to_string(),
            dry_run: ctx.dry_run,
        });

        ctx.checkpoint()?;
        self.ensure_listed(device, target, &runner).await?;

        ctx.checkpoint()?;
        let image = self.download(device, target, &runner).await?;

        let pre = self
            .capture(device, &artifacts, ArtifactKind::PreSnapshot, &runner)
            .await?;
        let backup = retry_call(&runner, Phase::Query, query, || device.backup_config()).await?;
        artifacts.write_config_backup(&backup)?;

        if ctx.dry_run {
            info!("Dry run complete, skipping install of {image}");
            report_event(&UpgradeEvent::DryRunCompleted {
                device: id.to_string(),
                from_version: installed.to_string(),
                to_version: target.to_string(),
            });
            return Ok(DeviceOutcome::DryRunComplete {
                from: installed,
                to: target,
            });
        }

        ctx.checkpoint()?;
        // Past this point the device is mid-upgrade and must be seen through
        let committed = PhaseRunner::uncancellable();

        info!("Installing {image}");
        committed
            .run(Phase::Install, self.config.install.policy(), |_| {
                install_attempt(device, &image)
            })
            .await
            .into_result()?;

        info!("Install finished, rebooting");
        retry_call(&committed, Phase::Reboot, query, || device.reboot()).await?;
        tokio::time::sleep(self.config.reboot.grace_period()).await;

        let running = committed
            .run(Phase::RebootVerify, self.config.reboot.policy(), |_| {
                verify_attempt(device, target)
            })
            .await
            .into_result()?;
        info!("Device is back on {running}");

        let settle = self.config.timing.post_upgrade_settle();
        debug!("Waiting {}s for the device to settle", settle.as_secs());
        tokio::time::sleep(settle).await;

        let post = self
            .capture(device, &artifacts, ArtifactKind::PostSnapshot, &committed)
            .await?;
        let diff = snapshot::diff(&pre, &post, &self.sections);
        artifacts.write_json(ArtifactKind::Diff, &diff)?;
        let diff_passed = diff.passed();
        if diff_passed {
            info!("Post-upgrade snapshot matches pre-upgrade state");
        } else {
            warn!(
                "Post-upgrade snapshot differs in: {}",
                diff.failed_sections().join(", ")
            );
        }

        report_event(&UpgradeEvent::UpgradeCompleted {
            device: id.to_string(),
            from_version: installed.to_string(),
            to_version: target.to_string(),
            duration_secs: started.elapsed().as_secs(),
            diff_passed,
        });
        Ok(DeviceOutcome::Upgraded {
            from: installed,
            to: target,
            diff_passed,
        })
    }

    async fn check_readiness(
        &self,
        device: &dyn DeviceClient,
        artifacts: &DeviceArtifacts,
        runner: &PhaseRunner,
    ) -> Result<()> {
        if self.readiness.is_empty() {
            debug!("No readiness checks enabled");
            return Ok(());
        }

        let names = self.readiness.names();
        let results = retry_call(runner, Phase::Query, self.config.query.policy(), || {
            device.run_readiness_checks(&names)
        })
        .await?;
        let report = self.readiness.evaluate(device.id(), &results);
        artifacts.write_json(ArtifactKind::Readiness, &report)?;
        report.ensure_ready()
    }

    async fn capture(
        &self,
        device: &dyn DeviceClient,
        artifacts: &DeviceArtifacts,
        kind: ArtifactKind,
        runner: &PhaseRunner,
    ) -> Result<Snapshot> {
        let snapshot = retry_call(runner, Phase::Query, self.config.query.policy(), || {
            device.take_snapshot(&self.sections)
        })
        .await?;
        artifacts.write_json(kind, &snapshot)?;
        Ok(snapshot)
    }

    /// Make sure `target` shows up in the image list, fetching its base image if needed
    async fn ensure_listed(
        &self,
        device: &dyn DeviceClient,
        target: Version,
        runner: &PhaseRunner,
    ) -> Result<()> {
        let query = self.config.query.policy();
        let listing = retry_call(runner, Phase::Query, query, || device.available_versions()).await?;
        if resolve_image(&listing, target).is_some() {
            return Ok(());
        }

        let base = target.base();
        if target.is_base() || resolve_image(&listing, base).is_none() {
            return Err(unavailable(&listing, target));
        }

        warn!("{target} is not listed, fetching base image {base} first");
        self.download(device, base, runner).await?;

        let listing = retry_call(runner, Phase::Query, query, || device.available_versions()).await?;
        if resolve_image(&listing, target).is_some() {
            info!("{target} is listed now that {base} is downloaded");
            Ok(())
        } else {
            Err(unavailable(&listing, target))
        }
    }

    async fn download(
        &self,
        device: &dyn DeviceClient,
        version: Version,
        runner: &PhaseRunner,
    ) -> Result<String> {
        let download = &self.config.download;
        let interval = download.poll_interval();
        let limit = download.poll_limit;

        runner
            .run(Phase::Download, download.policy(), |_| {
                download_attempt(device, version, runner, interval, limit)
            })
            .await
            .into_result()
    }
}

/// Find the listed image for `target`, matching on version rather than spelling
fn resolve_image(listing: &BTreeMap<String, ImageStatus>, target: Version) -> Option<(String, ImageStatus)> {
    listing
        .iter()
        .find(|(name, _)| Version::parse(name).is_ok_and(|v| v == target))
        .map(|(name, status)| (name.clone(), *status))
}

fn unavailable(listing: &BTreeMap<String, ImageStatus>, target: Version) -> UpgradeError {
    let closest = closest_matches(listing.keys(), &target.to_string(), 5);
    error!("{target} is not available on the device");
    UpgradeError::VersionUnavailable {
        requested: target.to_string(),
        closest,
    }
}

async fn download_attempt(
    device: &dyn DeviceClient,
    target: Version,
    runner: &PhaseRunner,
    interval: Duration,
    limit: u32,
) -> Result<Step<String>> {
    let listing = device.available_versions().await?;
    let Some((image, status)) = resolve_image(&listing, target) else {
        return Err(unavailable(&listing, target));
    };
    if status.downloaded {
        info!("{image} is already downloaded");
        return Ok(Step::Done(image));
    }

    info!("Downloading {image}");
    device.download_version(&image).await?;

    for poll in 1..=limit {
        if !runner.pause(interval).await {
            return Err(UpgradeError::Cancelled);
        }
        let listing = device.available_versions().await?;
        if resolve_image(&listing, target).is_some_and(|(_, s)| s.downloaded) {
            info!("{image} downloaded");
            return Ok(Step::Done(image));
        }
        debug!("{image} still downloading (poll {poll}/{limit})");
    }

    Ok(Step::Pending(format!(
        "{image} still downloading after {limit} polls"
    )))
}

/// Run one device call, retrying it while the device answers with transient errors
async fn retry_call<T, F, Fut>(
    runner: &PhaseRunner,
    phase: Phase,
    policy: RetryPolicy,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, DeviceError>>,
{
    runner
        .run(phase, policy, |_| call_attempt(call()))
        .await
        .into_result()
}

async fn call_attempt<T>(call: impl Future<Output = std::result::Result<T, DeviceError>>) -> Result<Step<T>> {
    Ok(Step::Done(call.await?))
}

async fn install_attempt(device: &dyn DeviceClient, image: &str) -> Result<Step<()>> {
    if device.install(image).await? {
        Ok(Step::Done(()))
    } else {
        Err(UpgradeError::InstallFailed {
            version: image.to_owned(),
        })
    }
}

async fn verify_attempt(device: &dyn DeviceClient, target: Version) -> Result<Step<Version>> {
    match device.version().await {
        Ok(running) if running == target => Ok(Step::Done(running)),
        Ok(running) => Err(UpgradeError::UnexpectedVersion {
            expected: target.to_string(),
            actual: running.to_string(),
        }),
        Err(e) if e.is_transient() => Ok(Step::Pending(format!("device not back yet: {e}"))),
        Err(e) => Err(e.into()),
    }
}
