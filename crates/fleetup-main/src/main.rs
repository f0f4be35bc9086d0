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

//! FleetUp - Entry point for the fleetup binary
//!
//! Loads the engine config and device inventory, then runs a single-device
//! upgrade, a fleet batch, or the version diagnostics. Ctrl-C cancels the
//! run; devices already installing are seen through reboot verification.

mod args;

use anyhow::Context;
use args::{BatchArgs, Cli, Commands, UpgradeArgs, VersionsArgs};
use clap::Parser;
use fleetup_core::sim::SimFleet;
use fleetup_core::{
    BatchScheduler, DeviceConnector, DeviceId, FleetConfig, FleetReport, OnFatal, UpgradeOrchestrator,
    Version, closest_matches, load_config,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fleetup=info,fleetup_core=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let fleet = load_inventory(&cli.inventory)?;
    info!(
        "Loaded inventory with {} device(s), {} worker(s)",
        fleet.ids().len(),
        config.concurrency.threads
    );

    match cli.command {
        Commands::Upgrade(args) => run_upgrade(config, fleet, args).await,
        Commands::Batch(args) => run_batch(config, fleet, args).await,
        Commands::Versions(args) => run_versions(&fleet, &args).await,
    }
}

fn load_inventory(path: &Path) -> anyhow::Result<SimFleet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading inventory {}", path.display()))?;
    let fleet = SimFleet::from_toml(&content)
        .with_context(|| format!("parsing inventory {}", path.display()))?;
    Ok(fleet)
}

fn parse_target(target: &str) -> anyhow::Result<Version> {
    Version::parse(target).with_context(|| format!("invalid target version '{target}'"))
}

/// Cancellation token fired by Ctrl-C
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight installs finish");
            on_signal.cancel();
        }
    });
    cancel
}

fn scheduler(config: FleetConfig, fleet: SimFleet, on_fatal: OnFatal) -> anyhow::Result<BatchScheduler> {
    let orchestrator = UpgradeOrchestrator::new(config).context("invalid engine configuration")?;
    Ok(BatchScheduler::new(orchestrator, Arc::new(fleet), on_fatal).with_cancellation(interrupt_token()))
}

async fn run_upgrade(config: FleetConfig, fleet: SimFleet, args: UpgradeArgs) -> anyhow::Result<ExitCode> {
    let target = parse_target(&args.target)?;
    let device = DeviceId::new(args.device);
    if !fleet.contains(&device) {
        anyhow::bail!("device {device} is not in the inventory");
    }

    let scheduler = scheduler(config, fleet, OnFatal::HaltProcess)?;
    let report = scheduler.run_fleet(&[device], target, args.dry_run).await;
    print_report(&report);
    Ok(exit_code(&report))
}

async fn run_batch(config: FleetConfig, fleet: SimFleet, args: BatchArgs) -> anyhow::Result<ExitCode> {
    let target = parse_target(&args.target)?;
    let devices: Vec<DeviceId> = if args.devices.is_empty() {
        fleet.ids()
    } else {
        args.devices.into_iter().map(DeviceId::new).collect()
    };
    if let Some(unknown) = devices.iter().find(|id| !fleet.contains(id)) {
        anyhow::bail!("device {unknown} is not in the inventory");
    }

    let scheduler = scheduler(config, fleet, OnFatal::IsolateDevice)?;
    let report = scheduler.run_fleet(&devices, target, args.dry_run).await;
    print_report(&report);

    let path = scheduler
        .write_summary(&report, target, args.dry_run)
        .context("writing fleet summary")?;
    println!("\nSummary written to {}", path.display());
    Ok(exit_code(&report))
}

async fn run_versions(fleet: &SimFleet, args: &VersionsArgs) -> anyhow::Result<ExitCode> {
    let device = fleet
        .connect(&DeviceId::new(args.device.as_str()))
        .await
        .with_context(|| format!("connecting to {}", args.device))?;
    let installed = device.version().await?;
    let listing = device.available_versions().await?;

    println!("{}: running {installed}", args.device);
    for (image, status) in &listing {
        let marker = if status.downloaded { "downloaded" } else { "" };
        println!("  {image:<16} {marker}");
    }

    let target = parse_target(&args.target)?;
    let listed = listing
        .keys()
        .any(|image| Version::parse(image).is_ok_and(|v| v == target));
    if listed {
        println!("\n{target} is available");
    } else {
        let closest = closest_matches(listing.keys(), &args.target, args.limit);
        println!("\n{target} is not available; closest: {}", closest.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &FleetReport) {
    println!();
    for result in &report.results {
        let status = match &result.outcome {
            Ok(outcome) => serde_json::to_string(outcome).unwrap_or_else(|_| "ok".to_owned()),
            Err(e) => format!("FAILED: {e}"),
        };
        println!("{:<20} {:<8} {status}", result.device.as_str(), format!("{:?}", result.pass));
    }
    println!(
        "\n{} succeeded, {} failed{}",
        report.succeeded(),
        report.failed(),
        if report.halted { ", run halted" } else { "" }
    );
}

fn exit_code(report: &FleetReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
