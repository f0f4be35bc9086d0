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

//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "fleetup")]
#[command(author, version, about = "Firmware upgrade orchestration for appliance fleets")]
#[command(
    long_about = "Upgrade standalone appliances and HA pairs with readiness checks, \
    pre/post snapshots and config backups.\n\
    \nHA pairs are handled automatically: an active member whose peer is on the same \
    version is deferred until the peer has been upgraded.\n\
    \nExamples:\n  \
    fleetup upgrade --device fw-01 --target 10.2.4 --dry-run\n  \
    fleetup batch --target 10.2.4\n  \
    fleetup versions --device fw-01 --target 10.2.4"
)]
pub struct Cli {
    /// Engine configuration (retry budgets, concurrency, reports directory)
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        default_value = "fleetup.toml",
        help = "Path to the TOML configuration file; defaults apply when it does not exist"
    )]
    pub config: PathBuf,

    /// Device inventory
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        default_value = "inventory.toml",
        help = "Path to the TOML device inventory"
    )]
    pub inventory: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Upgrade a single device; the first fatal error aborts the run
    Upgrade(UpgradeArgs),

    /// Upgrade many devices in parallel; failures are isolated per device
    #[command(
        long_about = "Upgrade every inventory device (or the ones given with --device) \
        on a bounded worker pool.\n\
        \nDeferred HA members are retried after all other devices finished. \
        A summary is written to <reports>/fleet-summary.json.\n\
        \nExamples:\n  \
        fleetup batch --target 10.2.4\n  \
        fleetup batch --target 10.2.4 --device fw-01 --device fw-02 --dry-run"
    )]
    Batch(BatchArgs),

    /// Show how a target version relates to the images a device offers
    Versions(VersionsArgs),
}

#[derive(Debug, Args)]
pub struct UpgradeArgs {
    /// Device id as listed in the inventory
    #[arg(long, value_name = "ID")]
    pub device: String,

    /// Target version, e.g. 10.2.4 or 10.2.4-h1
    #[arg(long, value_name = "VERSION")]
    pub target: String,

    /// Run every read-only step and stop before install
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// Target version, e.g. 10.2.4 or 10.2.4-h1
    #[arg(long, value_name = "VERSION")]
    pub target: String,

    /// Run every read-only step and stop before install
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Restrict the run to these devices (repeatable); all inventory devices by default
    #[arg(long = "device", value_name = "ID")]
    pub devices: Vec<String>,
}

#[derive(Debug, Args)]
pub struct VersionsArgs {
    #[arg(long, value_name = "ID")]
    pub device: String,

    #[arg(long, value_name = "VERSION")]
    pub target: String,

    /// Number of closest matches to show
    #[arg(long, default_value_t = 5)]
    pub limit: usize,
}
