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

//! FleetUp - upgrade orchestration for network appliance fleets
//!
//! Drives firmware upgrades of standalone appliances and HA pairs: HA-aware
//! ordering, bounded-retry download/install/reboot phases, pre/post state
//! snapshots and a batch scheduler that defers active HA members until their
//! peer has moved ahead.

pub mod artifacts;
pub mod config;
pub mod device;
pub mod error;
pub mod ha;
pub mod orchestrator;
pub mod phase;
pub mod readiness;
pub mod revisit;
pub mod scheduler;
pub mod sim;
pub mod snapshot;
pub mod telemetry;
pub mod version;

pub use config::{FleetConfig, load_config};
pub use device::{DeviceClient, DeviceConnector, DeviceId, DeviceKind, DeviceRole};
pub use error::{DeviceError, ErrorClass, UpgradeError};
pub use orchestrator::{DeviceOutcome, RunContext, UpgradeOrchestrator};
pub use scheduler::{BatchScheduler, FleetObserver, FleetReport, OnFatal, Pass};
pub use version::{Comparison, Version, closest_matches, compare, is_newer};
