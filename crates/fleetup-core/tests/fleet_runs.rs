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

//! End-to-end fleet runs against the simulated fleet

use fleetup_core::error::Result;
use fleetup_core::phase::Phase;
use fleetup_core::scheduler::DeviceResult;
use fleetup_core::sim::{SimDeviceSpec, SimFleet, SimHaSpec};
use fleetup_core::{
    BatchScheduler, DeviceId, DeviceKind, DeviceOutcome, DeviceRole, FleetConfig, FleetObserver,
    FleetReport, OnFatal, Pass, UpgradeError, UpgradeOrchestrator, Version,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}

fn id(s: &str) -> DeviceId {
    DeviceId::from(s)
}

fn scheduler(reports: &TempDir, fleet: &SimFleet, threads: usize, on_fatal: OnFatal) -> BatchScheduler {
    let mut config = FleetConfig::default();
    config.reports.directory = reports.path().to_path_buf();
    config.concurrency.threads = threads;
    let orchestrator = UpgradeOrchestrator::new(config).unwrap();
    BatchScheduler::new(orchestrator, Arc::new(fleet.clone()), on_fatal)
}

fn firewall(name: &str, version: &str) -> SimDeviceSpec {
    SimDeviceSpec::new(name, DeviceKind::Firewall, v(version)).with_image("10.2.0", true)
}

/// fw-a active and fw-b passive, both on 10.1.0
fn ha_pair() -> Vec<SimDeviceSpec> {
    vec![
        firewall("fw-a", "10.1.0").with_ha(DeviceRole::Active, "fw-b"),
        firewall("fw-b", "10.1.0").with_ha(DeviceRole::Passive, "fw-a"),
    ]
}

fn result<'a>(report: &'a FleetReport, device: &str) -> &'a DeviceResult {
    report.get(&id(device)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_ha_pair_passive_first_then_active() {
    let reports = TempDir::new().unwrap();
    let fleet = SimFleet::from_specs(ha_pair());

    let report = scheduler(&reports, &fleet, 2, OnFatal::IsolateDevice)
        .run_fleet(&[id("fw-a"), id("fw-b")], v("10.2.0"), false)
        .await;

    assert!(report.is_success(), "{report:?}");
    let active = result(&report, "fw-a");
    assert_eq!(active.pass, Pass::Revisit);
    assert!(matches!(
        active.outcome,
        Ok(DeviceOutcome::Upgraded { diff_passed: true, .. })
    ));
    assert_eq!(result(&report, "fw-b").pass, Pass::First);

    assert_eq!(fleet.version_of(&id("fw-a")), Some(v("10.2.0")));
    assert_eq!(fleet.version_of(&id("fw-b")), Some(v("10.2.0")));

    // fw-a was behind its upgraded peer on revisit and failed over first
    assert_eq!(fleet.counters(&id("fw-a")).unwrap().suspend_calls, 1);
    assert_eq!(fleet.counters(&id("fw-b")).unwrap().suspend_calls, 0);
    assert_eq!(fleet.role_of(&id("fw-a")), Some(DeviceRole::Passive));
    assert_eq!(fleet.role_of(&id("fw-b")), Some(DeviceRole::Active));
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_isolated_per_device() {
    let reports = TempDir::new().unwrap();
    let mut failing = firewall("fw-fail", "10.1.0");
    failing.faults.install_fails = true;
    let mut crashing = firewall("fw-crash", "10.1.0");
    crashing.faults.panic_on_install = true;
    let mut offline = firewall("fw-down", "10.1.0");
    offline.faults.unreachable = true;
    let fleet = SimFleet::from_specs(vec![
        firewall("fw-ok", "10.1.0"),
        failing,
        crashing,
        offline,
    ]);
    let scheduler = scheduler(&reports, &fleet, 4, OnFatal::IsolateDevice);

    let report = scheduler.run_fleet(&fleet.ids(), v("10.2.0"), false).await;

    assert!(!report.halted);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 3);
    assert!(matches!(
        result(&report, "fw-ok").outcome,
        Ok(DeviceOutcome::Upgraded { .. })
    ));
    assert!(matches!(
        result(&report, "fw-fail").outcome,
        Err(UpgradeError::InstallFailed { .. })
    ));
    match &result(&report, "fw-crash").outcome {
        Err(UpgradeError::Panicked(message)) => assert!(message.contains("simulated crash")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(matches!(
        result(&report, "fw-down").outcome,
        Err(UpgradeError::Connect { .. })
    ));

    let path = scheduler.write_summary(&report, v("10.2.0"), false).unwrap();
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(summary["succeeded"], 1);
    assert_eq!(summary["failed"], 3);
    assert_eq!(summary["devices"].as_array().unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_halt_cancels_queued_devices() {
    let reports = TempDir::new().unwrap();
    let mut failing = firewall("fw-1", "10.1.0");
    failing.faults.install_fails = true;
    let fleet = SimFleet::from_specs(vec![
        failing,
        firewall("fw-2", "10.1.0"),
        firewall("fw-3", "10.1.0"),
    ]);

    let report = scheduler(&reports, &fleet, 1, OnFatal::HaltProcess)
        .run_fleet(&[id("fw-1"), id("fw-2"), id("fw-3")], v("10.2.0"), false)
        .await;

    assert!(report.halted);
    assert!(matches!(
        result(&report, "fw-1").outcome,
        Err(UpgradeError::InstallFailed { .. })
    ));
    for queued in ["fw-2", "fw-3"] {
        assert!(matches!(
            result(&report, queued).outcome,
            Err(UpgradeError::Cancelled)
        ));
        assert_eq!(fleet.counters(&id(queued)).unwrap().install_calls, 0);
        assert_eq!(fleet.version_of(&id(queued)), Some(v("10.1.0")));
    }
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_device_halts_run() {
    let reports = TempDir::new().unwrap();
    let mut silent = firewall("fw-1", "10.1.0");
    silent.faults.query_timeouts = 10;
    let fleet = SimFleet::from_specs(vec![silent, firewall("fw-2", "10.1.0")]);

    let report = scheduler(&reports, &fleet, 1, OnFatal::HaltProcess)
        .run_fleet(&[id("fw-1"), id("fw-2")], v("10.2.0"), false)
        .await;

    assert!(report.halted);
    assert!(matches!(
        result(&report, "fw-1").outcome,
        Err(UpgradeError::PhaseExhausted {
            phase: Phase::Query,
            ..
        })
    ));
    assert!(matches!(
        result(&report, "fw-2").outcome,
        Err(UpgradeError::Cancelled)
    ));
    assert_eq!(fleet.counters(&id("fw-2")).unwrap().install_calls, 0);
    assert_eq!(fleet.version_of(&id("fw-2")), Some(v("10.1.0")));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_reply_does_not_halt_run() {
    let reports = TempDir::new().unwrap();
    let mut flaky = firewall("fw-1", "10.1.0");
    flaky.faults.query_timeouts = 1;
    let fleet = SimFleet::from_specs(vec![flaky, firewall("fw-2", "10.1.0")]);

    let report = scheduler(&reports, &fleet, 1, OnFatal::HaltProcess)
        .run_fleet(&[id("fw-1"), id("fw-2")], v("10.2.0"), false)
        .await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(fleet.version_of(&id("fw-1")), Some(v("10.2.0")));
    assert_eq!(fleet.version_of(&id("fw-2")), Some(v("10.2.0")));
}

#[tokio::test(start_paused = true)]
async fn test_unrequested_peer_is_handed_off() {
    let reports = TempDir::new().unwrap();
    let fleet = SimFleet::from_specs(ha_pair());

    let report = scheduler(&reports, &fleet, 2, OnFatal::IsolateDevice)
        .run_fleet(&[id("fw-a")], v("10.2.0"), false)
        .await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(result(&report, "fw-b").pass, Pass::Handoff);
    assert_eq!(result(&report, "fw-a").pass, Pass::Revisit);
    assert_eq!(fleet.version_of(&id("fw-a")), Some(v("10.2.0")));
    assert_eq!(fleet.version_of(&id("fw-b")), Some(v("10.2.0")));
}

#[tokio::test(start_paused = true)]
async fn test_peer_that_never_moves_stays_deferred() {
    let reports = TempDir::new().unwrap();
    let mut spec = firewall("fw-a", "10.1.0");
    spec.ha = Some(SimHaSpec {
        role: DeviceRole::Active,
        peer: id("fw-remote"),
        peer_version: Some(v("10.1.0")),
        peer_role: Some(DeviceRole::Passive),
        synchronized: true,
    });
    let fleet = SimFleet::from_specs(vec![spec]);

    let report = scheduler(&reports, &fleet, 2, OnFatal::IsolateDevice)
        .run_fleet(&[id("fw-a")], v("10.2.0"), false)
        .await;

    match &result(&report, "fw-a").outcome {
        Err(UpgradeError::StillDeferred { peer }) => assert_eq!(peer, "fw-remote"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    // the peer is outside the simulated fleet, so the hand-off cannot reach it
    assert!(report.get(&id("fw-remote")).is_none());
    assert_eq!(report.results.len(), 1);
    assert_eq!(fleet.version_of(&id("fw-a")), Some(v("10.1.0")));
    assert_eq!(fleet.counters(&id("fw-a")).unwrap().install_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_does_not_halt_single_upgrade() {
    let reports = TempDir::new().unwrap();
    let mut spec = firewall("fw-a", "10.1.0");
    spec.ha = Some(SimHaSpec {
        role: DeviceRole::Active,
        peer: id("fw-remote"),
        peer_version: Some(v("10.1.0")),
        peer_role: Some(DeviceRole::Passive),
        synchronized: true,
    });
    let fleet = SimFleet::from_specs(vec![spec]);

    let start = tokio::time::Instant::now();
    let report = scheduler(&reports, &fleet, 1, OnFatal::HaltProcess)
        .run_fleet(&[id("fw-a")], v("10.2.0"), false)
        .await;

    assert!(!report.halted);
    let active = result(&report, "fw-a");
    assert_eq!(active.pass, Pass::Revisit);
    match &active.outcome {
        Err(UpgradeError::StillDeferred { peer }) => assert_eq!(peer, "fw-remote"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.results.len(), 1);
    // the revisit pass waited out the whole resync budget
    assert!(start.elapsed() >= Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_fleet_changes_nothing() {
    let reports = TempDir::new().unwrap();
    let fleet = SimFleet::from_specs(vec![
        firewall("fw-1", "10.1.0"),
        SimDeviceSpec::new("mgr-1", DeviceKind::Manager, v("10.1.0")).with_image("10.2.0", false),
    ]);

    let report = scheduler(&reports, &fleet, 2, OnFatal::IsolateDevice)
        .run_fleet(&fleet.ids(), v("10.2.0"), true)
        .await;

    assert!(report.is_success(), "{report:?}");
    for device in ["fw-1", "mgr-1"] {
        assert!(matches!(
            result(&report, device).outcome,
            Ok(DeviceOutcome::DryRunComplete { .. })
        ));
        let counters = fleet.counters(&id(device)).unwrap();
        assert_eq!(counters.install_calls, 0);
        assert_eq!(counters.reboot_calls, 0);
        assert_eq!(counters.suspend_calls, 0);
        assert_eq!(fleet.version_of(&id(device)), Some(v("10.1.0")));
    }
}

#[derive(Debug, Default)]
struct Timeline {
    events: Mutex<Vec<(&'static str, DeviceId, Pass)>>,
}

impl FleetObserver for Timeline {
    fn task_started(&self, device: &DeviceId, pass: Pass) {
        self.events.lock().push(("start", device.clone(), pass));
    }

    fn task_finished(&self, device: &DeviceId, pass: Pass, _outcome: &Result<DeviceOutcome>) {
        self.events.lock().push(("finish", device.clone(), pass));
    }
}

#[tokio::test(start_paused = true)]
async fn test_revisit_starts_after_first_pass_drains() {
    let reports = TempDir::new().unwrap();
    let mut specs = ha_pair();
    specs.push(firewall("fw-solo", "10.1.0"));
    let fleet = SimFleet::from_specs(specs);
    let timeline = Arc::new(Timeline::default());

    let report = scheduler(&reports, &fleet, 3, OnFatal::IsolateDevice)
        .with_observer(timeline.clone())
        .run_fleet(&fleet.ids(), v("10.2.0"), false)
        .await;
    assert!(report.is_success(), "{report:?}");

    let events = timeline.events.lock();
    let last_first_finish = events
        .iter()
        .rposition(|(kind, _, pass)| *kind == "finish" && *pass == Pass::First)
        .unwrap();
    let revisit_start = events
        .iter()
        .position(|(kind, _, pass)| *kind == "start" && *pass == Pass::Revisit)
        .unwrap();
    assert!(revisit_start > last_first_finish);
    assert_eq!(events[revisit_start].1, id("fw-a"));
    assert_eq!(
        events.iter().filter(|(kind, _, _)| *kind == "start").count(),
        4
    );
}
