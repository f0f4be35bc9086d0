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

//! Bounded-retry execution of upgrade phases
//!
//! Every polling loop in the pipeline goes through [`PhaseRunner::run`] so a
//! device can never pin a worker forever: each phase has an attempt budget
//! and a fixed interval between attempts.

use crate::error::{Result, UpgradeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// One-shot device reads and commands outside the long-running phases
    Query,
    Download,
    Install,
    Reboot,
    RebootVerify,
    HaResync,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Query => "device query",
            Self::Download => "download",
            Self::Install => "install",
            Self::Reboot => "reboot",
            Self::RebootVerify => "reboot verification",
            Self::HaResync => "HA resync",
        };
        f.write_str(s)
    }
}

/// Attempt budget for one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }
}

/// What a single attempt produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// The phase is complete
    Done(T),
    /// Not there yet; counts as an attempt and retries after the interval
    Pending(String),
}

#[derive(Debug)]
pub struct PhaseOutcome<T> {
    pub phase: Phase,
    pub attempts: u32,
    pub result: Result<T>,
}

impl<T> PhaseOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn last_error(&self) -> Option<&UpgradeError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Runs phase attempts until success, a fatal error, or the budget is spent
#[derive(Debug, Clone, Default)]
pub struct PhaseRunner {
    cancel: Option<CancellationToken>,
}

impl PhaseRunner {
    /// A runner whose inter-attempt sleeps stop early when `cancel` fires
    pub fn cancellable(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    /// A runner that always sees its phase through, used once a device is mid-upgrade
    pub fn uncancellable() -> Self {
        Self { cancel: None }
    }

    pub async fn run<T, F, Fut>(&self, phase: Phase, policy: RetryPolicy, mut attempt: F) -> PhaseOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Step<T>>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut last = String::new();

        for n in 1..=max_attempts {
            if self.is_cancelled() {
                return outcome(phase, n - 1, Err(UpgradeError::Cancelled));
            }

            match attempt(n).await {
                Ok(Step::Done(value)) => {
                    debug!("{phase} completed on attempt {n}/{max_attempts}");
                    return outcome(phase, n, Ok(value));
                }
                Ok(Step::Pending(reason)) => {
                    debug!("{phase} not complete (attempt {n}/{max_attempts}): {reason}");
                    last = reason;
                }
                Err(e) if e.is_transient() => {
                    warn!("{phase} attempt {n}/{max_attempts} failed: {e}");
                    last = e.to_string();
                }
                Err(e) => {
                    error!("{phase} failed fatally on attempt {n}: {e}");
                    return outcome(phase, n, Err(e));
                }
            }

            if n < max_attempts && !self.pause(policy.interval).await {
                return outcome(phase, n, Err(UpgradeError::Cancelled));
            }
        }

        error!("{phase} gave up after {max_attempts} attempts: {last}");
        outcome(
            phase,
            max_attempts,
            Err(UpgradeError::PhaseExhausted {
                phase,
                attempts: max_attempts,
                last,
            }),
        )
    }

    /// Sleep for `duration`; false when cancelled first
    pub async fn pause(&self, duration: Duration) -> bool {
        match &self.cancel {
            Some(cancel) => {
                tokio::select! {
                    () = tokio::time::sleep(duration) => true,
                    () = cancel.cancelled() => false,
                }
            }
            None => {
                tokio::time::sleep(duration).await;
                true
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

fn outcome<T>(phase: Phase, attempts: u32, result: Result<T>) -> PhaseOutcome<T> {
    PhaseOutcome {
        phase,
        attempts,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_use_whole_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: PhaseOutcome<()> = PhaseRunner::default()
            .run(Phase::Install, policy(3), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DeviceError::Busy.into())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert!(!outcome.succeeded());
        assert!(matches!(
            outcome.last_error(),
            Some(UpgradeError::PhaseExhausted { attempts: 3, .. })
        ));
        assert!(!outcome.last_error().unwrap().is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: PhaseOutcome<()> = PhaseRunner::default()
            .run(Phase::Install, policy(5), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DeviceError::Rejected("bad image".to_owned()).into())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.into_result(),
            Err(UpgradeError::Device(DeviceError::Rejected(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_done() {
        let start = tokio::time::Instant::now();
        let outcome = PhaseRunner::default()
            .run(Phase::RebootVerify, policy(10), |n| async move {
                if n < 4 {
                    Ok(Step::Pending(format!("attempt {n}")))
                } else {
                    Ok(Step::Done(n * 10))
                }
            })
            .await;

        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.into_result().unwrap(), 40);
        // three sleeps between four attempts
        assert_eq!(start.elapsed(), Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_exhaustion_reports_reason() {
        let outcome: PhaseOutcome<()> = PhaseRunner::default()
            .run(Phase::Download, policy(2), |_| async {
                Ok(Step::Pending("still downloading".to_owned()))
            })
            .await;

        match outcome.into_result() {
            Err(UpgradeError::PhaseExhausted {
                phase,
                attempts,
                last,
            }) => {
                assert_eq!(phase, Phase::Download);
                assert_eq!(attempts, 2);
                assert_eq!(last, "still downloading");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let runner = PhaseRunner::cancellable(cancel.clone());
        let trigger = cancel.clone();

        let outcome: PhaseOutcome<()> = runner
            .run(Phase::Download, policy(5), |n| {
                if n == 2 {
                    trigger.cancel();
                }
                async { Err(DeviceError::Transport("timeout".to_owned()).into()) }
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.into_result(), Err(UpgradeError::Cancelled)));
    }

    #[test]
    fn test_policy_has_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
