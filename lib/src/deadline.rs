//! Wall-clock budget tracking and cooperative cancellation.
//!
//! The deadline controller answers one question at every stage boundary:
//! is there enough budget left to start the next step? Cancellation folds
//! the host's SIGTERM, a newer `NoOperation` goal state, and the disable
//! sentinel into a single token the command watchdog also observes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::settings;

/// Sentinel file (in the handler-state directory) that blocks runs while
/// the extension is disabled.
pub(crate) const DISABLE_SENTINEL: &str = ".disabled";

/// Budget reserved for a graceful wrap-up: final status flush, no reboot.
const WRAPUP_BUDGET: Duration = Duration::from_secs(60);
/// Stage estimate floor; also the estimate before any sample exists.
const MIN_STAGE_ESTIMATE: Duration = Duration::from_secs(30);

/// Verdict from a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    /// Enough budget for the next stage.
    Continue,
    /// Not enough for another stage, but a graceful wrap-up fits.
    StopWithPartial,
    /// The deadline has passed; stop immediately.
    StopNow,
}

/// Tracks the wall-clock budget of one run.
#[derive(Debug)]
pub(crate) struct DeadlineController {
    started: Instant,
    budget: Duration,
    estimate_floor: Duration,
    wrapup: Duration,
    install_samples: Vec<Duration>,
}

impl DeadlineController {
    pub(crate) fn new(budget: Duration) -> Self {
        Self::with_tuning(budget, MIN_STAGE_ESTIMATE, WRAPUP_BUDGET)
    }

    /// Like [`Self::new`] with custom stage-estimate and wrap-up tuning;
    /// lets tests compress time scales.
    pub(crate) fn with_tuning(budget: Duration, estimate_floor: Duration, wrapup: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            estimate_floor,
            wrapup,
            install_samples: Vec::new(),
        }
    }

    /// Remaining budget, saturating at zero.
    pub(crate) fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Record how long a single-patch install took.
    pub(crate) fn record_install(&mut self, took: Duration) {
        self.install_samples.push(took);
    }

    fn median_install(&self) -> Option<Duration> {
        if self.install_samples.is_empty() {
            return None;
        }
        let mut sorted = self.install_samples.clone();
        sorted.sort();
        Some(sorted[sorted.len() / 2])
    }

    /// Expected cost of the next single-patch install: observed median
    /// times 1.5, floored so early samples don't produce wild optimism.
    pub(crate) fn stage_estimate(&self) -> Duration {
        let base = self
            .median_install()
            .map(|m| m.mul_f64(1.5))
            .unwrap_or(self.estimate_floor);
        base.max(self.estimate_floor)
    }

    /// Gate for the next stage.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let remaining = self.remaining();
        if remaining.is_zero() {
            Checkpoint::StopNow
        } else if remaining < self.stage_estimate() + self.wrapup {
            Checkpoint::StopWithPartial
        } else {
            Checkpoint::Continue
        }
    }

    /// Cancel `token` when the budget runs out. The token is the one the
    /// command watchdog observes, so an exceeded deadline terminates a
    /// running package-manager child.
    pub(crate) fn arm(&self, token: CancellationToken) {
        let remaining = self.remaining();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            tracing::warn!("deadline exceeded; cancelling in-flight work");
            token.cancel();
        });
    }
}

/// Why a run is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    /// SIGTERM from the host agent.
    Signal,
    /// A newer goal state with `NoOperation` and our activity id.
    NoOperation,
    /// The disable sentinel appeared.
    Disabled,
}

/// Shared cancellation state: one token, first reason wins.
#[derive(Debug, Clone)]
pub(crate) struct Cancellation {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl Cancellation {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn cancel(&self, reason: CancelReason) {
        {
            let mut guard = self.reason.lock().expect("cancellation mutex");
            guard.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().expect("cancellation mutex")
    }
}

/// Spawn the SIGTERM listener. Separate from the config watcher because it
/// is wanted for every operation, including `NoOperation` itself.
pub(crate) fn spawn_signal_listener(cancel: &Cancellation) -> Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Installing SIGTERM handler")?;
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            tracing::info!("received SIGTERM");
            cancel.cancel(CancelReason::Signal);
        }
    });
    Ok(())
}

/// Spawn the config watcher: polls the config directory at 1 Hz for a newer
/// `NoOperation` sequence targeting our activity, and for the disable
/// sentinel.
pub(crate) fn spawn_config_watcher(
    cancel: &Cancellation,
    config_dir: Utf8PathBuf,
    state_dir: Utf8PathBuf,
    sequence: u64,
    activity_id: String,
) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.token().cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Ok(state) = Dir::open_ambient_dir(&state_dir, cap_std::ambient_authority()) {
                if state.try_exists(DISABLE_SENTINEL).unwrap_or(false) {
                    tracing::info!("disable sentinel present; cancelling");
                    cancel.cancel(CancelReason::Disabled);
                    break;
                }
            }
            let newer = Dir::open_ambient_dir(&config_dir, cap_std::ambient_authority())
                .ok()
                .and_then(|dir| {
                    settings::newer_no_operation(&dir, sequence, &activity_id).unwrap_or_default()
                });
            if let Some(seq) = newer {
                tracing::info!("sequence {seq} requests NoOperation; cancelling");
                cancel.cancel(CancelReason::NoOperation);
                break;
            }
        }
    });
}
