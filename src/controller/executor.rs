//! Applies the active plan slot to an actuator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::dwell::DwellController;
use super::power_transition::{PowerRamp, PowerRampConfig};
use super::safety::SetpointLimits;
use crate::config::Settings;
use crate::domain::{Action, Plan};
use crate::hardware::{ExecutorBackend, SetpointBus};
use crate::metrics::Metrics;

/// Result of one control tick, for logging and tests. Never an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// `now` is outside plan coverage
    NoSlot,
    DwellBlocked { current: Option<Action>, requested: Action },
    Applied { action: Action, setpoint_w: i32, confirmed: bool },
    Misapplied { action: Action, setpoint_w: i32, read_back_w: i32 },
    Failed { action: Action, error: String, failsafe_ok: bool },
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn backend(&self) -> ExecutorBackend;

    /// Resolves the slot for `now` and applies it unless dwell forbids the
    /// change. Actuator failures end in [`ApplyOutcome::Failed`] after the
    /// fail-safe ran; they are never returned as errors.
    async fn apply_setpoint(
        &mut self,
        now: DateTime<Utc>,
        plan: &Plan,
        dwell: &mut DwellController,
    ) -> ApplyOutcome;

    /// Hands control back to the site's own controller (setpoint 0).
    async fn reset_to_neutral(&mut self) -> Result<()>;

    fn reconfigure(&mut self, settings: &Settings);

    fn last_setpoint_w(&self) -> Option<i32>;
}

/// Logs the planned setpoint without touching hardware. Limits and ramping
/// belong to the bus path, so the reported value is the slot's own.
pub struct NoOpExecutor {
    metrics: Arc<Metrics>,
    last_setpoint_w: Option<i32>,
}

impl NoOpExecutor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            last_setpoint_w: None,
        }
    }
}

#[async_trait]
impl Executor for NoOpExecutor {
    fn backend(&self) -> ExecutorBackend {
        ExecutorBackend::Noop
    }

    async fn apply_setpoint(
        &mut self,
        now: DateTime<Utc>,
        plan: &Plan,
        dwell: &mut DwellController,
    ) -> ApplyOutcome {
        let Some(slot) = plan.slot_for(now) else {
            return ApplyOutcome::NoSlot;
        };
        if !dwell.should_change(slot.action, now) {
            return ApplyOutcome::DwellBlocked {
                current: dwell.last_action(),
                requested: slot.action,
            };
        }
        dwell.note_action(slot.action, now);

        let started = Instant::now();
        info!(
            setpoint_w = slot.target_grid_setpoint_w,
            action = %slot.action,
            at = %now,
            "no-op executor applying setpoint"
        );
        self.last_setpoint_w = Some(slot.target_grid_setpoint_w);
        self.metrics.executor_applies();
        self.metrics.set_current_setpoint(slot.target_grid_setpoint_w);
        self.metrics.observe_apply_seconds(started.elapsed().as_secs_f64());

        ApplyOutcome::Applied {
            action: slot.action,
            setpoint_w: slot.target_grid_setpoint_w,
            confirmed: true,
        }
    }

    async fn reset_to_neutral(&mut self) -> Result<()> {
        info!("no-op executor resetting setpoint to neutral");
        self.last_setpoint_w = Some(0);
        self.metrics.set_current_setpoint(0);
        Ok(())
    }

    fn reconfigure(&mut self, _settings: &Settings) {}

    fn last_setpoint_w(&self) -> Option<i32> {
        self.last_setpoint_w
    }
}

/// Retry and verification knobs for bus writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusReliability {
    pub write_retries: u32,
    pub reassert_attempts: u32,
    pub retry_delay: Duration,
}

impl BusReliability {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            write_retries: settings.dbus_write_retries,
            reassert_attempts: settings.dbus_reassert_attempts,
            retry_delay: Duration::from_secs_f64(settings.dbus_write_retry_delay_seconds.max(0.0)),
        }
    }
}

enum Verification {
    Confirmed,
    /// Read-back was unavailable; the write itself succeeded.
    Unverified,
    Mismatch { read_back_w: i32 },
}

/// Drives a real (or simulated) setpoint bus with clamping, ramping,
/// verify/reassert and a fail-safe reset on any write failure.
pub struct BusExecutor {
    backend: ExecutorBackend,
    bus: Arc<dyn SetpointBus>,
    limits: SetpointLimits,
    ramp: PowerRamp,
    reliability: BusReliability,
    metrics: Arc<Metrics>,
}

impl BusExecutor {
    pub fn new(
        backend: ExecutorBackend,
        bus: Arc<dyn SetpointBus>,
        settings: &Settings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            bus,
            limits: SetpointLimits::from_settings(settings),
            ramp: PowerRamp::new(PowerRampConfig::from_settings(settings)),
            reliability: BusReliability::from_settings(settings),
            metrics,
        }
    }

    async fn pause_between_attempts(&self) {
        if !self.reliability.retry_delay.is_zero() {
            tokio::time::sleep(self.reliability.retry_delay).await;
        }
    }

    async fn write_with_retries(&self, watts: i32) -> Result<()> {
        let attempts = self.reliability.write_retries + 1;
        let mut attempt = 1;
        loop {
            match self.bus.write_setpoint(watts).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(attempt, setpoint_w = watts, error = %e, "setpoint write failed, retrying");
                    attempt += 1;
                    self.pause_between_attempts().await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("setpoint write failed after {attempts} attempts"))
                }
            }
        }
    }

    async fn write_and_verify(&self, target: i32) -> Result<Verification> {
        self.write_with_retries(target).await?;

        if self.reliability.reassert_attempts == 0 {
            return Ok(Verification::Unverified);
        }
        for _ in 0..self.reliability.reassert_attempts {
            let current = match self.bus.read_setpoint().await {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "setpoint read-back unavailable");
                    return Ok(Verification::Unverified);
                }
            };
            if current == target {
                return Ok(Verification::Confirmed);
            }
            self.metrics.executor_reasserts();
            warn!(expected_w = target, read_back_w = current, "setpoint mismatch, reasserting");
            self.write_with_retries(target).await?;
            self.pause_between_attempts().await;
        }

        match self.bus.read_setpoint().await {
            Ok(current) if current == target => Ok(Verification::Confirmed),
            Ok(current) => Ok(Verification::Mismatch { read_back_w: current }),
            Err(e) => {
                debug!(error = %e, "final setpoint read-back unavailable");
                Ok(Verification::Unverified)
            }
        }
    }

    /// One isolated attempt to write 0. Errors are logged and counted only.
    async fn fail_safe(&mut self) -> bool {
        self.metrics.failsafe_resets();
        match self.bus.write_setpoint(0).await {
            Ok(()) => {
                self.ramp.record_applied(0);
                self.metrics.set_current_setpoint(0);
                warn!("fail-safe: grid setpoint reset to 0");
                true
            }
            Err(e) => {
                self.metrics.failsafe_failures();
                error!(error = %e, "fail-safe reset to 0 failed");
                false
            }
        }
    }
}

#[async_trait]
impl Executor for BusExecutor {
    fn backend(&self) -> ExecutorBackend {
        self.backend
    }

    async fn apply_setpoint(
        &mut self,
        now: DateTime<Utc>,
        plan: &Plan,
        dwell: &mut DwellController,
    ) -> ApplyOutcome {
        let Some(slot) = plan.slot_for(now) else {
            return ApplyOutcome::NoSlot;
        };
        let action = slot.action;
        if !dwell.should_change(action, now) {
            debug!(current = ?dwell.last_action(), requested = %action, "dwell blocks action change");
            return ApplyOutcome::DwellBlocked {
                current: dwell.last_action(),
                requested: action,
            };
        }

        let started = Instant::now();
        let (clamped, _) = self.limits.clamp(slot.target_grid_setpoint_w);
        let target = self.ramp.next_setpoint(clamped);

        let outcome = match self.write_and_verify(target).await {
            Ok(verification @ (Verification::Confirmed | Verification::Unverified)) => {
                let confirmed = matches!(verification, Verification::Confirmed);
                self.ramp.record_applied(target);
                self.metrics.set_current_setpoint(target);
                info!(setpoint_w = target, action = %action, confirmed, "grid setpoint applied");
                ApplyOutcome::Applied {
                    action,
                    setpoint_w: target,
                    confirmed,
                }
            }
            Ok(Verification::Mismatch { read_back_w }) => {
                self.metrics.executor_misapplies();
                self.ramp.record_applied(read_back_w);
                self.metrics.set_current_setpoint(read_back_w);
                warn!(expected_w = target, read_back_w, "setpoint misapplied after reasserts");
                ApplyOutcome::Misapplied {
                    action,
                    setpoint_w: target,
                    read_back_w,
                }
            }
            Err(e) => {
                self.metrics.executor_apply_failures();
                error!(error = %e, setpoint_w = target, "setpoint apply failed");
                let failsafe_ok = self.fail_safe().await;
                ApplyOutcome::Failed {
                    action,
                    error: format!("{e:#}"),
                    failsafe_ok,
                }
            }
        };

        dwell.note_action(action, now);
        self.metrics.executor_applies();
        self.metrics.observe_apply_seconds(started.elapsed().as_secs_f64());
        outcome
    }

    async fn reset_to_neutral(&mut self) -> Result<()> {
        self.write_with_retries(0).await?;
        self.ramp.record_applied(0);
        self.metrics.set_current_setpoint(0);
        info!("grid setpoint reset to neutral");
        Ok(())
    }

    fn reconfigure(&mut self, settings: &Settings) {
        self.limits = SetpointLimits::from_settings(settings);
        self.ramp.set_config(PowerRampConfig::from_settings(settings));
        self.reliability = BusReliability::from_settings(settings);
    }

    fn last_setpoint_w(&self) -> Option<i32> {
        self.ramp.last_applied_w()
    }
}
