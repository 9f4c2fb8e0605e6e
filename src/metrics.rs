//! Process-wide counters and gauges.
//!
//! Values live in atomics so the status endpoint can always read them. With
//! the `metrics` feature every update is also forwarded to the `metrics`
//! facade, which the Prometheus exporter renders at `/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    planner_runs: AtomicU64,
    planner_failures: AtomicU64,
    control_ticks: AtomicU64,
    executor_applies: AtomicU64,
    executor_apply_failures: AtomicU64,
    executor_reasserts: AtomicU64,
    executor_misapplies: AtomicU64,
    failsafe_resets: AtomicU64,
    failsafe_failures: AtomicU64,
    scheduler_misfires: AtomicU64,
    scheduler_coalesced: AtomicU64,
    telemetry_samples: AtomicU64,
    current_setpoint_w: AtomicI64,
    paused: AtomicU64,
    plan_age_seconds: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub planner_runs: u64,
    pub planner_failures: u64,
    pub control_ticks: u64,
    pub executor_applies: u64,
    pub executor_apply_failures: u64,
    pub executor_reasserts: u64,
    pub executor_misapplies: u64,
    pub failsafe_resets: u64,
    pub failsafe_failures: u64,
    pub scheduler_misfires: u64,
    pub scheduler_coalesced: u64,
    pub telemetry_samples: u64,
    pub current_setpoint_w: i64,
    pub paused: bool,
    pub plan_age_seconds: u64,
}

macro_rules! counter_methods {
    ($($field:ident => $name:literal),* $(,)?) => {
        $(
            pub fn $field(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                metrics::increment_counter!($name);
            }
        )*
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter_methods! {
        planner_runs => "helios_planner_runs_total",
        planner_failures => "helios_planner_failures_total",
        control_ticks => "helios_control_ticks_total",
        executor_applies => "helios_executor_applies_total",
        executor_apply_failures => "helios_executor_apply_failures_total",
        executor_reasserts => "helios_executor_reasserts_total",
        executor_misapplies => "helios_executor_misapplies_total",
        failsafe_resets => "helios_failsafe_resets_total",
        failsafe_failures => "helios_failsafe_failures_total",
        scheduler_misfires => "helios_scheduler_misfires_total",
        scheduler_coalesced => "helios_scheduler_coalesced_total",
        telemetry_samples => "helios_telemetry_samples_total",
    }

    pub fn set_current_setpoint(&self, watts: i32) {
        self.current_setpoint_w.store(i64::from(watts), Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::gauge!("helios_current_setpoint_watts", f64::from(watts));
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(u64::from(paused), Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::gauge!("helios_automation_paused", if paused { 1.0 } else { 0.0 });
    }

    pub fn set_plan_age(&self, seconds: u64) {
        self.plan_age_seconds.store(seconds, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::gauge!("helios_plan_age_seconds", seconds as f64);
    }

    /// Records how long one executor apply took.
    pub fn observe_apply_seconds(&self, seconds: f64) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("helios_executor_apply_seconds", seconds);
        #[cfg(not(feature = "metrics"))]
        let _ = seconds;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            planner_runs: load(&self.planner_runs),
            planner_failures: load(&self.planner_failures),
            control_ticks: load(&self.control_ticks),
            executor_applies: load(&self.executor_applies),
            executor_apply_failures: load(&self.executor_apply_failures),
            executor_reasserts: load(&self.executor_reasserts),
            executor_misapplies: load(&self.executor_misapplies),
            failsafe_resets: load(&self.failsafe_resets),
            failsafe_failures: load(&self.failsafe_failures),
            scheduler_misfires: load(&self.scheduler_misfires),
            scheduler_coalesced: load(&self.scheduler_coalesced),
            telemetry_samples: load(&self.telemetry_samples),
            current_setpoint_w: self.current_setpoint_w.load(Ordering::Relaxed),
            paused: load(&self.paused) != 0,
            plan_age_seconds: load(&self.plan_age_seconds),
        }
    }
}

/// Installs the global Prometheus recorder and returns the render handle.
#[cfg(feature = "metrics")]
pub fn install_prometheus_recorder(
) -> anyhow::Result<metrics_exporter_prometheus::PrometheusHandle> {
    use anyhow::Context;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let m = Metrics::new();
        m.executor_apply_failures();
        m.executor_apply_failures();
        m.failsafe_resets();
        m.set_current_setpoint(-1500);
        m.set_paused(true);

        let s = m.snapshot();
        assert_eq!(s.executor_apply_failures, 2);
        assert_eq!(s.failsafe_resets, 1);
        assert_eq!(s.current_setpoint_w, -1500);
        assert!(s.paused);
        assert_eq!(s.planner_runs, 0);
    }
}
