pub mod dwell;
pub mod executor;
pub mod power_transition;
pub mod safety;
pub mod scheduler;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, ConfigUpdate, Settings};
use crate::domain::{Plan, PlanSlot, TelemetrySnapshot};
use crate::forecast::{ForecastProvider, ForecastSelection, PriceProvider, PriceProviderSelection};
use crate::hardware::{
    build_executor, build_telemetry_reader, ExecutorBackend, SharedDevices, TelemetryBackend,
    TelemetryReader,
};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::planner::Planner;
use crate::repo::{HistoryStore, PriceRow, TelemetryRow};

pub use dwell::DwellController;
pub use executor::{ApplyOutcome, BusExecutor, Executor, NoOpExecutor};
pub use scheduler::{JobSet, JobSpec, Scheduler, TaskStatus};

use scheduler::{COUNTERS_JOB, CONTROL_JOB, RECALC_JOB, TELEMETRY_JOB};

/// Everything the jobs and the API read or replace together. Guarded by one
/// lock that is never held across an `.await`.
struct SharedState {
    settings: Arc<Settings>,
    plan: Option<Arc<Plan>>,
    paused: bool,
    last_recalc_at: Option<DateTime<Utc>>,
    last_control_at: Option<DateTime<Utc>>,
    last_telemetry_at: Option<DateTime<Utc>>,
    latest_telemetry: Option<TelemetrySnapshot>,
    price_selection: PriceProviderSelection,
    price_provider: Arc<dyn PriceProvider>,
    forecast_selection: ForecastSelection,
    forecast_provider: Arc<dyn ForecastProvider>,
    telemetry_backend: TelemetryBackend,
    telemetry: Arc<dyn TelemetryReader>,
    /// Last known actuator view, for readers that must not wait on actuation.
    executor_backend: ExecutorBackend,
    last_setpoint_w: Option<i32>,
}

/// Identifies the actuator an executor talks to; a change means rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExecutorSelection {
    backend: ExecutorBackend,
    modbus_address: Option<String>,
    modbus_unit_id: u8,
}

impl ExecutorSelection {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            backend: ExecutorBackend::from_settings(settings),
            modbus_address: settings.modbus_address.clone(),
            modbus_unit_id: settings.modbus_unit_id,
        }
    }
}

/// The executor and its dwell state. Bus writes await while this is held, so
/// it sits behind an async mutex separate from [`SharedState`].
struct Actuation {
    selection: ExecutorSelection,
    executor: Box<dyn Executor>,
    dwell: DwellController,
    neutral_applied: bool,
}

/// Pluggable pieces of the controller, built from settings or injected.
pub struct Components {
    pub price_provider: Arc<dyn PriceProvider>,
    pub forecast_provider: Arc<dyn ForecastProvider>,
    pub telemetry: Arc<dyn TelemetryReader>,
    pub executor: Box<dyn Executor>,
}

impl Components {
    pub fn from_settings(
        settings: &Settings,
        devices: &mut SharedDevices,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        Ok(Self {
            price_provider: PriceProviderSelection::from_settings(settings).build()?,
            forecast_provider: ForecastSelection::from_settings(settings).build(),
            telemetry: build_telemetry_reader(TelemetryBackend::from_settings(settings), settings, devices)?,
            executor: build_executor(ExecutorBackend::from_settings(settings), settings, devices, metrics)?,
        })
    }
}

/// What one control tick did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tick", rename_all = "snake_case")]
pub enum ControlTick {
    Paused { neutral_applied: bool },
    NoPlan,
    Executed { outcome: ApplyOutcome },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub automation_paused: bool,
    pub last_recalc_at: Option<DateTime<Utc>>,
    pub last_control_at: Option<DateTime<Utc>>,
    pub last_telemetry_at: Option<DateTime<Utc>>,
    pub plan_id: Option<Uuid>,
    pub plan_valid_until: Option<DateTime<Utc>>,
    pub current_slot: Option<PlanSlot>,
    pub latest_telemetry: Option<TelemetrySnapshot>,
    pub executor_backend: String,
    pub last_setpoint_w: Option<i32>,
    pub metrics: MetricsSnapshot,
    pub jobs: BTreeMap<String, TaskStatus>,
}

#[derive(Clone)]
pub struct AppState {
    shared: Arc<Mutex<SharedState>>,
    actuation: Arc<tokio::sync::Mutex<Actuation>>,
    devices: Arc<Mutex<SharedDevices>>,
    settings_update: Arc<tokio::sync::Mutex<()>>,
    pub scheduler: Arc<Scheduler>,
    pub history: Arc<HistoryStore>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let mut devices = SharedDevices::default();
        let components = Components::from_settings(&settings, &mut devices, metrics.clone())?;
        Ok(Self::with_components(settings, components, devices, metrics))
    }

    pub fn with_components(
        settings: Settings,
        components: Components,
        devices: SharedDevices,
        metrics: Arc<Metrics>,
    ) -> Self {
        let dwell = DwellController::from_settings(&settings);
        let shared = SharedState {
            price_selection: PriceProviderSelection::from_settings(&settings),
            price_provider: components.price_provider,
            forecast_selection: ForecastSelection::from_settings(&settings),
            forecast_provider: components.forecast_provider,
            telemetry_backend: TelemetryBackend::from_settings(&settings),
            telemetry: components.telemetry,
            plan: None,
            paused: false,
            last_recalc_at: None,
            last_control_at: None,
            last_telemetry_at: None,
            latest_telemetry: None,
            executor_backend: components.executor.backend(),
            last_setpoint_w: components.executor.last_setpoint_w(),
            settings: Arc::new(settings),
        };
        let actuation = Actuation {
            selection: ExecutorSelection::from_settings(&shared.settings),
            executor: components.executor,
            dwell,
            neutral_applied: false,
        };

        Self {
            shared: Arc::new(Mutex::new(shared)),
            actuation: Arc::new(tokio::sync::Mutex::new(actuation)),
            devices: Arc::new(Mutex::new(devices)),
            settings_update: Arc::new(tokio::sync::Mutex::new(())),
            scheduler: Arc::new(Scheduler::new(metrics.clone())),
            history: Arc::new(HistoryStore::default()),
            metrics,
        }
    }

    fn publish_actuation(&self, act: &Actuation) {
        let mut s = self.shared.lock();
        s.executor_backend = act.executor.backend();
        s.last_setpoint_w = act.executor.last_setpoint_w();
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.shared.lock().settings.clone()
    }

    pub fn current_plan(&self) -> Option<Arc<Plan>> {
        self.shared.lock().plan.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn set_paused(&self, paused: bool) {
        let changed = {
            let mut s = self.shared.lock();
            std::mem::replace(&mut s.paused, paused) != paused
        };
        self.metrics.set_paused(paused);
        if changed {
            info!(paused, "automation pause flag changed");
        }
    }

    /// Fetches prices and forecasts, builds a fresh plan and publishes it.
    /// On a price failure the previous plan stays in place.
    pub async fn recalculate_plan(&self) -> Result<Arc<Plan>> {
        let (settings, prices, forecast) = {
            let s = self.shared.lock();
            (s.settings.clone(), s.price_provider.clone(), s.forecast_provider.clone())
        };
        let now = Utc::now();
        let planner = Planner::new(settings);
        let (start, end) = planner.horizon(now);

        let raw = match prices.get_prices(start, end).await {
            Ok(raw) => raw,
            Err(e) => {
                self.metrics.planner_failures();
                warn!(error = %e, "price fetch failed, keeping previous plan");
                return Err(e.context("fetching prices"));
            }
        };
        let solar = forecast
            .get_solar_forecast(start, end)
            .await
            .map_err(|e| warn!(error = %e, "solar forecast unavailable"))
            .ok();
        let load = forecast
            .get_load_forecast(start, end)
            .await
            .map_err(|e| warn!(error = %e, "load forecast unavailable"))
            .ok();

        let plan = Arc::new(planner.build_plan(&raw, now, solar.as_deref(), load.as_deref()));
        self.history.upsert_prices(raw.iter().map(|p| PriceRow {
            at: p.at,
            raw: p.price,
            buy: planner.buy_price(p.price),
            sell: planner.sell_price(p.price),
        }));

        {
            let mut s = self.shared.lock();
            s.plan = Some(plan.clone());
            s.last_recalc_at = Some(now);
        }
        self.metrics.planner_runs();
        self.metrics.set_plan_age(0);
        info!(
            plan_id = %plan.id,
            slots = plan.slots.len(),
            prices = raw.len(),
            summary = plan.summary.as_deref().unwrap_or_default(),
            "plan published"
        );
        Ok(plan)
    }

    /// One control job run: honors the pause flag, then applies the active slot.
    pub async fn control_tick(&self) -> ControlTick {
        let now = Utc::now();
        let (paused, plan) = {
            let mut s = self.shared.lock();
            s.last_control_at = Some(now);
            (s.paused, s.plan.clone())
        };
        self.metrics.control_ticks();

        let mut guard = self.actuation.lock().await;
        let act = &mut *guard;
        if paused {
            if !act.neutral_applied {
                match act.executor.reset_to_neutral().await {
                    Ok(()) => {
                        act.neutral_applied = true;
                        info!("automation paused, setpoint reset to neutral");
                    }
                    Err(e) => warn!(error = %e, "neutral reset while paused failed, retrying next tick"),
                }
                self.publish_actuation(act);
            }
            return ControlTick::Paused {
                neutral_applied: act.neutral_applied,
            };
        }
        act.neutral_applied = false;

        let Some(plan) = plan else {
            debug!("no plan yet, control tick skipped");
            return ControlTick::NoPlan;
        };
        let outcome = act.executor.apply_setpoint(now, &plan, &mut act.dwell).await;
        self.publish_actuation(act);
        debug!(?outcome, "control tick");
        ControlTick::Executed { outcome }
    }

    pub async fn sample_telemetry(&self) -> TelemetrySnapshot {
        let reader = self.shared.lock().telemetry.clone();
        let snapshot = reader.read().await;
        let now = Utc::now();

        self.history.record_telemetry(TelemetryRow::from_snapshot(now, &snapshot));
        {
            let mut s = self.shared.lock();
            s.last_telemetry_at = Some(now);
            s.latest_telemetry = Some(snapshot.clone());
        }
        self.metrics.telemetry_samples();
        snapshot
    }

    /// Refreshes gauges and records cumulative counters when available.
    pub async fn collect_counters(&self) {
        let now = Utc::now();
        let (reader, paused, generated_at) = {
            let s = self.shared.lock();
            (s.telemetry.clone(), s.paused, s.plan.as_ref().map(|p| p.generated_at))
        };
        self.metrics.set_paused(paused);
        if let Some(generated_at) = generated_at {
            self.metrics
                .set_plan_age((now - generated_at).num_seconds().max(0) as u64);
        }
        // a control tick may be mid-write; the gauge catches up next run
        if let Ok(act) = self.actuation.try_lock() {
            if let Some(w) = act.executor.last_setpoint_w() {
                self.metrics.set_current_setpoint(w);
            }
        }
        if let Some(counters) = reader.read_counters().await {
            self.history.record_counters(now, counters);
        }
    }

    /// Validates and publishes new settings, swapping providers and backends
    /// whose selection changed, then reschedules all jobs. Nothing changes
    /// when validation or a component build fails.
    pub async fn apply_settings(&self, update: &ConfigUpdate) -> Result<Arc<Settings>, ConfigError> {
        let _serial = self.settings_update.lock().await;
        let (current, price_selection, forecast_selection, telemetry_backend) = {
            let s = self.shared.lock();
            (
                s.settings.clone(),
                s.price_selection.clone(),
                s.forecast_selection.clone(),
                s.telemetry_backend,
            )
        };
        let next = Arc::new(update.apply_to(&current)?);

        let new_price_selection = PriceProviderSelection::from_settings(&next);
        let price_provider = if new_price_selection != price_selection {
            Some(
                new_price_selection
                    .build()
                    .map_err(|e| ConfigError::Invalid(format!("price provider: {e:#}")))?,
            )
        } else {
            None
        };
        let new_forecast_selection = ForecastSelection::from_settings(&next);
        let forecast_provider =
            (new_forecast_selection != forecast_selection).then(|| new_forecast_selection.build());

        let new_telemetry_backend = TelemetryBackend::from_settings(&next);
        let telemetry = if new_telemetry_backend != telemetry_backend {
            let mut devices = self.devices.lock();
            Some(
                build_telemetry_reader(new_telemetry_backend, &next, &mut devices)
                    .map_err(|e| ConfigError::Invalid(format!("telemetry backend: {e:#}")))?,
            )
        } else {
            None
        };

        {
            let mut act = self.actuation.lock().await;
            let selection = ExecutorSelection::from_settings(&next);
            if selection != act.selection {
                let executor = {
                    let mut devices = self.devices.lock();
                    build_executor(selection.backend, &next, &mut devices, self.metrics.clone())
                        .map_err(|e| ConfigError::Invalid(format!("executor backend: {e:#}")))?
                };
                if let Err(e) = act.executor.reset_to_neutral().await {
                    warn!(error = %e, "neutral reset of replaced executor failed");
                }
                info!(from = %act.selection.backend, to = %selection.backend, "executor replaced");
                act.executor = executor;
                act.selection = selection;
                act.neutral_applied = false;
            } else {
                act.executor.reconfigure(&next);
            }
            act.dwell.reconfigure(&next);
            self.publish_actuation(&act);
        }

        {
            let mut s = self.shared.lock();
            s.settings = next.clone();
            if let Some(provider) = price_provider {
                s.price_provider = provider;
                s.price_selection = new_price_selection;
            }
            if let Some(provider) = forecast_provider {
                s.forecast_provider = provider;
                s.forecast_selection = new_forecast_selection;
            }
            if let Some(reader) = telemetry {
                s.telemetry = reader;
                s.telemetry_backend = new_telemetry_backend;
            }
        }
        info!("settings updated");

        if let Err(e) = next.persist_to_disk() {
            warn!(error = %e, "persisting settings failed");
        }
        self.scheduler.reschedule(self.job_set()).await;
        Ok(next)
    }

    /// The periodic jobs for the current settings.
    pub fn job_set(&self) -> JobSet {
        let settings = self.settings();
        let every = |secs: u32| Duration::from_secs(u64::from(secs));

        let state = self.clone();
        let recalc = JobSpec::new(RECALC_JOB, every(settings.recalculation_interval_seconds), move || {
            let state = state.clone();
            async move { state.recalculate_plan().await.map(|_| ()) }
        });
        let state = self.clone();
        let control = JobSpec::new(CONTROL_JOB, every(settings.dbus_update_interval_seconds), move || {
            let state = state.clone();
            async move {
                state.control_tick().await;
                Ok(())
            }
        });
        let telemetry = (TelemetryBackend::from_settings(&settings) != TelemetryBackend::Noop).then(|| {
            let state = self.clone();
            JobSpec::new(TELEMETRY_JOB, every(settings.telemetry_update_interval_seconds), move || {
                let state = state.clone();
                async move {
                    state.sample_telemetry().await;
                    Ok(())
                }
            })
        });
        let state = self.clone();
        let counters = JobSpec::new(COUNTERS_JOB, every(settings.counters_update_interval_seconds), move || {
            let state = state.clone();
            async move {
                state.collect_counters().await;
                Ok(())
            }
        });

        JobSet {
            recalc,
            control,
            telemetry,
            counters: Some(counters),
        }
    }

    /// Recalculates now, waiting for any scheduled recalculation in flight.
    pub async fn recalculate_now(&self) -> Result<Arc<Plan>> {
        self.scheduler
            .run_exclusive(RECALC_JOB, self.recalculate_plan())
            .await
            .context("plan recalculation failed")
    }

    /// Hands the setpoint back to the site before exit.
    pub async fn release_actuator(&self) {
        let mut act = self.actuation.lock().await;
        match act.executor.reset_to_neutral().await {
            Ok(()) => info!("actuator released to neutral"),
            Err(e) => warn!(error = %e, "neutral reset on shutdown failed"),
        }
        self.publish_actuation(&act);
    }

    /// Never waits on actuation: while a control tick or settings update is
    /// mid-write, the actuator fields come from the last published values.
    pub async fn status(&self) -> StatusReport {
        let now = Utc::now();
        let live = self
            .actuation
            .try_lock()
            .ok()
            .map(|act| (act.executor.backend(), act.executor.last_setpoint_w()));
        let s = self.shared.lock();
        let (executor_backend, last_setpoint_w) =
            live.unwrap_or((s.executor_backend, s.last_setpoint_w));
        StatusReport {
            automation_paused: s.paused,
            last_recalc_at: s.last_recalc_at,
            last_control_at: s.last_control_at,
            last_telemetry_at: s.last_telemetry_at,
            plan_id: s.plan.as_ref().map(|p| p.id),
            plan_valid_until: s.plan.as_ref().and_then(|p| p.valid_until()),
            current_slot: s.plan.as_ref().and_then(|p| p.slot_for(now).cloned()),
            latest_telemetry: s.latest_telemetry.clone(),
            executor_backend: executor_backend.to_string(),
            last_setpoint_w,
            metrics: self.metrics.snapshot(),
            jobs: self.scheduler.status(),
        }
    }
}
