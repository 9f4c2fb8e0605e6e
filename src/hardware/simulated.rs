use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{SetpointBus, TelemetryReader};
use crate::config::Settings;
use crate::domain::{EnergyCounters, TelemetrySnapshot};

/// In-memory ESS behind a grid setpoint.
///
/// The battery absorbs whatever the grid setpoint leaves over after the
/// household base load: `battery_w = setpoint_w - base_load_w`. SoC is
/// integrated lazily on every access using one-way efficiency
/// `sqrt(roundtrip)`.
pub struct SimulatedEss {
    capacity_kwh: f64,
    one_way_efficiency: f64,
    base_load_w: f64,
    state: Mutex<SimState>,
}

#[derive(Debug, Clone)]
struct SimState {
    soc_percent: f64,
    setpoint_w: i32,
    last_update: Instant,
    counters: EnergyCounters,
}

impl SimulatedEss {
    pub fn new(capacity_kwh: f64, roundtrip_efficiency: f64, base_load_w: f64, initial_soc: f64) -> Self {
        let efficiency = if (0.25..=1.0).contains(&roundtrip_efficiency) {
            roundtrip_efficiency.sqrt()
        } else {
            1.0
        };
        Self {
            capacity_kwh: capacity_kwh.max(0.1),
            one_way_efficiency: efficiency,
            base_load_w: base_load_w.max(0.0),
            state: Mutex::new(SimState {
                soc_percent: initial_soc.clamp(0.0, 100.0),
                setpoint_w: 0,
                last_update: Instant::now(),
                counters: EnergyCounters::default(),
            }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.battery_capacity_kwh.unwrap_or(10.0),
            settings.roundtrip_efficiency(),
            settings.base_load_watts,
            settings.assumed_current_soc_percent.unwrap_or(50.0),
        )
    }

    pub fn soc_percent(&self) -> f64 {
        let mut st = self.state.lock();
        self.integrate(&mut st);
        st.soc_percent
    }

    fn integrate(&self, st: &mut SimState) {
        let now = Instant::now();
        let dt_h = now.duration_since(st.last_update).as_secs_f64() / 3600.0;
        st.last_update = now;
        if dt_h <= 0.0 {
            return;
        }

        let grid_kwh = f64::from(st.setpoint_w) * dt_h / 1000.0;
        if grid_kwh >= 0.0 {
            st.counters.grid_import_kwh += grid_kwh;
        } else {
            st.counters.grid_export_kwh += -grid_kwh;
        }

        let battery_kwh = (f64::from(st.setpoint_w) - self.base_load_w) * dt_h / 1000.0;
        let stored_delta = if battery_kwh >= 0.0 {
            st.counters.battery_charged_kwh += battery_kwh;
            battery_kwh * self.one_way_efficiency
        } else {
            st.counters.battery_discharged_kwh += -battery_kwh;
            battery_kwh / self.one_way_efficiency
        };
        st.soc_percent = (st.soc_percent + stored_delta / self.capacity_kwh * 100.0).clamp(0.0, 100.0);
    }
}

#[async_trait]
impl SetpointBus for SimulatedEss {
    async fn write_setpoint(&self, watts: i32) -> Result<()> {
        let mut st = self.state.lock();
        self.integrate(&mut st);
        st.setpoint_w = watts;
        debug!(setpoint_w = watts, soc_percent = st.soc_percent, "simulated setpoint written");
        Ok(())
    }

    async fn read_setpoint(&self) -> Result<i32> {
        Ok(self.state.lock().setpoint_w)
    }
}

#[async_trait]
impl TelemetryReader for SimulatedEss {
    async fn read(&self) -> TelemetrySnapshot {
        let mut st = self.state.lock();
        self.integrate(&mut st);
        TelemetrySnapshot {
            soc_percent: Some(st.soc_percent),
            load_w: Some(self.base_load_w.round() as i32),
            solar_w: Some(0),
            grid_setpoint_w: Some(st.setpoint_w),
        }
    }

    async fn read_counters(&self) -> Option<EnergyCounters> {
        let mut st = self.state.lock();
        self.integrate(&mut st);
        Some(st.counters)
    }
}
