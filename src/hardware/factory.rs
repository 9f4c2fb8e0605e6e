use anyhow::Result;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{info, warn};

use super::{NoopTelemetry, SetpointBus, SimulatedEss, TelemetryReader};
use crate::config::Settings;
use crate::controller::executor::{BusExecutor, Executor, NoOpExecutor};
use crate::metrics::Metrics;

/// Where setpoints are written.
///
/// `Modbus` is only actuated when the crate is built with the `modbus`
/// feature; otherwise it falls back to the no-op backend with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ExecutorBackend {
    Noop,
    Sim,
    Modbus,
}

/// Where live readings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TelemetryBackend {
    Noop,
    Sim,
    Modbus,
}

impl ExecutorBackend {
    pub fn from_settings(settings: &Settings) -> Self {
        settings.executor_backend.parse().unwrap_or_else(|_| {
            warn!(backend = %settings.executor_backend, "unknown executor backend, using noop");
            ExecutorBackend::Noop
        })
    }
}

impl TelemetryBackend {
    pub fn from_settings(settings: &Settings) -> Self {
        settings.telemetry_backend.parse().unwrap_or_else(|_| {
            warn!(backend = %settings.telemetry_backend, "unknown telemetry backend, using noop");
            TelemetryBackend::Noop
        })
    }
}

/// Simulated ESS shared between the sim executor and the sim reader, so the
/// telemetry reflects what the executor wrote.
#[derive(Clone, Default)]
pub struct SharedDevices {
    sim: Option<Arc<SimulatedEss>>,
}

impl SharedDevices {
    pub fn simulated(&mut self, settings: &Settings) -> Arc<SimulatedEss> {
        self.sim
            .get_or_insert_with(|| Arc::new(SimulatedEss::from_settings(settings)))
            .clone()
    }
}

#[cfg(feature = "modbus")]
fn modbus_ess(settings: &Settings) -> Result<Arc<super::modbus::ModbusEss>> {
    use anyhow::Context;
    let addr = settings
        .modbus_address
        .as_deref()
        .context("modbus_address is not configured")?;
    Ok(Arc::new(super::modbus::ModbusEss::new(addr, settings.modbus_unit_id)?))
}

pub fn build_executor(
    backend: ExecutorBackend,
    settings: &Settings,
    devices: &mut SharedDevices,
    metrics: Arc<Metrics>,
) -> Result<Box<dyn Executor>> {
    let bus: Arc<dyn SetpointBus> = match backend {
        ExecutorBackend::Noop => return Ok(Box::new(NoOpExecutor::new(metrics))),
        ExecutorBackend::Sim => devices.simulated(settings),
        #[cfg(feature = "modbus")]
        ExecutorBackend::Modbus => modbus_ess(settings)?,
        #[cfg(not(feature = "modbus"))]
        ExecutorBackend::Modbus => {
            warn!("built without the modbus feature; executor falls back to noop");
            return Ok(Box::new(NoOpExecutor::new(metrics)));
        }
    };
    info!(%backend, "executor backend selected");
    Ok(Box::new(BusExecutor::new(backend, bus, settings, metrics)))
}

pub fn build_telemetry_reader(
    backend: TelemetryBackend,
    settings: &Settings,
    devices: &mut SharedDevices,
) -> Result<Arc<dyn TelemetryReader>> {
    let reader: Arc<dyn TelemetryReader> = match backend {
        TelemetryBackend::Noop => Arc::new(NoopTelemetry),
        TelemetryBackend::Sim => devices.simulated(settings),
        #[cfg(feature = "modbus")]
        TelemetryBackend::Modbus => modbus_ess(settings)?,
        #[cfg(not(feature = "modbus"))]
        TelemetryBackend::Modbus => {
            warn!("built without the modbus feature; telemetry falls back to noop");
            Arc::new(NoopTelemetry)
        }
    };
    Ok(reader)
}
