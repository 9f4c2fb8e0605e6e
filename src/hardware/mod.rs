pub mod factory;
#[cfg(feature = "modbus")]
pub mod modbus;
pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{EnergyCounters, TelemetrySnapshot};

pub use factory::{
    build_executor, build_telemetry_reader, ExecutorBackend, SharedDevices, TelemetryBackend,
};
pub use simulated::SimulatedEss;

/// Write/read access to the site's grid setpoint (watts, positive imports).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SetpointBus: Send + Sync {
    async fn write_setpoint(&self, watts: i32) -> Result<()>;
    async fn read_setpoint(&self) -> Result<i32>;
}

/// Live readings from the site.
#[async_trait]
pub trait TelemetryReader: Send + Sync {
    /// Never fails; unavailable values are left empty.
    async fn read(&self) -> TelemetrySnapshot;

    /// Cumulative counters, when the backend keeps them.
    async fn read_counters(&self) -> Option<EnergyCounters> {
        None
    }
}

/// Reader used when no telemetry backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

#[async_trait]
impl TelemetryReader for NoopTelemetry {
    async fn read(&self) -> TelemetrySnapshot {
        TelemetrySnapshot::default()
    }
}
