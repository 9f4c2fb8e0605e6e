use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::TelemetrySnapshot;
use crate::hardware::{SetpointBus, TelemetryReader};
use crate::modbus::client::ModbusClient;
use crate::modbus::parser;

/// Victron GX register layout used for ESS control and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VictronRegisters {
    /// ESS grid setpoint, int16 W, positive imports
    pub grid_setpoint: u16,
    /// Battery SoC, uint16 %
    pub battery_soc: u16,
    /// AC consumption L1..L3, uint16 W
    pub consumption_l1: u16,
    /// PV on AC output L1..L3 followed by PV on AC input L1..L3
    pub ac_pv_start: u16,
    pub ac_pv_count: u16,
    /// DC-coupled PV power, uint16 W
    pub dc_pv: u16,
}

impl Default for VictronRegisters {
    fn default() -> Self {
        Self {
            grid_setpoint: 2700,
            battery_soc: 843,
            consumption_l1: 817,
            ac_pv_start: 808,
            ac_pv_count: 6,
            dc_pv: 850,
        }
    }
}

/// ESS reached over Modbus TCP on a Victron GX device.
pub struct ModbusEss {
    client: ModbusClient,
    registers: VictronRegisters,
}

impl ModbusEss {
    pub fn new(addr: &str, unit_id: u8) -> Result<Self> {
        let client = ModbusClient::new(addr, unit_id).context("Failed to configure Modbus ESS")?;
        Ok(Self {
            client,
            registers: VictronRegisters::default(),
        })
    }

    async fn read_u16(&self, register: u16) -> Result<u16> {
        let regs = self.client.read_holding_registers(register, 1).await?;
        parser::parse_u16(&regs).with_context(|| format!("empty response for register {register}"))
    }

    async fn read_consumption(&self) -> Result<i32> {
        let regs = self
            .client
            .read_holding_registers(self.registers.consumption_l1, 3)
            .await?;
        Ok(parser::sum_u16(&regs))
    }

    async fn read_solar(&self) -> Result<i32> {
        let ac = self
            .client
            .read_holding_registers(self.registers.ac_pv_start, self.registers.ac_pv_count)
            .await?;
        let dc = self.read_u16(self.registers.dc_pv).await?;
        Ok(parser::sum_u16(&ac) + i32::from(dc))
    }
}

#[async_trait]
impl SetpointBus for ModbusEss {
    async fn write_setpoint(&self, watts: i32) -> Result<()> {
        debug!(setpoint_w = watts, addr = %self.client.addr(), "writing ESS grid setpoint");
        self.client
            .write_single_register(self.registers.grid_setpoint, parser::encode_i16(watts))
            .await
    }

    async fn read_setpoint(&self) -> Result<i32> {
        let regs = self
            .client
            .read_holding_registers(self.registers.grid_setpoint, 1)
            .await?;
        parser::parse_i16(&regs)
            .map(i32::from)
            .context("empty response for grid setpoint")
    }
}

#[async_trait]
impl TelemetryReader for ModbusEss {
    async fn read(&self) -> TelemetrySnapshot {
        let (soc, load, solar, setpoint) = tokio::join!(
            self.read_u16(self.registers.battery_soc),
            self.read_consumption(),
            self.read_solar(),
            self.read_setpoint(),
        );
        let snapshot = TelemetrySnapshot {
            soc_percent: soc.as_ref().ok().map(|v| f64::from(*v)),
            load_w: load.as_ref().ok().copied(),
            solar_w: solar.as_ref().ok().copied(),
            grid_setpoint_w: setpoint.as_ref().ok().copied(),
        };
        if let Some(e) = [soc.err(), load.err(), solar.err(), setpoint.err()]
            .into_iter()
            .flatten()
            .next()
        {
            warn!(error = %e, "partial Modbus telemetry read");
        }
        snapshot
    }
}
