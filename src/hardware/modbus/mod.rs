pub mod ess;

pub use ess::{ModbusEss, VictronRegisters};
