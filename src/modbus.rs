#[cfg(feature = "modbus")]
pub mod client {
    use anyhow::{anyhow, Context as AnyhowContext, Result};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::timeout;
    use tokio_modbus::client::{tcp, Context};
    use tokio_modbus::prelude::*;
    use tracing::{debug, warn};

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    const MAX_ATTEMPTS: u32 = 3;

    #[derive(Debug, Clone, Copy)]
    enum Operation {
        ReadHolding { start: u16, count: u16 },
        WriteSingle { addr: u16, value: u16 },
    }

    /// Modbus TCP client that connects on first use and drops the
    /// connection after any failed operation, so the next call reconnects.
    pub struct ModbusClient {
        context: Arc<Mutex<Option<Context>>>,
        unit_id: u8,
        addr: SocketAddr,
        timeout_duration: Duration,
    }

    impl ModbusClient {
        pub fn new(addr: &str, unit_id: u8) -> Result<Self> {
            Self::with_timeout(addr, unit_id, DEFAULT_TIMEOUT)
        }

        pub fn with_timeout(addr: &str, unit_id: u8, timeout_duration: Duration) -> Result<Self> {
            let addr = addr
                .parse()
                .with_context(|| format!("Invalid Modbus address {addr}"))?;
            Ok(Self {
                context: Arc::new(Mutex::new(None)),
                unit_id,
                addr,
                timeout_duration,
            })
        }

        pub fn addr(&self) -> SocketAddr {
            self.addr
        }

        pub async fn read_holding_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
            self.execute(Operation::ReadHolding { start, count })
                .await
                .with_context(|| format!("Failed to read holding registers at {start}"))
        }

        pub async fn write_single_register(&self, addr: u16, value: u16) -> Result<()> {
            self.execute(Operation::WriteSingle { addr, value })
                .await
                .map(|_| ())
                .with_context(|| format!("Failed to write register at {addr}"))
        }

        async fn connect(&self) -> Result<Context> {
            debug!(addr = %self.addr, unit_id = self.unit_id, "connecting to Modbus device");
            let ctx = timeout(self.timeout_duration, tcp::connect(self.addr))
                .await
                .context("Connection timeout")?
                .context("Failed to connect")?;
            Ok(ctx)
        }

        /// Runs one operation with bounded retries. The lock is held for
        /// the duration of a single attempt only.
        async fn execute(&self, op: Operation) -> Result<Vec<u16>> {
            let mut last_error = anyhow!("no attempt made");

            for attempt in 1..=MAX_ATTEMPTS {
                let mut guard = self.context.lock().await;
                if guard.is_none() {
                    match self.connect().await {
                        Ok(ctx) => *guard = Some(ctx),
                        Err(e) => {
                            warn!(attempt, error = %e, "Modbus connect failed");
                            last_error = e;
                            drop(guard);
                            tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                            continue;
                        }
                    }
                }
                let Some(ctx) = guard.as_mut() else { continue };
                ctx.set_slave(Slave(self.unit_id));

                let call = async {
                    match op {
                        Operation::ReadHolding { start, count } => {
                            ctx.read_holding_registers(start, count).await
                        }
                        Operation::WriteSingle { addr, value } => {
                            ctx.write_single_register(addr, value).await.map(|_| Vec::new())
                        }
                    }
                };

                match timeout(self.timeout_duration, call).await {
                    Ok(Ok(words)) => {
                        if attempt > 1 {
                            debug!(attempt, "Modbus operation succeeded after retry");
                        }
                        return Ok(words);
                    }
                    Ok(Err(e)) => {
                        warn!(attempt, error = %e, "Modbus operation failed");
                        last_error = e.into();
                    }
                    Err(_) => {
                        warn!(attempt, "Modbus operation timeout");
                        last_error = anyhow!("operation timed out after {:?}", self.timeout_duration);
                    }
                }

                *guard = None;
                drop(guard);
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }

            Err(last_error.context(format!("gave up after {MAX_ATTEMPTS} attempts")))
        }
    }

    impl Clone for ModbusClient {
        fn clone(&self) -> Self {
            Self {
                context: Arc::clone(&self.context),
                unit_id: self.unit_id,
                addr: self.addr,
                timeout_duration: self.timeout_duration,
            }
        }
    }
}

/// Register word helpers.
pub mod parser {
    /// Signed 16-bit register value.
    pub fn parse_i16(registers: &[u16]) -> Option<i16> {
        registers.first().map(|w| *w as i16)
    }

    pub fn parse_u16(registers: &[u16]) -> Option<u16> {
        registers.first().copied()
    }

    /// Wire representation of a signed watt value, saturating at the i16 range.
    pub fn encode_i16(value: i32) -> u16 {
        value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16 as u16
    }

    /// Sum of unsigned registers, e.g. per-phase powers.
    pub fn sum_u16(registers: &[u16]) -> i32 {
        registers.iter().map(|w| i32::from(*w)).sum()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn signed_round_trip_through_register() {
            assert_eq!(parse_i16(&[encode_i16(-2000)]), Some(-2000));
            assert_eq!(parse_i16(&[0x8000]), Some(-32768));
            assert_eq!(parse_i16(&[]), None);
        }

        #[test]
        fn encode_saturates() {
            assert_eq!(parse_i16(&[encode_i16(100_000)]), Some(i16::MAX));
            assert_eq!(parse_i16(&[encode_i16(-100_000)]), Some(i16::MIN));
        }

        #[test]
        fn phases_are_summed() {
            assert_eq!(sum_u16(&[100, 250, 50]), 400);
            assert_eq!(parse_u16(&[42]), Some(42));
        }
    }
}
