//! Modbus RTU/TCP transport on tokio-modbus
//!
//! Framing, CRC16 and MBAP headers are handled by tokio-modbus. This adapter
//! only selects the unit, bounds every call with a timeout and maps the
//! nested tokio-modbus results onto [`TransportError`].

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};
use tracing::{debug, info, trace};

use super::{RegisterTransport, UnitId};
use crate::error::TransportError;
use crate::profile::RegisterBank;

pub struct ModbusTransport {
    ctx: Context,
    timeout: Duration,
    endpoint: String,
    selected: Option<UnitId>,
}

impl ModbusTransport {
    /// Connect to a Modbus TCP endpoint ("host:port")
    #[cfg(feature = "modbus-tcp")]
    pub async fn connect_tcp(addr: &str, call_timeout: Duration) -> Result<Self, TransportError> {
        debug!("Connecting to Modbus TCP {}", addr);

        let socket_addr = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| TransportError::connection_lost(format!("resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| {
                TransportError::connection_lost(format!("{} resolved to no address", addr))
            })?;

        let ctx = match timeout(call_timeout, tokio_modbus::client::tcp::connect(socket_addr)).await
        {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(e)) => {
                return Err(TransportError::connection_lost(format!(
                    "connect {}: {}",
                    addr, e
                )))
            },
            Err(_) => return Err(TransportError::Timeout(call_timeout)),
        };

        info!("Modbus TCP connected: {}", addr);
        Ok(Self {
            ctx,
            timeout: call_timeout,
            endpoint: addr.to_string(),
            selected: None,
        })
    }

    /// Open a serial port and attach an RTU client to it
    #[cfg(feature = "modbus-rtu")]
    pub fn open_rtu(
        settings: &super::SerialSettings,
        call_timeout: Duration,
    ) -> Result<Self, TransportError> {
        use tokio_serial::SerialPortBuilderExt;

        debug!("Opening serial port {}", settings);

        let parity = match settings.parity {
            super::Parity::Even => tokio_serial::Parity::Even,
            super::Parity::Odd => tokio_serial::Parity::Odd,
            super::Parity::None => tokio_serial::Parity::None,
        };
        let stop_bits = match settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let serial = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(call_timeout)
            .open_native_async()
            .map_err(|e| {
                TransportError::connection_lost(format!("open {}: {}", settings.port, e))
            })?;

        info!("Serial port opened: {}", settings);
        Ok(Self {
            ctx: tokio_modbus::client::rtu::attach(serial),
            timeout: call_timeout,
            endpoint: settings.port.clone(),
            selected: None,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn select(&mut self, unit: UnitId) {
        if self.selected != Some(unit) {
            self.ctx.set_slave(Slave(unit.value()));
            self.selected = Some(unit);
        }
    }
}

impl fmt::Debug for ModbusTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusTransport")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("selected", &self.selected)
            .finish()
    }
}

/// Anything but a timeout or garbled data means the link itself is gone
fn classify_io(err: &io::Error, call_timeout: Duration) -> TransportError {
    match err.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout(call_timeout),
        io::ErrorKind::InvalidData => TransportError::malformed(err.to_string()),
        _ => TransportError::connection_lost(err.to_string()),
    }
}

fn flatten<T>(
    result: Result<tokio_modbus::Result<T>, tokio::time::error::Elapsed>,
    call_timeout: Duration,
) -> Result<T, TransportError> {
    match result {
        Err(_) => Err(TransportError::Timeout(call_timeout)),
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(code))) => Err(TransportError::exception(format!("{:?}", code))),
        Ok(Err(tokio_modbus::Error::Transport(e))) => Err(classify_io(&e, call_timeout)),
        Ok(Err(e)) => Err(TransportError::malformed(e.to_string())),
    }
}

#[async_trait]
impl RegisterTransport for ModbusTransport {
    async fn read_registers(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.select(unit);
        trace!(
            "FC{:02X} unit {} addr 0x{:04X} count {}",
            bank.read_function_code(),
            unit,
            address,
            count
        );

        let result = match bank {
            RegisterBank::Input => {
                timeout(self.timeout, self.ctx.read_input_registers(address, count)).await
            },
            RegisterBank::Holding => {
                timeout(self.timeout, self.ctx.read_holding_registers(address, count)).await
            },
        };
        let regs = flatten(result, self.timeout)?;

        if regs.len() != count as usize {
            return Err(TransportError::malformed(format!(
                "expected {} registers, got {}",
                count,
                regs.len()
            )));
        }
        Ok(regs)
    }

    async fn write_registers(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        if !bank.is_writable() {
            return Err(TransportError::exception(format!(
                "{} registers are read-only",
                bank
            )));
        }
        self.select(unit);
        trace!(
            "FC10 unit {} addr 0x{:04X} values {:04X?}",
            unit,
            address,
            values
        );

        let result = timeout(
            self.timeout,
            self.ctx.write_multiple_registers(address, values),
        )
        .await;
        flatten(result, self.timeout)
    }
}
