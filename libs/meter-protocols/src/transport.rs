//! Register transport seam
//!
//! The sequencer talks to a bus only through [`RegisterTransport`]. Framing,
//! CRC and sockets belong to the implementation (see [`modbus`] for the
//! tokio-modbus adapter, [`crate::simulator`] for the in-memory bus).

#[cfg(any(feature = "modbus-tcp", feature = "modbus-rtu"))]
pub mod modbus;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MeterError, Result, TransportError};
use crate::profile::RegisterBank;

/// Device identity on a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(u8);

impl UnitId {
    pub const MIN_RTU: u8 = 1;
    pub const MAX_RTU: u8 = 247;

    /// RTU slave address, 1..=247
    pub fn new(id: u16) -> Result<Self> {
        if (Self::MIN_RTU as u16..=Self::MAX_RTU as u16).contains(&id) {
            Ok(Self(id as u8))
        } else {
            Err(MeterError::InvalidUnit(id))
        }
    }

    /// Modbus TCP unit identifier, any value accepted
    pub fn tcp(id: u8) -> Self {
        Self(id)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Register-level access to devices behind one link
///
/// One request is in flight at a time: every method takes `&mut self`.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Read `count` registers starting at `address` (FC 0x04 / 0x03)
    async fn read_registers(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, TransportError>;

    /// Write consecutive holding registers (FC 0x10)
    async fn write_registers(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        values: &[u16],
    ) -> std::result::Result<(), TransportError>;
}

#[async_trait]
impl<T: RegisterTransport + ?Sized> RegisterTransport for Box<T> {
    async fn read_registers(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, TransportError> {
        (**self).read_registers(unit, bank, address, count).await
    }

    async fn write_registers(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        values: &[u16],
    ) -> std::result::Result<(), TransportError> {
        (**self).write_registers(unit, bank, address, values).await
    }
}

pub type BoxedTransport = Box<dyn RegisterTransport>;

/// Serial parity, configured as "E", "O" or "N"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Parity {
    #[default]
    Even,
    Odd,
    None,
}

impl FromStr for Parity {
    type Err = String;

    /// Only the first letter counts: "E", "even", "Even" are all accepted
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().chars().next().map(|c| c.to_ascii_uppercase()) {
            Some('E') => Ok(Self::Even),
            Some('O') => Ok(Self::Odd),
            Some('N') => Ok(Self::None),
            _ => Err(format!("invalid parity {:?}, expected E, O or N", s)),
        }
    }
}

impl TryFrom<String> for Parity {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Parity> for String {
    fn from(parity: Parity) -> Self {
        parity.to_string()
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Self::Even => "E",
            Self::Odd => "O",
            Self::None => "N",
        };
        write!(f, "{}", letter)
    }
}

/// Line settings of an RS-485 bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    pub data_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            parity: Parity::Even,
            stop_bits: 1,
            data_bits: 8,
        }
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}{}{}",
            self.port, self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}
