//! Modbus energy meter access
//!
//! Register-level model and session logic for float32 DIN-rail meters
//! (DDS661, Eastron SDM230) on RS-485 or Modbus TCP.
//!
//! # Features
//!
//! - `modbus-tcp` - tokio-modbus TCP transport
//! - `modbus-rtu` - tokio-modbus RTU transport over tokio-serial
//!
//! # Architecture
//!
//! Profiles describe what a meter exposes, the sequencer decides which
//! register operations to issue and in what order, and a [`RegisterTransport`]
//! carries them. Sessions tie the three together for one device; a
//! [`SharedBus`] keeps devices on the same line from interleaving.

pub mod bus;
pub mod codec;
pub mod error;
pub mod profile;
pub mod sequencer;
pub mod session;
pub mod simulator;
pub mod snapshot;
pub mod transport;

pub use bus::{BusLink, Connect, SharedBus};
pub use codec::ByteOrder;
pub use error::{MeterError, Result, TransportError};
pub use profile::{DeviceProfile, FieldRole, ProfileRegistry, RegisterBank, RegisterField};
pub use sequencer::{BatchLimits, PacingConfig, ReadMode, WriteOptions};
pub use session::MeterSession;
pub use snapshot::{CallPhase, MeasurementSnapshot, Reading, WriteReport, WriteStatus};
pub use transport::{BoxedTransport, Parity, RegisterTransport, SerialSettings, UnitId};
