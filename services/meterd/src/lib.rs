//! Energy meter poller
//!
//! Reads DDS661 / SDM230 meters over Modbus RTU or TCP on a fixed period and
//! publishes one JSON state document per meter to MQTT, optionally with Home
//! Assistant discovery.

pub mod config;
pub mod discovery;
pub mod error;
pub mod link;
pub mod poller;
pub mod publisher;

pub use config::MeterdConfig;
pub use error::{MeterdError, Result};
pub use poller::{CycleSummary, DeviceTarget, Poller};
pub use publisher::{Message, MqttPublisher, NullPublisher, Publisher};
