//! Error types for the meter poller

use meter_protocols::{MeterError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeterdError {
    /// Missing, unreadable or inconsistent configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Meter(#[from] MeterError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// MQTT client setup or publish failure
    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeterdError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn mqtt(msg: impl Into<String>) -> Self {
        Self::MqttError(msg.into())
    }
}

impl From<figment::Error> for MeterdError {
    fn from(err: figment::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<rumqttc::ClientError> for MeterdError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::MqttError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeterdError>;
