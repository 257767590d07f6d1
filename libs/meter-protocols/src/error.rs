//! Error types for meter register access

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a register transport for a single request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// No reply within the transport timeout
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The device answered with a Modbus exception
    #[error("Modbus exception: {0}")]
    Exception(String),

    /// Reply could not be used (wrong length, CRC, framing)
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Link to the bus or endpoint is gone
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// Connection-level failures stop the current device cycle
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::NotConnected)
    }

    pub fn exception(msg: impl Into<String>) -> Self {
        Self::Exception(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }
}

/// Errors raised by profiles, sessions and the sequencer before or instead of I/O
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeterError {
    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Invalid value {value} for {field}: {reason}")]
    InvalidValue {
        field: String,
        value: f32,
        reason: String,
    },

    #[error("Field is read-only: {0}")]
    ReadOnlyField(String),

    #[error("Field requested twice: {0}")]
    DuplicateField(String),

    #[error("Invalid unit id {0}: RTU slave addresses are 1..=247")]
    InvalidUnit(u16),

    #[error("Invalid profile {model}: {reason}")]
    InvalidProfile { model: String, reason: String },

    #[error("Unknown device model: {0}")]
    UnknownModel(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl MeterError {
    pub fn invalid_value(field: impl Into<String>, value: f32, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value,
            reason: reason.into(),
        }
    }

    pub fn invalid_profile(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProfile {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeterError>;

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::NotConnected.is_fatal());
        assert!(TransportError::connection_lost("port closed").is_fatal());
        assert!(!TransportError::Timeout(Duration::from_millis(500)).is_fatal());
        assert!(!TransportError::exception("illegal data address").is_fatal());
        assert!(!TransportError::malformed("crc").is_fatal());
    }

    #[test]
    fn test_display() {
        let err = MeterError::invalid_value("baud", 57600.0, "not one of [1200, 2400, 4800, 9600]");
        assert_eq!(
            err.to_string(),
            "Invalid value 57600 for baud: not one of [1200, 2400, 4800, 9600]"
        );
        let err: MeterError = TransportError::NotConnected.into();
        assert_eq!(err.to_string(), "Transport error: Not connected");
    }
}
