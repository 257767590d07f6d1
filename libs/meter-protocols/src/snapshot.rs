//! Results of session calls: measurement snapshots and write reports

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

use crate::error::TransportError;
use crate::transport::UnitId;

/// Progress of one session call
///
/// `Idle -> Issuing -> (AwaitingReply -> Decoding)* -> Done | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Idle,
    Issuing,
    AwaitingReply,
    Decoding,
    Done,
    Failed,
}

impl CallPhase {
    pub fn can_advance_to(self, next: CallPhase) -> bool {
        use CallPhase::*;
        matches!(
            (self, next),
            (Idle, Issuing)
                | (Issuing, AwaitingReply)
                | (Issuing, Done)
                | (AwaitingReply, Decoding)
                | (AwaitingReply, Failed)
                | (Decoding, Issuing)
                | (Decoding, Done)
                | (Decoding, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::Done | CallPhase::Failed)
    }
}

/// Tracks the phase of one call and traces transitions
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    operation: &'static str,
    phase: CallPhase,
}

impl PhaseTracker {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            phase: CallPhase::Idle,
        }
    }

    pub(crate) fn advance(&mut self, next: CallPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "{}: illegal transition {:?} -> {:?}",
            self.operation,
            self.phase,
            next
        );
        trace!("{}: {:?} -> {:?}", self.operation, self.phase, next);
        self.phase = next;
    }

    pub(crate) fn phase(&self) -> CallPhase {
        self.phase
    }
}

/// Outcome of reading one field
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Valid(f32),
    /// Decoded fine but non-finite or outside the field's plausible range
    Implausible(f32),
    /// The request covering this field failed
    Failed(TransportError),
    /// Not read because a fatal error ended the call first
    Skipped,
}

impl Reading {
    /// Decoded value, plausible or not
    pub fn value(&self) -> Option<f32> {
        match self {
            Self::Valid(v) | Self::Implausible(v) => Some(*v),
            _ => None,
        }
    }

    pub fn valid_value(&self) -> Option<f32> {
        match self {
            Self::Valid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Plausibility hint for decoded values; `None` when nothing was decoded
    pub fn is_plausible(&self) -> Option<bool> {
        match self {
            Self::Valid(_) => Some(true),
            Self::Implausible(_) => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid(v) => write!(f, "{}", v),
            Self::Implausible(v) => write!(f, "{} (implausible)", v),
            Self::Failed(e) => write!(f, "invalid: {}", e),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Field readings produced by one read call, in request order
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSnapshot {
    readings: Vec<(String, Reading)>,
    fatal: Option<TransportError>,
    phase: CallPhase,
    taken_at: DateTime<Utc>,
}

impl MeasurementSnapshot {
    pub(crate) fn new(
        readings: Vec<(String, Reading)>,
        fatal: Option<TransportError>,
        phase: CallPhase,
    ) -> Self {
        Self {
            readings,
            fatal,
            phase,
            taken_at: Utc::now(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Reading> {
        self.readings
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, reading)| reading)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Reading)> {
        self.readings.iter().map(|(name, r)| (name.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Connection-level error that cut the call short
    pub fn fatal(&self) -> Option<&TransportError> {
        self.fatal.as_ref()
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn valid_count(&self) -> usize {
        self.readings.iter().filter(|(_, r)| r.is_valid()).count()
    }

    /// Fields that did not produce a plausible value
    pub fn invalid_fields(&self) -> impl Iterator<Item = &str> {
        self.readings
            .iter()
            .filter(|(_, r)| !r.is_valid())
            .map(|(name, _)| name.as_str())
    }
}

/// Outcome of one field of a write batch
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    /// Written and confirmed by read-back (or accepted, for write-only fields)
    Committed { value: f32 },
    /// Device already held the value; nothing written
    Unchanged { value: f32 },
    /// Write request failed
    Failed(TransportError),
    /// Read-back after the write returned a different value
    Mismatch { requested: f32, actual: f32 },
    /// Write acknowledged but the read-back failed
    ConfirmFailed(TransportError),
    /// Slave address write acknowledged, device silent at the new address
    AddressAmbiguous(TransportError),
    NotAttempted,
}

impl WriteStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Committed { .. } | Self::Unchanged { .. })
    }
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed { value } => write!(f, "written ({})", value),
            Self::Unchanged { value } => write!(f, "unchanged ({})", value),
            Self::Failed(e) => write!(f, "ERROR: {}", e),
            Self::Mismatch { requested, actual } => {
                write!(f, "MISMATCH: wrote {}, read back {}", requested, actual)
            },
            Self::ConfirmFailed(e) => write!(f, "UNCONFIRMED: {}", e),
            Self::AddressAmbiguous(e) => write!(f, "ADDRESS AMBIGUOUS: {}", e),
            Self::NotAttempted => write!(f, "not attempted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteEntry {
    pub field: String,
    pub status: WriteStatus,
}

/// Per-field results of a write batch, in commit order
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub entries: Vec<WriteEntry>,
    /// Address that answered the confirm read after a slave change
    pub new_unit: Option<UnitId>,
    /// Baud or parity changed; the caller must reopen the line
    pub reconnect_required: bool,
    /// The device may answer on the old address, the new one, or neither
    pub address_ambiguous: bool,
    pub phase: CallPhase,
}

impl WriteReport {
    pub fn get(&self, field: &str) -> Option<&WriteStatus> {
        self.entries
            .iter()
            .find(|e| e.field == field)
            .map(|e| &e.status)
    }

    /// Fields that ended up holding the requested value
    pub fn committed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.status.is_success())
            .map(|e| e.field.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.status.is_success())
    }
}
