//! Transaction sequencer
//!
//! Turns "read these fields" or "write these values" into an ordered list of
//! register operations and runs them against a [`RegisterTransport`]:
//!
//! - reads are grouped per bank and, in bulk mode, merged into contiguous
//!   batches the same way the channel poller batches points (address gap and
//!   size limits)
//! - a failed read marks only the fields it covered; a connection-level
//!   failure ends the call and leaves the rest `Skipped`
//! - writes are validated up front, committed in the profile's write order and
//!   confirmed by reading each field back; the first failure aborts the batch

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{MeterError, Result, TransportError};
use crate::profile::{DeviceProfile, FieldRole, RegisterBank, RegisterField, CONFIRM_TOLERANCE};
use crate::snapshot::{
    CallPhase, MeasurementSnapshot, PhaseTracker, Reading, WriteEntry, WriteReport, WriteStatus,
};
use crate::transport::{RegisterTransport, UnitId};

/// Modbus limit for one read request
pub const MAX_READ_REGISTERS: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// One request per field with the per-field delay in between
    #[default]
    Sequential,
    /// Contiguous fields merged into batch requests, no delay
    Bulk,
}

/// Bulk read merge limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum registers per request
    #[serde(default = "default_max_registers")]
    pub max_registers: u16,
    /// Address gap threshold
    #[serde(default = "default_max_gap")]
    pub max_gap: u16,
}

fn default_max_registers() -> u16 {
    100
}

fn default_max_gap() -> u16 {
    5
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_registers: default_max_registers(),
            max_gap: default_max_gap(),
        }
    }
}

/// Pacing between register operations on one device
#[derive(Debug, Clone, PartialEq)]
pub struct PacingConfig {
    pub read_mode: ReadMode,
    /// Pause between consecutive requests (reads in sequential mode, every write step)
    pub per_field_delay: Duration,
    pub batch: BatchLimits,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            read_mode: ReadMode::Sequential,
            per_field_delay: Duration::from_millis(50),
            batch: BatchLimits::default(),
        }
    }
}

impl PacingConfig {
    /// Back-to-back requests
    pub fn unpaced(read_mode: ReadMode) -> Self {
        Self {
            read_mode,
            per_field_delay: Duration::ZERO,
            batch: BatchLimits::default(),
        }
    }
}

/// One read request covering one or more fields
#[derive(Debug, Clone, PartialEq)]
pub struct ReadUnit<'p> {
    pub bank: RegisterBank,
    pub address: u16,
    pub count: u16,
    pub fields: Vec<&'p RegisterField>,
}

impl<'p> ReadUnit<'p> {
    fn single(field: &'p RegisterField) -> Self {
        Self {
            bank: field.bank,
            address: field.address,
            count: field.length,
            fields: vec![field],
        }
    }
}

/// Requested fields (result order) and the requests that cover them
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPlan<'p> {
    pub fields: Vec<&'p RegisterField>,
    pub units: Vec<ReadUnit<'p>>,
}

/// One validated, encoded field write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteStep<'p> {
    pub field: &'p RegisterField,
    pub value: f32,
    pub words: [u16; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    /// Read the current value first and leave fields that already match alone
    pub skip_unchanged: bool,
}

fn values_match(actual: f32, requested: f32) -> bool {
    (actual - requested).abs() <= CONFIRM_TOLERANCE * requested.abs().max(1.0)
}

pub struct Sequencer<'p> {
    profile: &'p DeviceProfile,
    pacing: &'p PacingConfig,
}

impl<'p> Sequencer<'p> {
    pub fn new(profile: &'p DeviceProfile, pacing: &'p PacingConfig) -> Self {
        Self { profile, pacing }
    }

    // ========== Planning ==========

    /// Plan a read of named fields; unknown names fail before any I/O
    pub fn plan_reads<S: AsRef<str>>(&self, names: &[S]) -> Result<ReadPlan<'p>> {
        let mut fields: Vec<&'p RegisterField> = Vec::with_capacity(names.len());
        for name in names {
            let field = self.profile.field(name.as_ref())?;
            if !fields.iter().any(|f| f.name == field.name) {
                fields.push(field);
            }
        }
        Ok(self.plan(fields))
    }

    /// Plan a read of every field in a bank
    pub fn plan_bank_reads(&self, bank: RegisterBank) -> ReadPlan<'p> {
        self.plan(self.profile.fields_for_bank(bank))
    }

    fn plan(&self, fields: Vec<&'p RegisterField>) -> ReadPlan<'p> {
        let mut sorted = fields.clone();
        sorted.sort_by_key(|f| (f.bank, f.address));

        let units = match self.pacing.read_mode {
            ReadMode::Sequential => sorted.into_iter().map(ReadUnit::single).collect(),
            ReadMode::Bulk => self.merge(sorted),
        };
        ReadPlan { fields, units }
    }

    fn merge(&self, sorted: Vec<&'p RegisterField>) -> Vec<ReadUnit<'p>> {
        let max_registers = self.pacing.batch.max_registers.clamp(1, MAX_READ_REGISTERS) as u32;
        let max_gap = self.pacing.batch.max_gap as u32;

        let mut units = Vec::new();
        let mut current: Option<ReadUnit<'p>> = None;

        for field in sorted {
            if let Some(unit) = current.as_mut() {
                let end = unit.address as u32 + unit.count as u32;
                let gap = (field.address as u32).saturating_sub(end);
                let span = end.max(field.end_address()) - unit.address as u32;

                if unit.bank == field.bank && gap <= max_gap && span <= max_registers {
                    unit.count = span as u16;
                    unit.fields.push(field);
                    continue;
                }
            }
            if let Some(done) = current.replace(ReadUnit::single(field)) {
                units.push(done);
            }
        }
        units.extend(current);
        units
    }

    /// Validate and order a write batch; nothing is sent when this fails
    pub fn plan_writes<I, K>(&self, changes: I) -> Result<Vec<WriteStep<'p>>>
    where
        I: IntoIterator<Item = (K, f32)>,
        K: AsRef<str>,
    {
        let mut steps: Vec<WriteStep<'p>> = Vec::new();
        for (name, value) in changes {
            let name = name.as_ref();
            let field = self.profile.field(name)?;
            if !field.is_writable() {
                return Err(MeterError::ReadOnlyField(name.to_string()));
            }
            if steps.iter().any(|s| s.field.name == name) {
                return Err(MeterError::DuplicateField(name.to_string()));
            }
            let words = field.encode_value(value, self.profile.byte_order())?;
            steps.push(WriteStep { field, value, words });
        }

        steps.sort_by_key(|s| {
            self.profile
                .write_rank(&s.field.name)
                .unwrap_or(usize::MAX)
        });
        Ok(steps)
    }

    // ========== Execution ==========

    async fn pace(&self) {
        if !self.pacing.per_field_delay.is_zero() {
            tokio::time::sleep(self.pacing.per_field_delay).await;
        }
    }

    /// Run a read plan; never fails as a whole
    pub async fn execute_reads<T: RegisterTransport + ?Sized>(
        &self,
        transport: &mut T,
        unit: UnitId,
        plan: &ReadPlan<'p>,
    ) -> MeasurementSnapshot {
        let mut tracker = PhaseTracker::new("read");
        tracker.advance(CallPhase::Issuing);

        let mut results: HashMap<&str, Reading> = HashMap::with_capacity(plan.fields.len());
        let mut fatal = None;

        for (i, read) in plan.units.iter().enumerate() {
            if i > 0 {
                tracker.advance(CallPhase::Issuing);
                if self.pacing.read_mode == ReadMode::Sequential {
                    self.pace().await;
                }
            }
            tracker.advance(CallPhase::AwaitingReply);

            match transport
                .read_registers(unit, read.bank, read.address, read.count)
                .await
            {
                Ok(regs) => {
                    tracker.advance(CallPhase::Decoding);
                    for field in &read.fields {
                        results.insert(field.name.as_str(), self.decode(field, read, &regs));
                    }
                },
                Err(e) if e.is_fatal() => {
                    warn!(
                        "Unit {} {} read at 0x{:04X} lost the link: {} - skipping remaining fields",
                        unit, read.bank, read.address, e
                    );
                    tracker.advance(CallPhase::Failed);
                    fatal = Some(e);
                    break;
                },
                Err(e) => {
                    tracker.advance(CallPhase::Decoding);
                    debug!(
                        "Unit {} {} read at 0x{:04X} failed: {} - continuing",
                        unit, read.bank, read.address, e
                    );
                    for field in &read.fields {
                        results.insert(field.name.as_str(), Reading::Failed(e.clone()));
                    }
                },
            }
        }
        if !tracker.phase().is_terminal() {
            tracker.advance(CallPhase::Done);
        }

        let readings = plan
            .fields
            .iter()
            .map(|f| {
                let reading = results.remove(f.name.as_str()).unwrap_or(Reading::Skipped);
                (f.name.clone(), reading)
            })
            .collect();
        MeasurementSnapshot::new(readings, fatal, tracker.phase())
    }

    fn decode(&self, field: &RegisterField, read: &ReadUnit<'_>, regs: &[u16]) -> Reading {
        let offset = (field.address - read.address) as usize;
        let words = match regs.get(offset..offset + 2) {
            Some(&[hi, lo]) => [hi, lo],
            _ => {
                return Reading::Failed(TransportError::malformed(format!(
                    "{} outside {}-register reply",
                    field.name,
                    regs.len()
                )))
            },
        };

        let value = field.decode_value(&words, self.profile.byte_order());
        if field.is_plausible(value) {
            Reading::Valid(value)
        } else {
            debug!("{} decoded implausible value {}", field.name, value);
            Reading::Implausible(value)
        }
    }

    async fn read_value<T: RegisterTransport + ?Sized>(
        &self,
        transport: &mut T,
        unit: UnitId,
        field: &RegisterField,
    ) -> std::result::Result<f32, TransportError> {
        let regs = transport
            .read_registers(unit, field.bank, field.address, field.length)
            .await?;
        match regs.as_slice() {
            [hi, lo, ..] => Ok(field.decode_value(&[*hi, *lo], self.profile.byte_order())),
            _ => Err(TransportError::malformed(format!(
                "{} read returned {} registers",
                field.name,
                regs.len()
            ))),
        }
    }

    /// Start one register operation, pacing after the previous one
    async fn begin_op(&self, tracker: &mut PhaseTracker, ops: &mut usize) {
        if *ops > 0 {
            tracker.advance(CallPhase::Issuing);
            self.pace().await;
        }
        *ops += 1;
        tracker.advance(CallPhase::AwaitingReply);
    }

    /// Commit planned writes in order, confirming each by read-back
    pub async fn execute_writes<T: RegisterTransport + ?Sized>(
        &self,
        transport: &mut T,
        unit: UnitId,
        steps: &[WriteStep<'p>],
        options: WriteOptions,
    ) -> WriteReport {
        let mut tracker = PhaseTracker::new("write");
        tracker.advance(CallPhase::Issuing);

        let mut report = WriteReport {
            entries: Vec::with_capacity(steps.len()),
            new_unit: None,
            reconnect_required: false,
            address_ambiguous: false,
            phase: CallPhase::Idle,
        };
        let mut unit = unit;
        let mut ops = 0usize;
        let mut aborted = false;

        for step in steps {
            let field = step.field;
            let status = if aborted {
                WriteStatus::NotAttempted
            } else {
                self.commit(transport, &mut unit, step, options, &mut tracker, &mut ops, &mut report)
                    .await
            };
            if !aborted && !status.is_success() {
                aborted = true;
            }
            report.entries.push(WriteEntry {
                field: field.name.clone(),
                status,
            });
        }

        if !tracker.phase().is_terminal() {
            tracker.advance(CallPhase::Done);
        }
        report.phase = tracker.phase();
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit<T: RegisterTransport + ?Sized>(
        &self,
        transport: &mut T,
        unit: &mut UnitId,
        step: &WriteStep<'p>,
        options: WriteOptions,
        tracker: &mut PhaseTracker,
        ops: &mut usize,
        report: &mut WriteReport,
    ) -> WriteStatus {
        let field = step.field;

        if options.skip_unchanged {
            self.begin_op(tracker, ops).await;
            match self.read_value(transport, *unit, field).await {
                Ok(current) => {
                    tracker.advance(CallPhase::Decoding);
                    if values_match(current, step.value) {
                        debug!("{} already {} on unit {}", field.name, step.value, unit);
                        return WriteStatus::Unchanged { value: step.value };
                    }
                },
                Err(e) => {
                    warn!("Unit {} {} pre-read failed: {}", unit, field.name, e);
                    tracker.advance(CallPhase::Failed);
                    return WriteStatus::Failed(e);
                },
            }
        }

        self.begin_op(tracker, ops).await;
        if let Err(e) = transport
            .write_registers(*unit, field.bank, field.address, &step.words)
            .await
        {
            error!("Unit {} write {}={} failed: {}", unit, field.name, step.value, e);
            tracker.advance(CallPhase::Failed);
            return WriteStatus::Failed(e);
        }
        tracker.advance(CallPhase::Decoding);

        // Acknowledged: the device may already be on its new address or line settings
        let previous_unit = *unit;
        match field.role {
            FieldRole::SlaveAddress => {
                if let Ok(next) = UnitId::new(step.value as u16) {
                    *unit = next;
                }
            },
            FieldRole::LineSetting => report.reconnect_required = true,
            _ => {},
        }

        self.begin_op(tracker, ops).await;
        match self.read_value(transport, *unit, field).await {
            Ok(actual) if values_match(actual, step.value) => {
                tracker.advance(CallPhase::Decoding);
                if field.role == FieldRole::SlaveAddress {
                    report.new_unit = Some(*unit);
                }
                info!("Unit {} {} committed: {}", previous_unit, field.name, step.value);
                WriteStatus::Committed { value: step.value }
            },
            Ok(actual) => {
                tracker.advance(CallPhase::Decoding);
                tracker.advance(CallPhase::Failed);
                if field.role == FieldRole::SlaveAddress {
                    // Something answers on the new address, just not with it
                    report.new_unit = Some(*unit);
                    report.address_ambiguous = true;
                }
                warn!(
                    "Unit {} {} read back {} after writing {} - aborting remaining writes",
                    unit, field.name, actual, step.value
                );
                WriteStatus::Mismatch {
                    requested: step.value,
                    actual,
                }
            },
            Err(e) => {
                tracker.advance(CallPhase::Failed);
                if field.role == FieldRole::SlaveAddress {
                    report.address_ambiguous = true;
                    error!(
                        "Slave address change {} -> {} acknowledged but confirm read failed: {} - device addressability is ambiguous",
                        previous_unit, unit, e
                    );
                    WriteStatus::AddressAmbiguous(e)
                } else {
                    warn!("Unit {} {} confirm read failed: {}", unit, field.name, e);
                    WriteStatus::ConfirmFailed(e)
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::profile::{dds661, sdm230};
    use crate::simulator::{SimulatedBus, SimulatedMeter};
    use tracing_test::traced_test;

    fn addresses(plan: &ReadPlan<'_>) -> Vec<(u16, u16)> {
        plan.units.iter().map(|u| (u.address, u.count)).collect()
    }

    // ========== Read planning tests ==========

    #[test]
    fn test_sequential_plan_one_request_per_field() {
        let profile = dds661();
        let pacing = PacingConfig::default();
        let plan = Sequencer::new(&profile, &pacing).plan_bank_reads(RegisterBank::Input);
        assert_eq!(plan.units.len(), 8);
        assert!(plan.units.iter().all(|u| u.count == 2 && u.fields.len() == 1));
    }

    #[test]
    fn test_bulk_plan_merges_contiguous_and_overlapping() {
        let profile = dds661();
        let pacing = PacingConfig::unpaced(ReadMode::Bulk);
        let plan = Sequencer::new(&profile, &pacing).plan_bank_reads(RegisterBank::Input);
        // energy registers 0x100..0x105 overlap and collapse into one request
        assert_eq!(
            addresses(&plan),
            vec![
                (0x0000, 2),
                (0x0008, 2),
                (0x0012, 2),
                (0x002A, 2),
                (0x0036, 2),
                (0x0100, 5),
            ]
        );
        let energy: Vec<&str> = plan.units[5].fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(energy, vec!["e_total", "e_pos", "e_rev"]);
    }

    #[test]
    fn test_bulk_plan_respects_gap_and_size() {
        let profile = dds661();
        let mut pacing = PacingConfig::unpaced(ReadMode::Bulk);
        pacing.batch.max_gap = 8;
        let plan = Sequencer::new(&profile, &pacing).plan_bank_reads(RegisterBank::Input);
        // voltage+current+p_active (gaps 6, 8) merge, pf is 22 registers away
        assert_eq!(plan.units[0].address, 0x0000);
        assert_eq!(plan.units[0].count, 0x14);

        pacing.batch.max_registers = 10;
        let plan = Sequencer::new(&profile, &pacing).plan_bank_reads(RegisterBank::Input);
        assert_eq!(plan.units[0].count, 10);
        assert_eq!(plan.units[1].address, 0x0012);
    }

    #[test]
    fn test_bulk_plan_never_crosses_banks() {
        let profile = sdm230();
        let pacing = PacingConfig {
            batch: BatchLimits {
                max_registers: 125,
                max_gap: 100,
            },
            ..PacingConfig::unpaced(ReadMode::Bulk)
        };
        let plan = Sequencer::new(&profile, &pacing)
            .plan_reads(&["voltage", "slave", "parity"])
            .unwrap();
        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.units[0].bank, RegisterBank::Input);
        assert_eq!(plan.units[1].bank, RegisterBank::Holding);
        assert_eq!((plan.units[1].address, plan.units[1].count), (0x0012, 4));
        // result order follows the request
        let order: Vec<&str> = plan.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, vec!["voltage", "slave", "parity"]);
    }

    #[test]
    fn test_plan_reads_unknown_field() {
        let profile = dds661();
        let pacing = PacingConfig::default();
        let err = Sequencer::new(&profile, &pacing).plan_reads(&["voltage", "bogus_field"]);
        assert_eq!(err, Err(MeterError::UnknownField("bogus_field".into())));
    }

    #[test]
    fn test_plan_reads_deduplicates() {
        let profile = dds661();
        let pacing = PacingConfig::default();
        let plan = Sequencer::new(&profile, &pacing)
            .plan_reads(&["freq", "freq"])
            .unwrap();
        assert_eq!(plan.fields.len(), 1);
        assert_eq!(plan.units.len(), 1);
    }

    // ========== Write planning tests ==========

    #[test]
    fn test_plan_writes_follows_write_order() {
        let profile = dds661();
        let pacing = PacingConfig::default();
        let seq = Sequencer::new(&profile, &pacing);
        let steps = seq
            .plan_writes([("baud", 2400.0), ("parity", 1.0), ("slave", 7.0)])
            .unwrap();
        let order: Vec<&str> = steps.iter().map(|s| s.field.name.as_str()).collect();
        assert_eq!(order, vec!["slave", "parity", "baud"]);
        assert_eq!(steps[2].words, [0x4516, 0x0000]);
    }

    #[test]
    fn test_plan_writes_rejections() {
        let profile = dds661();
        let pacing = PacingConfig::default();
        let seq = Sequencer::new(&profile, &pacing);

        assert!(matches!(
            seq.plan_writes([("baud", 57600.0)]),
            Err(MeterError::InvalidValue { .. })
        ));
        assert!(matches!(
            seq.plan_writes([("slave", 0.0)]),
            Err(MeterError::InvalidValue { .. })
        ));
        assert_eq!(
            seq.plan_writes([("voltage", 230.0)]),
            Err(MeterError::ReadOnlyField("voltage".into()))
        );
        assert_eq!(
            seq.plan_writes([("slave", 2.0), ("slave", 3.0)]),
            Err(MeterError::DuplicateField("slave".into()))
        );
        assert_eq!(
            seq.plan_writes([("speed", 1.0)]),
            Err(MeterError::UnknownField("speed".into()))
        );
    }

    #[test]
    fn test_values_match_tolerance() {
        assert!(values_match(9600.0, 9600.0));
        assert!(values_match(1.000_000_1, 1.0));
        assert!(!values_match(0.0, 1.0));
        assert!(!values_match(2400.0, 9600.0));
    }

    // ========== Execution tests ==========

    fn sim(id: u16) -> (SimulatedBus, UnitId) {
        let unit = UnitId::new(id).unwrap();
        let bus = SimulatedBus::new();
        bus.add_meter(unit, SimulatedMeter::dds661());
        (bus, unit)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connection_loss_is_logged() {
        let (mut bus, unit) = sim(1);
        bus.fail_read(
            unit,
            RegisterBank::Input,
            0x0000,
            TransportError::connection_lost("port closed"),
        );
        let profile = dds661();
        let pacing = PacingConfig::unpaced(ReadMode::Sequential);
        let seq = Sequencer::new(&profile, &pacing);
        let plan = seq.plan_bank_reads(RegisterBank::Input);

        let snap = seq.execute_reads(&mut bus, unit, &plan).await;
        assert_eq!(snap.phase(), CallPhase::Failed);
        assert_eq!(snap.valid_count(), 0);
        assert!(logs_contain("skipping remaining fields"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ambiguous_slave_change_is_logged() {
        let (mut bus, unit) = sim(1);
        let target = UnitId::new(200).unwrap();
        bus.fail_read(
            target,
            RegisterBank::Holding,
            0x0008,
            TransportError::Timeout(Duration::from_secs(1)),
        );
        let profile = dds661();
        let pacing = PacingConfig::unpaced(ReadMode::Sequential);
        let seq = Sequencer::new(&profile, &pacing);
        let steps = seq.plan_writes([("slave", 200.0)]).unwrap();

        let report = seq
            .execute_writes(&mut bus, unit, &steps, WriteOptions::default())
            .await;
        assert!(report.address_ambiguous);
        assert_eq!(report.phase, CallPhase::Failed);
        assert_eq!(bus.units(), vec![target]);
        assert!(logs_contain("addressability is ambiguous"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_pacing_between_every_operation() {
        let (mut bus, unit) = sim(1);
        let profile = dds661();
        let pacing = PacingConfig::default();
        let seq = Sequencer::new(&profile, &pacing);
        let steps = seq
            .plan_writes([("parity", 1.0), ("baud", 4800.0)])
            .unwrap();

        let start = tokio::time::Instant::now();
        let report = seq
            .execute_writes(&mut bus, unit, &steps, WriteOptions::default())
            .await;
        assert!(report.is_complete());
        // write, confirm, write, confirm: three gaps
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(bus.call_count(), 4);
    }
}
