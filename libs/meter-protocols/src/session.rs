//! Measurement/parameter session
//!
//! Binds a borrowed transport, a unit and a profile for the duration of one
//! or more calls. The session never opens, closes or locks the transport;
//! exclusive use of the handle is the caller's job (see [`crate::bus`]).

use crate::error::Result;
use crate::profile::{DeviceProfile, RegisterBank};
use crate::sequencer::{PacingConfig, Sequencer, WriteOptions};
use crate::snapshot::{MeasurementSnapshot, WriteReport};
use crate::transport::{RegisterTransport, UnitId};

pub struct MeterSession<'a, T: ?Sized> {
    transport: &'a mut T,
    unit: UnitId,
    profile: &'a DeviceProfile,
    pacing: &'a PacingConfig,
}

impl<'a, T: RegisterTransport + ?Sized> MeterSession<'a, T> {
    pub fn new(
        transport: &'a mut T,
        unit: UnitId,
        profile: &'a DeviceProfile,
        pacing: &'a PacingConfig,
    ) -> Self {
        Self {
            transport,
            unit,
            profile,
            pacing,
        }
    }

    /// Address the device answers on; follows a committed slave change
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn profile(&self) -> &DeviceProfile {
        self.profile
    }

    fn sequencer(&self) -> Sequencer<'a> {
        Sequencer::new(self.profile, self.pacing)
    }

    /// Read every input-bank field
    pub async fn read_measurements(&mut self) -> MeasurementSnapshot {
        self.read_bank(RegisterBank::Input).await
    }

    /// Read every holding-bank field
    pub async fn read_parameters(&mut self) -> MeasurementSnapshot {
        self.read_bank(RegisterBank::Holding).await
    }

    async fn read_bank(&mut self, bank: RegisterBank) -> MeasurementSnapshot {
        let sequencer = self.sequencer();
        let plan = sequencer.plan_bank_reads(bank);
        sequencer
            .execute_reads(&mut *self.transport, self.unit, &plan)
            .await
    }

    /// Read selected fields; unknown names fail before any request is sent
    pub async fn read_fields<S: AsRef<str>>(&mut self, names: &[S]) -> Result<MeasurementSnapshot> {
        let sequencer = self.sequencer();
        let plan = sequencer.plan_reads(names)?;
        Ok(sequencer
            .execute_reads(&mut *self.transport, self.unit, &plan)
            .await)
    }

    /// Validate, order and commit parameter changes
    ///
    /// Validation errors return `Err` without touching the bus. Once the
    /// first request is sent the outcome is reported per field instead.
    pub async fn write_parameters<I, K>(
        &mut self,
        changes: I,
        options: WriteOptions,
    ) -> Result<WriteReport>
    where
        I: IntoIterator<Item = (K, f32)>,
        K: AsRef<str>,
    {
        let sequencer = self.sequencer();
        let steps = sequencer.plan_writes(changes)?;
        let report = sequencer
            .execute_writes(&mut *self.transport, self.unit, &steps, options)
            .await;
        if let Some(unit) = report.new_unit {
            self.unit = unit;
        }
        Ok(report)
    }
}
