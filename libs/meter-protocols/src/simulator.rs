//! In-memory meter bus for tests and dry runs
//!
//! Behaves like a shared RS-485 line with meters attached: register images per
//! unit, silent units, injected faults, registers that ignore writes, and a
//! call log with timestamps that lets tests check request ordering and
//! whether two requests were ever on the line at the same time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::codec::{decode, encode};
use crate::error::TransportError;
use crate::profile::{dds661, sdm230, RegisterBank};
use crate::transport::{RegisterTransport, UnitId};

/// Reply timeout reported for units nobody answers for
pub const SILENT_UNIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Register image of one simulated meter
#[derive(Debug, Clone, Default)]
pub struct SimulatedMeter {
    input: HashMap<u16, u16>,
    holding: HashMap<u16, u16>,
    identity_register: Option<u16>,
    sticky: HashSet<u16>,
}

impl SimulatedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// DDS661 with a plausible load and 9600 8E1 line settings
    pub fn dds661() -> Self {
        let profile = dds661();
        let mut meter = Self::new()
            .with_float(RegisterBank::Input, 0x0000, 230.1)
            .with_float(RegisterBank::Input, 0x0008, 1.25)
            .with_float(RegisterBank::Input, 0x0012, 287.5)
            .with_float(RegisterBank::Input, 0x002A, 0.98)
            .with_float(RegisterBank::Input, 0x0036, 50.0)
            .with_float(RegisterBank::Input, 0x0100, 1536.0)
            // e_pos low word is e_rev high word; both chosen so they stay exact
            .with_float(RegisterBank::Input, 0x0102, 1536.0)
            .with_float(RegisterBank::Input, 0x0103, 0.0)
            .with_float(RegisterBank::Holding, 0x0000, 9600.0)
            .with_float(RegisterBank::Holding, 0x0002, 0.0)
            .with_float(RegisterBank::Holding, 0x0008, 1.0);
        if let Ok(slave) = profile.field("slave") {
            meter.identity_register = Some(slave.address);
        }
        meter
    }

    /// SDM230 at 9600 baud (code 2), even parity (code 1)
    pub fn sdm230() -> Self {
        let profile = sdm230();
        let mut meter = Self::new()
            .with_float(RegisterBank::Input, 0x0000, 229.8)
            .with_float(RegisterBank::Input, 0x0006, 4.5)
            .with_float(RegisterBank::Input, 0x000C, 1020.0)
            .with_float(RegisterBank::Input, 0x001E, 0.97)
            .with_float(RegisterBank::Input, 0x0046, 49.99)
            .with_float(RegisterBank::Input, 0x0048, 812.25)
            .with_float(RegisterBank::Input, 0x004A, 3.5)
            .with_float(RegisterBank::Input, 0x0156, 815.75)
            .with_float(RegisterBank::Holding, 0x0012, 1.0)
            .with_float(RegisterBank::Holding, 0x0014, 1.0)
            .with_float(RegisterBank::Holding, 0x001C, 2.0);
        if let Ok(slave) = profile.field("slave") {
            meter.identity_register = Some(slave.address);
        }
        meter
    }

    fn bank(&self, bank: RegisterBank) -> &HashMap<u16, u16> {
        match bank {
            RegisterBank::Input => &self.input,
            RegisterBank::Holding => &self.holding,
        }
    }

    fn bank_mut(&mut self, bank: RegisterBank) -> &mut HashMap<u16, u16> {
        match bank {
            RegisterBank::Input => &mut self.input,
            RegisterBank::Holding => &mut self.holding,
        }
    }

    pub fn with_float(mut self, bank: RegisterBank, address: u16, value: f32) -> Self {
        self.set_float(bank, address, value);
        self
    }

    /// Holding register that acknowledges writes but keeps its value
    pub fn with_sticky_register(mut self, address: u16) -> Self {
        self.sticky.insert(address);
        self
    }

    /// Register whose float value is the meter's slave address
    pub fn with_identity_register(mut self, address: u16) -> Self {
        self.identity_register = Some(address);
        self
    }

    pub fn set_float(&mut self, bank: RegisterBank, address: u16, value: f32) {
        let (hi, lo) = encode(value);
        let regs = self.bank_mut(bank);
        regs.insert(address, hi);
        regs.insert(address.wrapping_add(1), lo);
    }

    pub fn set_raw(&mut self, bank: RegisterBank, address: u16, words: &[u16]) {
        let regs = self.bank_mut(bank);
        for (i, word) in words.iter().enumerate() {
            regs.insert(address.wrapping_add(i as u16), *word);
        }
    }

    pub fn float(&self, bank: RegisterBank, address: u16) -> f32 {
        let regs = self.bank(bank);
        let word = |a: u16| regs.get(&a).copied().unwrap_or(0);
        decode(word(address), word(address.wrapping_add(1)))
    }

    /// Unmapped registers read as zero
    fn read(&self, bank: RegisterBank, address: u16, count: u16) -> Vec<u16> {
        let regs = self.bank(bank);
        (0..count)
            .map(|i| regs.get(&address.wrapping_add(i)).copied().unwrap_or(0))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Read(RegisterBank),
    Write,
}

/// One request seen on the simulated line
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub unit: UnitId,
    pub kind: CallKind,
    pub address: u16,
    pub count: u16,
    pub values: Vec<u16>,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Clone)]
struct Fault {
    unit: UnitId,
    kind: CallKind,
    address: u16,
    error: TransportError,
}

#[derive(Debug, Default)]
struct BusState {
    meters: HashMap<UnitId, SimulatedMeter>,
    faults: Vec<Fault>,
    calls: Vec<CallRecord>,
    latency: Duration,
    in_flight: usize,
    max_in_flight: usize,
}

impl BusState {
    /// Faults match on the request's start address
    fn fault(&self, unit: UnitId, kind: CallKind, address: u16) -> Option<TransportError> {
        self.faults
            .iter()
            .find(|f| f.unit == unit && f.kind == kind && f.address == address)
            .map(|f| f.error.clone())
    }

    fn serve_read(
        &self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if let Some(err) = self.fault(unit, CallKind::Read(bank), address) {
            return Err(err);
        }
        let meter = self
            .meters
            .get(&unit)
            .ok_or(TransportError::Timeout(SILENT_UNIT_TIMEOUT))?;
        Ok(meter.read(bank, address, count))
    }

    fn serve_write(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        if let Some(err) = self.fault(unit, CallKind::Write, address) {
            return Err(err);
        }
        if !bank.is_writable() {
            return Err(TransportError::exception("IllegalFunction"));
        }
        let meter = self
            .meters
            .get_mut(&unit)
            .ok_or(TransportError::Timeout(SILENT_UNIT_TIMEOUT))?;
        if meter.sticky.contains(&address) {
            debug!("Simulated unit {} ignores write at 0x{:04X}", unit, address);
            return Ok(());
        }
        meter.set_raw(bank, address, values);

        // A new slave address takes effect immediately
        if meter.identity_register == Some(address) {
            let value = meter.float(RegisterBank::Holding, address);
            if let Ok(new_unit) = UnitId::new(value as u16) {
                if new_unit != unit {
                    if let Some(moved) = self.meters.remove(&unit) {
                        debug!("Simulated unit {} moved to {}", unit, new_unit);
                        self.meters.insert(new_unit, moved);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Shared handle to a simulated bus; clones see the same meters and call log
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a meter; its identity register is set to `unit`
    pub fn add_meter(&self, unit: UnitId, mut meter: SimulatedMeter) {
        if let Some(address) = meter.identity_register {
            meter.set_float(RegisterBank::Holding, address, unit.value() as f32);
        }
        self.state.lock().meters.insert(unit, meter);
    }

    /// Time each request spends on the line
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn fail_read(&self, unit: UnitId, bank: RegisterBank, address: u16, error: TransportError) {
        self.state.lock().faults.push(Fault {
            unit,
            kind: CallKind::Read(bank),
            address,
            error,
        });
    }

    pub fn fail_write(&self, unit: UnitId, address: u16, error: TransportError) {
        self.state.lock().faults.push(Fault {
            unit,
            kind: CallKind::Write,
            address,
            error,
        });
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn meter(&self, unit: UnitId) -> Option<SimulatedMeter> {
        self.state.lock().meters.get(&unit).cloned()
    }

    pub fn units(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = self.state.lock().meters.keys().copied().collect();
        units.sort();
        units
    }

    pub fn update_meter<R>(&self, unit: UnitId, f: impl FnOnce(&mut SimulatedMeter) -> R) -> Option<R> {
        self.state.lock().meters.get_mut(&unit).map(f)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Highest number of requests ever in progress at once
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    async fn enter(&self) -> Instant {
        let started = Instant::now();
        let latency = {
            let mut state = self.state.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        started
    }
}

#[async_trait]
impl RegisterTransport for SimulatedBus {
    async fn read_registers(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let started = self.enter().await;
        let mut state = self.state.lock();
        state.in_flight -= 1;
        let result = state.serve_read(unit, bank, address, count);
        state.calls.push(CallRecord {
            unit,
            kind: CallKind::Read(bank),
            address,
            count,
            values: Vec::new(),
            started,
            finished: Instant::now(),
        });
        result
    }

    async fn write_registers(
        &mut self,
        unit: UnitId,
        bank: RegisterBank,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let started = self.enter().await;
        let mut state = self.state.lock();
        state.in_flight -= 1;
        let result = state.serve_write(unit, bank, address, values);
        state.calls.push(CallRecord {
            unit,
            kind: CallKind::Write,
            address,
            count: values.len() as u16,
            values: values.to_vec(),
            started,
            finished: Instant::now(),
        });
        result
    }
}
