//! Subcommand handlers
//!
//! Handlers return JSON documents; printing is left to `main`.

use anyhow::{bail, Result};
use colored::Colorize;
use meter_protocols::{
    BusLink, MeasurementSnapshot, MeterSession, PacingConfig, ProfileRegistry, RegisterBank,
    WriteOptions, WriteReport,
};
use serde_json::{json, Map, Value};

use crate::target::Target;

pub const NOTE_SLAVE: &str = "If SLAVE changed, re-run with --slave <new>";
pub const NOTE_LINE: &str = "If PARITY/BAUD changed, reconnect with new serial settings";

/// Requested parameter changes
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteRequest {
    pub baud: Option<f32>,
    pub parity: Option<f32>,
    pub slave: Option<f32>,
    /// Write even when the device already holds the value
    pub force: bool,
}

impl WriteRequest {
    fn changes(&self) -> Vec<(&'static str, f32)> {
        [("baud", self.baud), ("parity", self.parity), ("slave", self.slave)]
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect()
    }

    pub fn notes(&self) -> Vec<&'static str> {
        let mut notes = Vec::new();
        if self.slave.is_some() {
            notes.push(NOTE_SLAVE);
        }
        if self.baud.is_some() || self.parity.is_some() {
            notes.push(NOTE_LINE);
        }
        notes
    }
}

/// Decoded values by field; fields that could not be read are null
pub fn snapshot_json(snapshot: &MeasurementSnapshot) -> Value {
    let map: Map<String, Value> = snapshot
        .iter()
        .map(|(name, reading)| {
            let value = reading
                .value()
                .map(f64::from)
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number);
            (name.to_string(), value)
        })
        .collect();
    Value::Object(map)
}

pub fn report_json(report: &WriteReport) -> Value {
    let fields: Map<String, Value> = report
        .entries
        .iter()
        .map(|entry| (entry.field.clone(), Value::from(entry.status.to_string())))
        .collect();
    json!({
        "fields": fields,
        "complete": report.is_complete(),
        "new_unit": report.new_unit.map(|u| u.value()),
        "reconnect_required": report.reconnect_required,
        "address_ambiguous": report.address_ambiguous,
    })
}

/// Parameters, then measurements
pub async fn read(link: &mut BusLink, target: &Target, pacing: &PacingConfig) -> Result<Value> {
    let transport = link.transport().await?;
    let mut session = MeterSession::new(transport, target.unit, &target.profile, pacing);
    let params = session.read_parameters().await;
    let measurements = session.read_measurements().await;

    for snapshot in [&params, &measurements] {
        if let Some(e) = snapshot.fatal() {
            bail!("link lost during read: {}", e);
        }
    }

    Ok(json!({
        "device": {
            "type": target.model,
            "manufacturer": target.profile.manufacturer(),
            "unit": target.unit.value(),
        },
        "params": snapshot_json(&params),
        "measurements": snapshot_json(&measurements),
    }))
}

pub async fn write(
    link: &mut BusLink,
    target: &Target,
    pacing: &PacingConfig,
    request: WriteRequest,
) -> Result<(Value, WriteReport)> {
    let changes = request.changes();
    if changes.is_empty() {
        bail!("nothing to write: pass --baud, --parity-new or --slave-new");
    }

    let transport = link.transport().await?;
    let mut session = MeterSession::new(transport, target.unit, &target.profile, pacing);
    let report = session
        .write_parameters(
            changes,
            WriteOptions {
                skip_unchanged: !request.force,
            },
        )
        .await?;

    let doc = json!({
        "report": report_json(&report),
        "note": request.notes(),
    });
    Ok((doc, report))
}

/// Colored follow-up hints for the operator, on stderr
pub fn print_write_warnings(report: &WriteReport) {
    if report.address_ambiguous {
        eprintln!(
            "{} slave address change was acknowledged but the meter does not answer; \
             try both the old and the new address",
            "WARNING".red().bold()
        );
    } else if let Some(unit) = report.new_unit {
        eprintln!("{} meter now answers on --slave {}", "NOTE".yellow(), unit.value());
    }
    if report.reconnect_required {
        eprintln!("{} reopen the line with the new serial settings", "NOTE".yellow());
    }
    if !report.is_complete() {
        eprintln!("{} not every field was committed", "WARNING".red().bold());
    }
}

/// Register maps of every known meter type
pub fn profiles(registry: &ProfileRegistry) -> String {
    let mut out = String::new();
    for profile in registry.profiles() {
        out.push_str(&format!(
            "{} ({}, {:?})\n",
            profile.model().bold(),
            profile.manufacturer(),
            profile.byte_order()
        ));
        for bank in [RegisterBank::Input, RegisterBank::Holding] {
            for field in profile.fields_for_bank(bank) {
                let rank = profile
                    .write_rank(&field.name)
                    .map(|r| format!("write #{}", r + 1))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "  {:<10} {:<8?} 0x{:04X}  {:<4} {}\n",
                    field.name, bank, field.address, field.unit, rank
                ));
            }
        }
    }
    out
}
