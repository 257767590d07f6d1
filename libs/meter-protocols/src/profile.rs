//! Device profiles: static register tables per meter model
//!
//! A profile is pure data. Model-specific behaviour (value domains, baud code
//! tables, the order in which line settings are committed) lives in the field
//! descriptors, so one `DeviceProfile` type covers every supported model.

mod dds661;
mod registry;
mod sdm230;

pub use dds661::dds661;
pub use registry::ProfileRegistry;
pub use sdm230::sdm230;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{f32_to_regs, regs_to_f32, ByteOrder};
use crate::error::{MeterError, Result};

/// Every field in this meter family is a float32 spread over two registers
pub const FLOAT_REGISTERS: u16 = 2;

/// Tolerance used when comparing a value read back against the value written
pub const CONFIRM_TOLERANCE: f32 = 1e-6;

/// Modbus register address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterBank {
    /// Read-only measurements, function 0x04
    Input,
    /// Parameters, function 0x03 (read) / 0x10 (write)
    Holding,
}

impl RegisterBank {
    pub fn read_function_code(&self) -> u8 {
        match self {
            Self::Input => 0x04,
            Self::Holding => 0x03,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Holding)
    }
}

impl fmt::Display for RegisterBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Holding => write!(f, "holding"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// What a field means to the device beyond its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    Measurement,
    Parameter,
    /// Changing it moves the device to a new bus address
    SlaveAddress,
    /// Changing it (baud, parity) requires reopening the line
    LineSetting,
}

/// Values accepted for a write
#[derive(Debug, Clone, PartialEq)]
pub enum ValueDomain {
    AnyFinite,
    OneOf(Vec<f32>),
    IntegerRange { min: i64, max: i64 },
}

impl ValueDomain {
    /// Returns the rejection reason for values outside the domain
    pub fn check(&self, value: f32) -> std::result::Result<(), String> {
        if !value.is_finite() {
            return Err("value is not finite".to_string());
        }
        match self {
            Self::AnyFinite => Ok(()),
            Self::OneOf(allowed) => {
                if allowed.iter().any(|a| *a == value) {
                    Ok(())
                } else {
                    let list: Vec<String> = allowed.iter().map(|a| a.to_string()).collect();
                    Err(format!("not one of [{}]", list.join(", ")))
                }
            },
            Self::IntegerRange { min, max } => {
                if value.fract() != 0.0 {
                    Err("not an integer".to_string())
                } else if (value as i64) < *min || (value as i64) > *max {
                    Err(format!("outside {}..={}", min, max))
                } else {
                    Ok(())
                }
            },
        }
    }
}

/// Physical value <-> raw register code table
///
/// Used where a device stores an enumerated code but callers think in
/// physical units (SDM230 baud: code 2 means 9600 baud).
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMap {
    /// (physical, raw) pairs
    pub entries: Vec<(f32, f32)>,
}

impl ValueMap {
    pub fn new(entries: Vec<(f32, f32)>) -> Self {
        Self { entries }
    }

    pub fn to_raw(&self, physical: f32) -> Option<f32> {
        self.entries
            .iter()
            .find(|(p, _)| *p == physical)
            .map(|(_, raw)| *raw)
    }

    /// Unknown codes pass through unchanged
    pub fn to_physical(&self, raw: f32) -> f32 {
        self.entries
            .iter()
            .find(|(_, r)| *r == raw)
            .map(|(p, _)| *p)
            .unwrap_or(raw)
    }
}

/// Inclusive range a healthy device reports for a field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plausibility {
    pub min: f32,
    pub max: f32,
}

impl Plausibility {
    pub fn contains(&self, value: f32) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// Static descriptor of one logical field
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterField {
    pub name: String,
    /// High-word register address
    pub address: u16,
    pub length: u16,
    pub bank: RegisterBank,
    pub access: Access,
    /// Informational
    pub unit: &'static str,
    pub role: FieldRole,
    pub domain: ValueDomain,
    pub value_map: Option<ValueMap>,
    pub plausible: Option<Plausibility>,
}

impl RegisterField {
    /// Read-only float32 measurement in the input bank
    pub fn measurement(name: &str, address: u16, unit: &'static str) -> Self {
        Self {
            name: name.to_string(),
            address,
            length: FLOAT_REGISTERS,
            bank: RegisterBank::Input,
            access: Access::ReadOnly,
            unit,
            role: FieldRole::Measurement,
            domain: ValueDomain::AnyFinite,
            value_map: None,
            plausible: None,
        }
    }

    /// Read/write float32 parameter in the holding bank
    pub fn parameter(name: &str, address: u16, role: FieldRole, domain: ValueDomain) -> Self {
        Self {
            name: name.to_string(),
            address,
            length: FLOAT_REGISTERS,
            bank: RegisterBank::Holding,
            access: Access::ReadWrite,
            unit: "",
            role,
            domain,
            value_map: None,
            plausible: None,
        }
    }

    pub fn with_plausible(mut self, min: f32, max: f32) -> Self {
        self.plausible = Some(Plausibility { min, max });
        self
    }

    pub fn with_value_map(mut self, map: ValueMap) -> Self {
        self.value_map = Some(map);
        self
    }

    pub fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = unit;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.bank.is_writable() && self.access == Access::ReadWrite
    }

    /// Last register address covered by the field
    pub fn end_address(&self) -> u32 {
        self.address as u32 + self.length as u32
    }

    /// Validate a physical value and encode it into register words
    pub fn encode_value(&self, value: f32, order: ByteOrder) -> Result<[u16; 2]> {
        self.domain
            .check(value)
            .map_err(|reason| MeterError::invalid_value(&self.name, value, reason))?;

        let raw = match &self.value_map {
            Some(map) => map.to_raw(value).ok_or_else(|| {
                MeterError::invalid_value(&self.name, value, "no register code for value")
            })?,
            None => value,
        };
        Ok(f32_to_regs(raw, order))
    }

    /// Decode register words into the physical value
    pub fn decode_value(&self, regs: &[u16; 2], order: ByteOrder) -> f32 {
        let raw = regs_to_f32(regs, order);
        match &self.value_map {
            Some(map) => map.to_physical(raw),
            None => raw,
        }
    }

    /// Whether a decoded value looks like something a healthy meter reports
    pub fn is_plausible(&self, value: f32) -> bool {
        match &self.plausible {
            Some(range) => range.contains(value),
            None => value.is_finite(),
        }
    }
}

/// Register table of one meter model
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    model: String,
    manufacturer: String,
    byte_order: ByteOrder,
    fields: Vec<RegisterField>,
    write_order: Vec<String>,
}

impl DeviceProfile {
    pub fn new(
        model: impl Into<String>,
        manufacturer: impl Into<String>,
        byte_order: ByteOrder,
        fields: Vec<RegisterField>,
        write_order: Vec<String>,
    ) -> Result<Self> {
        let profile = Self {
            model: model.into(),
            manufacturer: manufacturer.into(),
            byte_order,
            fields,
            write_order,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Static built-in tables skip validation; their tests run it instead
    pub(crate) fn builtin(
        model: &str,
        manufacturer: &str,
        byte_order: ByteOrder,
        fields: Vec<RegisterField>,
        write_order: &[&str],
    ) -> Self {
        Self {
            model: model.to_string(),
            manufacturer: manufacturer.to_string(),
            byte_order,
            fields,
            write_order: write_order.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(MeterError::invalid_profile(
                    &self.model,
                    format!("duplicate field name {}", field.name),
                ));
            }
            if !addresses.insert((field.bank, field.address)) {
                return Err(MeterError::invalid_profile(
                    &self.model,
                    format!(
                        "duplicate {} register 0x{:04X} ({})",
                        field.bank, field.address, field.name
                    ),
                ));
            }
            if field.length != FLOAT_REGISTERS {
                return Err(MeterError::invalid_profile(
                    &self.model,
                    format!("{} spans {} registers, expected 2", field.name, field.length),
                ));
            }
            if field.access == Access::ReadWrite && !field.bank.is_writable() {
                return Err(MeterError::invalid_profile(
                    &self.model,
                    format!("{} is read/write in the input bank", field.name),
                ));
            }
        }

        let mut seen = HashSet::new();
        for name in &self.write_order {
            let field = self.field(name).map_err(|_| {
                MeterError::invalid_profile(
                    &self.model,
                    format!("write order names unknown field {}", name),
                )
            })?;
            if !field.is_writable() {
                return Err(MeterError::invalid_profile(
                    &self.model,
                    format!("write order names read-only field {}", name),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(MeterError::invalid_profile(
                    &self.model,
                    format!("write order lists {} twice", name),
                ));
            }
        }
        if let Some(missing) = self
            .fields
            .iter()
            .find(|f| f.is_writable() && !seen.contains(f.name.as_str()))
        {
            return Err(MeterError::invalid_profile(
                &self.model,
                format!("write order is missing writable field {}", missing.name),
            ));
        }
        Ok(())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Fields in declaration order
    pub fn fields(&self) -> &[RegisterField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Result<&RegisterField> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| MeterError::UnknownField(name.to_string()))
    }

    /// Fields of one bank in ascending address order
    pub fn fields_for_bank(&self, bank: RegisterBank) -> Vec<&RegisterField> {
        let mut fields: Vec<&RegisterField> =
            self.fields.iter().filter(|f| f.bank == bank).collect();
        fields.sort_by_key(|f| f.address);
        fields
    }

    pub fn is_writable(&self, name: &str) -> bool {
        self.field(name).map(|f| f.is_writable()).unwrap_or(false)
    }

    pub fn write_order(&self) -> &[String] {
        &self.write_order
    }

    /// Position of a field in the commit order
    pub fn write_rank(&self, name: &str) -> Option<usize> {
        self.write_order.iter().position(|n| n == name)
    }

    /// Copy of the profile with a different commit order
    pub fn with_write_order<S: AsRef<str>>(&self, order: &[S]) -> Result<Self> {
        let mut profile = self.clone();
        profile.write_order = order.iter().map(|s| s.as_ref().to_string()).collect();
        profile.validate()?;
        Ok(profile)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn baud_field() -> RegisterField {
        RegisterField::parameter(
            "baud",
            0x0000,
            FieldRole::LineSetting,
            ValueDomain::OneOf(vec![1200.0, 2400.0, 4800.0, 9600.0]),
        )
    }

    // ========== Value domain tests ==========

    #[test]
    fn test_one_of_domain() {
        let domain = ValueDomain::OneOf(vec![1200.0, 9600.0]);
        assert!(domain.check(9600.0).is_ok());
        assert_eq!(
            domain.check(57600.0),
            Err("not one of [1200, 9600]".to_string())
        );
        assert!(domain.check(f32::NAN).is_err());
    }

    #[test]
    fn test_integer_range_domain() {
        let domain = ValueDomain::IntegerRange { min: 1, max: 247 };
        assert!(domain.check(1.0).is_ok());
        assert!(domain.check(247.0).is_ok());
        assert!(domain.check(0.0).is_err());
        assert!(domain.check(248.0).is_err());
        assert_eq!(domain.check(2.5), Err("not an integer".to_string()));
        assert!(domain.check(f32::INFINITY).is_err());
    }

    #[test]
    fn test_any_finite_domain() {
        assert!(ValueDomain::AnyFinite.check(-12.5).is_ok());
        assert!(ValueDomain::AnyFinite.check(f32::NEG_INFINITY).is_err());
    }

    // ========== Field tests ==========

    #[test]
    fn test_encode_validates_before_encoding() {
        let field = baud_field();
        assert_eq!(
            field.encode_value(9600.0, ByteOrder::BigEndian),
            Ok([0x4616, 0x0000])
        );
        let err = field.encode_value(57600.0, ByteOrder::BigEndian);
        assert!(matches!(err, Err(MeterError::InvalidValue { ref field, .. }) if field == "baud"));
    }

    #[test]
    fn test_value_map_roundtrip() {
        let field = baud_field().with_value_map(ValueMap::new(vec![
            (2400.0, 0.0),
            (4800.0, 1.0),
            (9600.0, 2.0),
            (1200.0, 5.0),
        ]));
        // code 2.0 on the wire
        let regs = field.encode_value(9600.0, ByteOrder::BigEndian).unwrap();
        assert_eq!(regs, [0x4000, 0x0000]);
        assert_eq!(field.decode_value(&regs, ByteOrder::BigEndian), 9600.0);
        // unknown code decodes to itself
        assert_eq!(field.decode_value(&[0x4080, 0x0000], ByteOrder::BigEndian), 4.0);
    }

    #[test]
    fn test_plausibility_hint() {
        let field = RegisterField::measurement("e_rev", 0x0103, "kWh").with_plausible(0.0, 1.0e9);
        assert!(field.is_plausible(12.5));
        assert!(!field.is_plausible(-151_732_604_633_088.0));
        assert!(!field.is_plausible(f32::NAN));
        let bare = RegisterField::measurement("freq", 0x0036, "Hz");
        assert!(bare.is_plausible(-1.0));
        assert!(!bare.is_plausible(f32::INFINITY));
    }

    // ========== Profile validation tests ==========

    #[test]
    fn test_duplicate_name_rejected() {
        let fields = vec![
            RegisterField::measurement("voltage", 0x0000, "V"),
            RegisterField::measurement("voltage", 0x0008, "V"),
        ];
        let err = DeviceProfile::new("x", "y", ByteOrder::BigEndian, fields, vec![]);
        assert!(matches!(err, Err(MeterError::InvalidProfile { .. })));
    }

    #[test]
    fn test_same_address_in_different_banks_allowed() {
        let fields = vec![
            RegisterField::measurement("voltage", 0x0000, "V"),
            baud_field(),
        ];
        let profile =
            DeviceProfile::new("x", "y", ByteOrder::BigEndian, fields, vec!["baud".into()]);
        assert!(profile.is_ok());
    }

    #[test]
    fn test_duplicate_address_in_bank_rejected() {
        let fields = vec![
            RegisterField::measurement("voltage", 0x0000, "V"),
            RegisterField::measurement("volts", 0x0000, "V"),
        ];
        let err = DeviceProfile::new("x", "y", ByteOrder::BigEndian, fields, vec![]);
        assert!(matches!(err, Err(MeterError::InvalidProfile { .. })));
    }

    #[test]
    fn test_write_order_must_cover_writable_fields() {
        let fields = vec![baud_field()];
        let err = DeviceProfile::new("x", "y", ByteOrder::BigEndian, fields.clone(), vec![]);
        assert!(matches!(err, Err(MeterError::InvalidProfile { .. })));

        let err = DeviceProfile::new(
            "x",
            "y",
            ByteOrder::BigEndian,
            fields,
            vec!["baud".into(), "baud".into()],
        );
        assert!(matches!(err, Err(MeterError::InvalidProfile { .. })));
    }

    #[test]
    fn test_lookup_and_banks() {
        let profile = dds661();
        assert_eq!(profile.field("voltage").unwrap().address, 0x0000);
        assert_eq!(
            profile.field("bogus_field"),
            Err(MeterError::UnknownField("bogus_field".into()))
        );
        assert!(profile.is_writable("slave"));
        assert!(!profile.is_writable("voltage"));
        assert!(!profile.is_writable("bogus_field"));

        let addrs: Vec<u16> = profile
            .fields_for_bank(RegisterBank::Holding)
            .iter()
            .map(|f| f.address)
            .collect();
        assert_eq!(addrs, vec![0x0000, 0x0002, 0x0008]);
    }

    #[test]
    fn test_write_order_override() {
        let profile = dds661();
        let reordered = profile.with_write_order(&["parity", "slave", "baud"]).unwrap();
        assert_eq!(reordered.write_rank("parity"), Some(0));
        assert_eq!(reordered.write_rank("voltage"), None);
        assert!(profile.with_write_order(&["slave", "voltage", "parity", "baud"]).is_err());
        assert!(profile.with_write_order(&["slave", "parity"]).is_err());
    }
}
