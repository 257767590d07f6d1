//! Eastron SDM230-Modbus single-phase meter

use super::{DeviceProfile, FieldRole, RegisterField, ValueDomain, ValueMap};
use crate::codec::ByteOrder;

pub const REG_PARITY: u16 = 0x0012;
pub const REG_SLAVE: u16 = 0x0014;
pub const REG_BAUD: u16 = 0x001C;

/// Physical baud rate -> code stored in the baud register
const BAUD_CODES: [(f32, f32); 4] = [(2400.0, 0.0), (4800.0, 1.0), (9600.0, 2.0), (1200.0, 5.0)];

/// Parity register codes
pub const PARITY_CODES: [(f32, &str); 4] = [
    (0.0, "N,1 stop"),
    (1.0, "E,1 stop"),
    (2.0, "O,1 stop"),
    (3.0, "N,2 stop"),
];

pub fn sdm230() -> DeviceProfile {
    let fields = vec![
        RegisterField::measurement("voltage", 0x0000, "V").with_plausible(0.0, 500.0),
        RegisterField::measurement("current", 0x0006, "A").with_plausible(0.0, 200.0),
        RegisterField::measurement("p_active", 0x000C, "W").with_plausible(-50_000.0, 50_000.0),
        RegisterField::measurement("pf", 0x001E, "").with_plausible(-1.0, 1.0),
        RegisterField::measurement("freq", 0x0046, "Hz").with_plausible(40.0, 70.0),
        RegisterField::measurement("e_pos", 0x0048, "kWh").with_plausible(0.0, 1.0e9),
        RegisterField::measurement("e_rev", 0x004A, "kWh").with_plausible(0.0, 1.0e9),
        RegisterField::measurement("e_total", 0x0156, "kWh").with_plausible(0.0, 1.0e9),
        RegisterField::parameter(
            "parity",
            REG_PARITY,
            FieldRole::LineSetting,
            ValueDomain::OneOf(PARITY_CODES.iter().map(|(code, _)| *code).collect()),
        ),
        RegisterField::parameter(
            "slave",
            REG_SLAVE,
            FieldRole::SlaveAddress,
            ValueDomain::IntegerRange { min: 1, max: 247 },
        ),
        RegisterField::parameter(
            "baud",
            REG_BAUD,
            FieldRole::LineSetting,
            ValueDomain::OneOf(vec![1200.0, 2400.0, 4800.0, 9600.0]),
        )
        .with_unit("bps")
        .with_value_map(ValueMap::new(BAUD_CODES.to_vec())),
    ];

    DeviceProfile::builtin(
        "sdm230",
        "Eastron",
        ByteOrder::BigEndian,
        fields,
        &["slave", "parity", "baud"],
    )
}
