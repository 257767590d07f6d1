//! DDS661 single-phase DIN-rail meter

use super::{DeviceProfile, FieldRole, RegisterField, ValueDomain};
use crate::codec::ByteOrder;

/// Holding register: baud rate as float (1200/2400/4800/9600)
pub const REG_BAUD: u16 = 0x0000;
/// Holding register: parity code as float (0 = Even, 1 = Odd, 2 = None)
pub const REG_PARITY: u16 = 0x0002;
/// Holding register: slave address as float (1..247)
pub const REG_SLAVE: u16 = 0x0008;

pub fn dds661() -> DeviceProfile {
    let fields = vec![
        RegisterField::measurement("voltage", 0x0000, "V").with_plausible(0.0, 500.0),
        RegisterField::measurement("current", 0x0008, "A").with_plausible(0.0, 200.0),
        RegisterField::measurement("p_active", 0x0012, "W").with_plausible(-50_000.0, 50_000.0),
        RegisterField::measurement("pf", 0x002A, "").with_plausible(-1.0, 1.0),
        RegisterField::measurement("freq", 0x0036, "Hz").with_plausible(40.0, 70.0),
        RegisterField::measurement("e_total", 0x0100, "kWh").with_plausible(0.0, 1.0e9),
        RegisterField::measurement("e_pos", 0x0102, "kWh").with_plausible(0.0, 1.0e9),
        // Overlaps e_pos by one register; some firmwares return garbage here
        RegisterField::measurement("e_rev", 0x0103, "kWh").with_plausible(0.0, 1.0e9),
        RegisterField::parameter(
            "baud",
            REG_BAUD,
            FieldRole::LineSetting,
            ValueDomain::OneOf(vec![1200.0, 2400.0, 4800.0, 9600.0]),
        )
        .with_unit("bps"),
        RegisterField::parameter(
            "parity",
            REG_PARITY,
            FieldRole::LineSetting,
            ValueDomain::OneOf(vec![0.0, 1.0, 2.0]),
        ),
        RegisterField::parameter(
            "slave",
            REG_SLAVE,
            FieldRole::SlaveAddress,
            ValueDomain::IntegerRange { min: 1, max: 247 },
        ),
    ];

    DeviceProfile::builtin(
        "dds661",
        "DDS",
        ByteOrder::BigEndian,
        fields,
        &["slave", "parity", "baud"],
    )
}
