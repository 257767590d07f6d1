//! Register codec: float32 values <-> pairs of 16-bit register words
//!
//! Energy meters of the DDS661/SDM230 family store every quantity as an
//! IEEE-754 binary32 value spread over two consecutive registers, high word
//! first, most significant byte first within each word (ABCD).
//!
//! For `238.6`:
//! - registers: `[0x436E, 0x999A]`
//! - bit pattern: `0x436E999A`

use std::fmt;
use std::str::FromStr;

/// Byte/word order of a 32-bit value spread over two registers
///
/// Uses ABCD notation where A is the most significant byte. For `0x12345678`:
/// - `BigEndian (ABCD)`: [0x12, 0x34, 0x56, 0x78]
/// - `LittleEndian (DCBA)`: [0x78, 0x56, 0x34, 0x12]
/// - `BigEndianSwap (CDAB)`: [0x56, 0x78, 0x12, 0x34]
/// - `LittleEndianSwap (BADC)`: [0x34, 0x12, 0x78, 0x56]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// High word first, MSB first (every meter profile shipped here)
    #[default]
    BigEndian,
    LittleEndian,
    /// Words swapped, common on PLC-style devices
    BigEndianSwap,
    LittleEndianSwap,
}

impl ByteOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    /// Accepts "ABCD", "AB-CD", "BE", "BIG_ENDIAN" and the equivalents of the other orders
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "");
        match normalized.as_str() {
            "ABCD" | "BE" | "BIG_ENDIAN" | "BIGENDIAN" => Ok(Self::BigEndian),
            "DCBA" | "LE" | "LITTLE_ENDIAN" | "LITTLEENDIAN" => Ok(Self::LittleEndian),
            "CDAB" | "BIG_ENDIAN_SWAP" | "BIGENDIANSWAP" => Ok(Self::BigEndianSwap),
            "BADC" | "LITTLE_ENDIAN_SWAP" | "LITTLEENDIANSWAP" => Ok(Self::LittleEndianSwap),
            _ => Err(format!("unknown byte order: {}", s)),
        }
    }
}

/// Decode an ABCD register pair
pub fn decode(hi: u16, lo: u16) -> f32 {
    f32::from_bits(((hi as u32) << 16) | lo as u32)
}

/// Encode a value as an ABCD register pair
///
/// Non-finite input is encoded bit for bit; callers filter it before writing.
pub fn encode(value: f32) -> (u16, u16) {
    let bits = value.to_bits();
    ((bits >> 16) as u16, bits as u16)
}

/// Convert 2 registers to 4 bytes in ABCD order
fn regs_to_bytes_4(regs: &[u16; 2], order: ByteOrder) -> [u8; 4] {
    let [h0, h1] = [regs[0].to_be_bytes(), regs[1].to_be_bytes()];

    match order {
        ByteOrder::BigEndian => [h0[0], h0[1], h1[0], h1[1]],
        ByteOrder::LittleEndian => [h1[1], h1[0], h0[1], h0[0]],
        ByteOrder::BigEndianSwap => [h1[0], h1[1], h0[0], h0[1]],
        ByteOrder::LittleEndianSwap => [h0[1], h0[0], h1[1], h1[0]],
    }
}

fn bytes_4_to_regs(bytes: [u8; 4], order: ByteOrder) -> [u16; 2] {
    let [a, b, c, d] = bytes;

    match order {
        ByteOrder::BigEndian => [u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])],
        ByteOrder::LittleEndian => [u16::from_be_bytes([d, c]), u16::from_be_bytes([b, a])],
        ByteOrder::BigEndianSwap => [u16::from_be_bytes([c, d]), u16::from_be_bytes([a, b])],
        ByteOrder::LittleEndianSwap => [u16::from_be_bytes([b, a]), u16::from_be_bytes([d, c])],
    }
}

/// Convert 2 registers to f32 using the given order
pub fn regs_to_f32(regs: &[u16; 2], order: ByteOrder) -> f32 {
    f32::from_be_bytes(regs_to_bytes_4(regs, order))
}

/// Convert f32 to 2 registers using the given order
pub fn f32_to_regs(value: f32, order: ByteOrder) -> [u16; 2] {
    bytes_4_to_regs(value.to_be_bytes(), order)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use rand::Rng;

    const ALL_ORDERS: [ByteOrder; 4] = [
        ByteOrder::BigEndian,
        ByteOrder::LittleEndian,
        ByteOrder::BigEndianSwap,
        ByteOrder::LittleEndianSwap,
    ];

    // ========== ABCD contract ==========

    #[test]
    fn test_voltage_capture() {
        assert_eq!(encode(238.6), (0x436E, 0x999A));
        let decoded = decode(0x436E, 0x999A);
        assert_eq!(decoded as f64, 238.60000610351562);
    }

    #[test]
    fn test_known_patterns() {
        assert_eq!(encode(9600.0), (0x4616, 0x0000));
        assert_eq!(encode(1.0), (0x3F80, 0x0000));
        assert_eq!(decode(0x4377, 0x0000), 247.0);
        assert_eq!(decode(0xD70A, 0x0000), -151_732_604_633_088.0);
    }

    #[test]
    fn test_random_roundtrip() {
        let mut rng = rand::thread_rng();
        let mut checked = 0;
        while checked < 10_000 {
            let v = f32::from_bits(rng.gen::<u32>());
            if !v.is_finite() {
                continue;
            }
            let (hi, lo) = encode(v);
            assert_eq!(decode(hi, lo).to_bits(), v.to_bits());
            checked += 1;
        }
    }

    #[test]
    fn test_words_roundtrip_for_finite_patterns() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let (hi, lo) = (rng.gen::<u16>(), rng.gen::<u16>());
            if decode(hi, lo).is_finite() {
                assert_eq!(encode(decode(hi, lo)), (hi, lo));
            }
        }
    }

    // ========== Byte order tests ==========

    #[test]
    fn test_regs_to_f32_all_orders() {
        // 0x12345678 laid out per order
        let cases = [
            (ByteOrder::BigEndian, [0x1234, 0x5678]),
            (ByteOrder::LittleEndian, [0x7856, 0x3412]),
            (ByteOrder::BigEndianSwap, [0x5678, 0x1234]),
            (ByteOrder::LittleEndianSwap, [0x3412, 0x7856]),
        ];
        for (order, regs) in cases {
            assert_eq!(regs_to_f32(&regs, order).to_bits(), 0x1234_5678, "{order}");
            assert_eq!(f32_to_regs(f32::from_bits(0x1234_5678), order), regs, "{order}");
        }
    }

    #[test]
    fn test_big_endian_matches_pair_codec() {
        for v in [0.0f32, -0.0, 1.5, 238.6, 49.98, -1234.5, f32::MAX, f32::MIN_POSITIVE] {
            let (hi, lo) = encode(v);
            assert_eq!(f32_to_regs(v, ByteOrder::BigEndian), [hi, lo]);
            assert_eq!(regs_to_f32(&[hi, lo], ByteOrder::BigEndian).to_bits(), v.to_bits());
        }
    }

    #[test]
    fn test_all_orders_roundtrip() {
        for order in ALL_ORDERS {
            for v in [0.5f32, 230.0, -17.25, 1.0e9] {
                let regs = f32_to_regs(v, order);
                assert_eq!(regs_to_f32(&regs, order), v);
            }
        }
    }

    #[test]
    fn test_byte_order_parse() {
        assert_eq!("ABCD".parse::<ByteOrder>(), Ok(ByteOrder::BigEndian));
        assert_eq!("cd-ab".parse::<ByteOrder>(), Ok(ByteOrder::BigEndianSwap));
        assert_eq!("LE".parse::<ByteOrder>(), Ok(ByteOrder::LittleEndian));
        assert!("XYZW".parse::<ByteOrder>().is_err());
        assert_eq!(ByteOrder::default().to_string(), "ABCD");
    }
}
