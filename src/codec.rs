//! Field codec for the fixed byte layouts of Pylontech CAN frames.
//!
//! All multi-byte integers on the bus are little endian. Physical values are
//! fixed point: the raw integer divided by a protocol defined [`Scale`].
//! These functions know nothing about frame identifiers.

use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::Serialize;

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

/// Fixed point scale of an encoded integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale(u32);

impl Scale {
    pub const UNIT: Scale = Scale(1);
    /// 0.1 per bit
    pub const DECI: Scale = Scale(10);
    /// 0.01 per bit
    pub const CENTI: Scale = Scale(100);

    pub fn divisor(self) -> u32 {
        self.0
    }
}

fn check_range(bytes: &[u8], offset: usize, width: usize) -> Result<()> {
    if !(1..=4).contains(&width) {
        return Err(Error::UnsupportedWidth(width));
    }
    match offset.checked_add(width) {
        Some(end) if end <= bytes.len() => Ok(()),
        _ => Err(Error::Truncated {
            offset,
            width,
            len: bytes.len(),
        }),
    }
}

/// Reads a little endian integer of `width` bytes at `offset`.
pub fn decode_int(bytes: &[u8], offset: usize, width: usize, signed: bool) -> Result<i64> {
    check_range(bytes, offset, width)?;
    let mut raw = [0u8; 4];
    raw[..width].copy_from_slice(&bytes[offset..offset + width]);
    let unsigned = u32::from_le_bytes(raw) as i64;
    if signed {
        let shift = 64 - 8 * width as u32;
        // sign extend from the top bit of the field
        Ok((unsigned << shift) >> shift)
    } else {
        Ok(unsigned)
    }
}

/// Reads a fixed point value: the integer at `offset` divided by `scale`.
pub fn decode_scaled_int(
    bytes: &[u8],
    offset: usize,
    width: usize,
    scale: Scale,
    signed: bool,
) -> Result<f64> {
    let raw = decode_int(bytes, offset, width, signed)?;
    Ok(raw as f64 / scale.divisor() as f64)
}

/// Writes `value` as a fixed point integer, rounded to the nearest step of `scale`.
pub fn encode_scaled_int(
    buf: &mut [u8],
    offset: usize,
    width: usize,
    scale: Scale,
    signed: bool,
    value: f64,
) -> Result<()> {
    check_range(buf, offset, width)?;
    let raw = (value * scale.divisor() as f64).round();
    let bits = 8 * width as u32;
    let (min, max) = if signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    } else {
        (0, (1i64 << bits) - 1)
    };
    if !raw.is_finite() || raw < min as f64 || raw > max as f64 {
        return Err(Error::OutOfRange);
    }
    let le = (raw as i64).to_le_bytes();
    buf[offset..offset + width].copy_from_slice(&le[..width]);
    Ok(())
}

/// Returns the bytes as text, rejecting anything outside 7-bit ASCII.
pub fn decode_ascii_chunk(bytes: &[u8]) -> Result<&str> {
    if let Some(position) = bytes.iter().position(|b| !b.is_ascii()) {
        log::warn!("Invalid text - non-ASCII byte at position {position}: {bytes:02X?}");
        return Err(Error::NotAscii { position });
    }
    // ASCII is always valid UTF-8
    std::str::from_utf8(bytes).map_err(|e| Error::NotAscii {
        position: e.valid_up_to(),
    })
}

/// Charge and discharge request bits of the status flags frame (0x35C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum RequestFlag {
    ChargeEnable,
    DischargeEnable,
    ForceCharge,
    ForceChargeLowBattery,
    BalancingCharge,
}

impl RequestFlag {
    pub fn name(self) -> &'static str {
        match self {
            RequestFlag::ChargeEnable => "charge_enable",
            RequestFlag::DischargeEnable => "discharge_enable",
            RequestFlag::ForceCharge => "force_charge_request",
            RequestFlag::ForceChargeLowBattery => "force_charge_request_low",
            RequestFlag::BalancingCharge => "balancing_charge_request",
        }
    }
}

/// Bit position of each request flag in byte 0 of 0x35C.
pub const REQUEST_FLAG_BITS: [(u8, RequestFlag); 5] = [
    (7, RequestFlag::ChargeEnable),
    (6, RequestFlag::DischargeEnable),
    (5, RequestFlag::ForceCharge),
    (4, RequestFlag::ForceChargeLowBattery),
    (3, RequestFlag::BalancingCharge),
];

/// The set of request flags decoded from one status byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags(u8);

impl RequestFlags {
    pub fn is_set(&self, flag: RequestFlag) -> bool {
        REQUEST_FLAG_BITS
            .iter()
            .find(|(_, f)| *f == flag)
            .is_some_and(|(bit, _)| read_bit!(self.0, bit))
    }

    pub fn set(&mut self, flag: RequestFlag, value: bool) {
        if let Some(&(bit, _)) = REQUEST_FLAG_BITS.iter().find(|(_, f)| *f == flag) {
            if value {
                self.0 |= 1u8 << bit;
            } else {
                self.0 &= !(1u8 << bit);
            }
        }
    }

    /// Flags that are set, in table order.
    pub fn iter(&self) -> impl Iterator<Item = RequestFlag> + '_ {
        REQUEST_FLAG_BITS
            .iter()
            .filter(|(bit, _)| read_bit!(self.0, bit))
            .map(|(_, flag)| *flag)
    }
}

/// Decodes the request flag byte. Bits outside the table are ignored.
pub fn decode_flags(byte: u8) -> RequestFlags {
    let mut flags = RequestFlags::default();
    for (bit, flag) in REQUEST_FLAG_BITS {
        flags.set(flag, read_bit!(byte, bit));
    }
    flags
}

pub fn encode_flags(flags: &RequestFlags) -> u8 {
    flags.0
}

/// Protection (error) bits of 0x359 bytes 0 and 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Protection {
    CellOverVoltage,
    CellUnderVoltage,
    CellOverTemperature,
    CellUnderTemperature,
    DischargeOverCurrent,
    ChargeOverCurrent,
    SystemError,
}

/// Alarm (warning) bits of 0x359 bytes 2 and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Alarm {
    HighVoltage,
    LowVoltage,
    HighTemperature,
    LowTemperature,
    DischargeHighCurrent,
    ChargeHighCurrent,
    InternalCommunicationFail,
}

const PROTECTION_BITS: [(usize, u8, Protection); 7] = [
    (0, 1, Protection::CellOverVoltage),
    (0, 2, Protection::CellUnderVoltage),
    (0, 3, Protection::CellOverTemperature),
    (0, 4, Protection::CellUnderTemperature),
    (0, 7, Protection::DischargeOverCurrent),
    (1, 0, Protection::ChargeOverCurrent),
    (1, 3, Protection::SystemError),
];

const ALARM_BITS: [(usize, u8, Alarm); 7] = [
    (2, 1, Alarm::HighVoltage),
    (2, 2, Alarm::LowVoltage),
    (2, 3, Alarm::HighTemperature),
    (2, 4, Alarm::LowTemperature),
    (2, 7, Alarm::DischargeHighCurrent),
    (3, 0, Alarm::ChargeHighCurrent),
    (3, 3, Alarm::InternalCommunicationFail),
];

fn collect_bits<T: Copy>(bytes: &[u8], table: &[(usize, u8, T)]) -> Result<Vec<T>> {
    let mut result = Vec::new();
    for &(byte, bit, item) in table {
        let value = decode_int(bytes, byte, 1, false)? as u8;
        if read_bit!(value, bit) {
            result.push(item);
        }
    }
    Ok(result)
}

/// Named protection conditions of a 0x359 payload.
pub fn decode_protections(bytes: &[u8]) -> Result<Vec<Protection>> {
    collect_bits(bytes, &PROTECTION_BITS)
}

/// Named alarm conditions of a 0x359 payload.
pub fn decode_alarms(bytes: &[u8]) -> Result<Vec<Alarm>> {
    collect_bits(bytes, &ALARM_BITS)
}

impl std::fmt::Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Protection::CellOverVoltage => write!(f, "Cell or module over voltage"),
            Protection::CellUnderVoltage => write!(f, "Cell or module under voltage"),
            Protection::CellOverTemperature => write!(f, "Cell over temperature"),
            Protection::CellUnderTemperature => write!(f, "Cell under temperature"),
            Protection::DischargeOverCurrent => write!(f, "Discharge over current"),
            Protection::ChargeOverCurrent => write!(f, "Charge over current"),
            Protection::SystemError => write!(f, "System error"),
        }
    }
}

impl std::fmt::Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Alarm::HighVoltage => write!(f, "Cell or module high voltage"),
            Alarm::LowVoltage => write!(f, "Cell or module low voltage"),
            Alarm::HighTemperature => write!(f, "Cell high temperature"),
            Alarm::LowTemperature => write!(f, "Cell low temperature"),
            Alarm::DischargeHighCurrent => write!(f, "Discharge high current"),
            Alarm::ChargeHighCurrent => write!(f, "Charge high current"),
            Alarm::InternalCommunicationFail => write!(f, "Internal communication failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_little_endian_fields() {
        // 0x351 of a Pylontech US2000: 56.3 V, 92.2 A, 922.5 A
        let payload = [0x33, 0x02, 0x9a, 0x03, 0x09, 0x24, 0x00, 0x00];
        assert_eq!(decode_int(&payload, 0, 2, false).unwrap(), 563);
        assert_eq!(decode_scaled_int(&payload, 0, 2, Scale::DECI, false).unwrap(), 56.3);
        assert_eq!(decode_scaled_int(&payload, 2, 2, Scale::DECI, true).unwrap(), 92.2);
        assert_eq!(decode_scaled_int(&payload, 4, 2, Scale::DECI, true).unwrap(), 922.5);
    }

    #[test]
    fn sign_extends_negative_values() {
        let payload = [0x9c, 0xff, 0xfe];
        assert_eq!(decode_int(&payload, 0, 2, true).unwrap(), -100);
        assert_eq!(decode_int(&payload, 0, 2, false).unwrap(), 0xff9c);
        assert_eq!(decode_scaled_int(&payload, 0, 2, Scale::DECI, true).unwrap(), -10.0);
        assert_eq!(decode_int(&payload, 2, 1, true).unwrap(), -2);
    }

    #[test]
    fn truncated_exactly_at_payload_end() {
        let payload = [0u8; 6];
        assert!(decode_int(&payload, 4, 2, false).is_ok());
        assert!(matches!(
            decode_int(&payload, 5, 2, false),
            Err(Error::Truncated {
                offset: 5,
                width: 2,
                len: 6
            })
        ));
        assert!(matches!(
            decode_int(&[], 0, 1, false),
            Err(Error::Truncated { .. })
        ));
        assert!(matches!(
            decode_int(&payload, usize::MAX, 2, false),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unsupported_width() {
        assert!(matches!(
            decode_int(&[0u8; 8], 0, 8, false),
            Err(Error::UnsupportedWidth(8))
        ));
        assert!(matches!(
            decode_int(&[0u8; 8], 0, 0, false),
            Err(Error::UnsupportedWidth(0))
        ));
    }

    #[test]
    fn encode_rejects_out_of_range() {
        let mut buf = [0u8; 2];
        assert!(matches!(
            encode_scaled_int(&mut buf, 0, 2, Scale::DECI, false, -1.0),
            Err(Error::OutOfRange)
        ));
        assert!(matches!(
            encode_scaled_int(&mut buf, 0, 2, Scale::DECI, true, 3276.8),
            Err(Error::OutOfRange)
        ));
        assert!(matches!(
            encode_scaled_int(&mut buf, 1, 2, Scale::UNIT, false, 1.0),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn request_flags_follow_bit_table() {
        let flags = decode_flags(0xc0);
        assert!(flags.is_set(RequestFlag::ChargeEnable));
        assert!(flags.is_set(RequestFlag::DischargeEnable));
        assert!(!flags.is_set(RequestFlag::ForceCharge));
        assert_eq!(
            flags.iter().collect::<Vec<_>>(),
            vec![RequestFlag::ChargeEnable, RequestFlag::DischargeEnable]
        );

        let flags = decode_flags(0x08);
        assert_eq!(
            flags.iter().collect::<Vec<_>>(),
            vec![RequestFlag::BalancingCharge]
        );

        // bits 0..2 are reserved
        assert_eq!(encode_flags(&decode_flags(0x07)), 0);
        assert_eq!(encode_flags(&decode_flags(0xf8)), 0xf8);
    }

    #[test]
    fn ascii_chunk() {
        assert_eq!(decode_ascii_chunk(b"PYLON   ").unwrap(), "PYLON   ");
        assert_eq!(decode_ascii_chunk(b"PYL\0\0").unwrap(), "PYL\0\0");
        assert!(matches!(
            decode_ascii_chunk(&[b'P', 0xc3, 0xa4]),
            Err(Error::NotAscii { position: 1 })
        ));
    }

    #[test]
    fn protection_and_alarm_bits() {
        let payload = [0x82, 0x08, 0x10, 0x01, 0x05, 0x50, 0x4e, 0x00];
        assert_eq!(
            decode_protections(&payload).unwrap(),
            vec![
                Protection::CellOverVoltage,
                Protection::DischargeOverCurrent,
                Protection::SystemError
            ]
        );
        assert_eq!(
            decode_alarms(&payload).unwrap(),
            vec![Alarm::LowTemperature, Alarm::ChargeHighCurrent]
        );
        assert!(decode_protections(&[0u8; 4]).unwrap().is_empty());
        assert!(matches!(
            decode_alarms(&[0u8; 3]),
            Err(Error::Truncated { .. })
        ));
    }

    proptest! {
        #[test]
        fn decode_inverts_encode_deci(raw in -32768i32..=32767) {
            let value = raw as f64 / 10.0;
            let mut buf = [0u8; 8];
            encode_scaled_int(&mut buf, 2, 2, Scale::DECI, true, value).unwrap();
            let decoded = decode_scaled_int(&buf, 2, 2, Scale::DECI, true).unwrap();
            prop_assert!((decoded - value).abs() < 0.05);
        }

        #[test]
        fn decode_inverts_encode_centi(raw in 0u32..=65535) {
            let value = raw as f64 / 100.0;
            let mut buf = [0u8; 2];
            encode_scaled_int(&mut buf, 0, 2, Scale::CENTI, false, value).unwrap();
            prop_assert_eq!(decode_int(&buf, 0, 2, false).unwrap(), raw as i64);
        }
    }
}
