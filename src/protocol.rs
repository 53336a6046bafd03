use crate::error::{Error, Result};
use std::fmt;

/// CAN identifier of the inverter poll request (eight zero data bytes).
pub const ID_INVERTER_REQUEST: u32 = 0x305;
/// Charge voltage command and current limits.
pub const ID_CHARGE_PARAMETERS: u32 = 0x351;
/// State of charge and state of health.
pub const ID_STATE_OF_CHARGE: u32 = 0x355;
/// Average system voltage, total current and average temperature.
pub const ID_MEASUREMENTS: u32 = 0x356;
/// Protection and alarm flags and the module count. Starts every BMS telegram.
pub const ID_PROTECTION_ALARM: u32 = 0x359;
/// Charge and discharge request flags.
pub const ID_REQUEST_FLAGS: u32 = 0x35C;
/// Manufacturer name.
pub const ID_MANUFACTURER: u32 = 0x35E;

/// Identifier that marks the start of the data telegram sent by the BMS.
pub const ID_BMS_TELEGRAM_START: u32 = ID_PROTECTION_ALARM;
/// Number of CAN frames belonging to one reply telegram from the BMS.
pub const N_BMS_REPLY_FRAMES: usize = 6;
/// All identifiers of one reply telegram, in bus order.
pub const BMS_TELEGRAM_IDS: [u32; N_BMS_REPLY_FRAMES] = [
    ID_PROTECTION_ALARM,
    ID_CHARGE_PARAMETERS,
    ID_STATE_OF_CHARGE,
    ID_MEASUREMENTS,
    ID_REQUEST_FLAGS,
    ID_MANUFACTURER,
];

/// Maximum data length of a classic CAN frame.
pub const MAX_PAYLOAD_LENGTH: usize = 8;

/// A data frame as delivered by the transport.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    identifier: u32,
    data: [u8; MAX_PAYLOAD_LENGTH],
    len: u8,
    sequence: u64,
}

impl RawFrame {
    pub fn new(identifier: u32, payload: &[u8], sequence: u64) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(Error::PayloadLength(payload.len()));
        }
        let mut data = [0u8; MAX_PAYLOAD_LENGTH];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            identifier,
            data,
            len: payload.len() as u8,
            sequence,
        })
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Arrival order assigned by the transport.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} 0x{:03X} {:02X?}",
            self.sequence,
            self.identifier,
            self.payload()
        )
    }
}

/// Frames carrying plain telemetry values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryGroup {
    ChargeParameters,
    StateOfCharge,
    Measurements,
    ProtectionAlarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Telemetry(TelemetryGroup),
    StatusFlags,
    ManufacturerChunk { index: u8, total: u8 },
    RequestEcho,
    Unknown,
}

/// How the manufacturer name is laid out in 0x35E frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StringFraming {
    /// The whole payload is the name (Pylontech).
    #[default]
    Single,
    /// Byte 0 is the chunk index, byte 1 the chunk count, the rest is text.
    Indexed,
}

impl StringFraming {
    /// Offset of the text within a manufacturer frame payload.
    pub fn text_offset(self) -> usize {
        match self {
            StringFraming::Single => 0,
            StringFraming::Indexed => 2,
        }
    }
}

/// Maps identifiers to frame kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classifier {
    framing: StringFraming,
}

impl Classifier {
    pub fn new(framing: StringFraming) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> StringFraming {
        self.framing
    }

    /// Never fails: identifiers not in the table, and manufacturer frames
    /// with an inconsistent chunk header, are [`FrameKind::Unknown`].
    pub fn classify(&self, identifier: u32, payload: &[u8]) -> FrameKind {
        match identifier {
            ID_INVERTER_REQUEST => FrameKind::RequestEcho,
            ID_CHARGE_PARAMETERS => FrameKind::Telemetry(TelemetryGroup::ChargeParameters),
            ID_STATE_OF_CHARGE => FrameKind::Telemetry(TelemetryGroup::StateOfCharge),
            ID_MEASUREMENTS => FrameKind::Telemetry(TelemetryGroup::Measurements),
            ID_PROTECTION_ALARM => FrameKind::Telemetry(TelemetryGroup::ProtectionAlarm),
            ID_REQUEST_FLAGS => FrameKind::StatusFlags,
            ID_MANUFACTURER => match self.framing {
                StringFraming::Single => FrameKind::ManufacturerChunk { index: 0, total: 1 },
                StringFraming::Indexed => match payload {
                    [index, total, ..] if index < total => FrameKind::ManufacturerChunk {
                        index: *index,
                        total: *total,
                    },
                    _ => {
                        log::debug!("Invalid manufacturer chunk header: {payload:02X?}");
                        FrameKind::Unknown
                    }
                },
            },
            _ => FrameKind::Unknown,
        }
    }
}

/// Classifies with the Pylontech single frame manufacturer layout.
pub fn classify(identifier: u32, payload: &[u8]) -> FrameKind {
    Classifier::default().classify(identifier, payload)
}

/// The frame an inverter sends to make the BMS reply with a telegram.
pub fn build_poll_request() -> RawFrame {
    RawFrame {
        identifier: ID_INVERTER_REQUEST,
        data: [0; MAX_PAYLOAD_LENGTH],
        len: MAX_PAYLOAD_LENGTH as u8,
        sequence: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_identifiers() {
        let payload = [0u8; 8];
        assert_eq!(classify(0x305, &payload), FrameKind::RequestEcho);
        assert_eq!(
            classify(0x351, &payload),
            FrameKind::Telemetry(TelemetryGroup::ChargeParameters)
        );
        assert_eq!(
            classify(0x355, &payload),
            FrameKind::Telemetry(TelemetryGroup::StateOfCharge)
        );
        assert_eq!(
            classify(0x356, &payload),
            FrameKind::Telemetry(TelemetryGroup::Measurements)
        );
        assert_eq!(
            classify(0x359, &payload),
            FrameKind::Telemetry(TelemetryGroup::ProtectionAlarm)
        );
        assert_eq!(classify(0x35C, &payload), FrameKind::StatusFlags);
        assert_eq!(
            classify(0x35E, b"PYLON   "),
            FrameKind::ManufacturerChunk { index: 0, total: 1 }
        );
    }

    #[test]
    fn unknown_identifiers_are_never_errors() {
        for id in [0x000, 0x304, 0x350, 0x35A, 0x35F, 0x7FF, 0x1FFF_FFFF, u32::MAX] {
            assert_eq!(classify(id, &[]), FrameKind::Unknown);
            assert_eq!(classify(id, &[0xff; 8]), FrameKind::Unknown);
        }
    }

    #[test]
    fn indexed_manufacturer_chunks() {
        let classifier = Classifier::new(StringFraming::Indexed);
        assert_eq!(
            classifier.classify(0x35E, &[1, 3, b'L', b'O']),
            FrameKind::ManufacturerChunk { index: 1, total: 3 }
        );
        assert_eq!(classifier.classify(0x35E, &[3, 3, b'X']), FrameKind::Unknown);
        assert_eq!(classifier.classify(0x35E, &[0, 0]), FrameKind::Unknown);
        assert_eq!(classifier.classify(0x35E, &[0]), FrameKind::Unknown);
        assert_eq!(classifier.classify(0x35E, &[]), FrameKind::Unknown);
        assert_eq!(
            classifier.classify(0x356, &[]),
            FrameKind::Telemetry(TelemetryGroup::Measurements)
        );
    }

    #[test]
    fn raw_frame_payload_limit() {
        let frame = RawFrame::new(0x356, &[1, 2, 3], 7).unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(frame.sequence(), 7);
        assert!(RawFrame::new(0x356, &[0u8; 8], 0).is_ok());
        assert!(matches!(
            RawFrame::new(0x356, &[0u8; 9], 0),
            Err(Error::PayloadLength(9))
        ));
    }

    #[test]
    fn poll_request_is_deterministic() {
        let request = build_poll_request();
        assert_eq!(request.identifier(), ID_INVERTER_REQUEST);
        assert_eq!(request.payload(), &[0u8; 8]);
        for _ in 0..10 {
            assert_eq!(build_poll_request(), request);
        }
        assert_eq!(classify(request.identifier(), request.payload()), FrameKind::RequestEcho);
    }
}
