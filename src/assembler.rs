//! Accumulates classified frames into a [`BmsSnapshot`].
//!
//! Every frame kind updates its own fields of the working snapshot, so a
//! snapshot may combine frames of different telegrams when the bus delivers
//! them unevenly. A frame that fails to decode leaves the state untouched.

use crate::codec::{self, Scale};
use crate::error::Result;
use crate::protocol::{
    Classifier, FrameKind, RawFrame, TelemetryGroup, BMS_TELEGRAM_IDS, ID_BMS_TELEGRAM_START,
    N_BMS_REPLY_FRAMES,
};
use crate::snapshot::BmsSnapshot;

/// What a processed frame did to the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not a BMS frame.
    Ignored,
    /// An inverter poll request or acknowledge was seen on the bus.
    InverterRequest,
    /// Fields of the working snapshot were updated.
    Updated,
    /// A manufacturer chunk arrived out of order and was discarded.
    ChunkDropped,
    /// A new manufacturer string started before the previous one was complete.
    ReassemblyAbandoned,
    /// A complete telegram was received; the snapshot is ready for publishing.
    Snapshot(BmsSnapshot),
}

/// Counters for frames that did not make it into a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Telegrams closed before every BMS frame had been received once.
    pub invalid_telegrams: u64,
    /// Frames that failed to decode.
    pub dropped_frames: u64,
    /// Frames whose sequence number did not increase.
    pub out_of_sequence: u64,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
enum Reassembly {
    #[default]
    Idle,
    Assembling { expected: u8, received: Vec<String> },
}

/// Bitmask over [`BMS_TELEGRAM_IDS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SeenFrames(u8);

impl SeenFrames {
    fn mark(&mut self, identifier: u32) {
        if let Some(pos) = BMS_TELEGRAM_IDS.iter().position(|id| *id == identifier) {
            self.0 |= 1u8 << pos;
        }
    }

    fn missing(&self) -> Option<u32> {
        BMS_TELEGRAM_IDS
            .iter()
            .enumerate()
            .find(|(pos, _)| self.0 & (1u8 << *pos) == 0)
            .map(|(_, id)| *id)
    }
}

#[derive(Debug, Clone)]
pub struct Assembler {
    classifier: Classifier,
    working: BmsSnapshot,
    reassembly: Reassembly,
    telegram_frames: usize,
    seen: SeenFrames,
    stats: Stats,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(Classifier::default())
    }
}

impl Assembler {
    pub fn new(classifier: Classifier) -> Self {
        Self {
            classifier,
            working: BmsSnapshot::default(),
            reassembly: Reassembly::Idle,
            telegram_frames: 0,
            seen: SeenFrames::default(),
            stats: Stats::default(),
        }
    }

    /// Current best-known state.
    pub fn snapshot(&self) -> BmsSnapshot {
        self.working.clone()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Whether a multi-frame manufacturer string is in progress.
    pub fn is_assembling(&self) -> bool {
        matches!(self.reassembly, Reassembly::Assembling { .. })
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.classifier);
    }

    /// Decodes one frame into the working state.
    ///
    /// A decode error drops the frame and is returned to the caller; the
    /// assembler stays ready for the next frame.
    pub fn process(&mut self, frame: &RawFrame) -> Result<Outcome> {
        self.track_sequence(frame.sequence());

        let identifier = frame.identifier();
        let payload = frame.payload();
        let kind = self.classifier.classify(identifier, payload);
        log::trace!("{frame:?} classified as {kind:?}");

        let decoded = match kind {
            FrameKind::Unknown => return Ok(Outcome::Ignored),
            FrameKind::RequestEcho => return Ok(Outcome::InverterRequest),
            FrameKind::Telemetry(group) => self.apply_telemetry(group, payload),
            FrameKind::StatusFlags => self.apply_request_flags(payload),
            FrameKind::ManufacturerChunk { index, total } => {
                self.apply_manufacturer_chunk(index, total, payload)
            }
        };
        let outcome = match decoded {
            Ok(outcome) => outcome,
            Err(err) => {
                self.stats.dropped_frames = self.stats.dropped_frames.saturating_add(1);
                log::warn!("Invalid data received - dropping {frame:?}: {err}");
                return Err(err);
            }
        };

        self.seen.mark(identifier);
        if identifier == ID_BMS_TELEGRAM_START {
            let complete = self.telegram_frames >= N_BMS_REPLY_FRAMES;
            self.telegram_frames = 1;
            if complete {
                return Ok(self.close_telegram(outcome));
            }
        } else {
            self.telegram_frames = self.telegram_frames.saturating_add(1);
        }
        Ok(outcome)
    }

    fn track_sequence(&mut self, sequence: u64) {
        if self.stats.last_sequence != 0 && sequence <= self.stats.last_sequence {
            self.stats.out_of_sequence = self.stats.out_of_sequence.saturating_add(1);
            log::debug!(
                "Frame out of sequence - last={} received={sequence}",
                self.stats.last_sequence
            );
        }
        self.stats.last_sequence = sequence;
    }

    fn close_telegram(&mut self, outcome: Outcome) -> Outcome {
        match self.seen.missing() {
            None => Outcome::Snapshot(self.snapshot()),
            Some(id) => {
                self.stats.invalid_telegrams = self.stats.invalid_telegrams.saturating_add(1);
                log::warn!("Incomplete set of data frames received. ID: 0x{id:03X}");
                outcome
            }
        }
    }

    fn apply_telemetry(&mut self, group: TelemetryGroup, payload: &[u8]) -> Result<Outcome> {
        let state = &mut self.working;
        match group {
            TelemetryGroup::ChargeParameters => {
                let v_charge_cmd = codec::decode_scaled_int(payload, 0, 2, Scale::DECI, false)?;
                let i_lim_charge = codec::decode_scaled_int(payload, 2, 2, Scale::DECI, true)?;
                let i_lim_discharge = codec::decode_scaled_int(payload, 4, 2, Scale::DECI, true)?;
                state.v_charge_cmd = v_charge_cmd;
                state.i_lim_charge = i_lim_charge;
                state.i_lim_discharge = i_lim_discharge;
            }
            TelemetryGroup::StateOfCharge => {
                let soc = codec::decode_int(payload, 0, 2, false)? as u16;
                let soh = codec::decode_int(payload, 2, 2, false)? as u16;
                state.soc = soc;
                state.soh = soh;
            }
            TelemetryGroup::Measurements => {
                let v_avg = codec::decode_scaled_int(payload, 0, 2, Scale::CENTI, true)?;
                let i_total = codec::decode_scaled_int(payload, 2, 2, Scale::DECI, true)?;
                let t_avg = codec::decode_scaled_int(payload, 4, 2, Scale::DECI, true)?;
                state.v_avg = v_avg;
                state.i_total = i_total;
                state.t_avg = t_avg;
            }
            TelemetryGroup::ProtectionAlarm => {
                // Any set bit counts, including bits without a name.
                let error_state = codec::decode_int(payload, 0, 2, false)? != 0;
                let warning_state = codec::decode_int(payload, 2, 2, false)? != 0;
                let n_modules = codec::decode_int(payload, 4, 1, false)? as u8;
                let protections = codec::decode_protections(payload)?;
                let alarms = codec::decode_alarms(payload)?;
                state.protections = protections;
                state.alarms = alarms;
                state.error_state = error_state;
                state.warning_state = warning_state;
                state.n_modules = n_modules;
            }
        }
        Ok(Outcome::Updated)
    }

    fn apply_request_flags(&mut self, payload: &[u8]) -> Result<Outcome> {
        let flags = codec::decode_flags(codec::decode_int(payload, 0, 1, false)? as u8);
        let state = &mut self.working;
        for (_, flag) in codec::REQUEST_FLAG_BITS {
            let value = flags.is_set(flag);
            match flag {
                codec::RequestFlag::ChargeEnable => state.charge_enable = value,
                codec::RequestFlag::DischargeEnable => state.discharge_enable = value,
                codec::RequestFlag::ForceCharge => state.force_charge_request = value,
                codec::RequestFlag::ForceChargeLowBattery => {
                    state.force_charge_request_low = value
                }
                codec::RequestFlag::BalancingCharge => state.balancing_charge_request = value,
            }
        }
        Ok(Outcome::Updated)
    }

    fn apply_manufacturer_chunk(&mut self, index: u8, total: u8, payload: &[u8]) -> Result<Outcome> {
        let text = payload
            .get(self.classifier.framing().text_offset()..)
            .unwrap_or_default();
        let text = codec::decode_ascii_chunk(text)?.to_string();

        let (reassembly, outcome) = match (std::mem::take(&mut self.reassembly), index) {
            (Reassembly::Assembling { expected, received }, 0) => {
                log::debug!(
                    "Manufacturer string abandoned after {} of {expected} chunks",
                    received.len()
                );
                (
                    Reassembly::Assembling {
                        expected: total,
                        received: vec![text],
                    },
                    Outcome::ReassemblyAbandoned,
                )
            }
            (Reassembly::Idle, 0) => (
                Reassembly::Assembling {
                    expected: total,
                    received: vec![text],
                },
                Outcome::Updated,
            ),
            (
                Reassembly::Assembling {
                    expected,
                    mut received,
                },
                index,
            ) if expected == total && received.len() == index as usize => {
                received.push(text);
                (Reassembly::Assembling { expected, received }, Outcome::Updated)
            }
            (reassembly, index) => {
                log::debug!("Dropping manufacturer chunk {index}/{total} in state {reassembly:?}");
                (reassembly, Outcome::ChunkDropped)
            }
        };

        self.reassembly = match reassembly {
            Reassembly::Assembling { expected, received } if received.len() == expected as usize => {
                let name = received.concat();
                self.working.manufacturer = name.trim_end_matches('\0').to_string();
                Reassembly::Idle
            }
            other => other,
        };
        Ok(outcome)
    }
}
