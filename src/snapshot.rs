use crate::codec::{Alarm, Protection};
use std::fmt;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Stable names of the published snapshot fields, in display order.
pub const FIELD_NAMES: [&str; 17] = [
    "manufacturer",
    "n_modules",
    "soc",
    "soh",
    "v_charge_cmd",
    "i_lim_charge",
    "i_lim_discharge",
    "i_total",
    "v_avg",
    "t_avg",
    "error_state",
    "warning_state",
    "charge_enable",
    "discharge_enable",
    "force_charge_request",
    "force_charge_request_low",
    "balancing_charge_request",
];

/// Decoded BMS state at one point in time.
///
/// Voltages are in V, currents in A (positive is charging) and temperatures
/// in °C, already scaled by the protocol's fixed point factors. Until the
/// first 0x359 frame arrives, `error_state` and `warning_state` are `true`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BmsSnapshot {
    pub manufacturer: String,
    pub n_modules: u8,
    pub soc: u16,
    pub soh: u16,
    pub v_charge_cmd: f64,
    pub i_lim_charge: f64,
    pub i_lim_discharge: f64,
    pub i_total: f64,
    pub v_avg: f64,
    pub t_avg: f64,
    pub error_state: bool,
    pub warning_state: bool,
    pub charge_enable: bool,
    pub discharge_enable: bool,
    pub force_charge_request: bool,
    pub force_charge_request_low: bool,
    pub balancing_charge_request: bool,
    pub protections: Vec<Protection>,
    pub alarms: Vec<Alarm>,
}

impl Default for BmsSnapshot {
    fn default() -> Self {
        Self {
            manufacturer: String::new(),
            n_modules: 0,
            soc: 0,
            soh: 0,
            v_charge_cmd: 0.0,
            i_lim_charge: 0.0,
            i_lim_discharge: 0.0,
            i_total: 0.0,
            v_avg: 0.0,
            t_avg: 0.0,
            error_state: true,
            warning_state: true,
            charge_enable: false,
            discharge_enable: false,
            force_charge_request: false,
            force_charge_request_low: false,
            balancing_charge_request: false,
            protections: Vec::new(),
            alarms: Vec::new(),
        }
    }
}

/// A single snapshot field, formatted with the precision the protocol encodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Count(u16),
    Decimal { value: f64, precision: usize },
    Flag(bool),
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FieldValue::Text(text) => write!(f, "{text}"),
            FieldValue::Count(count) => write!(f, "{count}"),
            FieldValue::Decimal { value, precision } => write!(f, "{value:.precision$}"),
            FieldValue::Flag(flag) => write!(f, "{flag}"),
        }
    }
}

impl BmsSnapshot {
    /// The named fields in the order of [`FIELD_NAMES`].
    pub fn fields(&self) -> [(&'static str, FieldValue<'_>); 17] {
        let decimal = |value, precision| FieldValue::Decimal { value, precision };
        let values = [
            FieldValue::Text(&self.manufacturer),
            FieldValue::Count(self.n_modules as u16),
            FieldValue::Count(self.soc),
            FieldValue::Count(self.soh),
            decimal(self.v_charge_cmd, 1),
            decimal(self.i_lim_charge, 1),
            decimal(self.i_lim_discharge, 1),
            decimal(self.i_total, 1),
            decimal(self.v_avg, 2),
            decimal(self.t_avg, 1),
            FieldValue::Flag(self.error_state),
            FieldValue::Flag(self.warning_state),
            FieldValue::Flag(self.charge_enable),
            FieldValue::Flag(self.discharge_enable),
            FieldValue::Flag(self.force_charge_request),
            FieldValue::Flag(self.force_charge_request_low),
            FieldValue::Flag(self.balancing_charge_request),
        ];
        let mut index = 0;
        values.map(|value| {
            let name = FIELD_NAMES[index];
            index += 1;
            (name, value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_state_reports_faults() {
        let snapshot = BmsSnapshot::default();
        assert!(snapshot.error_state);
        assert!(snapshot.warning_state);
        assert!(!snapshot.charge_enable);
    }

    #[test]
    fn fields_follow_stable_names() {
        let snapshot = BmsSnapshot {
            manufacturer: "PYLON".into(),
            v_avg: 53.41,
            t_avg: 15.2,
            ..Default::default()
        };
        let fields = snapshot.fields();
        let names: Vec<_> = fields.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, FIELD_NAMES);
        assert_eq!(fields[0].1, FieldValue::Text("PYLON"));
        assert_eq!(fields[8].1.to_string(), "53.41");
        assert_eq!(fields[9].1.to_string(), "15.2");
        assert_eq!(fields[10].1.to_string(), "true");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_every_field_name() {
        let value = serde_json::to_value(BmsSnapshot::default()).unwrap();
        let object = value.as_object().unwrap();
        for name in FIELD_NAMES {
            assert!(object.contains_key(name), "missing {name}");
        }
    }
}
