use crossterm::cursor::MoveTo;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use crossterm::QueueableCommand;
use pylonbms_lib::BmsSnapshot;
use std::fmt::Write as _;
use std::io::{self, Write};

// One label per snapshot field, in `FIELD_NAMES` order.
const LABELS: [&str; 17] = [
    "BMS manufacturer string",
    "Number of modules",
    "SOC",
    "SOH",
    "Requested Charging Voltage",
    "Charge Current Limit",
    "Discharge Current Limit",
    "System Current",
    "System Voltage (Average)",
    "System Temperature (Average)",
    "Errors",
    "Warnings",
    "Charge Enable",
    "Discharge Enable",
    "Force Charge",
    "Force Charge Low Battery",
    "Balancing Charge Request",
];

// A blank line goes before these fields.
const GROUP_STARTS: [usize; 5] = [2, 4, 7, 10, 12];

/// Text screen redrawn in place for every telegram.
#[derive(Debug, Default)]
pub struct Display {
    even_run: bool,
}

impl Display {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders the snapshot; `mqtt_connected` is shown when pushing to MQTT.
    pub fn render(&mut self, snapshot: &BmsSnapshot, mqtt_connected: Option<bool>) -> String {
        let mut text = String::from("\n");
        for (index, ((_, value), label)) in snapshot.fields().iter().zip(LABELS).enumerate() {
            if GROUP_STARTS.contains(&index) {
                text.push('\n');
            }
            let _ = writeln!(text, "    {label}: {value}");
        }
        if !snapshot.protections.is_empty() {
            let names: Vec<String> = snapshot.protections.iter().map(|p| p.to_string()).collect();
            let _ = writeln!(text, "\n    Protections: {}", names.join(", "));
        }
        if !snapshot.alarms.is_empty() {
            let names: Vec<String> = snapshot.alarms.iter().map(|a| a.to_string()).collect();
            let _ = writeln!(text, "    Alarms: {}", names.join(", "));
        }
        // alternating marker shows the screen is alive
        if self.even_run {
            text.push_str("    **********************************************\n");
        } else {
            text.push('\n');
        }
        self.even_run = !self.even_run;
        if let Some(connected) = mqtt_connected {
            let _ = writeln!(text, "    MQTT connected: {connected}");
        }
        text
    }

    /// Redraws the whole screen from the top left corner.
    pub fn draw<W: Write>(
        &mut self,
        out: &mut W,
        snapshot: &BmsSnapshot,
        mqtt_connected: Option<bool>,
    ) -> io::Result<()> {
        let text = self.render(snapshot, mqtt_connected);
        out.queue(Clear(ClearType::All))?
            .queue(MoveTo(0, 0))?
            .queue(Print(text))?;
        out.flush()
    }

    pub fn show(&mut self, snapshot: &BmsSnapshot, mqtt_connected: Option<bool>) {
        let mut stdout = io::stdout().lock();
        if let Err(e) = self.draw(&mut stdout, snapshot, mqtt_connected) {
            log::debug!("Cannot write to screen: {e}");
        }
    }
}
