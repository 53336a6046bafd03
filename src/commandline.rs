use clap::{ArgAction, Parser};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::LevelFilter;
use std::time::Duration;

pub const CAN_DEVICE_DEFAULT: &str = "vcan0";
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum MqttFormat {
    /// Every field as its own message below the topic
    Simple,
    /// One JSON object per telegram
    Json,
}

/// Accepts plain seconds ("1", "0.5") or a humantime duration ("500ms").
fn parse_poll_interval(value: &str) -> Result<Duration, String> {
    let interval = match value.parse::<f64>() {
        Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => Duration::from_secs_f64(seconds),
        Ok(_) => return Err(format!("invalid poll interval '{value}'")),
        Err(_) => humantime::parse_duration(value).map_err(|e| e.to_string())?,
    };
    if interval < MIN_POLL_INTERVAL {
        return Err(format!(
            "Poll interval must be at least {}",
            humantime::format_duration(MIN_POLL_INTERVAL)
        ));
    }
    Ok(interval)
}

const fn about_text() -> &'static str {
    "Diagnostics and MQTT bridge for Pylontech CAN bus battery management systems"
}

const fn long_about_text() -> &'static str {
    "Diagnostics and MQTT bridge for Pylontech CAN bus battery management systems.\n\n\
     By default, listens passively on the bus. With --poll, emulates a connected \
     inverter and periodically sends a request frame to trigger the BMS reply."
}

#[derive(Parser, Debug)]
#[command(version, about = about_text(), long_about = long_about_text())]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// CAN interface to use
    #[arg(default_value = CAN_DEVICE_DEFAULT)]
    pub ifname: String,

    /// Send a request frame every n seconds (e.g. "1", "0.5", "500ms")
    #[arg(
        long,
        value_name = "SECONDS",
        num_args = 0..=1,
        default_missing_value = "1",
        value_parser = parse_poll_interval
    )]
    pub poll: Option<Duration>,

    /// Push incoming BMS telegrams to MQTT
    #[arg(long)]
    pub push: bool,

    /// MQTT topic to push to [default: tele/bms]
    #[arg(short, long)]
    pub topic: Option<String>,

    /// MQTT host (broker) to push to [default: localhost]
    #[arg(short, long)]
    pub broker: Option<String>,

    /// YAML file with further MQTT settings (port, credentials, qos, ...)
    #[arg(long)]
    pub mqtt_config: Option<String>,

    /// Output format for MQTT messages
    #[arg(long, value_enum, default_value_t = MqttFormat::Json)]
    pub format: MqttFormat,

    /// Suppress screen text output. Given twice (-ss), also suppress warnings
    #[arg(short, long, action = ArgAction::Count)]
    pub silent: u8,

    /// Suppress text output. Also suppress warnings
    #[arg(long)]
    pub super_silent: bool,

    /// The manufacturer name is sent in indexed chunks (byte 0 index, byte 1 count)
    #[arg(long)]
    pub indexed_manufacturer: bool,
}

impl CliArgs {
    pub fn is_silent(&self) -> bool {
        self.silent > 0 || self.super_silent
    }

    pub fn is_super_silent(&self) -> bool {
        self.silent > 1 || self.super_silent
    }

    pub fn log_level(&self) -> LevelFilter {
        if self.is_super_silent() {
            LevelFilter::Error
        } else {
            self.verbose.log_level_filter()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("pylonbms").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.ifname, "vcan0");
        assert_eq!(args.poll, None);
        assert!(!args.push);
        assert!(!args.is_silent());
        assert_eq!(args.format, MqttFormat::Json);
        assert_eq!(args.log_level(), LevelFilter::Warn);
    }

    #[test]
    fn poll_with_and_without_interval() {
        assert_eq!(parse(&["can0", "--poll"]).poll, Some(Duration::from_secs(1)));
        assert_eq!(
            parse(&["can0", "--poll", "0.5"]).poll,
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            parse(&["--poll=250ms", "can0"]).poll,
            Some(Duration::from_millis(250))
        );
        assert!(CliArgs::try_parse_from(["pylonbms", "--poll", "0.1"]).is_err());
        assert!(CliArgs::try_parse_from(["pylonbms", "--poll", "-1"]).is_err());
    }

    #[test]
    fn silent_levels() {
        let args = parse(&["-s"]);
        assert!(args.is_silent());
        assert!(!args.is_super_silent());

        let args = parse(&["-ss"]);
        assert!(args.is_super_silent());
        assert_eq!(args.log_level(), LevelFilter::Error);

        assert!(parse(&["--super-silent"]).is_super_silent());
    }

    #[test]
    fn mqtt_options() {
        let args = parse(&[
            "can1", "--push", "-t", "home/bms", "-b", "broker.lan", "--format", "simple",
        ]);
        assert_eq!(args.ifname, "can1");
        assert!(args.push);
        assert_eq!(args.topic.as_deref(), Some("home/bms"));
        assert_eq!(args.broker.as_deref(), Some("broker.lan"));
        assert_eq!(args.format, MqttFormat::Simple);
    }
}
