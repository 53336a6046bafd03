use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use pylonbms_lib::protocol::{self, Classifier, StringFraming};
use pylonbms_lib::snapshot::FIELD_NAMES;
use pylonbms_lib::transport::CanBus;
use pylonbms_lib::{Assembler, BmsSnapshot, Outcome, Stats};
use serde_json::json;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{commandline, display, mqtt};

/// Bridge side bookkeeping published next to the snapshot.
#[derive(Debug, Default, Clone, Copy)]
struct BridgeState {
    last_bms_update: Option<DateTime<Local>>,
    last_inverter_request: Option<DateTime<Local>>,
}

struct Sinks {
    display: Option<display::Display>,
    mqtt: Option<(mqtt::MqttPublisher, commandline::MqttFormat)>,
}

const N_METADATA: usize = 4;

/// Messages one telegram produces in the simple format: the named fields,
/// the protection and alarm lists and the bridge metadata.
const MESSAGES_PER_TELEGRAM: usize = FIELD_NAMES.len() + 2 + N_METADATA;

/// Queue room for a few telegrams while the broker is unreachable.
const MQTT_QUEUE_CAPACITY: usize = 4 * MESSAGES_PER_TELEGRAM;

fn epoch_seconds(time: Option<DateTime<Local>>) -> f64 {
    time.map_or(0.0, |t| t.timestamp_micros() as f64 / 1e6)
}

/// Keys shared with existing `tele/bms` consumers; times are Unix seconds,
/// 0.0 until the first event.
fn metadata(
    stats: &Stats,
    bridge: &BridgeState,
) -> [(&'static str, serde_json::Value); N_METADATA] {
    [
        (
            "timestamp_last_bms_update",
            json!(epoch_seconds(bridge.last_bms_update)),
        ),
        (
            "timestamp_last_inverter_request",
            json!(epoch_seconds(bridge.last_inverter_request)),
        ),
        ("n_invalid_data_telegrams", json!(stats.invalid_telegrams)),
        ("dropped_frames", json!(stats.dropped_frames)),
    ]
}

fn to_json_payload(
    snapshot: &BmsSnapshot,
    stats: &Stats,
    bridge: &BridgeState,
) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(snapshot)?;
    if let serde_json::Value::Object(map) = &mut value {
        for (key, meta) in metadata(stats, bridge) {
            map.insert(key.to_string(), meta);
        }
    }
    Ok(value)
}

/// Flattens a JSON object into `(topic, payload)` pairs below `base_topic`.
/// Arrays are kept as JSON text so that an empty list replaces a stale one.
fn simple_format_messages(base_topic: &str, value: &serde_json::Value) -> Vec<(String, String)> {
    fn collect(topic: String, val: &serde_json::Value, messages: &mut Vec<(String, String)>) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    collect(format!("{topic}/{k}"), v, messages);
                }
            }
            serde_json::Value::Array(_) => messages.push((topic, val.to_string())),
            serde_json::Value::String(s) => messages.push((topic, s.clone())),
            serde_json::Value::Number(n) => messages.push((topic, n.to_string())),
            serde_json::Value::Bool(b) => messages.push((topic, b.to_string())),
            serde_json::Value::Null => {
                // Do not publish null values
            }
        }
    }
    let mut messages = Vec::new();
    collect(base_topic.to_string(), value, &mut messages);
    messages
}

fn publish(
    publisher: &mqtt::MqttPublisher,
    format: commandline::MqttFormat,
    payload: &serde_json::Value,
) {
    match format {
        commandline::MqttFormat::Json => match serde_json::to_string(payload) {
            Ok(json_payload) => {
                if let Err(e) = publisher.publish(publisher.topic(), &json_payload) {
                    error!("Failed to publish data to MQTT: {e:?}");
                } else {
                    debug!("Successfully published data to MQTT.");
                }
            }
            Err(e) => error!("Failed to serialize data to JSON string: {e}"),
        },
        commandline::MqttFormat::Simple => {
            for (topic, message) in simple_format_messages(publisher.topic(), payload) {
                if let Err(e) = publisher.publish(&topic, &message) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
        }
    }
}

impl Sinks {
    fn emit(&mut self, snapshot: &BmsSnapshot, stats: &Stats, bridge: &BridgeState) {
        if let Some((publisher, format)) = &self.mqtt {
            match to_json_payload(snapshot, stats, bridge) {
                Ok(payload) => publish(publisher, *format, &payload),
                Err(e) => error!("Failed to serialize snapshot: {e}"),
            }
        }
        if let Some(display) = &mut self.display {
            let connected = self.mqtt.as_ref().map(|(publisher, _)| publisher.is_connected());
            display.show(snapshot, connected);
        }
    }
}

/// Sends the poll request every `interval` on its own socket.
fn spawn_poller(ifname: &str, interval: Duration) -> Result<JoinHandle<()>> {
    let bus = CanBus::open(ifname)
        .with_context(|| format!("Cannot open CAN interface '{ifname}' for polling"))?;
    let request = protocol::build_poll_request();
    info!("Polling the BMS every {interval:?}");

    thread::Builder::new()
        .name("poll".into())
        .spawn(move || {
            let mut next_call = Instant::now();
            loop {
                if let Err(e) = bus.send(&request) {
                    warn!("Cannot send request frame on {}: {e}", bus.ifname());
                }
                next_call += interval;
                match next_call.checked_duration_since(Instant::now()) {
                    Some(wait) => thread::sleep(wait),
                    // fell behind, e.g. after a blocking send
                    None => next_call = Instant::now(),
                }
            }
        })
        .with_context(|| "Cannot spawn poll thread")
}

/// Feeds every received frame to the assembler and fans completed
/// snapshots out to the sinks. Returns only when the bus fails.
fn receive_loop(bus: &mut CanBus, assembler: &mut Assembler, sinks: &mut Sinks) -> Result<()> {
    let mut bridge = BridgeState::default();
    loop {
        let frame = match bus.receive() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read from CAN interface '{}'", bus.ifname()))
            }
        };
        match assembler.process(&frame) {
            Ok(Outcome::InverterRequest) => bridge.last_inverter_request = Some(Local::now()),
            Ok(Outcome::Snapshot(snapshot)) => {
                bridge.last_bms_update = Some(Local::now());
                sinks.emit(&snapshot, &assembler.stats(), &bridge);
            }
            Ok(Outcome::ReassemblyAbandoned) => {
                info!("Manufacturer string restarted before it was complete")
            }
            Ok(Outcome::Ignored | Outcome::Updated | Outcome::ChunkDropped) => {}
            // already logged by the assembler
            Err(_) => {}
        }
    }
}

pub fn run(args: &commandline::CliArgs) -> Result<()> {
    info!(
        "Starting bridge: ifname={}, poll={:?}, push={}",
        args.ifname, args.poll, args.push
    );

    let mut bus = CanBus::open(&args.ifname)
        .with_context(|| format!("Cannot open CAN interface '{}'", args.ifname))?;

    let mqtt = if args.push {
        let config = match &args.mqtt_config {
            Some(config_file) => mqtt::MqttConfig::load(config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?,
            None => mqtt::MqttConfig::default(),
        }
        .with_overrides(args.broker.as_deref(), args.topic.as_deref());
        info!("MQTT config: {config:?}");
        let publisher = mqtt::MqttPublisher::new(config, MQTT_QUEUE_CAPACITY)
            .with_context(|| "Failed to create MQTT publisher")?;
        Some((publisher, args.format))
    } else {
        None
    };

    let mut sinks = Sinks {
        display: (!args.is_silent()).then(display::Display::new),
        mqtt,
    };

    let _poller = match args.poll {
        Some(interval) => Some(spawn_poller(&args.ifname, interval)?),
        None => None,
    };

    let framing = if args.indexed_manufacturer {
        StringFraming::Indexed
    } else {
        StringFraming::Single
    };
    let mut assembler = Assembler::new(Classifier::new(framing));

    receive_loop(&mut bus, &mut assembler, &mut sinks)
}
