use anyhow::{Context, Result};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MqttConfig {
    #[serde(default = "MqttConfig::default_host")]
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_delay",
        with = "humantime_serde"
    )]
    reconnect_delay: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            username: None,
            password: None,
            topic: Self::default_topic(),
            qos: Self::default_qos(),
            client_id: Self::default_client_id(),
            keep_alive_interval: Self::default_keep_alive_interval(),
            reconnect_delay: Self::default_reconnect_delay(),
        }
    }
}

impl MqttConfig {
    fn default_host() -> String {
        "localhost".into()
    }

    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "tele/bms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("pylonbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Command line values win over the config file.
    pub fn with_overrides(mut self, broker: Option<&str>, topic: Option<&str>) -> Self {
        if let Some(broker) = broker {
            self.host = broker.to_string();
        }
        if let Some(topic) = topic {
            self.topic = topic.to_string();
        }
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn qos(&self) -> QoS {
        match self.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive_interval)
            .set_clean_session(true); // Typically true for telemetry publishers
        if let Some(user_name) = &self.username {
            options.set_credentials(user_name, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    /// Creates the client and drives its connection on a background thread,
    /// reconnecting after `reconnect_delay` whenever the broker goes away.
    ///
    /// `capacity` is the number of messages that can be queued at once and
    /// must cover the largest burst passed to [`MqttPublisher::publish`].
    pub fn new(config: MqttConfig, capacity: usize) -> Result<Self> {
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut connection) = Client::new(config.options(), capacity);
        let connected = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&connected);
        let reconnect_delay = config.reconnect_delay;
        std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("Connected to MQTT broker.");
                            flag.store(true, Ordering::Relaxed);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            flag.store(false, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if flag.swap(false, Ordering::Relaxed) {
                                log::warn!("MQTT connection lost: {e}");
                            } else {
                                log::debug!("MQTT connection failed: {e}");
                            }
                            std::thread::sleep(reconnect_delay);
                        }
                    }
                }
            })
            .with_context(|| "Cannot spawn MQTT connection thread")?;

        Ok(Self {
            client,
            config,
            connected,
        })
    }

    pub fn topic(&self) -> &str {
        self.config.topic()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queues a message without blocking; fails when the queue is full.
    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={}",
            topic,
            self.config.qos
        );

        self.client
            .try_publish(topic, self.config.qos(), false, payload.as_bytes().to_vec())
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    /// Accepts one client, acknowledges its CONNECT and discards the rest.
    fn local_broker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).unwrap();
            while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
        });
        port
    }

    #[test]
    fn defaults() {
        let config = MqttConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.topic(), "tele/bms");
        assert_eq!(config.qos(), QoS::AtMostOnce);
        assert!(config.client_id.starts_with("pylonbms-"));
        assert_eq!(config.client_id.len(), "pylonbms-".len() + 8);
    }

    #[test]
    fn load_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "host: broker.lan\nport: 8883\nusername: bms\npassword: secret\nqos: 1\nkeep_alive_interval: 30s"
        )
        .unwrap();

        let config = MqttConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.host, "broker.lan");
        assert_eq!(config.port, 8883);
        assert_eq!(config.username.as_deref(), Some("bms"));
        assert_eq!(config.qos(), QoS::AtLeastOnce);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.topic(), "tele/bms");
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        assert!(MqttConfig::load(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn command_line_overrides() {
        let config = MqttConfig::default().with_overrides(Some("10.0.0.2"), None);
        assert_eq!(config.host, "10.0.0.2");
        assert_eq!(config.topic(), "tele/bms");

        let config = config.with_overrides(None, Some("home/battery"));
        assert_eq!(config.host, "10.0.0.2");
        assert_eq!(config.topic(), "home/battery");
    }

    #[test]
    fn burst_within_capacity_is_queued() {
        let config = MqttConfig {
            host: "127.0.0.1".into(),
            port: local_broker(),
            ..MqttConfig::default()
        };
        let publisher = MqttPublisher::new(config, 23).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !publisher.is_connected() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(publisher.is_connected());

        let rejected = (0..23)
            .filter(|n| publisher.publish(&format!("tele/bms/field{n}"), "1").is_err())
            .count();
        assert_eq!(rejected, 0);
    }
}
