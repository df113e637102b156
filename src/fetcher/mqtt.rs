//! MQTT broker subscription fetcher
//!
//! Subscribes to a set of topics and maps each publish onto a data key.
//! Connection loss is handled by re-polling the event loop with a growing
//! delay; subscriptions are re-established on every ConnAck.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, Transport};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DataMap, Fetcher, FetcherConfig};
use crate::error::Error;

/// Registry name of the MQTT fetcher.
pub const METHOD_MQTT: &str = "mqtt";

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

fn default_keepalive() -> u64 {
    60
}

/// One topic subscription and the data key its payloads land under.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttSubscription {
    /// Topic of this sub
    pub topic: String,

    /// QoS of this sub (0..=2)
    #[serde(default)]
    pub qos: u8,

    /// The configmap/secret data key payloads are stored under
    pub data_key: String,
}

/// MQTT fetcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConfig {
    /// Broker address: `host:port` for tcp, a `ws://`/`wss://` URL for
    /// websocket transport
    pub broker: String,

    /// Transport: `tcp` (default) or `websocket`
    #[serde(default)]
    pub transport: String,

    /// Protocol version: `3.1.1` (default) or `4` (same wire protocol);
    /// v5 brokers are not supported
    #[serde(default)]
    pub version: String,

    /// Client identifier
    #[serde(default)]
    pub client_id: String,

    /// Username, empty for anonymous
    #[serde(default)]
    pub username: String,

    /// Password
    #[serde(default)]
    pub password: String,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Connect over TLS (tcp transport only)
    #[serde(default)]
    pub tls: bool,

    /// Topic subscriptions
    pub subscriptions: Vec<MqttSubscription>,
}

/// Build an MQTT fetcher from its config.
pub fn new_mqtt_fetcher(config: &FetcherConfig) -> Result<Box<dyn Fetcher>, Error> {
    let mqtt = config
        .mqtt
        .as_ref()
        .ok_or_else(|| Error::config("no mqtt fetcher configuration provided"))?;

    let mut topics = HashMap::new();
    let mut subs = Vec::with_capacity(mqtt.subscriptions.len());
    for sub in &mqtt.subscriptions {
        let qos = match sub.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => return Err(Error::config(format!("invalid qos level {other}"))),
        };
        topics.insert(sub.topic.clone(), sub.data_key.clone());
        subs.push((sub.topic.clone(), qos));
    }

    let options = build_options(mqtt)?;

    Ok(Box::new(MqttFetcher {
        options,
        subs,
        topics,
        required_data_keys: config.required_data_keys.clone(),
        rx: None,
        client: None,
        cancel: CancellationToken::new(),
    }))
}

fn build_options(mqtt: &MqttConfig) -> Result<MqttOptions, Error> {
    match mqtt.version.as_str() {
        "" | "3.1.1" | "4" => {}
        other => {
            return Err(Error::config(format!(
                "unsupported mqtt protocol version {other:?}"
            )))
        }
    }

    let client_id = if mqtt.client_id.is_empty() {
        crate::CONTROLLER_NAME.to_string()
    } else {
        mqtt.client_id.clone()
    };

    let mut options = match mqtt.transport.as_str() {
        "websocket" => {
            // for websockets the broker field is the full URL; the port
            // argument is unused by rumqttc but required by the signature
            let mut o = MqttOptions::new(client_id, mqtt.broker.clone(), 0);
            o.set_transport(Transport::Ws);
            o
        }
        "" | "tcp" => {
            let (host, port) = mqtt
                .broker
                .rsplit_once(':')
                .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
                .ok_or_else(|| {
                    Error::config(format!("invalid mqtt broker address {:?}", mqtt.broker))
                })?;
            let mut o = MqttOptions::new(client_id, host, port);
            if mqtt.tls {
                o.set_transport(Transport::tls_with_default_config());
            }
            o
        }
        other => {
            return Err(Error::config(format!(
                "unsupported mqtt transport {other:?}"
            )))
        }
    };

    if !mqtt.username.is_empty() {
        options.set_credentials(mqtt.username.clone(), mqtt.password.clone());
    }
    options.set_keep_alive(Duration::from_secs(mqtt.keepalive_secs.max(5)));
    options.set_clean_session(true);

    Ok(options)
}

#[derive(Debug)]
struct MqttFetcher {
    options: MqttOptions,
    subs: Vec<(String, QoS)>,
    topics: HashMap<String, String>,
    required_data_keys: Vec<String>,
    rx: Option<mpsc::Receiver<DataMap>>,
    client: Option<AsyncClient>,
    cancel: CancellationToken,
}

#[async_trait]
impl Fetcher for MqttFetcher {
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        self.cancel = cancel.child_token();

        let (client, eventloop) = AsyncClient::new(self.options.clone(), 16);
        let (tx, rx) = mpsc::channel(1);
        self.rx = Some(rx);
        self.client = Some(client.clone());

        let pump = Pump {
            client,
            subs: self.subs.clone(),
            topics: self.topics.clone(),
            required_data_keys: self.required_data_keys.clone(),
            tx,
        };
        let cancel = self.cancel.clone();
        tokio::spawn(async move { pump.run(eventloop, cancel).await });

        Ok(())
    }

    fn retrieve(&mut self) -> Option<mpsc::Receiver<DataMap>> {
        self.rx.take()
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.cancel.cancel();
        if let Some(client) = self.client.take() {
            // best effort: the event loop is going away either way
            let _ = client.disconnect().await;
        }
        Ok(())
    }
}

struct Pump {
    client: AsyncClient,
    subs: Vec<(String, QoS)>,
    topics: HashMap<String, String>,
    required_data_keys: Vec<String>,
    tx: mpsc::Sender<DataMap>,
}

impl Pump {
    async fn run(self, mut eventloop: rumqttc::EventLoop, cancel: CancellationToken) {
        let mut buffer: DataMap = HashMap::new();
        let mut reconnect_delay = RECONNECT_MIN;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    reconnect_delay = RECONNECT_MIN;
                    debug!("mqtt connected, subscribing");
                    for (topic, qos) in &self.subs {
                        if let Err(e) = self.client.subscribe(topic.clone(), *qos).await {
                            warn!(topic = %topic, error = %e, "mqtt subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let Some(data_key) = self.topics.get(&publish.topic) else {
                        debug!(topic = %publish.topic, "publish on unmapped topic");
                        continue;
                    };
                    buffer.insert(data_key.clone(), publish.payload.to_vec());

                    if self.ready(&buffer) {
                        let batch = std::mem::take(&mut buffer);
                        if self.tx.send(batch).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, delay_ms = reconnect_delay.as_millis() as u64,
                        "mqtt connection error, reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    reconnect_delay = (reconnect_delay * 2).min(RECONNECT_MAX);
                }
            }
        }
    }

    // all of this fetcher's own required keys buffered?
    fn ready(&self, buffer: &DataMap) -> bool {
        self.required_data_keys
            .iter()
            .all(|k| buffer.contains_key(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(mqtt: MqttConfig) -> FetcherConfig {
        FetcherConfig {
            method: METHOD_MQTT.to_string(),
            required_data_keys: vec![],
            mqtt: Some(mqtt),
        }
    }

    fn base_mqtt() -> MqttConfig {
        MqttConfig {
            broker: "broker.test:1883".to_string(),
            transport: String::new(),
            version: String::new(),
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            keepalive_secs: 60,
            tls: false,
            subscriptions: vec![MqttSubscription {
                topic: "conf/app".to_string(),
                qos: 1,
                data_key: "app.yaml".to_string(),
            }],
        }
    }

    #[test]
    fn invalid_qos_fails_construction() {
        let mut mqtt = base_mqtt();
        mqtt.subscriptions[0].qos = 3;
        let err = new_mqtt_fetcher(&base_config(mqtt)).unwrap_err();
        assert!(err.to_string().contains("invalid qos level 3"));
    }

    #[test]
    fn invalid_broker_address_fails_construction() {
        let mut mqtt = base_mqtt();
        mqtt.broker = "no-port".to_string();
        assert!(new_mqtt_fetcher(&base_config(mqtt)).is_err());
    }

    #[test]
    fn unsupported_transport_fails_construction() {
        let mut mqtt = base_mqtt();
        mqtt.transport = "carrier-pigeon".to_string();
        assert!(new_mqtt_fetcher(&base_config(mqtt)).is_err());
    }

    #[test]
    fn v5_protocol_is_rejected() {
        let mut mqtt = base_mqtt();
        mqtt.version = "5".to_string();
        let err = new_mqtt_fetcher(&base_config(mqtt)).unwrap_err();
        assert!(err.to_string().contains("unsupported mqtt protocol version"));
    }

    #[test]
    fn websocket_transport_is_accepted() {
        let mut mqtt = base_mqtt();
        mqtt.transport = "websocket".to_string();
        mqtt.broker = "ws://broker.test:8080/mqtt".to_string();
        assert!(new_mqtt_fetcher(&base_config(mqtt)).is_ok());
    }

    #[test]
    fn config_parses_from_yaml() {
        let config: FetcherConfig = serde_yaml::from_str(
            r#"
method: mqtt
requiredDataKeys: [app.yaml]
mqtt:
  broker: broker.test:1883
  username: resync
  password: hunter2
  subscriptions:
    - topic: conf/app
      qos: 1
      dataKey: app.yaml
"#,
        )
        .unwrap();
        assert_eq!(config.required_data_keys, vec!["app.yaml"]);
        let mqtt = config.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.subscriptions[0].data_key, "app.yaml");
        assert!(new_mqtt_fetcher(&config).is_ok());
    }

    #[tokio::test]
    async fn retrieve_yields_channel_once() {
        let mut fetcher = new_mqtt_fetcher(&base_config(base_mqtt())).unwrap();
        fetcher.start(CancellationToken::new()).await.unwrap();
        assert!(fetcher.retrieve().is_some());
        assert!(fetcher.retrieve().is_none());
        fetcher.stop().await.unwrap();
        // stop is idempotent
        fetcher.stop().await.unwrap();
    }
}
