//! MQTT publishing
//!
//! The poller talks to a [`Publisher`]; [`MqttPublisher`] is the rumqttc
//! backed implementation. Availability is carried on `{base}/status`: the
//! broker publishes the retained "offline" will if the client vanishes, and
//! the client republishes "online" after every (re)connect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, Event, LastWill, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, TlsConfig};
use crate::error::{MeterdError, Result};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// rumqttc refuses keep-alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Requests buffered between the client and the event loop
const REQUEST_CAPACITY: usize = 64;

/// One outgoing MQTT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Discovery configs, published once at startup
    async fn announce(&self, messages: Vec<Message>) -> Result<()>;

    /// One device state payload
    async fn publish_state(&self, message: Message) -> Result<()>;

    /// Mark the poller offline and flush
    async fn shutdown(&self) -> Result<()>;
}

pub fn qos_level(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

fn tls_transport(tls: &TlsConfig) -> Result<Transport> {
    let Some(ca_path) = &tls.ca_certs else {
        return Ok(Transport::tls_with_default_config());
    };
    let ca = std::fs::read(ca_path).map_err(|e| {
        MeterdError::mqtt(format!("Cannot read CA file {}: {}", ca_path.display(), e))
    })?;

    let client_auth = match (&tls.certfile, &tls.keyfile) {
        (Some(cert), Some(key)) => Some((std::fs::read(cert)?, std::fs::read(key)?)),
        (None, None) => None,
        _ => {
            return Err(MeterdError::mqtt(
                "TLS client auth needs both certfile and keyfile",
            ))
        },
    };

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

/// Broker connection options, including the retained offline will
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keepalive).max(MIN_KEEP_ALIVE));
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    options.set_last_will(LastWill::new(
        config.status_topic(),
        STATUS_OFFLINE,
        qos_level(config.qos),
        true,
    ));

    if config.tls.enabled {
        options.set_transport(tls_transport(&config.tls)?);
    }

    Ok(options)
}

pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    retain: bool,
    status_topic: String,
    stop: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    /// Create the client and start driving its event loop
    ///
    /// The broker does not have to be reachable yet; the event loop keeps
    /// retrying and queued messages go out once the session is up. While it
    /// is down, messages beyond the request queue are dropped with a warning.
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let options = mqtt_options(config)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let stop = CancellationToken::new();
        let qos = qos_level(config.qos);
        let status_topic = config.status_topic();

        let loop_client = client.clone();
        let loop_stop = stop.clone();
        let loop_status = status_topic.clone();
        let broker = format!("{}:{}", config.host, config.port);
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = loop_stop.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected to {}", broker);
                        if let Err(e) =
                            loop_client.try_publish(&loop_status, qos, true, STATUS_ONLINE)
                        {
                            warn!("Failed to queue availability: {}", e);
                        }
                    },
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect sent");
                        break;
                    },
                    Ok(event) => debug!("MQTT event: {:?}", event),
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::select! {
                            _ = loop_stop.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {},
                        }
                    },
                }
            }
            debug!("MQTT event loop stopped");
        });

        Ok(Self {
            client,
            qos,
            retain: config.retain,
            status_topic,
            stop,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    /// Queue without waiting; a full queue drops the message
    fn send(&self, message: Message) -> Result<bool> {
        let topic = message.topic.clone();
        queued(
            &topic,
            self.client
                .try_publish(message.topic, self.qos, message.retain, message.payload),
        )
    }
}

/// `Ok(false)` when the request queue is full (broker unreachable)
fn queued(what: &str, result: std::result::Result<(), ClientError>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(ClientError::TryRequest(_)) => {
            warn!("MQTT queue full, dropping {}", what);
            Ok(false)
        },
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn announce(&self, messages: Vec<Message>) -> Result<()> {
        let total = messages.len();
        let mut count = 0;
        for message in messages {
            if self.send(message)? {
                count += 1;
            }
        }
        info!("Queued {}/{} discovery configs", count, total);
        Ok(())
    }

    async fn publish_state(&self, message: Message) -> Result<()> {
        debug!("Publishing {}", message.topic);
        self.send(Message {
            retain: message.retain && self.retain,
            ..message
        })?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let offline = queued(
            &self.status_topic,
            self.client
                .try_publish(&self.status_topic, self.qos, true, STATUS_OFFLINE),
        );
        let disconnect = queued("disconnect", self.client.try_disconnect());

        if !matches!(disconnect, Ok(true)) {
            self.stop.cancel();
        }
        if let Some(handle) = self.event_loop.lock().await.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("MQTT event loop did not drain in {:?}", DRAIN_TIMEOUT);
            }
        }
        self.stop.cancel();

        offline?;
        disconnect?;
        info!("MQTT publisher stopped");
        Ok(())
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Publisher that drops everything; used when MQTT is not wanted (dry runs)
#[derive(Debug, Default)]
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn announce(&self, messages: Vec<Message>) -> Result<()> {
        debug!("Dropping {} discovery configs", messages.len());
        Ok(())
    }

    async fn publish_state(&self, message: Message) -> Result<()> {
        info!("{} {}", message.topic, message.payload);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub type SharedPublisher = Arc<dyn Publisher>;

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_test::traced_test;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
    }

    #[test]
    fn test_options_carry_will_and_credentials() {
        let config = MqttConfig {
            username: Some("meters".into()),
            password: Some("secret".into()),
            keepalive: 1,
            qos: 1,
            ..MqttConfig::default()
        };
        let options = mqtt_options(&config).unwrap();

        assert_eq!(options.client_id(), "meters-poller");
        assert_eq!(
            options.broker_address(),
            ("127.0.0.1".to_string(), 1883)
        );
        assert_eq!(options.keep_alive(), MIN_KEEP_ALIVE);
        assert_eq!(
            options.credentials(),
            Some(("meters".to_string(), "secret".to_string()))
        );

        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "energy/status");
        assert_eq!(&will.message[..], STATUS_OFFLINE.as_bytes());
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_tls_requires_cert_and_key_together() {
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();

        let tls = TlsConfig {
            enabled: true,
            ca_certs: Some(ca.path().to_path_buf()),
            certfile: Some(ca.path().to_path_buf()),
            keyfile: None,
        };
        assert!(matches!(
            tls_transport(&tls),
            Err(MeterdError::MqttError(_))
        ));

        let tls = TlsConfig {
            certfile: None,
            ..tls
        };
        assert!(matches!(tls_transport(&tls), Ok(Transport::Tls(_))));
    }

    #[test]
    fn test_missing_ca_file_is_reported() {
        let tls = TlsConfig {
            enabled: true,
            ca_certs: Some("/nonexistent/meterd-ca.pem".into()),
            certfile: None,
            keyfile: None,
        };
        let err = tls_transport(&tls).err().unwrap();
        assert!(err.to_string().contains("meterd-ca.pem"));
    }

    // ========== Unreachable broker tests ==========

    #[tokio::test]
    #[traced_test]
    async fn test_broker_down_never_blocks() {
        let config = MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..MqttConfig::default()
        };
        let publisher = MqttPublisher::connect(&config).unwrap();
        let configs: Vec<Message> = (0..100)
            .map(|i| Message::new(format!("homeassistant/sensor/m_{}/config", i), "{}", true))
            .collect();

        tokio::time::timeout(Duration::from_secs(5), async {
            publisher.announce(configs).await.unwrap();
            publisher
                .publish_state(Message::new("energy/boiler/state", "{}", false))
                .await
                .unwrap();
            publisher.shutdown().await.unwrap();
        })
        .await
        .expect("publisher blocked while the broker is down");

        assert!(logs_contain("MQTT queue full"));
    }
}
