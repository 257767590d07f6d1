//! Periodic polling of every configured meter
//!
//! Devices are grouped by the link they are reached through. Groups run
//! concurrently; inside a group devices are read one at a time in
//! configuration order while holding the bus lock for the whole device.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use meter_protocols::{
    BusLink, Connect, DeviceProfile, MeasurementSnapshot, MeterSession, PacingConfig,
    ProfileRegistry, Reading, RegisterBank, SharedBus, UnitId,
};
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BusSpec, DeviceConfig, MeterdConfig};
use crate::discovery::{device_discovery, state_topic};
use crate::error::Result;
use crate::publisher::{Message, SharedPublisher};

/// A configured device resolved against its profile
#[derive(Debug, Clone)]
pub struct DeviceTarget {
    pub id: u8,
    pub unit: UnitId,
    pub device_type: String,
    pub name: String,
    pub topic: String,
    pub profile: Arc<DeviceProfile>,
}

impl DeviceTarget {
    pub fn resolve(
        config: &MeterdConfig,
        device: &DeviceConfig,
        registry: &ProfileRegistry,
    ) -> Result<Self> {
        let mut profile = registry.get(&device.model())?;
        if let Some(order) = &device.write_order {
            profile = Arc::new(profile.with_write_order(order.as_slice())?);
        }
        let name = device.display_name();
        Ok(Self {
            id: device.id,
            unit: device.unit()?,
            device_type: device.model(),
            topic: state_topic(&config.mqtt.base_topic, &name, device.id),
            name,
            profile,
        })
    }
}

struct BusGroup {
    bus: SharedBus<BusLink>,
    devices: Vec<DeviceTarget>,
}

/// Counters for one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Devices whose state was published
    pub published: usize,
    /// Devices that produced no valid value at all
    pub unreachable: usize,
    /// Devices left out because the cycle was cancelled
    pub skipped: usize,
}

impl CycleSummary {
    fn merge(self, other: Self) -> Self {
        Self {
            published: self.published + other.published,
            unreachable: self.unreachable + other.unreachable,
            skipped: self.skipped + other.skipped,
        }
    }
}

pub struct Poller {
    groups: Vec<BusGroup>,
    publisher: SharedPublisher,
    pacing: PacingConfig,
    period: Duration,
    device_delay: Duration,
    publish_implausible: bool,
    debug_log: bool,
    retain: bool,
    discovery: Vec<Message>,
}

impl Poller {
    /// Resolve devices and build one bus per distinct link
    ///
    /// `connector` opens the link for a bus; pass [`crate::link::connector_for`]
    /// for real hardware.
    pub fn new<F>(
        config: &MeterdConfig,
        registry: &ProfileRegistry,
        publisher: SharedPublisher,
        connector: F,
    ) -> Result<Self>
    where
        F: Fn(&BusSpec) -> Box<dyn Connect>,
    {
        let mut groups: Vec<(String, BusGroup)> = Vec::new();
        let mut discovery = Vec::new();

        for device in &config.devices {
            let target = DeviceTarget::resolve(config, device, registry)?;
            if config.home_assistant.enabled {
                discovery.extend(device_discovery(
                    &config.home_assistant,
                    &config.mqtt,
                    device,
                    &target.profile,
                ));
            }

            let bus_spec = config.bus_spec(device);
            let key = bus_spec.key();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.devices.push(target),
                None => {
                    info!("Bus {} for device {}", bus_spec, target.name);
                    let bus =
                        SharedBus::new(bus_spec.to_string(), BusLink::new(connector(&bus_spec)));
                    groups.push((
                        key,
                        BusGroup {
                            bus,
                            devices: vec![target],
                        },
                    ));
                },
            }
        }

        Ok(Self {
            groups: groups.into_iter().map(|(_, group)| group).collect(),
            publisher,
            pacing: config.polling.pacing(),
            period: config.polling.period(),
            device_delay: config.polling.device_delay(),
            publish_implausible: config.polling.publish_implausible,
            debug_log: config.polling.debug_log,
            retain: config.mqtt.retain,
            discovery,
        })
    }

    pub fn bus_count(&self) -> usize {
        self.groups.len()
    }

    pub fn device_count(&self) -> usize {
        self.groups.iter().map(|g| g.devices.len()).sum()
    }

    pub fn discovery_messages(&self) -> &[Message] {
        &self.discovery
    }

    /// Announce discovery, then poll every period until cancelled
    pub async fn run(&self, cancel: CancellationToken, oneshot: bool) -> Result<()> {
        if !self.discovery.is_empty() {
            self.publisher.announce(self.discovery.clone()).await?;
        }

        info!(
            "Polling {} devices on {} buses every {:?}",
            self.device_count(),
            self.bus_count(),
            self.period
        );

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            let summary = self.poll_once(&cancel).await;
            debug!(
                "Cycle done: {} published, {} unreachable, {} skipped",
                summary.published, summary.unreachable, summary.skipped
            );

            if oneshot {
                break;
            }
        }

        info!("Poller stopped");
        Ok(())
    }

    /// One pass over every bus
    pub async fn poll_once(&self, cancel: &CancellationToken) -> CycleSummary {
        join_all(self.groups.iter().map(|group| self.poll_bus(group, cancel)))
            .await
            .into_iter()
            .fold(CycleSummary::default(), CycleSummary::merge)
    }

    async fn poll_bus(&self, group: &BusGroup, cancel: &CancellationToken) -> CycleSummary {
        let mut summary = CycleSummary::default();

        for (index, target) in group.devices.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.skipped = group.devices.len() - index;
                debug!("Bus {}: cycle cancelled", group.bus.name());
                break;
            }

            let snapshot = {
                let mut link = group.bus.lock().await;
                self.read_device(&mut link, target).await
            };

            if snapshot.as_ref().map_or(true, |s| s.valid_count() == 0) {
                summary.unreachable += 1;
            }
            if self.debug_log {
                info!("{}", describe(target, snapshot.as_ref()));
            }

            let payload = state_payload(target, snapshot.as_ref(), self.publish_implausible);
            let message = Message::new(target.topic.clone(), payload.to_string(), self.retain);
            match self.publisher.publish_state(message).await {
                Ok(()) => summary.published += 1,
                Err(e) => warn!("Publish for {} failed: {}", target.name, e),
            }

            if !self.device_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {},
                    _ = tokio::time::sleep(self.device_delay) => {},
                }
            }
        }

        summary
    }

    /// `None` when the link could not be opened
    async fn read_device(
        &self,
        link: &mut BusLink,
        target: &DeviceTarget,
    ) -> Option<MeasurementSnapshot> {
        let snapshot = {
            let transport = match link.transport().await {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("{}: link unavailable: {}", target.name, e);
                    return None;
                },
            };
            let mut session =
                MeterSession::new(transport, target.unit, &target.profile, &self.pacing);
            session.read_measurements().await
        };

        if let Some(e) = snapshot.fatal() {
            warn!("{}: {}; reconnecting next cycle", target.name, e);
            link.drop_connection();
        }
        Some(snapshot)
    }
}

/// JSON value for one field; anything without a trustworthy number is null
pub fn field_value(reading: Option<&Reading>, publish_implausible: bool) -> Value {
    let value = match reading {
        Some(Reading::Valid(v)) => Some(*v),
        Some(Reading::Implausible(v)) if publish_implausible => Some(*v),
        _ => None,
    };
    value
        .map(f64::from)
        .and_then(serde_json::Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

/// State document: identity plus every measurement of the profile
pub fn state_payload(
    target: &DeviceTarget,
    snapshot: Option<&MeasurementSnapshot>,
    publish_implausible: bool,
) -> Value {
    let mut doc = Map::new();
    doc.insert("id".into(), Value::from(target.id));
    doc.insert("type".into(), Value::from(target.device_type.as_str()));
    doc.insert("name".into(), Value::from(target.name.as_str()));

    for field in target.profile.fields_for_bank(RegisterBank::Input) {
        let reading = snapshot.and_then(|s| s.get(&field.name));
        if let Some(Reading::Implausible(v)) = reading {
            if !publish_implausible {
                warn!(
                    "{}: {} = {} outside plausible range, publishing null",
                    target.name, field.name, v
                );
            }
        }
        doc.insert(field.name.clone(), field_value(reading, publish_implausible));
    }

    Value::Object(doc)
}

fn describe(target: &DeviceTarget, snapshot: Option<&MeasurementSnapshot>) -> String {
    let Some(snapshot) = snapshot else {
        return format!("[{}] unreachable", target.name);
    };
    let fields: Vec<String> = target
        .profile
        .fields_for_bank(RegisterBank::Input)
        .into_iter()
        .map(|field| match snapshot.get(&field.name) {
            Some(reading) => format!("{}={}{}", field.name, reading, field.unit),
            None => format!("{}=?", field.name),
        })
        .collect();
    format!("[{}] {}", target.name, fields.join(" "))
}
