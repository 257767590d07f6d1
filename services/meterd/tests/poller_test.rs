#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

//! Poll loop against simulated buses

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meter_protocols::simulator::{SimulatedBus, SimulatedMeter};
use meter_protocols::{Connect, ProfileRegistry, RegisterBank, TransportError, UnitId};
use meterd::config::{BusSpec, DeviceConfig, MeterdConfig, Protocol, TcpOverrides};
use meterd::link::SimulatedConnector;
use meterd::publisher::{Message, Publisher};
use meterd::{Poller, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingPublisher {
    announced: Mutex<Vec<Message>>,
    states: Mutex<Vec<Message>>,
    /// Cancelled after the first state is published
    cancel_after_first: Option<CancellationToken>,
}

impl RecordingPublisher {
    fn states(&self) -> Vec<Message> {
        self.states.lock().clone()
    }

    fn state_for(&self, topic: &str) -> Value {
        let states = self.states.lock();
        let message = states.iter().find(|m| m.topic == topic).unwrap();
        serde_json::from_str(&message.payload).unwrap()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn announce(&self, messages: Vec<Message>) -> Result<()> {
        self.announced.lock().extend(messages);
        Ok(())
    }

    async fn publish_state(&self, message: Message) -> Result<()> {
        self.states.lock().push(message);
        if let Some(cancel) = &self.cancel_after_first {
            cancel.cancel();
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

fn rtu_device(id: u8, device_type: &str, name: &str) -> DeviceConfig {
    DeviceConfig {
        id,
        device_type: device_type.into(),
        name: Some(name.into()),
        protocol: Protocol::Rtu,
        tcp: None,
        write_order: None,
    }
}

fn tcp_device(id: u8, host: &str, name: &str) -> DeviceConfig {
    DeviceConfig {
        protocol: Protocol::Tcp,
        tcp: Some(TcpOverrides {
            host: Some(host.into()),
            port: None,
            timeout: None,
        }),
        ..rtu_device(id, "sdm230", name)
    }
}

fn unit(id: u16) -> UnitId {
    UnitId::new(id).unwrap()
}

fn base_config(devices: Vec<DeviceConfig>) -> MeterdConfig {
    let mut config = MeterdConfig::default();
    config.devices = devices;
    config.polling.per_measure_delay_ms = 0;
    config
}

/// One simulated bus per bus key
fn simulated(buses: Vec<(&'static str, SimulatedBus)>) -> impl Fn(&BusSpec) -> Box<dyn Connect> {
    move |bus_spec: &BusSpec| {
        let key = bus_spec.key();
        let bus = buses
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, bus)| bus.clone())
            .unwrap_or_default();
        Box::new(SimulatedConnector { bus, name: key }) as Box<dyn Connect>
    }
}

// ========== Payload tests ==========

#[tokio::test]
async fn test_state_payload_per_device() {
    let rtu = SimulatedBus::new();
    rtu.add_meter(unit(1), SimulatedMeter::dds661());
    rtu.add_meter(unit(2), SimulatedMeter::sdm230());

    let config = base_config(vec![
        rtu_device(1, "dds661", "Main DDS"),
        rtu_device(2, "sdm230", "PV Import/Export"),
    ]);
    let publisher = Arc::new(RecordingPublisher::default());
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        publisher.clone(),
        simulated(vec![("rtu:/dev/ttyCOM1", rtu)]),
    )
    .unwrap();
    assert_eq!(poller.bus_count(), 1);

    let summary = poller.poll_once(&CancellationToken::new()).await;
    assert_eq!(summary.published, 2);
    assert_eq!(summary.unreachable, 0);

    let main = publisher.state_for("energy/main-dds/state");
    assert_eq!(main["id"], 1);
    assert_eq!(main["type"], "dds661");
    assert_eq!(main["name"], "Main DDS");
    assert_eq!(main["voltage"].as_f64(), Some(f64::from(230.1f32)));
    assert_eq!(main["e_total"].as_f64(), Some(1536.0));
    assert_eq!(main["e_rev"].as_f64(), Some(0.0));

    let pv = publisher.state_for("energy/pv-import-export/state");
    assert_eq!(pv["type"], "sdm230");
    assert_eq!(pv["p_active"].as_f64(), Some(1020.0));
    assert_eq!(pv["e_total"].as_f64(), Some(815.75));

    assert!(publisher.states().iter().all(|m| m.retain));
}

#[tokio::test]
async fn test_failed_and_implausible_fields_publish_null() {
    let rtu = SimulatedBus::new();
    rtu.add_meter(
        unit(1),
        SimulatedMeter::dds661().with_float(RegisterBank::Input, 0x0036, f32::NAN),
    );
    rtu.fail_read(
        unit(1),
        RegisterBank::Input,
        0x0103,
        TransportError::exception("IllegalDataAddress"),
    );

    let config = base_config(vec![rtu_device(1, "dds661", "Main")]);
    let publisher = Arc::new(RecordingPublisher::default());
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        publisher.clone(),
        simulated(vec![("rtu:/dev/ttyCOM1", rtu)]),
    )
    .unwrap();
    poller.poll_once(&CancellationToken::new()).await;

    let state = publisher.state_for("energy/main/state");
    assert_eq!(state["freq"], Value::Null);
    assert_eq!(state["e_rev"], Value::Null);
    assert_eq!(state["e_pos"].as_f64(), Some(1536.0));
    assert_eq!(state["voltage"].as_f64(), Some(f64::from(230.1f32)));
}

#[tokio::test]
async fn test_silent_meter_publishes_nulls_and_others_continue() {
    let rtu = SimulatedBus::new();
    rtu.add_meter(unit(2), SimulatedMeter::dds661());

    let config = base_config(vec![
        rtu_device(1, "dds661", "Missing"),
        rtu_device(2, "dds661", "Present"),
    ]);
    let publisher = Arc::new(RecordingPublisher::default());
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        publisher.clone(),
        simulated(vec![("rtu:/dev/ttyCOM1", rtu)]),
    )
    .unwrap();

    let summary = poller.poll_once(&CancellationToken::new()).await;
    assert_eq!(summary.published, 2);
    assert_eq!(summary.unreachable, 1);

    let missing = publisher.state_for("energy/missing/state");
    assert_eq!(missing["voltage"], Value::Null);
    let present = publisher.state_for("energy/present/state");
    assert_eq!(present["freq"].as_f64(), Some(50.0));
}

// ========== Bus scheduling tests ==========

#[tokio::test(start_paused = true)]
async fn test_devices_on_one_bus_never_overlap() {
    let rtu = SimulatedBus::new();
    rtu.set_latency(Duration::from_millis(10));
    for id in 1..=3 {
        rtu.add_meter(unit(id), SimulatedMeter::dds661());
    }

    let config = base_config(vec![
        rtu_device(1, "dds661", "A"),
        rtu_device(2, "dds661", "B"),
        rtu_device(3, "dds661", "C"),
    ]);
    let publisher = Arc::new(RecordingPublisher::default());
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        publisher.clone(),
        simulated(vec![("rtu:/dev/ttyCOM1", rtu.clone())]),
    )
    .unwrap();
    poller.poll_once(&CancellationToken::new()).await;

    assert_eq!(rtu.max_in_flight(), 1);
    let calls = rtu.calls();
    let order: Vec<u8> = calls.iter().map(|c| c.unit.value()).collect();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted, "devices must be read in configuration order");

    let names: Vec<String> = publisher
        .states()
        .iter()
        .map(|m| m.topic.clone())
        .collect();
    assert_eq!(
        names,
        ["energy/a/state", "energy/b/state", "energy/c/state"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_inter_device_delay() {
    let rtu = SimulatedBus::new();
    rtu.add_meter(unit(1), SimulatedMeter::dds661());
    rtu.add_meter(unit(2), SimulatedMeter::dds661());

    let mut config = base_config(vec![rtu_device(1, "dds661", "A"), rtu_device(2, "dds661", "B")]);
    config.polling.delay_ms_between_devices = 200;
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        Arc::new(RecordingPublisher::default()),
        simulated(vec![("rtu:/dev/ttyCOM1", rtu.clone())]),
    )
    .unwrap();
    poller.poll_once(&CancellationToken::new()).await;

    let calls = rtu.calls();
    let last_a = calls.iter().filter(|c| c.unit == unit(1)).map(|c| c.finished).max().unwrap();
    let first_b = calls.iter().filter(|c| c.unit == unit(2)).map(|c| c.started).min().unwrap();
    assert!(first_b - last_a >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_separate_buses_run_concurrently() {
    let rtu = SimulatedBus::new();
    rtu.set_latency(Duration::from_millis(50));
    rtu.add_meter(unit(1), SimulatedMeter::dds661());

    let tcp = SimulatedBus::new();
    tcp.set_latency(Duration::from_millis(50));
    tcp.add_meter(UnitId::tcp(1), SimulatedMeter::sdm230());

    let config = base_config(vec![
        rtu_device(1, "dds661", "Serial"),
        tcp_device(1, "10.0.0.7", "Network"),
    ]);
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        Arc::new(RecordingPublisher::default()),
        simulated(vec![
            ("rtu:/dev/ttyCOM1", rtu.clone()),
            ("tcp:10.0.0.7:502", tcp.clone()),
        ]),
    )
    .unwrap();
    assert_eq!(poller.bus_count(), 2);

    let started = tokio::time::Instant::now();
    poller.poll_once(&CancellationToken::new()).await;
    let elapsed = started.elapsed();

    // 8 sequential reads per bus at 50ms each; run back to back this would be 800ms
    assert!(elapsed < Duration::from_millis(800), "elapsed {:?}", elapsed);
    assert_eq!(rtu.calls().len(), 8);
    assert_eq!(tcp.calls().len(), 8);
}

// ========== Lifecycle tests ==========

#[tokio::test]
async fn test_cancel_stops_between_devices() {
    let rtu = SimulatedBus::new();
    rtu.add_meter(unit(1), SimulatedMeter::dds661());
    rtu.add_meter(unit(2), SimulatedMeter::dds661());

    let cancel = CancellationToken::new();
    let publisher = Arc::new(RecordingPublisher {
        cancel_after_first: Some(cancel.clone()),
        ..RecordingPublisher::default()
    });

    let config = base_config(vec![rtu_device(1, "dds661", "A"), rtu_device(2, "dds661", "B")]);
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        publisher.clone(),
        simulated(vec![("rtu:/dev/ttyCOM1", rtu.clone())]),
    )
    .unwrap();

    let summary = poller.poll_once(&cancel).await;
    assert_eq!(summary.published, 1);
    assert_eq!(summary.skipped, 1);
    assert!(rtu.calls().iter().all(|c| c.unit == unit(1)));
}

#[tokio::test]
async fn test_oneshot_announces_then_polls_once() {
    let rtu = SimulatedBus::new();
    rtu.add_meter(unit(5), SimulatedMeter::sdm230());

    let mut config = base_config(vec![rtu_device(5, "sdm230", "PV")]);
    config.home_assistant.enabled = true;
    let publisher = Arc::new(RecordingPublisher::default());
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        publisher.clone(),
        simulated(vec![("rtu:/dev/ttyCOM1", rtu)]),
    )
    .unwrap();

    poller.run(CancellationToken::new(), true).await.unwrap();

    let announced = publisher.announced.lock().clone();
    assert_eq!(announced.len(), 8);
    assert!(announced
        .iter()
        .any(|m| m.topic == "homeassistant/sensor/sdm230_5_voltage/config"));
    assert_eq!(publisher.states().len(), 1);
}

#[tokio::test]
async fn test_run_returns_when_cancelled() {
    let config = base_config(vec![rtu_device(1, "dds661", "A")]);
    let publisher = Arc::new(RecordingPublisher::default());
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        publisher.clone(),
        simulated(vec![]),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    poller.run(cancel, false).await.unwrap();
    assert!(publisher.states().is_empty());
    assert!(publisher.announced.lock().is_empty());
}

#[tokio::test]
async fn test_connection_loss_reconnects_next_cycle() {
    let rtu = SimulatedBus::new();
    rtu.add_meter(unit(1), SimulatedMeter::dds661());
    rtu.fail_read(
        unit(1),
        RegisterBank::Input,
        0x0000,
        TransportError::connection_lost("broken pipe"),
    );

    let config = base_config(vec![rtu_device(1, "dds661", "A")]);
    let publisher = Arc::new(RecordingPublisher::default());
    let poller = Poller::new(
        &config,
        &ProfileRegistry::builtin(),
        publisher.clone(),
        simulated(vec![("rtu:/dev/ttyCOM1", rtu.clone())]),
    )
    .unwrap();

    let first = poller.poll_once(&CancellationToken::new()).await;
    assert_eq!(first.unreachable, 1);
    assert_eq!(rtu.calls().len(), 1);

    rtu.clear_faults();
    let second = poller.poll_once(&CancellationToken::new()).await;
    assert_eq!(second.unreachable, 0);
    let state = &publisher.states()[1];
    let payload: Value = serde_json::from_str(&state.payload).unwrap();
    assert_eq!(payload["voltage"].as_f64(), Some(f64::from(230.1f32)));
}
