//! Poller configuration
//!
//! One YAML file with `serial`, `tcp`, `mqtt`, `home_assistant`, `polling`,
//! `logging` and `devices` sections. Every key has a default; environment
//! variables prefixed `METERD_` override file values, with `__` separating
//! nesting levels (`METERD_MQTT__HOST=broker.lan`).

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::LogConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use meter_protocols::sequencer::MAX_READ_REGISTERS;
use meter_protocols::{
    BatchLimits, PacingConfig, Parity, ProfileRegistry, ReadMode, SerialSettings, UnitId,
};
use serde::{Deserialize, Serialize};

use crate::error::{MeterdError, Result};

// ============================================================================
// Serial line
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// Reply timeout in seconds
    #[serde(default = "default_timeout_s")]
    pub timeout: f64,
}

fn default_serial_port() -> String {
    "/dev/ttyCOM1".to_string()
}

fn default_baudrate() -> u32 {
    9600
}

fn default_stopbits() -> u8 {
    1
}

fn default_bytesize() -> u8 {
    8
}

fn default_timeout_s() -> f64 {
    1.0
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baudrate: default_baudrate(),
            parity: Parity::default(),
            stopbits: default_stopbits(),
            bytesize: default_bytesize(),
            timeout: default_timeout_s(),
        }
    }
}

impl SerialConfig {
    pub fn settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baudrate,
            parity: self.parity,
            stop_bits: self.stopbits,
            data_bits: self.bytesize,
        }
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout)
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::from_secs(1))
}

// ============================================================================
// Modbus TCP
// ============================================================================

/// TCP settings; the global section supplies defaults for per-device overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

pub const DEFAULT_TCP_HOST: &str = "192.168.0.99";
pub const DEFAULT_TCP_PORT: u16 = 502;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl TcpEndpoint {
    /// Device values win over the global section, then the built-in defaults
    pub fn resolve(global: &TcpOverrides, device: Option<&TcpOverrides>) -> Self {
        let pick_host = device
            .and_then(|d| d.host.clone())
            .or_else(|| global.host.clone());
        let pick_port = device.and_then(|d| d.port).or(global.port);
        let pick_timeout = device.and_then(|d| d.timeout).or(global.timeout);
        Self {
            host: pick_host.unwrap_or_else(|| DEFAULT_TCP_HOST.to_string()),
            port: pick_port.unwrap_or(DEFAULT_TCP_PORT),
            timeout: seconds(pick_timeout.unwrap_or_else(default_timeout_s)),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// MQTT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// CA bundle; the platform root store is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certs: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_true")]
    pub retain: bool,
    /// Seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "meters-poller".to_string()
}

fn default_base_topic() -> String {
    "energy".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keepalive() -> u64 {
    60
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            base_topic: default_base_topic(),
            qos: 0,
            retain: true,
            keepalive: default_keepalive(),
            username: None,
            password: None,
            tls: TlsConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Availability topic carrying "online" / "offline"
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.base_topic)
    }
}

// ============================================================================
// Home Assistant
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery_prefix: default_discovery_prefix(),
            area: None,
        }
    }
}

// ============================================================================
// Polling
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub read_mode: ReadMode,
    #[serde(default = "default_per_measure_delay_ms")]
    pub per_measure_delay_ms: u64,
    #[serde(default)]
    pub delay_ms_between_devices: u64,
    /// Cycle period in seconds
    #[serde(default = "default_period_s")]
    pub period_s: f64,
    /// Dump every device's measurements at info level
    #[serde(default)]
    pub debug_log: bool,
    /// Publish values outside the plausible range instead of null
    #[serde(default)]
    pub publish_implausible: bool,
    /// Bulk mode: largest address gap merged into one request
    #[serde(default = "default_max_gap")]
    pub max_gap: u16,
    /// Bulk mode: largest request
    #[serde(default = "default_max_batch_registers")]
    pub max_batch_registers: u16,
}

fn default_per_measure_delay_ms() -> u64 {
    50
}

fn default_period_s() -> f64 {
    5.0
}

fn default_max_gap() -> u16 {
    BatchLimits::default().max_gap
}

fn default_max_batch_registers() -> u16 {
    BatchLimits::default().max_registers
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            read_mode: ReadMode::default(),
            per_measure_delay_ms: default_per_measure_delay_ms(),
            delay_ms_between_devices: 0,
            period_s: default_period_s(),
            debug_log: false,
            publish_implausible: false,
            max_gap: default_max_gap(),
            max_batch_registers: default_max_batch_registers(),
        }
    }
}

impl PollingConfig {
    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            read_mode: self.read_mode,
            per_field_delay: Duration::from_millis(self.per_measure_delay_ms),
            batch: BatchLimits {
                max_registers: self.max_batch_registers,
                max_gap: self.max_gap,
            },
        }
    }

    pub fn period(&self) -> Duration {
        seconds(self.period_s)
    }

    pub fn device_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms_between_devices)
    }
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Rtu,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Modbus unit id
    pub id: u8,
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpOverrides>,
    /// Replaces the profile's parameter write order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_order: Option<Vec<String>>,
}

fn default_device_type() -> String {
    "dds661".to_string()
}

impl DeviceConfig {
    pub fn model(&self) -> String {
        self.device_type.trim().to_lowercase()
    }

    /// Configured name, or "<TYPE> <id>"
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{} {}", self.model().to_uppercase(), self.id),
        }
    }

    pub fn unit(&self) -> Result<UnitId> {
        match self.protocol {
            Protocol::Rtu => Ok(UnitId::new(self.id as u16)?),
            Protocol::Tcp => Ok(UnitId::tcp(self.id)),
        }
    }
}

/// Physical link a device is reached through
#[derive(Debug, Clone, PartialEq)]
pub enum BusSpec {
    Rtu {
        settings: SerialSettings,
        timeout: Duration,
    },
    Tcp(TcpEndpoint),
}

impl BusSpec {
    /// Devices with the same key share one link and are polled one at a time
    pub fn key(&self) -> String {
        match self {
            Self::Rtu { settings, .. } => format!("rtu:{}", settings.port),
            Self::Tcp(endpoint) => format!("tcp:{}", endpoint.address()),
        }
    }
}

impl fmt::Display for BusSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtu { settings, .. } => write!(f, "RTU {}", settings),
            Self::Tcp(endpoint) => write!(f, "TCP {}", endpoint.address()),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterdConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub tcp: TcpOverrides,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub home_assistant: HomeAssistantConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

pub const ENV_PREFIX: &str = "METERD_";

impl MeterdConfig {
    /// Load defaults, then the YAML file, then `METERD_*` variables
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MeterdError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        Self::figment(path).extract().map_err(MeterdError::from)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(MeterdConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn bus_spec(&self, device: &DeviceConfig) -> BusSpec {
        match device.protocol {
            Protocol::Rtu => BusSpec::Rtu {
                settings: self.serial.settings(),
                timeout: self.serial.timeout(),
            },
            Protocol::Tcp => BusSpec::Tcp(TcpEndpoint::resolve(&self.tcp, device.tcp.as_ref())),
        }
    }

    /// Device whose unit id matches, first match wins
    pub fn device(&self, id: u8) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Reject configurations the poller cannot run
    pub fn validate(&self, registry: &ProfileRegistry) -> Result<()> {
        if self.mqtt.qos > 2 {
            return Err(MeterdError::config(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        if self.mqtt.base_topic.trim().is_empty() {
            return Err(MeterdError::config("mqtt.base_topic cannot be empty"));
        }
        if !(self.polling.period_s.is_finite() && self.polling.period_s > 0.0) {
            return Err(MeterdError::config(format!(
                "polling.period_s must be positive, got {}",
                self.polling.period_s
            )));
        }
        if self.polling.max_batch_registers == 0
            || self.polling.max_batch_registers > MAX_READ_REGISTERS
        {
            return Err(MeterdError::config(format!(
                "polling.max_batch_registers must be 1..={}, got {}",
                MAX_READ_REGISTERS, self.polling.max_batch_registers
            )));
        }
        if self.serial.timeout <= 0.0 || !self.serial.timeout.is_finite() {
            return Err(MeterdError::config("serial.timeout must be positive"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            let profile = registry.get(&device.model()).map_err(|_| {
                MeterdError::config(format!(
                    "Device {}: unsupported type '{}' (known: {})",
                    device.id,
                    device.device_type,
                    registry.models().collect::<Vec<_>>().join(", ")
                ))
            })?;
            device.unit().map_err(|e| {
                MeterdError::config(format!("Device {}: {}", device.id, e))
            })?;
            if let Some(order) = &device.write_order {
                profile.with_write_order(order.as_slice()).map_err(|e| {
                    MeterdError::config(format!("Device {}: {}", device.id, e))
                })?;
            }
            let bus = self.bus_spec(device).key();
            if !seen.insert((bus.clone(), device.id)) {
                return Err(MeterdError::config(format!(
                    "Device id {} appears twice on {}",
                    device.id, bus
                )));
            }
        }
        Ok(())
    }
}
