//! Which meter to talk to, and over what

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use meter_protocols::simulator::{SimulatedBus, SimulatedMeter};
use meter_protocols::{Connect, DeviceProfile, Parity, ProfileRegistry, UnitId};
use meterd::config::{BusSpec, MeterdConfig, Protocol, SerialConfig, TcpEndpoint, DEFAULT_TCP_PORT};
use meterd::link::{connector_for, SimulatedConnector};

/// Link and device selection; command-line values win over the config file
#[derive(Args, Debug, Clone, Default)]
pub struct LinkArgs {
    /// Serial port
    #[arg(long, global = true)]
    pub port: Option<String>,

    #[arg(long, global = true)]
    pub baudrate: Option<u32>,

    /// E, O or N
    #[arg(long, global = true)]
    pub parity: Option<Parity>,

    #[arg(long, global = true)]
    pub stopbits: Option<u8>,

    #[arg(long, global = true)]
    pub bytesize: Option<u8>,

    /// Reply timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<f64>,

    /// Use Modbus TCP instead of the serial port
    #[arg(long, global = true, value_name = "HOST:PORT")]
    pub tcp: Option<String>,

    /// Current Modbus unit id
    #[arg(long, global = true, default_value_t = 1)]
    pub slave: u8,

    /// Meter type; otherwise taken from the config device with the same id
    #[arg(long = "type", global = true)]
    pub device_type: Option<String>,

    /// Talk to an in-memory meter instead of hardware
    #[arg(long, global = true)]
    pub simulate: bool,
}

/// A fully resolved meter address
#[derive(Debug, Clone)]
pub struct Target {
    pub model: String,
    pub unit: UnitId,
    pub bus: BusSpec,
    pub profile: Arc<DeviceProfile>,
}

impl Target {
    pub fn resolve(
        args: &LinkArgs,
        config: Option<&MeterdConfig>,
        registry: &ProfileRegistry,
    ) -> Result<Self> {
        let device = config.and_then(|c| c.device(args.slave));
        let model = resolve_type(args, config);
        let mut profile = registry.get(&model)?;
        if let Some(order) = device.and_then(|d| d.write_order.as_ref()) {
            profile = Arc::new(profile.with_write_order(order.as_slice())?);
        }

        let timeout = args
            .timeout
            .map(seconds)
            .transpose()?;

        let bus = match (&args.tcp, config, device) {
            (Some(address), _, _) => BusSpec::Tcp(parse_tcp(address, timeout)?),
            (None, Some(config), Some(device))
                if device.protocol == Protocol::Tcp && args.port.is_none() =>
            {
                match config.bus_spec(device) {
                    BusSpec::Tcp(mut endpoint) => {
                        if let Some(timeout) = timeout {
                            endpoint.timeout = timeout;
                        }
                        BusSpec::Tcp(endpoint)
                    },
                    rtu => rtu,
                }
            },
            _ => serial_bus(args, config.map(|c| &c.serial), timeout),
        };

        let unit = match bus {
            BusSpec::Tcp(_) => UnitId::tcp(args.slave),
            BusSpec::Rtu { .. } => UnitId::new(args.slave.into())?,
        };

        Ok(Self {
            model,
            unit,
            bus,
            profile,
        })
    }

    /// Hardware connector, or a simulated bus holding one factory-fresh meter
    pub fn connector(&self, simulate: bool) -> Box<dyn Connect> {
        if !simulate {
            return connector_for(&self.bus);
        }
        let bus = SimulatedBus::new();
        let meter = match self.model.as_str() {
            "sdm230" => SimulatedMeter::sdm230(),
            _ => SimulatedMeter::dds661(),
        };
        bus.add_meter(self.unit, meter);
        Box::new(SimulatedConnector {
            bus,
            name: self.bus.to_string(),
        })
    }
}

/// `--type`, else the config device with the same id, else dds661
pub fn resolve_type(args: &LinkArgs, config: Option<&MeterdConfig>) -> String {
    if let Some(model) = &args.device_type {
        return model.trim().to_lowercase();
    }
    config
        .and_then(|c| c.device(args.slave))
        .map(|d| d.model())
        .unwrap_or_else(|| "dds661".to_string())
}

fn seconds(value: f64) -> Result<Duration> {
    if !(value.is_finite() && value > 0.0) {
        bail!("timeout must be a positive number of seconds, got {}", value);
    }
    Ok(Duration::from_secs_f64(value))
}

fn serial_bus(args: &LinkArgs, base: Option<&SerialConfig>, timeout: Option<Duration>) -> BusSpec {
    let base = base.cloned().unwrap_or_default();
    let serial = SerialConfig {
        port: args.port.clone().unwrap_or(base.port),
        baudrate: args.baudrate.unwrap_or(base.baudrate),
        parity: args.parity.unwrap_or(base.parity),
        stopbits: args.stopbits.unwrap_or(base.stopbits),
        bytesize: args.bytesize.unwrap_or(base.bytesize),
        timeout: base.timeout,
    };
    BusSpec::Rtu {
        settings: serial.settings(),
        timeout: timeout.unwrap_or_else(|| serial.timeout()),
    }
}

/// "host:port" or bare "host" (port 502)
fn parse_tcp(address: &str, timeout: Option<Duration>) -> Result<TcpEndpoint> {
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid TCP port in {:?}", address))?;
            (host, port)
        },
        None => (address, DEFAULT_TCP_PORT),
    };
    if host.is_empty() {
        bail!("missing TCP host in {:?}", address);
    }
    Ok(TcpEndpoint {
        host: host.to_string(),
        port,
        timeout: timeout.unwrap_or(Duration::from_secs(1)),
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(yaml: &str) -> MeterdConfig {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        MeterdConfig::load(file.path()).unwrap()
    }

    const CONFIG: &str = r#"
serial:
  port: /dev/ttyUSB0
  baudrate: 4800
  parity: "N"
devices:
  - id: 5
    type: sdm230
    name: PV
  - id: 7
    type: dds661
    protocol: tcp
    tcp:
      host: 10.0.0.9
"#;

    #[test]
    fn test_type_resolution_order() {
        let cfg = config(CONFIG);
        let mut args = LinkArgs {
            slave: 5,
            ..LinkArgs::default()
        };
        assert_eq!(resolve_type(&args, Some(&cfg)), "sdm230");
        assert_eq!(resolve_type(&args, None), "dds661");

        args.device_type = Some("DDS661".into());
        assert_eq!(resolve_type(&args, Some(&cfg)), "dds661");

        args.device_type = None;
        args.slave = 9;
        assert_eq!(resolve_type(&args, Some(&cfg)), "dds661");
    }

    #[test]
    fn test_serial_settings_merge_config_and_flags() {
        let cfg = config(CONFIG);
        let args = LinkArgs {
            slave: 5,
            baudrate: Some(9600),
            ..LinkArgs::default()
        };
        let target = Target::resolve(&args, Some(&cfg), &ProfileRegistry::builtin()).unwrap();
        assert_eq!(target.model, "sdm230");
        match &target.bus {
            BusSpec::Rtu { settings, timeout } => {
                assert_eq!(settings.port, "/dev/ttyUSB0");
                assert_eq!(settings.baud_rate, 9600);
                assert_eq!(settings.parity, Parity::None);
                assert_eq!(*timeout, Duration::from_secs(1));
            },
            other => panic!("expected RTU, got {:?}", other),
        }
    }

    #[test]
    fn test_tcp_from_flag_and_from_config() {
        let args = LinkArgs {
            slave: 0,
            tcp: Some("192.168.1.20:1502".into()),
            ..LinkArgs::default()
        };
        let target = Target::resolve(&args, None, &ProfileRegistry::builtin()).unwrap();
        assert_eq!(target.bus.key(), "tcp:192.168.1.20:1502");
        assert_eq!(target.unit.value(), 0);

        let cfg = config(CONFIG);
        let args = LinkArgs {
            slave: 7,
            ..LinkArgs::default()
        };
        let target = Target::resolve(&args, Some(&cfg), &ProfileRegistry::builtin()).unwrap();
        assert_eq!(target.bus.key(), "tcp:10.0.0.9:502");
    }

    #[test]
    fn test_rejects_bad_input() {
        let registry = ProfileRegistry::builtin();
        let args = LinkArgs {
            slave: 0,
            ..LinkArgs::default()
        };
        assert!(Target::resolve(&args, None, &registry).is_err());

        let args = LinkArgs {
            slave: 1,
            device_type: Some("sdm630".into()),
            ..LinkArgs::default()
        };
        assert!(Target::resolve(&args, None, &registry).is_err());

        let args = LinkArgs {
            slave: 1,
            tcp: Some("host:notaport".into()),
            ..LinkArgs::default()
        };
        assert!(Target::resolve(&args, None, &registry).is_err());
    }
}
