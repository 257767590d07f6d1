//! Connectors that open the physical links named by a [`BusSpec`]

use std::time::Duration;

use async_trait::async_trait;
use meter_protocols::simulator::SimulatedBus;
use meter_protocols::transport::modbus::ModbusTransport;
use meter_protocols::{BoxedTransport, Connect, SerialSettings, TransportError};

use crate::config::{BusSpec, TcpEndpoint};

/// Serial port with an RTU client
#[derive(Debug, Clone)]
pub struct RtuConnector {
    pub settings: SerialSettings,
    pub timeout: Duration,
}

#[async_trait]
impl Connect for RtuConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        let transport = ModbusTransport::open_rtu(&self.settings, self.timeout)?;
        Ok(Box::new(transport))
    }

    fn endpoint(&self) -> String {
        self.settings.to_string()
    }
}

/// Modbus TCP socket
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub endpoint: TcpEndpoint,
}

#[async_trait]
impl Connect for TcpConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        let transport =
            ModbusTransport::connect_tcp(&self.endpoint.address(), self.endpoint.timeout).await?;
        Ok(Box::new(transport))
    }

    fn endpoint(&self) -> String {
        self.endpoint.address()
    }
}

/// In-memory bus; every connect hands out a handle to the same meters
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    pub bus: SimulatedBus,
    pub name: String,
}

#[async_trait]
impl Connect for SimulatedConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        Ok(Box::new(self.bus.clone()))
    }

    fn endpoint(&self) -> String {
        format!("simulated {}", self.name)
    }
}

/// Hardware connector for a bus
pub fn connector_for(bus_spec: &BusSpec) -> Box<dyn Connect> {
    match bus_spec {
        BusSpec::Rtu { settings, timeout } => Box::new(RtuConnector {
            settings: settings.clone(),
            timeout: *timeout,
        }),
        BusSpec::Tcp(endpoint) => Box::new(TcpConnector {
            endpoint: endpoint.clone(),
        }),
    }
}
