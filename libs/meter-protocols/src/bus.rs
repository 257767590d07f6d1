//! Shared bus ownership
//!
//! Several meters on one RS-485 line share a half-duplex medium. A
//! [`SharedBus`] hands out exclusive access to the link for a whole device
//! cycle, so two sessions on the same bus can never interleave requests.
//! Devices on different buses are polled without coordination.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::BoxedTransport;

/// Named, exclusively lockable link
pub struct SharedBus<T> {
    name: Arc<str>,
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for SharedBus<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedBus<T> {
    pub fn new(name: impl Into<Arc<str>>, link: T) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(link)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for exclusive use of the link; released when the guard drops
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        let guard = self.inner.lock().await;
        debug!("Bus {} acquired", self.name);
        guard
    }
}

impl<T> fmt::Debug for SharedBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBus").field("name", &self.name).finish()
    }
}

/// Opens a transport for a link
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<BoxedTransport, TransportError>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

/// Lazily connected link that reopens after connection loss
pub struct BusLink {
    connector: Box<dyn Connect>,
    active: Option<BoxedTransport>,
}

impl BusLink {
    pub fn new(connector: Box<dyn Connect>) -> Self {
        Self {
            connector,
            active: None,
        }
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// Connected transport, opening it first if needed
    pub async fn transport(&mut self) -> Result<&mut BoxedTransport, TransportError> {
        if self.active.is_none() {
            let transport = self.connector.connect().await.map_err(|e| {
                warn!("Connect to {} failed: {}", self.connector.endpoint(), e);
                e
            })?;
            info!("Link up: {}", self.connector.endpoint());
            self.active = Some(transport);
        }
        self.active.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Forget the transport; the next call reconnects
    pub fn drop_connection(&mut self) {
        if self.active.take().is_some() {
            info!("Link down: {}", self.connector.endpoint());
        }
    }
}

impl fmt::Debug for BusLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusLink")
            .field("endpoint", &self.connector.endpoint())
            .field("connected", &self.active.is_some())
            .finish()
    }
}
