//! The connection facade.
//!
//! [`Connection`] is what callers hold. It resolves attributes by
//! (service, characteristic) UUID against the catalog, checks capabilities,
//! applies the configured operation timeout, and hands everything else to
//! the [`ConnectionStateMachine`].
//!
//! # Example
//!
//! ```
//! use gattlink_core::{Connection, ConnectionConfig, MockLink, MockPeripheral, ServiceCatalogCache};
//! use gattlink_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE};
//! use gattlink_types::PeerId;
//!
//! # #[tokio::main]
//! # async fn main() -> gattlink_core::Result<()> {
//! let (link, events) = MockLink::with_peripheral(MockPeripheral::battery(87));
//! let peer = PeerId::new("AA:BB:CC:DD:EE:FF")?;
//! let connection = Connection::new(peer, link, events, ServiceCatalogCache::new(), ConnectionConfig::default())?;
//!
//! connection.connect().await?;
//! let level = connection.read(BATTERY_SERVICE, BATTERY_LEVEL).await?;
//! assert_eq!(level.as_ref(), &[87]);
//! connection.close();
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use gattlink_types::uuid::CLIENT_CHARACTERISTIC_CONFIGURATION;
use gattlink_types::{
    AttributeCatalog, CharacteristicRef, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
    GattCharacteristic, PeerId, Phy, PhyOptions,
};

use crate::cache::ServiceCatalogCache;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::events::EventReceiver;
use crate::link::{GattLink, LinkEventReceiver, WriteType};
use crate::machine::{ConnectionStateMachine, NotificationReceiver};
use crate::metrics::ConnectionMetricsSummary;
use crate::state::ConnectionState;
use crate::traits::AttributeClient;

/// A connection to one peer.
///
/// Dropping the connection closes it.
#[derive(Debug)]
pub struct Connection {
    machine: ConnectionStateMachine,
}

impl Connection {
    /// Create a connection over `link`, consuming the link's event channel.
    ///
    /// The connection starts `Disconnected`; call [`connect`](Self::connect).
    pub fn new(
        peer: PeerId,
        link: Arc<dyn GattLink>,
        events: LinkEventReceiver,
        cache: ServiceCatalogCache,
        config: ConnectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let machine = ConnectionStateMachine::new(peer, link, cache, config);
        machine.spawn_event_loop(events);
        Ok(Self { machine })
    }

    /// The underlying state machine.
    pub fn machine(&self) -> &ConnectionStateMachine {
        &self.machine
    }

    pub fn peer(&self) -> &PeerId {
        self.machine.peer()
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Stream of state changes, starting with the current state.
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.machine.subscribe_state()
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> EventReceiver {
        self.machine.subscribe_events()
    }

    pub fn catalog(&self) -> Option<Arc<AttributeCatalog>> {
        self.machine.catalog()
    }

    pub fn mtu(&self) -> u16 {
        self.machine.mtu()
    }

    pub fn metrics(&self) -> ConnectionMetricsSummary {
        self.machine.metrics().summary()
    }

    /// Wait until the state satisfies `predicate` and return that state.
    pub async fn wait_for_state<F>(&self, predicate: F) -> Result<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state_stream();
        rx.wait_for(predicate)
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.machine.config().operation_timeout {
            Some(duration) => match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(peer = %self.peer(), operation, ?duration, "Operation timed out");
                    Err(Error::timeout(operation, duration))
                }
            },
            None => fut.await,
        }
    }

    /// Connect and wait until the connection is `Ready`.
    ///
    /// Returns immediately if already ready. Fails with the link or
    /// discovery error if the attempt ends in `Error`; a configured
    /// reconnect policy keeps trying in the background.
    #[tracing::instrument(level = "info", skip_all, fields(peer = %self.peer()))]
    pub async fn connect(&self) -> Result<()> {
        self.machine.connect()?;
        self.with_timeout("connect", self.machine.wait_until_ready())
            .await
    }

    /// Disconnect and wait for the platform to confirm.
    #[tracing::instrument(level = "info", skip_all, fields(peer = %self.peer()))]
    pub async fn disconnect(&self) -> Result<()> {
        self.machine.disconnect()?;
        self.with_timeout(
            "disconnect",
            self.wait_for_state(|s| !s.is_connecting_or_connected()),
        )
        .await?;
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.machine.close();
    }

    /// Drop the cached catalog and rediscover on the live link.
    #[tracing::instrument(level = "info", skip_all, fields(peer = %self.peer()))]
    pub async fn rediscover(&self) -> Result<Arc<AttributeCatalog>> {
        self.with_timeout("rediscover", self.machine.rediscover())
            .await
    }

    fn resolve(
        &self,
        operation: &'static str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(CharacteristicRef, GattCharacteristic)> {
        if self.machine.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let state = self.machine.state();
        let catalog = match (state.is_ready(), self.machine.catalog()) {
            (true, Some(catalog)) => catalog,
            _ => return Err(Error::InvalidState { operation, state }),
        };
        let found = catalog
            .characteristic(&service, &characteristic)
            .cloned()
            .ok_or_else(|| Error::attribute_not_found(service, characteristic))?;
        Ok((CharacteristicRef::new(service, characteristic), found))
    }

    /// Resolve an attribute, rediscovering once if a cached catalog lacks it.
    async fn resolve_fresh(
        &self,
        operation: &'static str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(CharacteristicRef, GattCharacteristic)> {
        match self.resolve(operation, service, characteristic) {
            Err(Error::AttributeNotFound { .. }) if self.machine.catalog_from_cache() => {
                info!(
                    peer = %self.peer(),
                    %service,
                    %characteristic,
                    "Attribute missing from cached catalog, rediscovering"
                );
                self.machine.rediscover().await?;
                self.resolve(operation, service, characteristic)
            }
            other => other,
        }
    }

    fn require(
        target: CharacteristicRef,
        supported: bool,
        capability: &'static str,
    ) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(Error::NotSupported {
                attribute: target.to_string(),
                capability,
            })
        }
    }

    /// Read a characteristic value.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer(), %service, %characteristic))]
    pub async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Bytes> {
        self.with_timeout("read", async {
            let (target, info) = self.resolve_fresh("read", service, characteristic).await?;
            Self::require(target, info.properties.read, "read")?;
            self.machine.read_characteristic(target).await
        })
        .await
    }

    /// Write a characteristic value with response.
    ///
    /// Values larger than one write at the current MTU are split into
    /// sequential chunks; the call completes when the last one is
    /// acknowledged.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer(), %service, %characteristic))]
    pub async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.write_with_type(service, characteristic, value.into(), WriteType::WithResponse)
            .await
    }

    /// Write a characteristic value without response.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer(), %service, %characteristic))]
    pub async fn write_without_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.write_with_type(service, characteristic, value.into(), WriteType::WithoutResponse)
            .await
    }

    async fn write_with_type(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<()> {
        self.with_timeout("write", async {
            let (target, info) = self.resolve_fresh("write", service, characteristic).await?;
            match write_type {
                WriteType::WithResponse => Self::require(target, info.properties.write, "write")?,
                WriteType::WithoutResponse => Self::require(
                    target,
                    info.properties.write_without_response,
                    "write without response",
                )?,
            }
            self.machine
                .write_characteristic(target, value, write_type)
                .await
        })
        .await
    }

    /// Negotiate the MTU. Returns the value the peer agreed to.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer(), mtu))]
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        self.with_timeout("request MTU", self.machine.request_mtu(mtu))
            .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer(), %tx, %rx))]
    pub async fn set_preferred_phy(
        &self,
        tx: Phy,
        rx: Phy,
        options: PhyOptions,
    ) -> Result<(Phy, Phy)> {
        self.with_timeout("set PHY", self.machine.set_preferred_phy(tx, rx, options))
            .await
    }

    /// Bond with the peer.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer()))]
    pub async fn bond(&self) -> Result<()> {
        self.with_timeout("bond", self.machine.bond()).await
    }

    /// Subscribe to values pushed by the peer for one characteristic.
    ///
    /// Notifications are preferred when the characteristic supports both.
    /// Every call returns a new receiver; all receivers see every value.
    /// Receivers end when the link is lost or the connection is closed.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer(), %service, %characteristic))]
    pub async fn enable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationReceiver> {
        self.with_timeout("enable notifications", async {
            let (target, info) = self
                .resolve_fresh("enable notifications", service, characteristic)
                .await?;
            Self::require(target, info.properties.can_notify(), "notify")?;

            let cccd_value = info
                .descriptor(&CLIENT_CHARACTERISTIC_CONFIGURATION)
                .map(|_| {
                    if info.properties.notify {
                        ENABLE_NOTIFICATION_VALUE
                    } else {
                        ENABLE_INDICATION_VALUE
                    }
                });
            self.machine.enable_notifications(target, cccd_value).await
        })
        .await
    }

    /// Stop delivery of pushed values and end all receivers for the characteristic.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer(), %service, %characteristic))]
    pub async fn disable_notifications(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.with_timeout("disable notifications", async {
            let (target, info) = self
                .resolve("disable notifications", service, characteristic)?;
            let has_cccd = info
                .descriptor(&CLIENT_CHARACTERISTIC_CONFIGURATION)
                .is_some();
            self.machine.disable_notifications(target, has_cccd).await
        })
        .await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.machine.close();
    }
}

#[async_trait]
impl AttributeClient for Connection {
    fn peer(&self) -> &PeerId {
        Connection::peer(self)
    }

    fn state(&self) -> ConnectionState {
        Connection::state(self)
    }

    async fn connect(&self) -> Result<()> {
        Connection::connect(self).await
    }

    async fn disconnect(&self) -> Result<()> {
        Connection::disconnect(self).await
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Bytes> {
        Connection::read(self, service, characteristic).await
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, value: Bytes) -> Result<()> {
        Connection::write(self, service, characteristic, value).await
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        Connection::request_mtu(self, mtu).await
    }

    async fn enable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationReceiver> {
        Connection::enable_notifications(self, service, characteristic).await
    }

    async fn disable_notifications(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        Connection::disable_notifications(self, service, characteristic).await
    }
}
