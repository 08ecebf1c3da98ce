//! Trait abstraction over attribute clients.
//!
//! [`AttributeClient`] is the surface application code programs against.
//! [`Connection`](crate::Connection) implements it for any [`GattLink`](crate::GattLink),
//! including the in-memory [`MockLink`](crate::MockLink).

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use gattlink_types::PeerId;

use crate::error::Result;
use crate::machine::NotificationReceiver;
use crate::state::ConnectionState;

/// Attribute access to one peer.
///
/// # Example
///
/// ```ignore
/// use gattlink_core::{AttributeClient, Result};
/// use gattlink_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE};
///
/// async fn battery_level<C: AttributeClient>(client: &C) -> Result<u8> {
///     let value = client.read(BATTERY_SERVICE, BATTERY_LEVEL).await?;
///     Ok(value.first().copied().unwrap_or_default())
/// }
/// ```
#[async_trait]
pub trait AttributeClient: Send + Sync {
    // --- Connection Management ---

    fn peer(&self) -> &PeerId;

    fn state(&self) -> ConnectionState;

    /// Whether attribute operations are currently permitted.
    fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Connect and wait until attributes are known.
    ///
    /// A no-op when already connecting or connected.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    // --- Attribute Operations ---

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Bytes>;

    /// Write with response, chunking values that exceed one write.
    async fn write(&self, service: Uuid, characteristic: Uuid, value: Bytes) -> Result<()>;

    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    // --- Notifications ---

    async fn enable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationReceiver>;

    async fn disable_notifications(&self, service: Uuid, characteristic: Uuid) -> Result<()>;
}
