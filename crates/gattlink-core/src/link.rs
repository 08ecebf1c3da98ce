//! The platform boundary.
//!
//! A [`GattLink`] is the narrow capability interface the state machine
//! drives: every method only *requests* something from the platform and
//! returns as soon as the request is accepted. Outcomes come back later as
//! [`LinkEvent`]s on a single event channel, which the state machine drains
//! in order.
//!
//! Implementations must never deliver an event synchronously from inside a
//! request call; queueing it on the event channel is fine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use gattlink_types::{
    CharacteristicRef, DescriptorRef, GattService, GattStatus, PeerId, Phy, PhyOptions,
};

use crate::error::Result;
use crate::state::LinkState;

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    /// The peer acknowledges the write.
    #[default]
    WithResponse,
    /// Fire and forget; the platform acknowledges once the write is queued.
    WithoutResponse,
}

/// An inbound event from the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The transport came up, went down, or failed to come up.
    LinkStateChanged { status: GattStatus, state: LinkState },
    /// Attribute discovery finished.
    AttributesDiscovered {
        status: GattStatus,
        services: Vec<GattService>,
    },
    /// The MTU was negotiated (solicited or not).
    MtuChanged { mtu: u16, status: GattStatus },
    /// The PHY was updated.
    PhyUpdated { tx: Phy, rx: Phy, status: GattStatus },
    /// A characteristic read finished.
    CharacteristicRead {
        characteristic: CharacteristicRef,
        status: GattStatus,
        value: Bytes,
    },
    /// A characteristic write finished.
    CharacteristicWritten {
        characteristic: CharacteristicRef,
        status: GattStatus,
    },
    /// The peer pushed a value (notification or indication).
    CharacteristicChanged {
        characteristic: CharacteristicRef,
        value: Bytes,
    },
    /// A descriptor write finished.
    DescriptorWritten {
        descriptor: DescriptorRef,
        status: GattStatus,
    },
    /// Bonding finished or was lost.
    BondStateChanged { bonded: bool, status: GattStatus },
}

/// Sender half of the platform event channel, held by the link adapter.
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Receiver half of the platform event channel, consumed by the state machine.
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Create a platform event channel.
pub fn link_event_channel() -> (LinkEventSender, LinkEventReceiver) {
    mpsc::unbounded_channel()
}

/// Outbound requests to the platform for one connection handle.
///
/// Every method returns `Ok(())` once the platform accepted the request, or
/// an error if it refused it outright. A refused request produces no event.
pub trait GattLink: Send + Sync + 'static {
    /// Establish the transport to `peer`.
    fn connect(&self, peer: &PeerId) -> Result<()>;

    /// Tear the transport down. Completion is reported as a link-state event.
    fn disconnect(&self) -> Result<()>;

    /// Release the platform handle. No event follows.
    fn close_handle(&self);

    /// Enumerate the peer's attributes.
    fn discover_attributes(&self) -> Result<()>;

    fn request_mtu(&self, mtu: u16) -> Result<()>;

    fn set_preferred_phy(&self, tx: Phy, rx: Phy, options: PhyOptions) -> Result<()>;

    fn read_characteristic(&self, characteristic: CharacteristicRef) -> Result<()>;

    fn write_characteristic(
        &self,
        characteristic: CharacteristicRef,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<()>;

    fn write_descriptor(&self, descriptor: DescriptorRef, value: Bytes) -> Result<()>;

    /// Turn local delivery of pushed values on or off. Completes synchronously.
    fn set_notification_delivery(&self, characteristic: CharacteristicRef, enabled: bool)
    -> Result<()>;

    fn create_bond(&self) -> Result<()>;
}
