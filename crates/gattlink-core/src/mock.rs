//! In-memory link implementation for testing.
//!
//! This module provides a [`GattLink`] that needs no Bluetooth hardware.
//! Every request is recorded; tests either answer requests by hand with
//! [`MockLink::emit`] or attach a [`MockPeripheral`] that answers them
//! automatically.
//!
//! # Features
//!
//! - **Request log**: inspect what the state machine asked the platform to do
//! - **Scripted peripheral**: services, connect and discovery statuses, an
//!   echoing value store, an MTU ceiling
//! - **Failure injection**: refuse requests synchronously, or complete
//!   reads and writes of a characteristic with an error status

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use uuid::Uuid;

use gattlink_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIGURATION};
use gattlink_types::{
    CharacteristicProperties, CharacteristicRef, DescriptorRef, GattCharacteristic, GattService,
    GattStatus, MAX_ATT_MTU, PeerId, Phy, PhyOptions,
};

use crate::error::{Error, Result};
use crate::link::{GattLink, LinkEvent, LinkEventReceiver, LinkEventSender, WriteType, link_event_channel};
use crate::state::LinkState;

/// A request the state machine made of the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkRequest {
    Connect(PeerId),
    Disconnect,
    CloseHandle,
    DiscoverAttributes,
    RequestMtu(u16),
    SetPreferredPhy {
        tx: Phy,
        rx: Phy,
        options: PhyOptions,
    },
    ReadCharacteristic(CharacteristicRef),
    WriteCharacteristic {
        characteristic: CharacteristicRef,
        value: Bytes,
        write_type: WriteType,
    },
    WriteDescriptor {
        descriptor: DescriptorRef,
        value: Bytes,
    },
    SetNotificationDelivery {
        characteristic: CharacteristicRef,
        enabled: bool,
    },
    CreateBond,
}

impl LinkRequest {
    /// Short name of the request, as used by [`MockLink::reject`].
    pub fn name(&self) -> &'static str {
        match self {
            LinkRequest::Connect(_) => "connect",
            LinkRequest::Disconnect => "disconnect",
            LinkRequest::CloseHandle => "close handle",
            LinkRequest::DiscoverAttributes => "discover attributes",
            LinkRequest::RequestMtu(_) => "request MTU",
            LinkRequest::SetPreferredPhy { .. } => "set PHY",
            LinkRequest::ReadCharacteristic(_) => "read characteristic",
            LinkRequest::WriteCharacteristic { .. } => "write characteristic",
            LinkRequest::WriteDescriptor { .. } => "write descriptor",
            LinkRequest::SetNotificationDelivery { .. } => "set notification delivery",
            LinkRequest::CreateBond => "create bond",
        }
    }
}

/// Scripted behavior for a [`MockLink`].
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    services: Vec<GattService>,
    connect_status: GattStatus,
    discovery_status: GattStatus,
    max_mtu: u16,
    bondable: bool,
    values: HashMap<CharacteristicRef, Bytes>,
    /// Per-characteristic (successes left, failure status).
    failures: HashMap<CharacteristicRef, (usize, GattStatus)>,
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            connect_status: GattStatus::SUCCESS,
            discovery_status: GattStatus::SUCCESS,
            max_mtu: MAX_ATT_MTU,
            bondable: true,
            values: HashMap::new(),
            failures: HashMap::new(),
        }
    }
}

impl MockPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// A peripheral exposing the standard battery service with the given level.
    ///
    /// Battery level is readable, writable and notifying, with a CCCD.
    pub fn battery(level: u8) -> Self {
        let service = GattService::new(BATTERY_SERVICE).with_characteristic(
            GattCharacteristic::new(BATTERY_LEVEL, CharacteristicProperties::from_bits(0x1A))
                .with_descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION),
        );
        Self::new()
            .with_service(service)
            .with_value(BATTERY_SERVICE, BATTERY_LEVEL, vec![level])
    }

    #[must_use]
    pub fn with_service(mut self, service: GattService) -> Self {
        self.services.push(service);
        self
    }

    /// Initial value returned by reads of a characteristic.
    #[must_use]
    pub fn with_value(mut self, service: Uuid, characteristic: Uuid, value: impl Into<Bytes>) -> Self {
        self.values
            .insert(CharacteristicRef::new(service, characteristic), value.into());
        self
    }

    #[must_use]
    pub fn connect_status(mut self, status: GattStatus) -> Self {
        self.connect_status = status;
        self
    }

    #[must_use]
    pub fn discovery_status(mut self, status: GattStatus) -> Self {
        self.discovery_status = status;
        self
    }

    /// Largest MTU the peripheral agrees to.
    #[must_use]
    pub fn max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu;
        self
    }

    #[must_use]
    pub fn bondable(mut self, bondable: bool) -> Self {
        self.bondable = bondable;
        self
    }

    fn take_failure(&mut self, characteristic: &CharacteristicRef) -> GattStatus {
        match self.failures.get_mut(characteristic) {
            Some((0, status)) => *status,
            Some((successes, _)) => {
                *successes -= 1;
                GattStatus::SUCCESS
            }
            None => GattStatus::SUCCESS,
        }
    }

    fn respond(&mut self, request: &LinkRequest) -> Option<LinkEvent> {
        let event = match request {
            LinkRequest::Connect(_) => LinkEvent::LinkStateChanged {
                status: self.connect_status,
                state: if self.connect_status.is_success() {
                    LinkState::Connected
                } else {
                    LinkState::Disconnected
                },
            },
            LinkRequest::Disconnect => LinkEvent::LinkStateChanged {
                status: GattStatus::SUCCESS,
                state: LinkState::Disconnected,
            },
            LinkRequest::DiscoverAttributes => LinkEvent::AttributesDiscovered {
                status: self.discovery_status,
                services: if self.discovery_status.is_success() {
                    self.services.clone()
                } else {
                    Vec::new()
                },
            },
            LinkRequest::RequestMtu(mtu) => LinkEvent::MtuChanged {
                mtu: (*mtu).min(self.max_mtu),
                status: GattStatus::SUCCESS,
            },
            LinkRequest::SetPreferredPhy { tx, rx, .. } => LinkEvent::PhyUpdated {
                tx: *tx,
                rx: *rx,
                status: GattStatus::SUCCESS,
            },
            LinkRequest::ReadCharacteristic(characteristic) => {
                let status = self.take_failure(characteristic);
                LinkEvent::CharacteristicRead {
                    characteristic: *characteristic,
                    status,
                    value: if status.is_success() {
                        self.values.get(characteristic).cloned().unwrap_or_default()
                    } else {
                        Bytes::new()
                    },
                }
            }
            LinkRequest::WriteCharacteristic {
                characteristic,
                value,
                ..
            } => {
                let status = self.take_failure(characteristic);
                if status.is_success() {
                    self.values.insert(*characteristic, value.clone());
                }
                LinkEvent::CharacteristicWritten {
                    characteristic: *characteristic,
                    status,
                }
            }
            LinkRequest::WriteDescriptor { descriptor, .. } => LinkEvent::DescriptorWritten {
                descriptor: *descriptor,
                status: GattStatus::SUCCESS,
            },
            LinkRequest::CreateBond => LinkEvent::BondStateChanged {
                bonded: self.bondable,
                status: if self.bondable {
                    GattStatus::SUCCESS
                } else {
                    GattStatus::INSUFFICIENT_AUTHENTICATION
                },
            },
            LinkRequest::CloseHandle | LinkRequest::SetNotificationDelivery { .. } => return None,
        };
        Some(event)
    }
}

/// A [`GattLink`] backed by memory.
///
/// # Example
///
/// ```
/// use gattlink_core::{GattLink, MockLink, MockPeripheral};
/// use gattlink_core::mock::LinkRequest;
/// use gattlink_types::PeerId;
///
/// # #[tokio::main]
/// # async fn main() {
/// let (link, mut events) = MockLink::with_peripheral(MockPeripheral::battery(90));
/// let peer = PeerId::new("AA:BB:CC:DD:EE:FF").unwrap();
///
/// link.connect(&peer).unwrap();
/// assert_eq!(link.requests(), vec![LinkRequest::Connect(peer)]);
/// assert!(events.recv().await.is_some());
/// # }
/// ```
pub struct MockLink {
    events: LinkEventSender,
    history: Mutex<Vec<LinkRequest>>,
    requests_tx: mpsc::UnboundedSender<LinkRequest>,
    requests_rx: AsyncMutex<mpsc::UnboundedReceiver<LinkRequest>>,
    peripheral: Mutex<Option<MockPeripheral>>,
    rejected: Mutex<HashSet<&'static str>>,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("requests", &self.lock_history().len())
            .field("scripted", &self.lock_peripheral().is_some())
            .finish()
    }
}

impl MockLink {
    /// A link that records requests and never answers them on its own.
    pub fn new() -> (Arc<Self>, LinkEventReceiver) {
        Self::build(None)
    }

    /// A link whose requests are answered by `peripheral`.
    pub fn with_peripheral(peripheral: MockPeripheral) -> (Arc<Self>, LinkEventReceiver) {
        Self::build(Some(peripheral))
    }

    fn build(peripheral: Option<MockPeripheral>) -> (Arc<Self>, LinkEventReceiver) {
        let (events, events_rx) = link_event_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            events,
            history: Mutex::new(Vec::new()),
            requests_tx,
            requests_rx: AsyncMutex::new(requests_rx),
            peripheral: Mutex::new(peripheral),
            rejected: Mutex::new(HashSet::new()),
        });
        (link, events_rx)
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<LinkRequest>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_peripheral(&self) -> MutexGuard<'_, Option<MockPeripheral>> {
        self.peripheral.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a platform event to the state machine.
    pub fn emit(&self, event: LinkEvent) {
        // The receiver is gone once the connection is dropped.
        let _ = self.events.send(event);
    }

    /// Report that the link dropped with `status`.
    pub fn drop_link(&self, status: GattStatus) {
        self.emit(LinkEvent::LinkStateChanged {
            status,
            state: LinkState::Disconnected,
        });
    }

    /// Push a value for `characteristic` as if the peer notified it.
    pub fn notify(&self, characteristic: CharacteristicRef, value: impl Into<Bytes>) {
        self.emit(LinkEvent::CharacteristicChanged {
            characteristic,
            value: value.into(),
        });
    }

    /// Every request made so far, oldest first.
    pub fn requests(&self) -> Vec<LinkRequest> {
        self.lock_history().clone()
    }

    /// Number of recorded requests matching `predicate`.
    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&LinkRequest) -> bool,
    {
        self.lock_history().iter().filter(|r| predicate(r)).count()
    }

    /// Values passed to `write_characteristic`, oldest first.
    pub fn written_values(&self, characteristic: CharacteristicRef) -> Vec<Bytes> {
        self.lock_history()
            .iter()
            .filter_map(|r| match r {
                LinkRequest::WriteCharacteristic {
                    characteristic: c,
                    value,
                    ..
                } if *c == characteristic => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait for the next request not yet taken by this method.
    pub async fn next_request(&self) -> Option<LinkRequest> {
        self.requests_rx.lock().await.recv().await
    }

    /// Refuse requests named `name` (see [`LinkRequest::name`]) synchronously.
    pub fn reject(&self, name: &'static str) {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name);
    }

    pub fn accept(&self, name: &'static str) {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Change the status the scripted peripheral reports for connects.
    pub fn set_connect_status(&self, status: GattStatus) {
        if let Some(peripheral) = self.lock_peripheral().as_mut() {
            peripheral.connect_status = status;
        }
    }

    /// Replace the services the scripted peripheral reports on discovery.
    pub fn set_services(&self, services: Vec<GattService>) {
        if let Some(peripheral) = self.lock_peripheral().as_mut() {
            peripheral.services = services;
        }
    }

    /// Complete reads and writes of `characteristic` with `status` after
    /// `successes` more successful ones.
    pub fn fail_characteristic_after(
        &self,
        characteristic: CharacteristicRef,
        successes: usize,
        status: GattStatus,
    ) {
        if let Some(peripheral) = self.lock_peripheral().as_mut() {
            peripheral
                .failures
                .insert(characteristic, (successes, status));
        }
    }

    pub fn fail_characteristic(&self, characteristic: CharacteristicRef, status: GattStatus) {
        self.fail_characteristic_after(characteristic, 0, status);
    }

    /// The value the scripted peripheral currently holds for `characteristic`.
    pub fn value(&self, characteristic: CharacteristicRef) -> Option<Bytes> {
        self.lock_peripheral()
            .as_ref()
            .and_then(|p| p.values.get(&characteristic).cloned())
    }

    fn submit(&self, request: LinkRequest) -> Result<()> {
        let name = request.name();
        if self
            .rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
        {
            return Err(Error::rejected(name, "rejected by mock link"));
        }

        let response = self
            .lock_peripheral()
            .as_mut()
            .and_then(|p| p.respond(&request));

        self.lock_history().push(request.clone());
        let _ = self.requests_tx.send(request);

        if let Some(event) = response {
            self.emit(event);
        }
        Ok(())
    }
}

impl GattLink for MockLink {
    fn connect(&self, peer: &PeerId) -> Result<()> {
        self.submit(LinkRequest::Connect(peer.clone()))
    }

    fn disconnect(&self) -> Result<()> {
        self.submit(LinkRequest::Disconnect)
    }

    fn close_handle(&self) {
        let _ = self.submit(LinkRequest::CloseHandle);
    }

    fn discover_attributes(&self) -> Result<()> {
        self.submit(LinkRequest::DiscoverAttributes)
    }

    fn request_mtu(&self, mtu: u16) -> Result<()> {
        self.submit(LinkRequest::RequestMtu(mtu))
    }

    fn set_preferred_phy(&self, tx: Phy, rx: Phy, options: PhyOptions) -> Result<()> {
        self.submit(LinkRequest::SetPreferredPhy { tx, rx, options })
    }

    fn read_characteristic(&self, characteristic: CharacteristicRef) -> Result<()> {
        self.submit(LinkRequest::ReadCharacteristic(characteristic))
    }

    fn write_characteristic(
        &self,
        characteristic: CharacteristicRef,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<()> {
        self.submit(LinkRequest::WriteCharacteristic {
            characteristic,
            value,
            write_type,
        })
    }

    fn write_descriptor(&self, descriptor: DescriptorRef, value: Bytes) -> Result<()> {
        self.submit(LinkRequest::WriteDescriptor { descriptor, value })
    }

    fn set_notification_delivery(
        &self,
        characteristic: CharacteristicRef,
        enabled: bool,
    ) -> Result<()> {
        self.submit(LinkRequest::SetNotificationDelivery {
            characteristic,
            enabled,
        })
    }

    fn create_bond(&self) -> Result<()> {
        self.submit(LinkRequest::CreateBond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::new("AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn battery() -> CharacteristicRef {
        CharacteristicRef::new(BATTERY_SERVICE, BATTERY_LEVEL)
    }

    #[tokio::test]
    async fn test_unscripted_link_only_records() {
        let (link, mut events) = MockLink::new();
        link.connect(&peer()).unwrap();
        link.discover_attributes().unwrap();

        assert_eq!(
            link.requests(),
            vec![LinkRequest::Connect(peer()), LinkRequest::DiscoverAttributes]
        );
        assert_eq!(link.next_request().await, Some(LinkRequest::Connect(peer())));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peripheral_answers_connect_and_discovery() {
        let (link, mut events) = MockLink::with_peripheral(MockPeripheral::battery(50));
        link.connect(&peer()).unwrap();
        link.discover_attributes().unwrap();

        assert_eq!(
            events.recv().await,
            Some(LinkEvent::LinkStateChanged {
                status: GattStatus::SUCCESS,
                state: LinkState::Connected,
            })
        );
        match events.recv().await {
            Some(LinkEvent::AttributesDiscovered { status, services }) => {
                assert!(status.is_success());
                assert_eq!(services.len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peripheral_echoes_writes() {
        let (link, mut events) = MockLink::with_peripheral(MockPeripheral::battery(50));
        link.write_characteristic(battery(), Bytes::from_static(&[7]), WriteType::WithResponse)
            .unwrap();
        link.read_characteristic(battery()).unwrap();

        let _written = events.recv().await;
        match events.recv().await {
            Some(LinkEvent::CharacteristicRead { value, .. }) => assert_eq!(value.as_ref(), &[7]),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(link.value(battery()), Some(Bytes::from_static(&[7])));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let (link, mut events) = MockLink::with_peripheral(MockPeripheral::battery(50));
        link.fail_characteristic_after(battery(), 1, GattStatus::WRITE_NOT_PERMITTED);

        link.write_characteristic(battery(), Bytes::from_static(&[1]), WriteType::WithResponse)
            .unwrap();
        link.write_characteristic(battery(), Bytes::from_static(&[2]), WriteType::WithResponse)
            .unwrap();

        let statuses: Vec<_> = [events.recv().await, events.recv().await]
            .into_iter()
            .map(|e| match e {
                Some(LinkEvent::CharacteristicWritten { status, .. }) => status,
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(statuses, vec![GattStatus::SUCCESS, GattStatus::WRITE_NOT_PERMITTED]);
        assert_eq!(link.value(battery()), Some(Bytes::from_static(&[1])));
    }

    #[test]
    fn test_rejected_requests_are_not_recorded() {
        let (link, _events) = MockLink::new();
        link.reject("connect");
        assert!(matches!(
            link.connect(&peer()),
            Err(Error::PlatformRejected { request: "connect", .. })
        ));
        assert!(link.requests().is_empty());

        link.accept("connect");
        assert!(link.connect(&peer()).is_ok());
    }

    #[test]
    fn test_mtu_is_capped_by_peripheral() {
        let (link, mut events) =
            MockLink::with_peripheral(MockPeripheral::battery(50).max_mtu(185));
        link.request_mtu(517).unwrap();
        assert_eq!(
            events.try_recv().ok(),
            Some(LinkEvent::MtuChanged {
                mtu: 185,
                status: GattStatus::SUCCESS
            })
        );
    }
}
