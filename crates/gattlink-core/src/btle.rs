//! [`GattLink`] adapter for btleplug peripherals.
//!
//! btleplug exposes async request/response calls; the state machine wants
//! fire-and-forget requests with outcomes delivered as events. Each request
//! here spawns the corresponding btleplug call on the current tokio runtime
//! and reports its result on the link event channel.
//!
//! btleplug has no MTU, PHY or bonding primitives. Those requests complete
//! with [`GattStatus::REQUEST_NOT_SUPPORTED`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btleplug::api::{
    Central, CentralEvent, Characteristic, Descriptor, Peripheral as _, Service,
    WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gattlink_types::uuid::CLIENT_CHARACTERISTIC_CONFIGURATION;
use gattlink_types::{
    CharacteristicProperties, CharacteristicRef, DISABLE_NOTIFICATION_VALUE, DescriptorRef,
    GattCharacteristic, GattDescriptor, GattService, GattStatus, PeerId, Phy, PhyOptions,
};

use crate::error::{Error, Result};
use crate::link::{GattLink, LinkEvent, LinkEventReceiver, LinkEventSender, WriteType, link_event_channel};
use crate::state::LinkState;

/// Convert a btleplug service into the platform-agnostic model.
pub fn to_gatt_service(service: &Service) -> GattService {
    GattService {
        uuid: service.uuid,
        primary: service.primary,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                properties: CharacteristicProperties::from_bits(c.properties.bits()),
                descriptors: c
                    .descriptors
                    .iter()
                    .map(|d| GattDescriptor { uuid: d.uuid })
                    .collect(),
            })
            .collect(),
    }
}

/// Best-effort mapping of a btleplug error onto a platform status.
fn status_for(error: &btleplug::Error) -> GattStatus {
    match error {
        btleplug::Error::PermissionDenied => GattStatus::INSUFFICIENT_AUTHENTICATION,
        btleplug::Error::NotConnected => GattStatus::LOCAL_TERMINATED,
        btleplug::Error::TimedOut(_) => GattStatus::CONNECTION_TIMEOUT,
        btleplug::Error::NotSupported(_) => GattStatus::REQUEST_NOT_SUPPORTED,
        _ => GattStatus::FAILURE,
    }
}

struct Shared {
    peripheral: Peripheral,
    events: LinkEventSender,
    /// Characteristics whose pushed values are forwarded.
    delivering: Mutex<HashSet<CharacteristicRef>>,
    /// Set while a requested disconnect is in progress.
    disconnecting: AtomicBool,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("Link event dropped, connection is gone");
        }
    }

    fn delivering(&self) -> MutexGuard<'_, HashSet<CharacteristicRef>> {
        self.delivering.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn characteristic(&self, target: CharacteristicRef) -> Option<Characteristic> {
        self.peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == target.service)
            .flat_map(|s| s.characteristics.into_iter())
            .find(|c| c.uuid == target.characteristic)
    }
}

/// A [`GattLink`] driving one btleplug peripheral.
pub struct BtleplugLink {
    shared: Arc<Shared>,
    adapter: Adapter,
    /// Background tasks tied to the current transport.
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BtleplugLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugLink")
            .field("peripheral", &self.shared.peripheral.id())
            .finish_non_exhaustive()
    }
}

impl BtleplugLink {
    /// Wrap `peripheral`, found on `adapter`.
    ///
    /// The adapter is watched for unsolicited disconnects of the peripheral.
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> (Arc<Self>, LinkEventReceiver) {
        let (events, events_rx) = link_event_channel();
        let link = Arc::new(Self {
            shared: Arc::new(Shared {
                peripheral,
                events,
                delivering: Mutex::new(HashSet::new()),
                disconnecting: AtomicBool::new(false),
            }),
            adapter,
            background: Mutex::new(Vec::new()),
        });
        (link, events_rx)
    }

    fn spawn<F>(&self, request: &'static str, task: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::rejected(request, "no tokio runtime"))?;
        Ok(runtime.spawn(task))
    }

    fn stop_background(&self) {
        let mut tasks = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Forward pushed values and watch for unsolicited disconnects.
    async fn watch_link(shared: Arc<Shared>, adapter: Adapter) {
        let notifications = shared.peripheral.notifications().await;
        let central = adapter.events().await;
        let (mut notifications, mut central) = match (notifications, central) {
            (Ok(n), Ok(c)) => (n, c),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Could not watch peripheral, pushed values and link loss will be missed");
                return;
            }
        };
        let id = shared.peripheral.id();

        loop {
            tokio::select! {
                notification = notifications.next() => {
                    let Some(notification) = notification else { break };
                    let target = shared
                        .delivering()
                        .iter()
                        .find(|c| c.characteristic == notification.uuid)
                        .copied();
                    if let Some(characteristic) = target {
                        shared.emit(LinkEvent::CharacteristicChanged {
                            characteristic,
                            value: Bytes::from(notification.value),
                        });
                    }
                }
                event = central.next() => {
                    match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            if !shared.disconnecting.load(Ordering::SeqCst) {
                                info!("Peripheral disconnected");
                                shared.emit(LinkEvent::LinkStateChanged {
                                    status: GattStatus::REMOTE_TERMINATED,
                                    state: LinkState::Disconnected,
                                });
                            }
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
        debug!("Stopped watching peripheral");
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.stop_background();
    }
}

impl GattLink for BtleplugLink {
    fn connect(&self, peer: &PeerId) -> Result<()> {
        debug!(peer = %peer, "Connecting peripheral");
        self.shared.disconnecting.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let adapter = self.adapter.clone();
        let watcher = Arc::clone(&self.shared);
        let background = self.spawn("connect", async move {
            match shared.peripheral.connect().await {
                Ok(()) => shared.emit(LinkEvent::LinkStateChanged {
                    status: GattStatus::SUCCESS,
                    state: LinkState::Connected,
                }),
                Err(e) => {
                    warn!(error = %e, "Connect failed");
                    shared.emit(LinkEvent::LinkStateChanged {
                        status: status_for(&e),
                        state: LinkState::Disconnected,
                    });
                    return;
                }
            }
            Self::watch_link(watcher, adapter).await;
        })?;

        self.stop_background();
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(background);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.shared.disconnecting.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        self.spawn("disconnect", async move {
            let status = match shared.peripheral.disconnect().await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!(error = %e, "Disconnect failed");
                    status_for(&e)
                }
            };
            shared.emit(LinkEvent::LinkStateChanged {
                status,
                state: LinkState::Disconnected,
            });
        })?;
        Ok(())
    }

    fn close_handle(&self) {
        self.stop_background();
        self.shared.delivering().clear();
        self.shared.disconnecting.store(true, Ordering::SeqCst);

        // Best effort: the peripheral may already be gone.
        let peripheral = self.shared.peripheral.clone();
        let _ = self.spawn("close handle", async move {
            if let Ok(true) = peripheral.is_connected().await
                && let Err(e) = peripheral.disconnect().await
            {
                debug!(error = %e, "Best-effort disconnect on close failed");
            }
        });
    }

    fn discover_attributes(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.spawn("discover attributes", async move {
            let event = match shared.peripheral.discover_services().await {
                Ok(()) => LinkEvent::AttributesDiscovered {
                    status: GattStatus::SUCCESS,
                    services: shared
                        .peripheral
                        .services()
                        .iter()
                        .map(to_gatt_service)
                        .collect(),
                },
                Err(e) => {
                    warn!(error = %e, "Service discovery failed");
                    LinkEvent::AttributesDiscovered {
                        status: status_for(&e),
                        services: Vec::new(),
                    }
                }
            };
            shared.emit(event);
        })?;
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<()> {
        debug!(mtu, "MTU negotiation is handled by the platform");
        self.shared.emit(LinkEvent::MtuChanged {
            mtu,
            status: GattStatus::REQUEST_NOT_SUPPORTED,
        });
        Ok(())
    }

    fn set_preferred_phy(&self, tx: Phy, rx: Phy, _options: PhyOptions) -> Result<()> {
        self.shared.emit(LinkEvent::PhyUpdated {
            tx,
            rx,
            status: GattStatus::REQUEST_NOT_SUPPORTED,
        });
        Ok(())
    }

    fn read_characteristic(&self, characteristic: CharacteristicRef) -> Result<()> {
        let target = self
            .shared
            .characteristic(characteristic)
            .ok_or_else(|| Error::rejected("read characteristic", format!("{} not discovered", characteristic)))?;
        let shared = Arc::clone(&self.shared);
        self.spawn("read characteristic", async move {
            let (status, value) = match shared.peripheral.read(&target).await {
                Ok(value) => (GattStatus::SUCCESS, Bytes::from(value)),
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    (status_for(&e), Bytes::new())
                }
            };
            shared.emit(LinkEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            });
        })?;
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: CharacteristicRef,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<()> {
        let target = self
            .shared
            .characteristic(characteristic)
            .ok_or_else(|| Error::rejected("write characteristic", format!("{} not discovered", characteristic)))?;
        let write_type = match write_type {
            WriteType::WithResponse => BtleWriteType::WithResponse,
            WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
        };
        let shared = Arc::clone(&self.shared);
        self.spawn("write characteristic", async move {
            let status = match shared.peripheral.write(&target, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    debug!(error = %e, "Write failed");
                    status_for(&e)
                }
            };
            shared.emit(LinkEvent::CharacteristicWritten {
                characteristic,
                status,
            });
        })?;
        Ok(())
    }

    fn write_descriptor(&self, descriptor: DescriptorRef, value: Bytes) -> Result<()> {
        let characteristic = descriptor.characteristic;
        let shared = Arc::clone(&self.shared);

        // btleplug owns the CCCD: subscribing writes it for us.
        if descriptor.descriptor == CLIENT_CHARACTERISTIC_CONFIGURATION {
            let target = self
                .shared
                .characteristic(characteristic)
                .ok_or_else(|| Error::rejected("write descriptor", format!("{} not discovered", characteristic)))?;
            let enable = value.as_ref() != DISABLE_NOTIFICATION_VALUE;
            self.spawn("write descriptor", async move {
                let outcome = if enable {
                    shared.peripheral.subscribe(&target).await
                } else {
                    shared.peripheral.unsubscribe(&target).await
                };
                let status = match outcome {
                    Ok(()) => GattStatus::SUCCESS,
                    Err(e) => {
                        debug!(error = %e, enable, "Subscription change failed");
                        status_for(&e)
                    }
                };
                shared.emit(LinkEvent::DescriptorWritten { descriptor, status });
            })?;
            return Ok(());
        }

        let target = Descriptor {
            uuid: descriptor.descriptor,
            service_uuid: characteristic.service,
            characteristic_uuid: characteristic.characteristic,
        };
        self.spawn("write descriptor", async move {
            let status = match shared.peripheral.write_descriptor(&target, &value).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    debug!(error = %e, "Descriptor write failed");
                    status_for(&e)
                }
            };
            shared.emit(LinkEvent::DescriptorWritten { descriptor, status });
        })?;
        Ok(())
    }

    fn set_notification_delivery(
        &self,
        characteristic: CharacteristicRef,
        enabled: bool,
    ) -> Result<()> {
        let mut delivering = self.shared.delivering();
        if enabled {
            delivering.insert(characteristic);
        } else {
            delivering.remove(&characteristic);
        }
        Ok(())
    }

    fn create_bond(&self) -> Result<()> {
        self.shared.emit(LinkEvent::BondStateChanged {
            bonded: false,
            status: GattStatus::REQUEST_NOT_SUPPORTED,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::CharPropFlags;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    #[test]
    fn test_service_conversion() {
        let service_uuid = gattlink_types::uuid::BATTERY_SERVICE;
        let characteristic_uuid = gattlink_types::uuid::BATTERY_LEVEL;
        let descriptor = Descriptor {
            uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
            service_uuid,
            characteristic_uuid,
        };
        let characteristic = Characteristic {
            uuid: characteristic_uuid,
            service_uuid,
            properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
            descriptors: BTreeSet::from([descriptor]),
        };
        let service = Service {
            uuid: service_uuid,
            primary: true,
            characteristics: BTreeSet::from([characteristic]),
        };

        let converted = to_gatt_service(&service);
        assert_eq!(converted.uuid, service_uuid);
        assert!(converted.primary);
        let battery = converted.characteristic(&characteristic_uuid).unwrap();
        assert!(battery.properties.read);
        assert!(battery.properties.notify);
        assert!(!battery.properties.write);
        assert!(battery.descriptor(&CLIENT_CHARACTERISTIC_CONFIGURATION).is_some());
        assert!(converted.characteristic(&Uuid::nil()).is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&btleplug::Error::PermissionDenied),
            GattStatus::INSUFFICIENT_AUTHENTICATION
        );
        assert_eq!(
            status_for(&btleplug::Error::NotConnected),
            GattStatus::LOCAL_TERMINATED
        );
        assert_eq!(
            status_for(&btleplug::Error::RuntimeError("boom".into())),
            GattStatus::FAILURE
        );
    }
}
