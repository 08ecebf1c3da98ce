//! The connection state machine.
//!
//! [`ConnectionStateMachine`] is the single authority over a connection's
//! [`ConnectionState`] and the only component that calls connect,
//! disconnect and discovery on the [`GattLink`]. Platform events are fed to
//! [`handle_event`](ConnectionStateMachine::handle_event), usually by the
//! event loop started with
//! [`spawn_event_loop`](ConnectionStateMachine::spawn_event_loop).
//!
//! All mutation of the state, the catalog, and the notification observers
//! happens under one per-connection lock. Attribute operations are
//! additionally serialized by an operation slot: at most one platform
//! request is outstanding at a time, and a chunked write holds the slot for
//! all of its chunks. A caller that stops waiting does not free the slot;
//! it stays taken until the platform answers, the link drops, or the
//! connection is closed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gattlink_types::uuid::CLIENT_CHARACTERISTIC_CONFIGURATION;
use gattlink_types::{
    AttributeCatalog, CharacteristicRef, DEFAULT_ATT_MTU, DISABLE_NOTIFICATION_VALUE,
    DescriptorRef, GattService, GattStatus, MAX_ATT_MTU, PeerId, Phy, PhyOptions,
};

use crate::cache::ServiceCatalogCache;
use crate::chunked::ChunkedWriteEngine;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, DisconnectReason, EventDispatcher, EventReceiver};
use crate::link::{GattLink, LinkEvent, LinkEventReceiver, WriteType};
use crate::metrics::ConnectionMetrics;
use crate::operation::{OperationKey, OperationOutput};
use crate::reconnect::{ReconnectAttempt, ReconnectDecision, ReconnectPolicy};
use crate::registry::{OperationCompletionRegistry, PendingCompletion};
use crate::state::{ConnectionState, LinkState};

/// Receiver of values pushed by the peer for one characteristic.
pub type NotificationReceiver = broadcast::Receiver<Bytes>;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Link(GattStatus),
    Discovery(GattStatus),
}

/// States an operation may be issued from.
#[derive(Debug, Clone, Copy)]
enum Requires {
    /// Any state with an established transport.
    Transport,
    /// Attributes known.
    Ready,
}

impl Requires {
    fn admits(self, state: &ConnectionState) -> bool {
        match self {
            Requires::Transport => state.has_transport(),
            Requires::Ready => state.is_ready(),
        }
    }
}

struct Core {
    state: ConnectionState,
    catalog: Option<Arc<AttributeCatalog>>,
    catalog_from_cache: bool,
    mtu: u16,
    phy: Option<(Phy, Phy)>,
    bonded: bool,
    closed: bool,
    handle_released: bool,
    disconnect_requested: bool,
    last_failure: Option<Failure>,
    observers: HashMap<CharacteristicRef, broadcast::Sender<Bytes>>,
}

impl Core {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            catalog: None,
            catalog_from_cache: false,
            mtu: DEFAULT_ATT_MTU,
            phy: None,
            bonded: false,
            closed: false,
            handle_released: false,
            disconnect_requested: false,
            last_failure: None,
            observers: HashMap::new(),
        }
    }

    /// Forget everything tied to the current transport.
    fn reset_link(&mut self) {
        self.catalog = None;
        self.catalog_from_cache = false;
        self.mtu = DEFAULT_ATT_MTU;
        self.phy = None;
        self.observers.clear();
    }
}

struct Inner {
    peer: PeerId,
    link: Arc<dyn GattLink>,
    cache: ServiceCatalogCache,
    config: ConnectionConfig,
    registry: OperationCompletionRegistry<OperationKey, OperationOutput>,
    reconnect: ReconnectPolicy,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventDispatcher,
    metrics: ConnectionMetrics,
    op_slot: Arc<AsyncMutex<()>>,
    notify_gate: AsyncMutex<()>,
    in_flight: Mutex<HashSet<OperationKey>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let handle = self
            .event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Marks a logical operation as in flight until dropped.
struct Reservation<'a> {
    set: &'a Mutex<HashSet<OperationKey>>,
    key: OperationKey,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// The operation slot as held by one caller.
type Slot = Mutex<Option<OwnedMutexGuard<()>>>;

/// A request the platform has accepted and not yet answered.
struct Outstanding<'a> {
    pending: PendingCompletion<OperationKey, OperationOutput>,
    slot: &'a Slot,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        if self.pending.is_finished() {
            return;
        }
        // The waiter is gone but the platform still owes an answer: the
        // entry keeps the slot until that answer, a link loss, or close.
        let guard = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.pending.abandon(guard);
    }
}

/// Owner of one connection's lifecycle.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionStateMachine {
    /// Create a machine for `peer` in the `Disconnected` state.
    pub fn new(
        peer: PeerId,
        link: Arc<dyn GattLink>,
        cache: ServiceCatalogCache,
        config: ConnectionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                peer,
                link,
                cache,
                reconnect: ReconnectPolicy::new(config.reconnect.clone()),
                events: EventDispatcher::new(config.event_capacity),
                config,
                registry: OperationCompletionRegistry::new(),
                core: Mutex::new(Core::new()),
                state_tx,
                metrics: ConnectionMetrics::new(),
                op_slot: Arc::new(AsyncMutex::new(())),
                notify_gate: AsyncMutex::new(()),
                in_flight: Mutex::new(HashSet::new()),
                event_loop: Mutex::new(None),
            }),
        }
    }

    /// Drain `events` into [`handle_event`](Self::handle_event) on a background task.
    ///
    /// Events are handled strictly in arrival order. The task ends when the
    /// sender side is dropped or the machine goes away.
    pub fn spawn_event_loop(&self, mut events: LinkEventReceiver) {
        let weak = Arc::downgrade(&self.inner);
        let peer = self.inner.peer.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionStateMachine { inner }.handle_event(event);
            }
            debug!(peer = %peer, "Link event loop finished");
        });

        let previous = self
            .inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Observation ---

    /// The peer this machine connects to.
    pub fn peer(&self) -> &PeerId {
        &self.inner.peer
    }

    /// Configuration fixed at construction.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// The catalog cache shared with other connections.
    pub fn cache(&self) -> &ServiceCatalogCache {
        &self.inner.cache
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    /// Subscribe to state changes. The current state is available immediately.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to connection events emitted from now on.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// The catalog in use, present while `Ready` (and during rediscovery of a live link).
    pub fn catalog(&self) -> Option<Arc<AttributeCatalog>> {
        self.lock().catalog.clone()
    }

    /// Whether the catalog in use came from the cache rather than a discovery on this link.
    pub fn catalog_from_cache(&self) -> bool {
        self.lock().catalog_from_cache
    }

    /// The negotiated MTU (23 until a request succeeds).
    pub fn mtu(&self) -> u16 {
        self.lock().mtu
    }

    /// The (tx, rx) PHY last reported by the platform.
    pub fn phy(&self) -> Option<(Phy, Phy)> {
        self.lock().phy
    }

    /// Whether the last bonding attempt succeeded.
    pub fn is_bonded(&self) -> bool {
        self.lock().bonded
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Counters for this connection.
    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.inner.metrics
    }

    /// The reconnect attempt currently waiting to fire, if any.
    pub fn scheduled_reconnect(&self) -> Option<ReconnectAttempt> {
        self.inner.reconnect.scheduled()
    }

    /// Number of platform requests awaiting completion, including ones
    /// whose caller stopped waiting.
    pub fn pending_operations(&self) -> usize {
        self.inner.registry.len()
    }

    // --- State changes ---

    /// Move to `next` if the edge is allowed. Must be called with the core lock held.
    fn transition(&self, core: &mut Core, next: ConnectionState) -> bool {
        if core.state == next {
            return false;
        }
        if !core.state.can_transition_to(&next) {
            warn!(
                peer = %self.inner.peer,
                from = %core.state,
                to = %next,
                "Ignoring invalid state transition"
            );
            return false;
        }

        let from = std::mem::replace(&mut core.state, next.clone());
        info!(peer = %self.inner.peer, from = %from, to = %next, "Connection state changed");
        self.inner.state_tx.send_replace(next.clone());
        self.inner.events.send(ConnectionEvent::StateChanged {
            peer: self.inner.peer.clone(),
            from,
            to: next,
        });
        true
    }

    fn failure_error(&self, core: &Core) -> Error {
        if core.closed {
            return Error::ConnectionClosed;
        }
        let peer = self.inner.peer.clone();
        match core.last_failure {
            Some(Failure::Discovery(status)) => Error::Discovery { peer, status },
            Some(Failure::Link(status)) => Error::Link { peer, status },
            None => Error::Link {
                peer,
                status: GattStatus::LOCAL_TERMINATED,
            },
        }
    }

    /// Start connecting.
    ///
    /// A no-op while connecting or connected. Re-opens a closed machine.
    /// Returns once the platform accepted the request; watch the state
    /// stream for the outcome.
    pub fn connect(&self) -> Result<()> {
        {
            let mut core = self.lock();
            if core.closed {
                debug!(peer = %self.inner.peer, "Re-opening closed connection");
                core.closed = false;
                core.handle_released = false;
                self.inner.reconnect.reopen();
            }
            core.disconnect_requested = false;

            if core.state.is_connecting_or_connected() {
                debug!(peer = %self.inner.peer, state = %core.state, "Already connecting or connected");
                return Ok(());
            }

            core.last_failure = None;
            self.transition(&mut core, ConnectionState::Connecting);
        }

        self.inner.metrics.record_connect_attempt(false);
        self.issue_connect()
    }

    fn issue_connect(&self) -> Result<()> {
        if let Err(e) = self.inner.link.connect(&self.inner.peer) {
            warn!(peer = %self.inner.peer, error = %e, "Platform refused connect");
            let mut core = self.lock();
            core.last_failure = Some(Failure::Link(GattStatus::FAILURE));
            let reason = format!("connect to {} refused: {}", self.inner.peer, e);
            self.transition(&mut core, ConnectionState::Error(reason));
            return Err(e);
        }
        Ok(())
    }

    /// Ask the platform to tear the transport down.
    ///
    /// The state changes when the platform confirms. A user-requested
    /// disconnect never triggers a reconnect.
    pub fn disconnect(&self) -> Result<()> {
        {
            let mut core = self.lock();
            if core.closed {
                return Err(Error::ConnectionClosed);
            }
            core.disconnect_requested = true;
            self.inner.reconnect.abort_scheduled();
            if !core.state.is_connecting_or_connected() {
                debug!(peer = %self.inner.peer, state = %core.state, "Nothing to disconnect");
                return Ok(());
            }
        }
        debug!(peer = %self.inner.peer, "Requesting disconnect");
        self.inner.link.disconnect()
    }

    /// Close the connection.
    ///
    /// Cancels any scheduled reconnect, releases the platform handle, fails
    /// every pending operation with [`Error::ConnectionClosed`] and forces
    /// `Disconnected`. Calling it again has no further effect.
    pub fn close(&self) {
        let release = {
            let mut core = self.lock();
            self.inner.reconnect.cancel();

            let first = !core.closed;
            core.closed = true;
            let release = !core.handle_released;
            core.handle_released = true;

            let had_link = core.state.is_connecting_or_connected();
            core.reset_link();
            self.transition(&mut core, ConnectionState::Disconnected);
            if first && had_link {
                self.inner.events.send(ConnectionEvent::Disconnected {
                    peer: self.inner.peer.clone(),
                    reason: DisconnectReason::Closed,
                });
            }
            release
        };

        let failed = self
            .inner
            .registry
            .cancel_all(|_| true, || Error::ConnectionClosed);
        if failed > 0 {
            debug!(peer = %self.inner.peer, failed, "Failed pending operations on close");
        }

        if release {
            self.inner.link.close_handle();
            info!(peer = %self.inner.peer, "Connection closed");
        }
    }

    /// Wait until the connection is `Ready`, or report why it is not.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut rx = self.subscribe_state();
        let state = rx
            .wait_for(|s| {
                s.is_ready() || s.is_error() || *s == ConnectionState::Disconnected
            })
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::ConnectionClosed)?;

        if state.is_ready() {
            return Ok(());
        }
        Err(self.failure_error(&self.lock()))
    }

    // --- Reconnect ---

    fn schedule_reconnect(&self, cause: String) {
        let weak = Arc::downgrade(&self.inner);
        let decision = self.inner.reconnect.on_link_lost(cause, move |attempt| async move {
            if let Some(inner) = weak.upgrade() {
                ConnectionStateMachine { inner }.reconnect_attempt(attempt);
            }
        });

        let peer = self.inner.peer.clone();
        match decision {
            ReconnectDecision::Scheduled(attempt) => {
                self.inner.events.send(ConnectionEvent::ReconnectScheduled {
                    peer,
                    attempt: attempt.attempt,
                    delay_ms: attempt.delay.as_millis() as u64,
                    cause: attempt.cause,
                });
            }
            ReconnectDecision::Exhausted { attempts } => {
                warn!(peer = %peer, attempts, "Giving up on reconnecting");
                self.inner
                    .events
                    .send(ConnectionEvent::ReconnectExhausted { peer, attempts });
            }
            ReconnectDecision::AlreadyScheduled | ReconnectDecision::Closed => {}
        }
    }

    fn reconnect_attempt(&self, attempt: u32) {
        {
            let mut core = self.lock();
            if core.closed || core.disconnect_requested {
                debug!(peer = %self.inner.peer, attempt, "Skipping reconnect");
                return;
            }
            if core.state.is_connecting_or_connected() {
                debug!(peer = %self.inner.peer, attempt, state = %core.state, "Already connected, skipping reconnect");
                return;
            }
            info!(peer = %self.inner.peer, attempt, "Reconnecting");
            self.inner.events.send(ConnectionEvent::ReconnectStarted {
                peer: self.inner.peer.clone(),
                attempt,
            });
            self.transition(&mut core, ConnectionState::Connecting);
        }

        self.inner.metrics.record_connect_attempt(true);
        if let Err(e) = self.issue_connect() {
            self.schedule_reconnect(e.to_string());
        }
    }

    // --- Platform events ---

    /// Route one platform event.
    pub fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::LinkStateChanged { status, state } => self.handle_link_state(status, state),
            LinkEvent::AttributesDiscovered { status, services } => {
                self.handle_attributes_discovered(status, services)
            }
            LinkEvent::MtuChanged { mtu, status } => self.handle_mtu_changed(mtu, status),
            LinkEvent::PhyUpdated { tx, rx, status } => self.handle_phy_updated(tx, rx, status),
            LinkEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            } => self.complete(OperationKey::Read(characteristic), status, || {
                OperationOutput::Value(value)
            }),
            LinkEvent::CharacteristicWritten {
                characteristic,
                status,
            } => self.complete(OperationKey::Write(characteristic), status, || {
                OperationOutput::Written
            }),
            LinkEvent::DescriptorWritten { descriptor, status } => {
                self.complete(OperationKey::WriteDescriptor(descriptor), status, || {
                    OperationOutput::Written
                })
            }
            LinkEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.handle_characteristic_changed(characteristic, value),
            LinkEvent::BondStateChanged { bonded, status } => {
                self.handle_bond_state(bonded, status)
            }
        }
    }

    fn handle_link_state(&self, status: GattStatus, link_state: LinkState) {
        let peer = &self.inner.peer;
        let config = &self.inner.config;
        let mut discover = false;
        let mut lost: Option<bool> = None;

        {
            let mut core = self.lock();
            if core.closed {
                debug!(peer = %peer, status = %status, "Ignoring link event after close");
                return;
            }

            match (status.is_success(), link_state) {
                (true, LinkState::Connected) => {
                    if core.state.has_transport() {
                        debug!(peer = %peer, "Duplicate connected event");
                        return;
                    }
                    if core.state != ConnectionState::Connecting {
                        self.transition(&mut core, ConnectionState::Connecting);
                    }
                    self.transition(&mut core, ConnectionState::Connected);
                    core.reset_link();
                    core.last_failure = None;

                    let cached = if config.reuse_cached_catalog && !config.revalidate_catalog {
                        self.inner.cache.get(peer)
                    } else {
                        None
                    };
                    match cached {
                        Some(catalog) => {
                            debug!(peer = %peer, "Reusing cached attribute catalog");
                            core.catalog = Some(catalog);
                            core.catalog_from_cache = true;
                            self.transition(&mut core, ConnectionState::Ready);
                            self.inner.reconnect.reset();
                            self.inner.metrics.record_ready(false);
                        }
                        None => {
                            self.transition(&mut core, ConnectionState::DiscoveringAttributes);
                            discover = true;
                        }
                    }
                }
                (true, LinkState::Disconnected) => {
                    if core.state == ConnectionState::Disconnected {
                        debug!(peer = %peer, "Already disconnected");
                        return;
                    }
                    let requested = core.disconnect_requested;
                    self.transition(&mut core, ConnectionState::Disconnected);
                    core.reset_link();
                    self.inner.events.send(ConnectionEvent::Disconnected {
                        peer: peer.clone(),
                        reason: if requested {
                            DisconnectReason::UserRequested
                        } else {
                            DisconnectReason::LinkLost(status)
                        },
                    });
                    lost = Some(!requested);
                }
                (false, _) => {
                    let had_link = core.state.has_transport();
                    core.last_failure = Some(Failure::Link(status));
                    warn!(peer = %peer, status = %status, state = %core.state, "Link failure");
                    let reason = format!("connection to {} failed with status {}", peer, status);
                    self.transition(&mut core, ConnectionState::Error(reason));
                    core.reset_link();
                    if had_link {
                        self.inner.events.send(ConnectionEvent::Disconnected {
                            peer: peer.clone(),
                            reason: DisconnectReason::LinkLost(status),
                        });
                    }
                    lost = Some(!core.disconnect_requested);
                }
            }
        }

        if let Some(unexpected) = lost {
            self.inner.metrics.record_link_loss();
            let failed = self.inner.registry.cancel_all(
                |_| true,
                || Error::Link {
                    peer: peer.clone(),
                    status,
                },
            );
            if failed > 0 {
                debug!(peer = %peer, failed, "Failed pending operations after link loss");
            }
            if unexpected && config.auto_reconnect {
                self.schedule_reconnect(format!("link lost with status {}", status));
            }
        }

        if discover {
            self.start_discovery();
        }
    }

    fn start_discovery(&self) {
        debug!(peer = %self.inner.peer, "Discovering attributes");
        if let Err(e) = self.inner.link.discover_attributes() {
            warn!(peer = %self.inner.peer, error = %e, "Platform refused discovery");
            let mut core = self.lock();
            if core.state == ConnectionState::DiscoveringAttributes {
                core.last_failure = Some(Failure::Discovery(GattStatus::FAILURE));
                self.transition(
                    &mut core,
                    ConnectionState::Error(format!("discovery failed: {}", e)),
                );
            }
        }
    }

    fn handle_attributes_discovered(&self, status: GattStatus, services: Vec<GattService>) {
        let peer = &self.inner.peer;
        let mut core = self.lock();
        if core.closed || core.state != ConnectionState::DiscoveringAttributes {
            debug!(peer = %peer, state = %core.state, "Ignoring discovery result");
            return;
        }

        if !status.is_success() {
            warn!(peer = %peer, status = %status, "Attribute discovery failed");
            core.last_failure = Some(Failure::Discovery(status));
            self.transition(
                &mut core,
                ConnectionState::Error(format!("discovery failed: {}", status)),
            );
            return;
        }

        let catalog = Arc::new(AttributeCatalog::new(peer.clone(), services));
        let update = self.inner.cache.put(Arc::clone(&catalog));
        self.inner.events.send(ConnectionEvent::CatalogUpdated {
            peer: peer.clone(),
            update,
            characteristics: catalog.characteristic_count(),
        });

        core.catalog = Some(catalog);
        core.catalog_from_cache = false;
        self.transition(&mut core, ConnectionState::Ready);
        self.inner.reconnect.reset();
        self.inner.metrics.record_ready(true);
    }

    fn complete<F>(&self, key: OperationKey, status: GattStatus, output: F)
    where
        F: FnOnce() -> OperationOutput,
    {
        let outcome = if status.is_success() {
            Ok(output())
        } else {
            Err(Error::operation(key.kind(), key.attribute(), status))
        };
        self.inner.registry.resolve(&key, outcome);
    }

    fn handle_mtu_changed(&self, mtu: u16, status: GattStatus) {
        if status.is_success() {
            let mut core = self.lock();
            debug!(peer = %self.inner.peer, from = core.mtu, to = mtu, "MTU changed");
            core.mtu = mtu;
        }
        self.complete(OperationKey::Mtu, status, || OperationOutput::Mtu(mtu));
    }

    fn handle_phy_updated(&self, tx: Phy, rx: Phy, status: GattStatus) {
        if status.is_success() {
            self.lock().phy = Some((tx, rx));
        }
        self.complete(OperationKey::Phy, status, || OperationOutput::Phy { tx, rx });
    }

    fn handle_bond_state(&self, bonded: bool, status: GattStatus) {
        let status = if status.is_success() && !bonded {
            GattStatus::FAILURE
        } else {
            status
        };
        self.lock().bonded = bonded && status.is_success();
        self.complete(OperationKey::Bond, status, || OperationOutput::Bonded);
    }

    fn handle_characteristic_changed(&self, characteristic: CharacteristicRef, value: Bytes) {
        let mut core = self.lock();
        let Some(sender) = core.observers.get(&characteristic) else {
            debug!(peer = %self.inner.peer, characteristic = %characteristic, "Dropping value for unobserved characteristic");
            return;
        };
        if sender.send(value).is_err() {
            debug!(peer = %self.inner.peer, characteristic = %characteristic, "All observers gone, removing");
            core.observers.remove(&characteristic);
        }
    }

    // --- Operations ---

    fn check(&self, core: &Core, operation: &'static str, requires: Requires) -> Result<()> {
        if core.closed {
            return Err(Error::ConnectionClosed);
        }
        if !requires.admits(&core.state) {
            return Err(Error::InvalidState {
                operation,
                state: core.state.clone(),
            });
        }
        Ok(())
    }

    fn reserve(&self, key: OperationKey) -> Result<Reservation<'_>> {
        let mut set = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key) {
            return Err(Error::DuplicateRequest {
                key: key.to_string(),
            });
        }
        Ok(Reservation {
            set: &self.inner.in_flight,
            key,
        })
    }

    /// Wait for the operation slot.
    async fn acquire_slot(&self) -> Slot {
        Mutex::new(Some(Arc::clone(&self.inner.op_slot).lock_owned().await))
    }

    /// Issue one platform request and wait for its completion.
    ///
    /// `slot` must hold the operation slot. If this future is dropped after
    /// the request was issued, the slot moves to the registry entry.
    async fn issue_locked<F>(
        &self,
        slot: &Slot,
        key: OperationKey,
        operation: &'static str,
        requires: Requires,
        issue: F,
    ) -> Result<OperationOutput>
    where
        F: FnOnce(&dyn GattLink) -> Result<()>,
    {
        // Registering under the core lock means close() or a link loss
        // either sees this entry or we see their state change.
        let pending = {
            let core = self.lock();
            self.check(&core, operation, requires)?;
            self.inner.registry.register(key)?
        };

        let started = Instant::now();
        issue(self.inner.link.as_ref())?;
        let mut outstanding = Outstanding { pending, slot };
        let outcome = (&mut outstanding.pending).await;
        self.inner
            .metrics
            .record_operation(key.kind(), outcome.is_ok(), started.elapsed());

        if let Err(e) = &outcome {
            debug!(peer = %self.inner.peer, key = %key, error = %e, "Operation failed");
            self.inner.events.send(ConnectionEvent::OperationFailed {
                peer: self.inner.peer.clone(),
                operation: key.to_string(),
                error: e.to_string(),
            });
        }
        outcome
    }

    /// Reserve `key`, take the operation slot, and run one request.
    async fn execute<F>(
        &self,
        key: OperationKey,
        operation: &'static str,
        requires: Requires,
        issue: F,
    ) -> Result<OperationOutput>
    where
        F: FnOnce(&dyn GattLink) -> Result<()>,
    {
        self.check(&self.lock(), operation, requires)?;
        let _reservation = self.reserve(key)?;
        let slot = self.acquire_slot().await;
        self.issue_locked(&slot, key, operation, requires, issue).await
    }

    /// Negotiate the MTU. Returns the value the peer agreed to.
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        if !(DEFAULT_ATT_MTU..=MAX_ATT_MTU).contains(&mtu) {
            return Err(Error::InvalidData(format!(
                "MTU {} outside {}..={}",
                mtu, DEFAULT_ATT_MTU, MAX_ATT_MTU
            )));
        }
        self.execute(OperationKey::Mtu, "request MTU", Requires::Transport, |link| {
            link.request_mtu(mtu)
        })
        .await?
        .into_mtu()
    }

    pub async fn set_preferred_phy(&self, tx: Phy, rx: Phy, options: PhyOptions) -> Result<(Phy, Phy)> {
        self.execute(OperationKey::Phy, "set PHY", Requires::Transport, |link| {
            link.set_preferred_phy(tx, rx, options)
        })
        .await?
        .into_phy()
    }

    pub async fn bond(&self) -> Result<()> {
        self.execute(OperationKey::Bond, "bond", Requires::Transport, |link| {
            link.create_bond()
        })
        .await?
        .into_bonded()
    }

    pub async fn read_characteristic(&self, characteristic: CharacteristicRef) -> Result<Bytes> {
        let value = self
            .execute(OperationKey::Read(characteristic), "read", Requires::Ready, |link| {
                link.read_characteristic(characteristic)
            })
            .await?
            .into_value()?;
        self.inner.metrics.record_bytes_read(value.len());
        Ok(value)
    }

    /// Write a characteristic value, splitting it into chunks when it does
    /// not fit in one write at the current MTU.
    pub async fn write_characteristic(
        &self,
        characteristic: CharacteristicRef,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<()> {
        let key = OperationKey::Write(characteristic);
        self.check(&self.lock(), "write", Requires::Ready)?;
        let _reservation = self.reserve(key)?;
        let slot = self.acquire_slot().await;

        let len = value.len();
        let engine = ChunkedWriteEngine::for_mtu(self.mtu());
        if engine.needs_chunking(len) {
            let this = self;
            let slot = &slot;
            engine
                .write(value, |_, data| async move {
                    this.issue_locked(slot, key, "write", Requires::Ready, |link| {
                        link.write_characteristic(characteristic, data, write_type)
                    })
                    .await?
                    .into_written()
                })
                .await?;
        } else {
            self.issue_locked(&slot, key, "write", Requires::Ready, |link| {
                link.write_characteristic(characteristic, value, write_type)
            })
            .await?
            .into_written()?;
        }

        self.inner.metrics.record_bytes_written(len);
        Ok(())
    }

    pub async fn write_descriptor(&self, descriptor: DescriptorRef, value: Bytes) -> Result<()> {
        self.execute(
            OperationKey::WriteDescriptor(descriptor),
            "write descriptor",
            Requires::Ready,
            |link| link.write_descriptor(descriptor, value),
        )
        .await?
        .into_written()
    }

    /// Register an observer and turn on delivery of pushed values.
    ///
    /// `cccd_value` is written to the characteristic's configuration
    /// descriptor; `None` skips the write for characteristics without one.
    /// Enabling and disabling are serialized. A failed enable leaves
    /// observers registered by earlier calls untouched.
    pub async fn enable_notifications(
        &self,
        characteristic: CharacteristicRef,
        cccd_value: Option<[u8; 2]>,
    ) -> Result<NotificationReceiver> {
        let _gate = self.inner.notify_gate.lock().await;
        let receiver = {
            let mut core = self.lock();
            self.check(&core, "enable notifications", Requires::Ready)?;
            let capacity = self.inner.config.notification_capacity;
            core.observers
                .entry(characteristic)
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe()
        };

        if let Err(e) = self.turn_on_delivery(characteristic, cccd_value).await {
            drop(receiver);
            let unobserved = {
                let mut core = self.lock();
                let unobserved = core
                    .observers
                    .get(&characteristic)
                    .is_some_and(|sender| sender.receiver_count() == 0);
                if unobserved {
                    core.observers.remove(&characteristic);
                }
                unobserved
            };
            if unobserved
                && let Err(err) = self
                    .inner
                    .link
                    .set_notification_delivery(characteristic, false)
            {
                warn!(
                    peer = %self.inner.peer,
                    characteristic = %characteristic,
                    error = %err,
                    "Failed to turn off notification delivery"
                );
            }
            return Err(e);
        }
        Ok(receiver)
    }

    async fn turn_on_delivery(
        &self,
        characteristic: CharacteristicRef,
        cccd_value: Option<[u8; 2]>,
    ) -> Result<()> {
        self.inner
            .link
            .set_notification_delivery(characteristic, true)?;
        if let Some(value) = cccd_value {
            let cccd = characteristic.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION);
            self.write_descriptor(cccd, Bytes::copy_from_slice(&value))
                .await?;
        }
        Ok(())
    }

    /// Drop all observers of `characteristic` and turn delivery off.
    pub async fn disable_notifications(
        &self,
        characteristic: CharacteristicRef,
        write_cccd: bool,
    ) -> Result<()> {
        let _gate = self.inner.notify_gate.lock().await;
        {
            let mut core = self.lock();
            self.check(&core, "disable notifications", Requires::Ready)?;
            core.observers.remove(&characteristic);
        }
        self.inner
            .link
            .set_notification_delivery(characteristic, false)?;
        if write_cccd {
            let cccd = characteristic.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION);
            self.write_descriptor(cccd, Bytes::from_static(&DISABLE_NOTIFICATION_VALUE))
                .await?;
        }
        Ok(())
    }

    /// Drop the cached catalog and rediscover attributes on the live link.
    ///
    /// Moves `Ready -> DiscoveringAttributes -> Ready` without reconnecting.
    pub async fn rediscover(&self) -> Result<Arc<AttributeCatalog>> {
        let _slot = self.inner.op_slot.lock().await;
        {
            let mut core = self.lock();
            self.check(&core, "rediscover attributes", Requires::Ready)?;
            if self.inner.cache.invalidate(&self.inner.peer) {
                self.inner.events.send(ConnectionEvent::CatalogInvalidated {
                    peer: self.inner.peer.clone(),
                });
            }
            core.catalog = None;
            core.catalog_from_cache = false;
            self.transition(&mut core, ConnectionState::DiscoveringAttributes);
        }

        info!(peer = %self.inner.peer, "Rediscovering attributes");
        self.start_discovery();

        let mut rx = self.subscribe_state();
        let state = rx
            .wait_for(|s| *s != ConnectionState::DiscoveringAttributes)
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::ConnectionClosed)?;

        let core = self.lock();
        match (&state, &core.catalog) {
            (ConnectionState::Ready, Some(catalog)) => Ok(Arc::clone(catalog)),
            _ => Err(self.failure_error(&core)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{LinkRequest, MockLink};
    use gattlink_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE};
    use gattlink_types::{CharacteristicProperties, GattCharacteristic};

    fn peer() -> PeerId {
        PeerId::new("AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn battery() -> CharacteristicRef {
        CharacteristicRef::new(BATTERY_SERVICE, BATTERY_LEVEL)
    }

    fn services() -> Vec<GattService> {
        vec![GattService::new(BATTERY_SERVICE).with_characteristic(GattCharacteristic::new(
            BATTERY_LEVEL,
            CharacteristicProperties::from_bits(0x1A),
        ))]
    }

    fn machine(config: ConnectionConfig) -> (ConnectionStateMachine, Arc<MockLink>) {
        let (link, _events) = MockLink::new();
        let machine =
            ConnectionStateMachine::new(peer(), link.clone(), ServiceCatalogCache::new(), config);
        (machine, link)
    }

    fn make_ready(machine: &ConnectionStateMachine) {
        machine.connect().unwrap();
        machine.handle_event(LinkEvent::LinkStateChanged {
            status: GattStatus::SUCCESS,
            state: LinkState::Connected,
        });
        machine.handle_event(LinkEvent::AttributesDiscovered {
            status: GattStatus::SUCCESS,
            services: services(),
        });
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (machine, link) = machine(ConnectionConfig::default());
        machine.connect().unwrap();
        machine.connect().unwrap();
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(link.count(|r| matches!(r, LinkRequest::Connect(_))), 1);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_platform() {
        let (machine, link) = machine(ConnectionConfig::default());
        make_ready(&machine);

        machine.disconnect().unwrap();
        assert_eq!(machine.state(), ConnectionState::Ready);
        assert_eq!(link.count(|r| matches!(r, LinkRequest::Disconnect)), 1);

        machine.handle_event(LinkEvent::LinkStateChanged {
            status: GattStatus::SUCCESS,
            state: LinkState::Disconnected,
        });
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_operations_require_ready() {
        let (machine, _link) = machine(ConnectionConfig::default());
        let err = machine.read_characteristic(battery()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: ConnectionState::Disconnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_late_completion_is_ignored() {
        let (machine, _link) = machine(ConnectionConfig::default());
        make_ready(&machine);
        machine.handle_event(LinkEvent::CharacteristicRead {
            characteristic: battery(),
            status: GattStatus::SUCCESS,
            value: Bytes::from_static(&[1]),
        });
        assert_eq!(machine.pending_operations(), 0);
        assert!(machine.state().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_holds_slot_until_link_loss() {
        let (machine, link) = machine(ConnectionConfig::default());
        make_ready(&machine);

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            machine.read_characteristic(battery()),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(machine.pending_operations(), 1);

        let mtu = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.request_mtu(185).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(link.count(|r| matches!(r, LinkRequest::RequestMtu(_))), 0);

        machine.handle_event(LinkEvent::LinkStateChanged {
            status: GattStatus::REMOTE_TERMINATED,
            state: LinkState::Disconnected,
        });
        assert_eq!(machine.pending_operations(), 0);
        assert!(matches!(
            mtu.await.unwrap(),
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(link.count(|r| matches!(r, LinkRequest::RequestMtu(_))), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (machine, link) = machine(ConnectionConfig::default());
        make_ready(&machine);

        machine.close();
        machine.close();
        machine.close();

        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.is_closed());
        assert_eq!(link.count(|r| matches!(r, LinkRequest::CloseHandle)), 1);
        assert!(matches!(
            machine.read_characteristic(battery()).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(machine.disconnect(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_events_after_close_are_ignored() {
        let (machine, _link) = machine(ConnectionConfig::default());
        machine.connect().unwrap();
        machine.close();

        machine.handle_event(LinkEvent::LinkStateChanged {
            status: GattStatus::SUCCESS,
            state: LinkState::Connected,
        });
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_discovery_failure_moves_to_error() {
        let (machine, _link) = machine(ConnectionConfig::default());
        machine.connect().unwrap();
        machine.handle_event(LinkEvent::LinkStateChanged {
            status: GattStatus::SUCCESS,
            state: LinkState::Connected,
        });
        machine.handle_event(LinkEvent::AttributesDiscovered {
            status: GattStatus::GATT_ERROR,
            services: Vec::new(),
        });

        let state = machine.state();
        assert!(state.is_error());
        assert!(state.to_string().contains("discovery failed"));
        assert!(matches!(
            machine.wait_until_ready().await,
            Err(Error::Discovery { status: GattStatus::GATT_ERROR, .. })
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_mtu_change_is_recorded() {
        let (machine, _link) = machine(ConnectionConfig::default());
        make_ready(&machine);
        machine.handle_event(LinkEvent::MtuChanged {
            mtu: 247,
            status: GattStatus::SUCCESS,
        });
        assert_eq!(machine.mtu(), 247);
    }

    #[tokio::test]
    async fn test_mtu_range_checked() {
        let (machine, _link) = machine(ConnectionConfig::default());
        make_ready(&machine);
        assert!(matches!(machine.request_mtu(10).await, Err(Error::InvalidData(_))));
        assert!(matches!(machine.request_mtu(600).await, Err(Error::InvalidData(_))));
    }
}
