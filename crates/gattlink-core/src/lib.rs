//! Connection lifecycle and operation multiplexing for GATT-style attribute links.
//!
//! This crate sits between application code and a platform Bluetooth stack.
//! The platform is driven through the narrow [`GattLink`] interface and
//! reports back on a single [`LinkEvent`] channel; this crate turns that
//! callback-shaped surface into a state machine with a watchable state and
//! plain `async` request/response operations.
//!
//! # Features
//!
//! - **Connection state machine**: one authority over the connection state,
//!   with an observable state stream (last value replayed to new observers)
//! - **Operation multiplexing**: one outstanding platform request at a time,
//!   completions matched back to waiters by operation key
//! - **Catalog cache**: discovered attribute trees shared across connections
//!   and reused on reconnect, with layout fingerprints to detect changes
//! - **Chunked writes**: values larger than the MTU allows are split and
//!   written in order
//! - **Auto-reconnect**: opt-in, with exponential backoff and jitter
//! - **Notifications**: per-characteristic multicast of pushed values
//! - **Backends**: a btleplug adapter and an in-memory mock for tests
//!
//! # Connection States
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> DiscoveringAttributes -> Ready
//!                                      \_______ cached catalog _______/
//! ```
//!
//! `Disconnected` and `Error` are reachable from every state. `close()`
//! always settles in `Disconnected`.
//!
//! # Quick Start
//!
//! ```
//! use gattlink_core::{Connection, ConnectionConfig, MockLink, MockPeripheral, ServiceCatalogCache};
//! use gattlink_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE};
//! use gattlink_types::PeerId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // One cache per process, shared by every connection.
//!     let cache = ServiceCatalogCache::new();
//!
//!     let (link, events) = MockLink::with_peripheral(MockPeripheral::battery(64));
//!     let peer = PeerId::new("AA:BB:CC:DD:EE:FF")?;
//!     let connection = Connection::new(peer, link, events, cache, ConnectionConfig::default())?;
//!
//!     connection.connect().await?;
//!     connection.write(BATTERY_SERVICE, BATTERY_LEVEL, vec![42]).await?;
//!     let value = connection.read(BATTERY_SERVICE, BATTERY_LEVEL).await?;
//!     assert_eq!(value.as_ref(), &[42]);
//!
//!     connection.close();
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod cache;
pub mod chunked;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod link;
pub mod machine;
pub mod metrics;
pub mod mock;
pub mod operation;
pub mod reconnect;
pub mod registry;
pub mod retry;
pub mod state;
pub mod traits;

// Re-export the attribute model
pub use gattlink_types::types;
pub use gattlink_types::uuid;
pub use gattlink_types::uuid as uuids;
pub use gattlink_types::{
    AttributeCatalog, CharacteristicRef, DescriptorRef, GattService, GattStatus, PeerId, Phy,
    PhyOptions,
};

// Core exports
pub use connection::Connection;
pub use error::{Error, Result};
pub use machine::{ConnectionStateMachine, NotificationReceiver};
pub use state::{ConnectionState, LinkState};
pub use traits::AttributeClient;

/// Type alias for a shared connection.
///
/// `Connection` closes itself on drop and is not `Clone`; wrap it in `Arc`
/// to use it from several tasks.
pub type SharedConnection = std::sync::Arc<Connection>;

pub use btle::BtleplugLink;
pub use cache::{CatalogUpdate, ServiceCatalogCache};
pub use chunked::{Chunk, ChunkedWriteEngine, ChunkedWriteReport, usable_chunk_size};
pub use config::ConnectionConfig;
pub use events::{ConnectionEvent, DisconnectReason, EventDispatcher, EventReceiver, EventSender};
pub use link::{GattLink, LinkEvent, LinkEventReceiver, LinkEventSender, WriteType, link_event_channel};
pub use metrics::{ConnectionMetrics, ConnectionMetricsSummary, OperationMetrics};
pub use mock::{MockLink, MockPeripheral};
pub use operation::{OperationKey, OperationKind, OperationOutput};
pub use reconnect::{ReconnectAttempt, ReconnectDecision, ReconnectOptions, ReconnectPolicy};
pub use registry::{OperationCompletionRegistry, PendingCompletion};
pub use retry::{RetryConfig, is_retryable, with_retry};
