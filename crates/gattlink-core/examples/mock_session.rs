//! Example: A Connection Against the In-Memory Peripheral
//!
//! Walks through the connection lifecycle without hardware: connect,
//! a chunked write, notifications, a link drop with auto-reconnect and a
//! second connect served from the catalog cache.
//!
//! Run with: `cargo run --example mock_session`

use std::time::Duration;

use gattlink_core::{
    Connection, ConnectionConfig, ConnectionEvent, GattStatus, MockLink, MockPeripheral,
    ReconnectOptions, ServiceCatalogCache,
};
use gattlink_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE};
use gattlink_types::{CharacteristicRef, PeerId};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cache = ServiceCatalogCache::new();
    let peer = PeerId::new("AA:BB:CC:DD:EE:FF")?;
    let (link, events) = MockLink::with_peripheral(MockPeripheral::battery(80).max_mtu(185));
    let config = ConnectionConfig::default()
        .auto_reconnect(true)
        .reconnect(ReconnectOptions::fixed_delay(Duration::from_millis(200)));
    let connection = Connection::new(peer, link.clone(), events, cache.clone(), config)?;

    let mut log = connection.events();
    tokio::spawn(async move {
        while let Ok(event) = log.recv().await {
            match event {
                ConnectionEvent::StateChanged { from, to, .. } => println!("  [{} -> {}]", from, to),
                ConnectionEvent::ReconnectScheduled { attempt, delay_ms, .. } => {
                    println!("  [reconnect #{} in {}ms]", attempt, delay_ms)
                }
                _ => {}
            }
        }
    });

    println!("Connecting...");
    connection.connect().await?;

    let mtu = connection.request_mtu(185).await?;
    println!("MTU: {}", mtu);

    let payload = vec![0xAB; 600];
    connection
        .write(BATTERY_SERVICE, BATTERY_LEVEL, payload)
        .await?;
    let chunks = link.written_values(CharacteristicRef::new(BATTERY_SERVICE, BATTERY_LEVEL));
    println!("600-byte write sent as {} chunks", chunks.len());

    let mut values = connection
        .enable_notifications(BATTERY_SERVICE, BATTERY_LEVEL)
        .await?;
    link.notify(CharacteristicRef::new(BATTERY_SERVICE, BATTERY_LEVEL), vec![79]);
    if let Ok(value) = values.recv().await {
        println!("Notified: {:?}", value.as_ref());
    }

    println!("Dropping the link...");
    link.drop_link(GattStatus::REMOTE_TERMINATED);
    connection.wait_for_state(|s| s.is_error()).await?;
    connection.wait_for_state(|s| s.is_ready()).await?;
    println!("Reconnected, catalog from cache: {}", connection.machine().catalog_from_cache());

    let metrics = connection.metrics();
    println!();
    println!("Connect attempts:   {}", metrics.connect_attempts);
    println!("Reconnect attempts: {}", metrics.reconnect_attempts);
    println!("Discoveries:        {}", metrics.discoveries);
    println!("Cache hits:         {}", metrics.cache_hits);
    println!("Bytes written:      {}", metrics.bytes_written);

    connection.close();
    Ok(())
}
