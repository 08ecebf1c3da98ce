//! Hardware integration tests for gattlink-core
//!
//! These tests require actual BLE hardware and should be run with:
//! ```text
//! cargo test --package gattlink-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the peripheral via environment variables:
//! - `GATTLINK_PEER`: address or advertised name of a connectable peripheral
//!
//! Example:
//! ```text
//! GATTLINK_PEER="AA:BB:CC:DD:EE:FF" cargo test --package gattlink-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use tokio::time::{sleep, timeout};

use gattlink_core::{
    BtleplugLink, Connection, ConnectionConfig, ConnectionState, ServiceCatalogCache,
};
use gattlink_types::PeerId;
use gattlink_types::uuid::{DEVICE_NAME, GAP_SERVICE};

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

fn get_peer() -> Option<String> {
    env::var("GATTLINK_PEER").ok().filter(|s| !s.is_empty())
}

async fn open(identifier: &str, cache: ServiceCatalogCache) -> Option<Connection> {
    let manager = Manager::new().await.ok()?;
    let adapter = manager.adapters().await.ok()?.into_iter().next()?;

    adapter.start_scan(ScanFilter::default()).await.ok()?;
    sleep(Duration::from_secs(5)).await;
    let _ = adapter.stop_scan().await;

    let wanted = identifier.to_lowercase();
    for peripheral in adapter.peripherals().await.ok()? {
        let address = peripheral.address().to_string();
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name)
            .unwrap_or_default();
        if address.to_lowercase() == wanted || name.to_lowercase().contains(&wanted) {
            let (link, events) = BtleplugLink::new(adapter, peripheral);
            let peer = PeerId::new(&address).ok()?;
            let config = ConnectionConfig::default().operation_timeout(Some(BLE_TIMEOUT));
            return Connection::new(peer, link, events, cache, config).ok();
        }
    }
    None
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_connect_and_read_device_name() {
    let Some(identifier) = get_peer() else {
        println!("Skipping: GATTLINK_PEER not set");
        return;
    };
    let Some(connection) = open(&identifier, ServiceCatalogCache::new()).await else {
        println!("Skipping: {} not found", identifier);
        return;
    };

    connection.connect().await.expect("connect");
    assert_eq!(connection.state(), ConnectionState::Ready);

    let catalog = connection.catalog().expect("catalog");
    println!("Discovered {} characteristics", catalog.characteristic_count());

    match connection.read(GAP_SERVICE, DEVICE_NAME).await {
        Ok(value) => println!("Device name: {}", String::from_utf8_lossy(&value)),
        Err(e) => println!("Device name not readable: {}", e),
    }

    connection.disconnect().await.expect("disconnect");
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    connection.close();
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_reconnect_reuses_cached_catalog() {
    let Some(identifier) = get_peer() else {
        println!("Skipping: GATTLINK_PEER not set");
        return;
    };
    let cache = ServiceCatalogCache::new();
    let Some(connection) = open(&identifier, cache.clone()).await else {
        println!("Skipping: {} not found", identifier);
        return;
    };

    connection.connect().await.expect("first connect");
    connection.disconnect().await.expect("disconnect");

    let reconnect = timeout(BLE_TIMEOUT, connection.connect()).await;
    assert!(matches!(reconnect, Ok(Ok(()))), "reconnect: {:?}", reconnect);
    assert!(connection.machine().catalog_from_cache());
    assert_eq!(cache.len(), 1);

    let metrics = connection.metrics();
    println!("Metrics: {:?}", metrics);
    assert_eq!(metrics.discoveries, 1);
    assert_eq!(metrics.cache_hits, 1);

    connection.close();
}
