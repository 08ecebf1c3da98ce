//! Example: Reading a Battery Level Over btleplug
//!
//! Scans for a peripheral by address or name, connects through
//! `BtleplugLink`, prints the discovered attribute catalog and reads the
//! standard battery level characteristic.
//!
//! Run with: `cargo run --example read_battery -- <DEVICE_ADDRESS_OR_NAME>`

use std::env;
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use tokio::time::sleep;

use gattlink_core::{BtleplugLink, Connection, ConnectionConfig, ServiceCatalogCache};
use gattlink_types::PeerId;
use gattlink_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let identifier = if args.len() > 1 {
        &args[1]
    } else {
        eprintln!("Usage: {} <DEVICE_ADDRESS_OR_NAME>", args[0]);
        eprintln!();
        eprintln!("Example:");
        eprintln!("  {} AA:BB:CC:DD:EE:FF", args[0]);
        std::process::exit(1);
    };

    println!("Scanning for {}...", identifier);

    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or("No Bluetooth adapter")?;

    adapter.start_scan(ScanFilter::default()).await?;
    sleep(Duration::from_secs(5)).await;
    adapter.stop_scan().await?;

    let wanted = identifier.to_lowercase();
    let mut found = None;
    for peripheral in adapter.peripherals().await? {
        let address = peripheral.address().to_string();
        let name = peripheral
            .properties()
            .await?
            .and_then(|p| p.local_name)
            .unwrap_or_default();
        if address.to_lowercase() == wanted || name.to_lowercase().contains(&wanted) {
            found = Some((address, peripheral));
            break;
        }
    }
    let (address, peripheral) = found.ok_or("Device not found")?;

    let (link, events) = BtleplugLink::new(adapter, peripheral);
    let connection = Connection::new(
        PeerId::new(&address)?,
        link,
        events,
        ServiceCatalogCache::new(),
        ConnectionConfig::resilient(),
    )?;

    println!("Connecting to {}...", address);
    connection.connect().await?;
    println!("Connected!");

    if let Some(catalog) = connection.catalog() {
        println!();
        println!("Services:");
        for service in catalog.services() {
            println!("  {}", service.uuid);
            for characteristic in &service.characteristics {
                println!(
                    "    {} (properties 0x{:02X})",
                    characteristic.uuid,
                    characteristic.properties.bits()
                );
            }
        }
    }

    println!();
    match connection.read(BATTERY_SERVICE, BATTERY_LEVEL).await {
        Ok(value) => match value.first() {
            Some(level) => println!("Battery: {}%", level),
            None => println!("Battery: empty value"),
        },
        Err(e) => println!("Battery: unavailable ({})", e),
    }

    connection.disconnect().await?;
    connection.close();
    println!();
    println!("Disconnected.");

    Ok(())
}
