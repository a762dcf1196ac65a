//! Direct-device operator commands
//!
//! These drive the local radio without a coordinator: scan, send, find,
//! battery. Handy for bring-up and for checking a collar from whichever
//! machine is closest.

use std::time::Duration;

use tracing::debug;

use collarlink_ble::{clamp_level, encode_command, encode_find, BleEndpoint, EndpointEvent};

use collarlink::config::Config;

/// Gap between the two writes of a command frame
const REPEAT_GAP: Duration = Duration::from_millis(300);

/// Ceiling on the connect attempt (device search window plus margin)
const CONNECT_WAIT: Duration = Duration::from_secs(35);

/// Window for the battery notification after a query
const BATTERY_WAIT: Duration = Duration::from_secs(5);

pub async fn scan(config: &Config, duration_ms: Option<u64>) -> anyhow::Result<()> {
    let endpoint = BleEndpoint::new(config.device.endpoint_config()).await?;
    let duration = Duration::from_millis(duration_ms.unwrap_or(config.device.scan_duration_ms));
    let devices = endpoint.scan(duration).await?;

    if devices.is_empty() {
        println!("No compatible devices found");
        return Ok(());
    }
    println!("{:<28} {:<20} {:>5}  {}", "ADDRESS", "NAME", "RSSI", "DETECTED VIA");
    for device in devices {
        println!(
            "{:<28} {:<20} {:>5}  {}",
            device.address,
            device.name,
            device.rssi,
            device.detection_method.as_str()
        );
    }
    Ok(())
}

pub async fn send(config: &Config, shock: f64, vibro: f64, sound: f64) -> anyhow::Result<()> {
    let endpoint = connect(config).await?;
    let frame = encode_command(shock, vibro, sound);
    // Same double-send the coordinator applies to command frames
    let first = endpoint.write(&frame).await;
    tokio::time::sleep(REPEAT_GAP).await;
    let second = endpoint.write(&frame).await;
    anyhow::ensure!(first && second, "BLE write failed");

    println!(
        "Command sent: shock={} vibro={} sound={}",
        clamp_level(shock),
        clamp_level(vibro),
        clamp_level(sound)
    );
    endpoint.disconnect().await;
    Ok(())
}

pub async fn find(config: &Config) -> anyhow::Result<()> {
    let endpoint = connect(config).await?;
    anyhow::ensure!(endpoint.write(&encode_find()).await, "BLE write failed");
    println!("Find beacon triggered");
    endpoint.disconnect().await;
    Ok(())
}

pub async fn battery(config: &Config) -> anyhow::Result<()> {
    let endpoint = connect(config).await?;
    let mut events = endpoint.subscribe();
    endpoint.request_battery().await;

    let deadline = tokio::time::sleep(BATTERY_WAIT);
    tokio::pin!(deadline);
    let level = loop {
        tokio::select! {
            _ = &mut deadline => break endpoint.last_battery(),
            event = events.recv() => match event {
                Ok(EndpointEvent::Battery(level)) => break Some(level),
                Ok(_) => {}
                Err(_) => break endpoint.last_battery(),
            },
        }
    };
    match level {
        Some(level) => println!("Battery: {level}%"),
        None => println!("No battery report from the device"),
    }
    endpoint.disconnect().await;
    Ok(())
}

/// Bring the endpoint up and wait until it is ready to write.
async fn connect(config: &Config) -> anyhow::Result<BleEndpoint> {
    let endpoint = BleEndpoint::new(config.device.endpoint_config()).await?;
    let mut events = endpoint.subscribe();
    endpoint.connect();
    debug!("waiting for the collar link");
    loop {
        match tokio::time::timeout(CONNECT_WAIT, events.recv()).await {
            Ok(Ok(EndpointEvent::Connected)) => return Ok(endpoint),
            Ok(Ok(_)) => {}
            Ok(Err(_)) => anyhow::bail!("endpoint event stream closed"),
            Err(_) => anyhow::bail!("device not found"),
        }
    }
}
