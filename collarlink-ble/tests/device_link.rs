//! Integration tests against a real collar.
//!
//! These require a powered device in radio range.
//! Run with: cargo test -p collarlink-ble --test device_link -- --ignored --nocapture

use std::time::Duration;

use collarlink_ble::{
    encode_find, BleEndpoint, DeviceMatcher, EndpointConfig, EndpointEvent,
};

fn config() -> EndpointConfig {
    EndpointConfig {
        matcher: DeviceMatcher::new(None, vec!["collar".into()]),
        ..EndpointConfig::default()
    }
}

async fn connect() -> BleEndpoint {
    let endpoint = BleEndpoint::new(config())
        .await
        .expect("No BLE adapter — is Bluetooth up?");
    let mut events = endpoint.subscribe();
    endpoint.connect();
    loop {
        match tokio::time::timeout(Duration::from_secs(40), events.recv())
            .await
            .expect("device not found within the connect window")
        {
            Ok(EndpointEvent::Connected) => break,
            Ok(_) => {}
            Err(e) => panic!("event stream failed: {e}"),
        }
    }
    endpoint
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // requires hardware
async fn scan_reports_the_collar() {
    let endpoint = BleEndpoint::new(config())
        .await
        .expect("No BLE adapter — is Bluetooth up?");
    let devices = endpoint
        .scan(Duration::from_secs(10))
        .await
        .expect("scan failed");

    assert!(
        !devices.is_empty(),
        "no compatible device in range — power the collar on"
    );
    for device in &devices {
        eprintln!(
            "  {} '{}' {} dBm via {}",
            device.address,
            device.name,
            device.rssi,
            device.detection_method.as_str()
        );
        assert!(device.rssi < 0, "advert RSSI should be negative dBm");
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // requires hardware
async fn connect_then_battery_report_arrives() {
    let endpoint = connect().await;
    let mut events = endpoint.subscribe();

    // The battery interval queries right after connect; give the
    // notification a generous window.
    endpoint.request_battery().await;
    let level = loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("no battery notification within 10 seconds")
        {
            Ok(EndpointEvent::Battery(level)) => break level,
            Ok(_) => {}
            Err(e) => panic!("event stream failed: {e}"),
        }
    };
    eprintln!("battery: {level}%");
    assert!(level <= 100);
    assert_eq!(endpoint.last_battery(), Some(level));

    endpoint.disconnect().await;
    assert!(!endpoint.is_ready());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // requires hardware
async fn find_beacon_write_succeeds() {
    let endpoint = connect().await;
    assert!(endpoint.write(&encode_find()).await);

    let rssi = endpoint.read_rssi().await;
    eprintln!("live rssi: {rssi:?}");

    endpoint.disconnect().await;
}
