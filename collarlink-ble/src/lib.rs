//! BLE endpoint and frame codec for the collar device
//!
//! The collar is a single BLE peripheral speaking a Nordic UART-style
//! framed byte protocol. This crate provides:
//!
//! - the frame codec (command, find-beacon, battery query, battery report)
//! - a stateful endpoint wrapping one host radio's link to the device
//! - the identification strategy used to recognize the device on hosts
//!   that do and do not expose peripheral addresses
//!
//! The endpoint is used identically by the coordinator (local radio) and
//! by every forwarder agent.

pub mod endpoint;
pub mod error;
pub mod matcher;
pub mod protocol;
pub mod types;

pub use endpoint::{BleEndpoint, EndpointConfig};
pub use error::BleError;
pub use matcher::DeviceMatcher;
pub use protocol::{
    clamp_level, encode_battery_query, encode_command, encode_find, parse_notification, Frame,
    FrameKind,
};
pub use types::{DetectionMethod, DiscoveredDevice, EndpointEvent, EndpointState};

use uuid::Uuid;

/// UART service advertised by the collar
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Write-without-response characteristic (host → device)
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Notify characteristic (device → host)
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);
