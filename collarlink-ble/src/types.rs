//! Common types for the BLE endpoint layer

use serde::{Deserialize, Serialize};

/// Endpoint lifecycle phase
///
/// `Ready` is entered only once the TX characteristic is known and the RX
/// notification subscription has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// No link and no attempt in flight
    Idle,
    /// Searching for / connecting to the device
    Connecting,
    /// Connected, resolving the UART service and characteristics
    Discovering,
    /// Link up, writable
    Ready,
    /// Link lost; auto-reconnect decides what happens next
    Disconnected,
}

impl EndpointState {
    /// Whether a connection attempt is in flight or established
    pub fn is_engaged(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Ready)
    }
}

/// How a scan candidate was recognized as compatible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    /// Advertised the UART service UUID
    ServiceUuid,
    /// Local name contained a configured pattern
    NamePattern,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceUuid => "service-uuid",
            Self::NamePattern => "name-pattern",
        }
    }
}

/// A compatible peripheral seen during a timed scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Platform identifier (MAC address on Linux, UUID on macOS)
    pub address: String,
    /// Advertised local name (may be empty)
    pub name: String,
    /// Signal strength at discovery time (dBm)
    pub rssi: i16,
    /// Which rule matched
    pub detection_method: DetectionMethod,
}

/// Events emitted by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    /// Link established and characteristics resolved
    Connected,
    /// Link lost or torn down
    Disconnected,
    /// Battery level notification from the device (0-100)
    Battery(u8),
}
