//! Agent ↔ coordinator wire protocol
//!
//! Framed JSON text messages over an ordered, reliable stream (WebSocket
//! text frames). Every message is an object with a mandatory `"type"`
//! field; frame payloads travel as hex strings. Malformed messages are
//! discarded by receivers without closing the link.

use serde::{Deserialize, Serialize};

use collarlink_ble::{DetectionMethod, DiscoveredDevice};

/// A scan candidate as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDevice {
    pub address: String,
    pub name: String,
    pub rssi: i16,
    pub detection_method: DetectionMethod,
}

impl From<DiscoveredDevice> for ScanDevice {
    fn from(d: DiscoveredDevice) -> Self {
        Self {
            address: d.address,
            name: d.name,
            rssi: d.rssi,
            detection_method: d.detection_method,
        }
    }
}

/// Messages an agent sends to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    /// Mandatory first message on a fresh link
    Auth {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    /// Periodic liveness/state report, also sent on BLE edges
    Status {
        ble_connected: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        battery: Option<u8>,
    },
    /// Reply to a `scan` instruction
    ScanResult { devices: Vec<ScanDevice> },
    /// Unsolicited battery level from the device
    Battery { level: u8 },
    /// Reply to `get_rssi`
    Rssi { value: i16 },
    /// Reply to a `command`
    CommandResult { id: u64, success: bool },
}

/// Messages the coordinator sends to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CoordinatorMessage {
    /// Sent exactly once per link, straight after `auth`
    AuthResult { success: bool },
    /// Write this frame to the device; `data` is hex
    Command { id: u64, data: String },
    GetBattery,
    GetRssi,
    /// Run a timed scan; duration in milliseconds
    Scan { duration: u64 },
    /// Bring the BLE endpoint up
    Connect,
    /// Bring the BLE endpoint down
    DisconnectBle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_wire_shape() {
        let msg = AgentMessage::Auth {
            token: "secret".into(),
            node_id: Some("garage".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"auth""#));
        assert!(json.contains(r#""nodeId":"garage""#));

        let parsed: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_auth_node_id_is_optional() {
        let parsed: AgentMessage =
            serde_json::from_str(r#"{"type":"auth","token":"t"}"#).unwrap();
        assert_eq!(
            parsed,
            AgentMessage::Auth {
                token: "t".into(),
                node_id: None
            }
        );
    }

    #[test]
    fn test_status_camel_case_fields() {
        let parsed: AgentMessage =
            serde_json::from_str(r#"{"type":"status","bleConnected":true,"battery":73}"#).unwrap();
        assert_eq!(
            parsed,
            AgentMessage::Status {
                ble_connected: true,
                battery: Some(73)
            }
        );
    }

    #[test]
    fn test_unit_instruction_shapes() {
        assert_eq!(
            serde_json::to_string(&CoordinatorMessage::GetBattery).unwrap(),
            r#"{"type":"get_battery"}"#
        );
        assert_eq!(
            serde_json::to_string(&CoordinatorMessage::DisconnectBle).unwrap(),
            r#"{"type":"disconnect_ble"}"#
        );
    }

    #[test]
    fn test_scan_result_round_trip() {
        let msg = AgentMessage::ScanResult {
            devices: vec![ScanDevice {
                address: "AA:BB:CC:DD:EE:FF".into(),
                name: "collar".into(),
                rssi: -55,
                detection_method: DetectionMethod::ServiceUuid,
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""detectionMethod":"service-uuid""#));
        let parsed: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_malformed_messages_fail_to_parse() {
        // Receivers discard these rather than closing the link
        assert!(serde_json::from_str::<AgentMessage>("not json").is_err());
        assert!(serde_json::from_str::<AgentMessage>(r#"{"token":"t"}"#).is_err());
        assert!(serde_json::from_str::<AgentMessage>(r#"{"type":"bogus"}"#).is_err());
        assert!(
            serde_json::from_str::<AgentMessage>(r#"{"type":"status","bleConnected":"yes"}"#)
                .is_err()
        );
    }
}
