//! TOML configuration for the coordinator and agent daemons
//!
//! Every field has a default; a missing file means "all defaults". A file
//! that exists but does not parse is fatal at startup.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use collarlink_ble::{DeviceMatcher, EndpointConfig};

/// Address type for platforms that connect by MAC; ignored elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

/// Device selection and radio tunables, shared by both roles
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Peripheral address, where the platform exposes one
    pub address: Option<String>,
    pub address_type: AddressType,
    /// Host adapter index (HCI interface on Linux)
    pub hci_index: usize,
    /// Case-insensitive substrings matched against advertised names
    pub name_patterns: Vec<String>,
    pub scan_duration_ms: u64,
    pub reconnect_delay_ms: u64,
    pub battery_check_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            address_type: AddressType::Public,
            hci_index: 0,
            name_patterns: Vec::new(),
            scan_duration_ms: 10_000,
            reconnect_delay_ms: 5_000,
            battery_check_interval_ms: 1_800_000,
        }
    }
}

impl DeviceConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    /// Endpoint settings derived from this section.
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            matcher: DeviceMatcher::new(self.address.clone(), self.name_patterns.clone()),
            adapter_index: self.hci_index,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            battery_check_interval: Duration::from_millis(self.battery_check_interval_ms),
            ..EndpointConfig::default()
        }
    }
}

/// Coordinator daemon settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Agent channel listen address
    pub listen_addr: String,
    /// Shared secret; `""` or `"none"` disables authentication
    pub token: String,
    pub ping_interval_ms: u64,
    pub stale_timeout_ms: u64,
    pub handoff_timeout_ms: u64,
    /// Bring the local endpoint up at startup
    pub scan_on_start: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3816".into(),
            token: String::new(),
            ping_interval_ms: 30_000,
            stale_timeout_ms: 60_000,
            handoff_timeout_ms: 30_000,
            scan_on_start: true,
        }
    }
}

impl CoordinatorConfig {
    /// Authentication is disabled for an empty or literal-"none" token.
    pub fn auth_enabled(&self) -> bool {
        !(self.token.is_empty() || self.token == "none")
    }
}

/// Forwarder agent settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Coordinator WebSocket URL
    pub server_url: String,
    /// Shared secret presented on `auth`
    pub token: String,
    /// Stable identifier; the coordinator generates one when omitted
    pub node_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3816".into(),
            token: String::new(),
            node_id: None,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub coordinator: CoordinatorConfig,
    pub agent: AgentConfig,
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_timings() {
        let config = Config::default();
        assert_eq!(config.device.scan_duration_ms, 10_000);
        assert_eq!(config.device.reconnect_delay_ms, 5_000);
        assert_eq!(config.device.battery_check_interval_ms, 1_800_000);
        assert_eq!(config.coordinator.ping_interval_ms, 30_000);
        assert_eq!(config.coordinator.stale_timeout_ms, 60_000);
        assert_eq!(config.coordinator.handoff_timeout_ms, 30_000);
        assert!(config.coordinator.scan_on_start);
    }

    #[test]
    fn test_auth_disabled_for_empty_and_none() {
        let mut config = CoordinatorConfig::default();
        assert!(!config.auth_enabled());
        config.token = "none".into();
        assert!(!config.auth_enabled());
        config.token = "hunter2".into();
        assert!(config.auth_enabled());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [coordinator]
            token = "secret"
            ping_interval_ms = 5000

            [device]
            name_patterns = ["collar", "petsafe"]
            address = "AA:BB:CC:DD:EE:FF"
            address_type = "random"
            "#,
        )
        .unwrap();
        assert_eq!(config.coordinator.token, "secret");
        assert_eq!(config.coordinator.ping_interval_ms, 5_000);
        // Untouched fields keep their defaults
        assert_eq!(config.coordinator.stale_timeout_ms, 60_000);
        assert_eq!(config.device.name_patterns.len(), 2);
        assert_eq!(config.device.address_type, AddressType::Random);
        assert_eq!(config.agent.server_url, "ws://127.0.0.1:3816");
    }

    #[test]
    fn test_endpoint_config_carries_matcher() {
        let device = DeviceConfig {
            address: Some("AA:BB:CC:DD:EE:FF".into()),
            name_patterns: vec!["collar".into()],
            hci_index: 1,
            ..DeviceConfig::default()
        };
        let endpoint = device.endpoint_config();
        assert_eq!(endpoint.adapter_index, 1);
        assert_eq!(endpoint.matcher.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(endpoint.matcher.name_patterns, vec!["collar".to_string()]);
        assert_eq!(endpoint.reconnect_delay, Duration::from_secs(5));
    }
}
