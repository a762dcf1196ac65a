//! Peripheral identification strategy
//!
//! Hosts differ in what they expose about a peripheral: Linux/BlueZ gives
//! MAC addresses, CoreBluetooth does not. The matcher folds those
//! differences into one value so call sites never branch on platform:
//! a candidate is the target if its address equals the configured one, or
//! it advertises the UART service, or its local name contains a configured
//! pattern.

use uuid::Uuid;

use crate::types::DetectionMethod;
use crate::UART_SERVICE_UUID;

/// Rules for recognizing the collar among scan candidates
#[derive(Debug, Clone, Default)]
pub struct DeviceMatcher {
    /// Exact peripheral identifier, where the platform exposes one
    pub address: Option<String>,
    /// Case-insensitive substrings matched against the advertised name
    pub name_patterns: Vec<String>,
}

impl DeviceMatcher {
    pub fn new(address: Option<String>, name_patterns: Vec<String>) -> Self {
        Self {
            address,
            name_patterns,
        }
    }

    /// Classify a candidate as compatible, preferring the service UUID
    /// match over a name-pattern match.
    pub fn detect(&self, name: Option<&str>, services: &[Uuid]) -> Option<DetectionMethod> {
        if services.contains(&UART_SERVICE_UUID) {
            return Some(DetectionMethod::ServiceUuid);
        }
        if let Some(name) = name {
            let lower = name.to_lowercase();
            if self
                .name_patterns
                .iter()
                .any(|p| lower.contains(&p.to_lowercase()))
            {
                return Some(DetectionMethod::NamePattern);
            }
        }
        None
    }

    /// Whether a candidate is the device this endpoint should connect to
    pub fn is_target(&self, address: &str, name: Option<&str>, services: &[Uuid]) -> bool {
        if let Some(wanted) = &self.address {
            if wanted.eq_ignore_ascii_case(address) {
                return true;
            }
        }
        self.detect(name, services).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uart() -> Vec<Uuid> {
        vec![UART_SERVICE_UUID]
    }

    #[test]
    fn test_service_uuid_dominates_name_pattern() {
        let matcher = DeviceMatcher::new(None, vec!["collar".into()]);
        assert_eq!(
            matcher.detect(Some("My Collar"), &uart()),
            Some(DetectionMethod::ServiceUuid)
        );
    }

    #[test]
    fn test_name_pattern_is_case_insensitive_substring() {
        let matcher = DeviceMatcher::new(None, vec!["CoLLaR".into()]);
        assert_eq!(
            matcher.detect(Some("petsafe-collar-42"), &[]),
            Some(DetectionMethod::NamePattern)
        );
        assert_eq!(matcher.detect(Some("headphones"), &[]), None);
        assert_eq!(matcher.detect(None, &[]), None);
    }

    #[test]
    fn test_no_patterns_requires_service_uuid() {
        let matcher = DeviceMatcher::default();
        assert_eq!(matcher.detect(Some("anything"), &[]), None);
        assert_eq!(
            matcher.detect(None, &uart()),
            Some(DetectionMethod::ServiceUuid)
        );
    }

    #[test]
    fn test_is_target_by_address() {
        let matcher = DeviceMatcher::new(Some("AA:BB:CC:DD:EE:FF".into()), vec![]);
        assert!(matcher.is_target("aa:bb:cc:dd:ee:ff", None, &[]));
        assert!(!matcher.is_target("11:22:33:44:55:66", None, &[]));
        // Service match still wins when the address differs
        assert!(matcher.is_target("11:22:33:44:55:66", None, &uart()));
    }
}
