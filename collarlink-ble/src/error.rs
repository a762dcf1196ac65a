//! BLE endpoint error types

use thiserror::Error;

/// Errors that can occur while driving the collar link
#[derive(Error, Debug)]
pub enum BleError {
    #[error("No BLE adapter available")]
    NoAdapter,

    #[error("Adapter index {0} does not exist")]
    NoSuchAdapter(usize),

    #[error("Device not found within {0:?}")]
    DeviceNotFound(std::time::Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("GATT characteristic not found: {0}")]
    CharacteristicNotFound(&'static str),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}
