//! Coordinator and forwarder agents for a single BLE collar device
//!
//! One collar, many radios: a central coordinator arbitrates which
//! endpoint — its own radio or one of several remote forwarder agents —
//! holds the device's single BLE link, and routes user commands to
//! whichever path is live.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod wire;
