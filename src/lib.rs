//! GPIO ⇄ MQTT bridge
//!
//! Drives output pins from `<topic>/in/<pin>` messages and publishes input pin
//! changes on `<topic>/out/<pin>`, with a retained LWT record telling subscribers
//! whether the bridge is online.

pub mod bridge;
pub mod config;
pub mod gpio;
pub mod mqtt;
