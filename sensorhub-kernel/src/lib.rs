//! SensorHub kernel: telemetry fan-out hub, device registry and MQTT bridge.

pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod hub;
pub mod models;
pub mod mqtt;
pub mod registry;
pub mod state;
pub mod store;
