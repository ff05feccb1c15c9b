/*!
# SensorHub DevKit - test doubles for the kernel and its tools

- MQTT client stub recording publications and subscriptions, no broker needed
- Builders for sensor readings, hub telemetry events and registry records
*/

pub mod mqtt_stub;

pub use mqtt_stub::{MockMqttClient, TelemetryMessageBuilder};
