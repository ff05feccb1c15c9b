//! Wire types as served by the kernel (same field names as the registry file).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub fans_state: bool,
    #[serde(default)]
    pub lights_state: bool,
    #[serde(default)]
    pub hvac_state: bool,
}

impl DeviceSnapshot {
    /// Placeholder shown until the registry answers: only the name is known.
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: String::new(),
            topic: String::new(),
            image: None,
            fans_state: false,
            lights_state: false,
            hvac_state: false,
        }
    }

    pub fn control(&self, key: ControlKey) -> bool {
        match key {
            ControlKey::Fans => self.fans_state,
            ControlKey::Lights => self.lights_state,
            ControlKey::Hvac => self.hvac_state,
        }
    }

    pub fn set_control(&mut self, key: ControlKey, value: bool) {
        match key {
            ControlKey::Fans => self.fans_state = value,
            ControlKey::Lights => self.lights_state = value,
            ControlKey::Hvac => self.hvac_state = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKey {
    #[serde(rename = "fansState")]
    Fans,
    #[serde(rename = "lightsState")]
    Lights,
    #[serde(rename = "hvacState")]
    Hvac,
}

impl ControlKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKey::Fans => "fansState",
            ControlKey::Lights => "lightsState",
            ControlKey::Hvac => "hvacState",
        }
    }
}

impl fmt::Display for ControlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relayed telemetry frame: device identifier plus its numeric metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub device: String,
    pub metrics: BTreeMap<String, f64>,
}

impl TelemetryEvent {
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
        let serde_json::Value::Object(map) = value else {
            return Err("frame is not a JSON object".into());
        };
        let device = map
            .get("deviceIdentifier")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or("missing 'deviceIdentifier'")?
            .to_string();
        let metrics = map
            .iter()
            .filter(|(k, _)| k.as_str() != "deviceIdentifier")
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
            .collect();
        Ok(Self { device, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enriched_bridge_frame() {
        let ev = TelemetryEvent::parse(
            r#"{"co2":512.0,"deviceIdentifier":"Room1","humidity":40.5,"location":"Lab","temperature":22.5,"topic":"temp1"}"#,
        )
        .unwrap();
        assert_eq!(ev.device, "Room1");
        assert_eq!(ev.metrics.keys().collect::<Vec<_>>(), ["co2", "humidity", "temperature"]);
    }

    #[test]
    fn snapshot_accepts_registry_record() {
        let d: DeviceSnapshot =
            serde_json::from_str(r#"{"name":"Room1","topic":"temp1","fansState":true}"#).unwrap();
        assert!(d.control(ControlKey::Fans));
        assert!(!d.control(ControlKey::Hvac));
    }
}
