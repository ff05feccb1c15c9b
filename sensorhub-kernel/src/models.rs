use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A monitored device as persisted in the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    #[serde(default)]
    pub location: String,
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

impl Device {
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: String::new(),
            topic: topic.into(),
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

    pub fn controls(&self) -> ControlStates {
        ControlStates {
            fans_state: self.fans_state,
            lights_state: self.lights_state,
            hvac_state: self.hvac_state,
        }
    }
}

/// Persisted document layout: `{"devices": [...]}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub devices: Vec<Device>,
}

/// One of the three boolean actuators carried by every device.
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
    pub const ALL: [ControlKey; 3] = [ControlKey::Fans, ControlKey::Lights, ControlKey::Hvac];

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

impl FromStr for ControlKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown control key '{s}'"))
    }
}

/// Payload published on `{topic}-control` for the actuator side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStates {
    pub fans_state: bool,
    pub lights_state: bool,
    pub hvac_state: bool,
}

/// Registry write request; everything but `name` and `topic` may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInput {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub location: Option<String>,
    pub image: Option<String>,
    pub fans_state: Option<bool>,
    pub lights_state: Option<bool>,
    pub hvac_state: Option<bool>,
}

impl From<Device> for DeviceInput {
    fn from(d: Device) -> Self {
        Self {
            name: Some(d.name),
            topic: Some(d.topic),
            location: Some(d.location),
            image: d.image,
            fans_state: Some(d.fans_state),
            lights_state: Some(d.lights_state),
            hvac_state: Some(d.hvac_state),
        }
    }
}

/// Body of `POST /api/devices/{name}/control`.
#[derive(Debug, Deserialize)]
pub struct ControlChange {
    pub key: String,
    pub value: bool,
}

/// Field carrying the device identity in a telemetry payload.
pub const DEVICE_ID_FIELD: &str = "deviceIdentifier";

/// A parsed telemetry payload. The raw text is kept so that it can be relayed verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub device: String,
    pub metrics: BTreeMap<String, f64>,
}

impl TelemetryEvent {
    /// Parses `{"deviceIdentifier": "...", "<metric>": <number>, ...}`.
    /// Non-numeric fields other than the identifier are tolerated and ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| format!("invalid JSON: {e}"))?;
        let serde_json::Value::Object(map) = value else {
            return Err("payload is not a JSON object".into());
        };

        let device = match map.get(DEVICE_ID_FIELD) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(_) => return Err(format!("'{DEVICE_ID_FIELD}' must be a non-empty string")),
            None => return Err(format!("missing '{DEVICE_ID_FIELD}'")),
        };

        let metrics: BTreeMap<String, f64> = map
            .iter()
            .filter(|(k, _)| k.as_str() != DEVICE_ID_FIELD)
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
            .collect();

        if metrics.is_empty() {
            return Err("no numeric metric in payload".into());
        }

        Ok(Self { device, metrics })
    }
}
