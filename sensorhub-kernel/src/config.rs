use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub mqtt: MqttConf,
    pub registry: RegistryConf,
    pub fanout: FanoutConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".into(),
            port: 1883,
            client_id: "sensorhub-kernel".into(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConf {
    pub path: PathBuf,
}

impl Default for RegistryConf {
    fn default() -> Self {
        Self { path: PathBuf::from("data/device_config.json") }
    }
}

/// What to do when a viewer's outbound queue is full.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    Disconnect,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FanoutConf {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for FanoutConf {
    fn default() -> Self {
        Self { queue_capacity: 64, overflow: OverflowPolicy::DropOldest }
    }
}

impl KernelConfig {
    fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `SENSORHUB_*` overrides looked up through `var`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = var("SENSORHUB_HTTP_BIND") {
            self.http.bind = bind;
        }
        if let Some(path) = var("SENSORHUB_REGISTRY_PATH") {
            self.registry.path = PathBuf::from(path);
        }
        if let Some(host) = var("SENSORHUB_MQTT_HOST") {
            self.mqtt.host = host;
        }
        match var("SENSORHUB_MQTT_PORT").map(|p| p.parse::<u16>()) {
            Some(Ok(port)) => self.mqtt.port = port,
            Some(Err(e)) => tracing::warn!(error = %e, "ignoring invalid SENSORHUB_MQTT_PORT"),
            None => {}
        }
        // a zero-sized queue could never hold a frame
        self.fanout.queue_capacity = self.fanout.queue_capacity.max(1);
    }
}

/// Reads `SENSORHUB_CONFIG` (default `sensorhub.yaml`); missing or invalid files fall back to defaults.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("SENSORHUB_CONFIG").unwrap_or_else(|_| "sensorhub.yaml".into());
    let mut cfg = read_config_file(Path::new(&path)).await;
    cfg.apply_env();
    cfg
}

async fn read_config_file(path: &Path) -> KernelConfig {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        KernelConfig::default()
    })
}
