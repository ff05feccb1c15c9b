//! Registry HTTP client.

use crate::model::{ControlKey, DeviceSnapshot};
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry answered {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid base url: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            ClientError::InvalidUrl(_) => None,
        }
    }
}

/// What a viewer session needs from the registry.
pub trait RegistryApi {
    fn list_devices(&self) -> impl Future<Output = Result<Vec<DeviceSnapshot>, ClientError>> + Send;

    fn update_control_state(
        &self,
        name: &str,
        key: ControlKey,
        value: bool,
    ) -> impl Future<Output = Result<DeviceSnapshot, ClientError>> + Send;
}

#[derive(Deserialize)]
struct DeviceList {
    devices: Vec<DeviceSnapshot>,
}

#[derive(Deserialize)]
struct Ack {
    message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    base: Url,
    http: reqwest::Client,
}

impl HttpRegistryClient {
    /// `base_url` is the kernel root, e.g. `http://localhost:3000`.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { base, http: reqwest::Client::new() })
    }

    // Segments are percent-encoded, so topics containing '/' stay one segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, ClientError> {
        let url = self.endpoint(&["api", "devices"])?;
        let list: DeviceList = decode(self.http.get(url).send().await?).await?;
        Ok(list.devices)
    }

    /// Creates or replaces the record named `device.name`; returns the server's message.
    pub async fn upsert_device(&self, device: &DeviceSnapshot) -> Result<String, ClientError> {
        let url = self.endpoint(&["api", "devices"])?;
        let ack: Ack = decode(self.http.post(url).json(device).send().await?).await?;
        Ok(ack.message)
    }

    pub async fn remove_device(&self, topic: &str) -> Result<String, ClientError> {
        let url = self.endpoint(&["api", "devices", topic])?;
        let ack: Ack = decode(self.http.delete(url).send().await?).await?;
        Ok(ack.message)
    }

    pub async fn update_control_state(
        &self,
        name: &str,
        key: ControlKey,
        value: bool,
    ) -> Result<DeviceSnapshot, ClientError> {
        let url = self.endpoint(&["api", "devices", name, "control"])?;
        debug!(device = name, %key, value, "sending control change");
        let body = serde_json::json!({ "key": key.as_str(), "value": value });
        decode(self.http.post(url).json(&body).send().await?).await
    }
}

impl RegistryApi for HttpRegistryClient {
    async fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, ClientError> {
        HttpRegistryClient::list_devices(self).await
    }

    async fn update_control_state(
        &self,
        name: &str,
        key: ControlKey,
        value: bool,
    ) -> Result<DeviceSnapshot, ClientError> {
        HttpRegistryClient::update_control_state(self, name, key, value).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    Err(ClientError::Api { status: status.as_u16(), message })
}
