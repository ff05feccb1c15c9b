/*!
Mock MQTT client for tests without a broker

Records every publication, subscription and unsubscription. Sensor publications are
routed back to the client like a broker would: only on topics it is subscribed to.
*/

use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock client mirroring the parts of `rumqttc::AsyncClient` the kernel uses
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages the fake broker delivers to this client. A new feed replaces the previous one.
    pub fn inbound_feed(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        rx
    }

    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };
        log::info!("[mock] published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        log::info!("[mock] subscribed to {}", topic);
        self.subscriptions.lock().unwrap().push(topic);
        Ok(())
    }

    pub async fn unsubscribe<S: Into<String>>(&self, topic: S) -> Result<()> {
        let topic = topic.into();
        log::info!("[mock] unsubscribed from {}", topic);
        self.subscriptions.lock().unwrap().retain(|t| *t != topic);
        Ok(())
    }

    /// A field sensor publishes `payload` on `topic`. Returns whether the message reached
    /// the inbound feed, which requires a subscription to `topic`.
    pub fn sensor_publish<V: Into<Vec<u8>>>(&self, topic: &str, payload: V) -> bool {
        if !self.subscriptions.lock().unwrap().iter().any(|t| t == topic) {
            log::debug!("[mock] {} has no subscriber, dropped", topic);
            return false;
        }
        let message = MockMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        match self.inbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Active subscriptions, in subscription order
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Last message on `topic` parsed as JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

/// Builders for the payloads exchanged around the kernel
pub struct TelemetryMessageBuilder;

impl TelemetryMessageBuilder {
    /// Raw reading as a field sensor publishes it on its device topic
    pub fn sensor_reading(temperature: f64, humidity: f64, co2: f64) -> Value {
        serde_json::json!({
            "temperature": temperature,
            "humidity": humidity,
            "co2": co2
        })
    }

    /// Event as accepted by the fan-out hub
    pub fn hub_event<S: Into<String>>(device: S, metrics: &[(&str, f64)]) -> Value {
        let mut event = serde_json::Map::new();
        event.insert("deviceIdentifier".into(), Value::String(device.into()));
        for (name, value) in metrics {
            event.insert((*name).to_string(), serde_json::json!(value));
        }
        Value::Object(event)
    }

    /// Registry record with actuators off
    pub fn device_record<S: Into<String>>(name: S, topic: S, location: S) -> Value {
        serde_json::json!({
            "name": name.into(),
            "topic": topic.into(),
            "location": location.into(),
            "image": null,
            "fansState": false,
            "lightsState": false,
            "hvacState": false
        })
    }
}
