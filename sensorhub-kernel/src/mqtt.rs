//! MQTT bridge between field devices and the kernel.
//!
//! Ingress: the kernel subscribes to every registered device topic. A raw sensor
//! reading received there is tagged with the device identity and handed to the hub.
//!
//! Egress: whenever the registry changes, actuator states that differ from what was
//! last published are sent to `{topic}-control`.

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::hub::SharedHub;
use crate::models::{ControlStates, Device, DEVICE_ID_FIELD};
use crate::registry::RegistrySnapshot;
use crate::state::Shared;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{self, JoinHandle};

/// Identity stamped onto readings arriving on a device topic.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRoute {
    pub name: String,
    pub location: String,
}

/// Device topic → identity.
pub type RouteTable = HashMap<String, DeviceRoute>;

pub fn control_topic(topic: &str) -> String {
    format!("{topic}-control")
}

/// The subset of an MQTT client the bridge needs.
pub trait MqttLink: Send + Sync {
    fn subscribe(&self, topic: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn unsubscribe(&self, topic: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl MqttLink for AsyncClient {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        AsyncClient::subscribe(self, topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        AsyncClient::unsubscribe(self, topic).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

pub fn create_mqtt_client(cfg: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    AsyncClient::new(opts, 10)
}

/// Builds the hub payload for a reading received on `topic`.
pub fn enrich(topic: &str, payload: &[u8], routes: &RouteTable) -> Result<Vec<u8>, String> {
    let route = routes
        .get(topic)
        .ok_or_else(|| format!("no device registered for topic '{topic}'"))?;
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| format!("invalid JSON: {e}"))?;
    let serde_json::Value::Object(mut reading) = value else {
        return Err("reading is not a JSON object".into());
    };

    reading.insert(DEVICE_ID_FIELD.into(), route.name.clone().into());
    reading.insert("location".into(), route.location.clone().into());
    reading.insert("topic".into(), topic.into());
    serde_json::to_vec(&reading).map_err(|e| e.to_string())
}

fn handle_publish(hub: &SharedHub, routes: &Shared<RouteTable>, topic: &str, payload: &[u8]) {
    let enriched = enrich(topic, payload, &routes.lock());
    match enriched {
        // the hub logs rejected payloads itself
        Ok(event) => {
            let _ = hub.accept(&event);
        }
        Err(reason) => tracing::warn!(%topic, %reason, "dropping MQTT reading"),
    }
}

/// Tracks what the broker already knows: active subscriptions and last published controls.
#[derive(Debug, Default)]
pub struct ControlSync {
    subscribed: HashSet<String>,
    published: HashMap<String, ControlStates>,
}

impl ControlSync {
    /// Aligns routes, subscriptions and control topics with `devices`.
    pub async fn apply<L: MqttLink>(&mut self, link: &L, devices: &[Device], routes: &Shared<RouteTable>) {
        *routes.lock() = devices
            .iter()
            .map(|d| {
                let route = DeviceRoute { name: d.name.clone(), location: d.location.clone() };
                (d.topic.clone(), route)
            })
            .collect();

        let wanted: HashSet<String> = devices.iter().map(|d| d.topic.clone()).collect();

        let added: Vec<String> = wanted.difference(&self.subscribed).cloned().collect();
        for topic in added {
            match link.subscribe(&topic).await {
                Ok(()) => {
                    tracing::info!(%topic, "subscribed to device topic");
                    self.subscribed.insert(topic);
                }
                Err(e) => tracing::warn!(%topic, error = %e, "subscribe failed"),
            }
        }

        let removed: Vec<String> = self.subscribed.difference(&wanted).cloned().collect();
        for topic in removed {
            if let Err(e) = link.unsubscribe(&topic).await {
                tracing::warn!(%topic, error = %e, "unsubscribe failed");
            }
            self.subscribed.remove(&topic);
        }

        for device in devices {
            let states = device.controls();
            if self.published.get(&device.topic) == Some(&states) {
                continue;
            }
            let target = control_topic(&device.topic);
            let payload = match serde_json::to_vec(&states) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(topic = %target, error = %e, "cannot encode control state");
                    continue;
                }
            };
            match link.publish(&target, payload).await {
                Ok(()) => {
                    tracing::info!(topic = %target, ?states, "published control state");
                    self.published.insert(device.topic.clone(), states);
                }
                Err(e) => tracing::warn!(topic = %target, error = %e, "control publish failed"),
            }
        }
        self.published.retain(|topic, _| wanted.contains(topic));
    }

    /// Called after a broker reconnect: the broker forgot our subscriptions.
    pub fn forget_subscriptions(&mut self) {
        self.subscribed.clear();
    }
}

/// Follows the registry change feed and keeps the broker in sync with it.
pub fn spawn_registry_sync<L: MqttLink + 'static>(
    link: L,
    mut changes: watch::Receiver<RegistrySnapshot>,
    routes: Shared<RouteTable>,
    reconnected: Arc<Notify>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut sync = ControlSync::default();
        loop {
            let snapshot = changes.borrow_and_update().clone();
            sync.apply(&link, &snapshot, &routes).await;

            tokio::select! {
                res = changes.changed() => {
                    if res.is_err() {
                        tracing::debug!("registry feed closed, stopping MQTT sync");
                        break;
                    }
                }
                _ = reconnected.notified() => sync.forget_subscriptions(),
            }
        }
    })
}

/// Drives the MQTT event loop and feeds device readings into the hub.
pub fn spawn_ingress(
    mut eventloop: EventLoop,
    hub: SharedHub,
    routes: Shared<RouteTable>,
    health: HealthTracker,
    reconnected: Arc<Notify>,
) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    tracing::info!("connected to MQTT broker");
                    health.mark_mqtt_connected();
                    reconnected.notify_one();
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    handle_publish(&hub, &routes, &p.topic, &p.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = ?e, "MQTT connection error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
