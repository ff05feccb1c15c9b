/**
 * SENSORHUB KERNEL - server entry point
 *
 * Wires config, registry, fan-out hub, MQTT bridge and HTTP together.
 * MQTT is optional: with `mqtt.enabled: false` telemetry only arrives on `/ws/ingest`.
 */

use anyhow::Context;
use sensorhub_kernel::config::load_config;
use sensorhub_kernel::health::HealthTracker;
use sensorhub_kernel::http::{build_router, AppState};
use sensorhub_kernel::hub::FanoutHub;
use sensorhub_kernel::mqtt::{self, RouteTable};
use sensorhub_kernel::registry::RegistryService;
use sensorhub_kernel::state::new_state;
use sensorhub_kernel::store::JsonFileStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    let store = Arc::new(JsonFileStore::new(&cfg.registry.path));
    let registry = Arc::new(RegistryService::open(store).await);

    let hub = FanoutHub::new(cfg.fanout.clone());
    let health = HealthTracker::new();

    if cfg.mqtt.enabled {
        let (client, eventloop) = mqtt::create_mqtt_client(&cfg.mqtt);
        let routes = new_state(RouteTable::new());
        let reconnected = Arc::new(Notify::new());
        mqtt::spawn_ingress(eventloop, hub.clone(), routes.clone(), health.clone(), reconnected.clone());
        mqtt::spawn_registry_sync(client, registry.subscribe(), routes, reconnected);
        tracing::info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "MQTT bridge started");
    } else {
        health.mark_mqtt_disabled();
        tracing::info!("MQTT bridge disabled");
    }

    let app = build_router(AppState { registry, hub, health });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    tracing::info!(addr = %cfg.http.bind, "listening");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
