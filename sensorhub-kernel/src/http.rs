/*!
HTTP surface of the kernel

Routes:
- `/health`, `/system/health`: liveness and runtime counters
- `/api/devices`: registry listing and upsert; `/api/devices/{id}` delete (by topic);
  `/api/devices/{id}/control` actuator update (by name)
- `/ws`: viewer egress, every accepted telemetry frame relayed verbatim
- `/ws/ingest`: publisher ingress, one payload per WebSocket message

Registry failures answer `{"error": reason}` with 400, 404 or 500.
*/

use crate::error::RegistryError;
use crate::health::{HealthTracker, KernelHealth};
use crate::hub::SharedHub;
use crate::models::{ControlChange, ControlKey, Device, DeviceInput, RegistryDocument};
use crate::registry::{SharedRegistry, UpsertOutcome};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub hub: SharedHub,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/devices", get(list_devices).post(upsert_device).put(upsert_device))
        .route("/api/devices/{id}", axum::routing::delete(remove_device))
        .route("/api/devices/{id}/control", post(update_control))
        .route("/ws", get(viewer_socket))
        .route("/ws/ingest", get(publisher_socket))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.hub))
}

// GET /api/devices
async fn list_devices(State(app): State<AppState>) -> Result<Json<RegistryDocument>, RegistryError> {
    let devices = app.registry.list_devices().await?;
    Ok(Json(RegistryDocument { devices }))
}

// POST|PUT /api/devices
async fn upsert_device(
    State(app): State<AppState>,
    body: Result<Json<DeviceInput>, JsonRejection>,
) -> Result<Json<Value>, RegistryError> {
    let Json(input) = body.map_err(|e| RegistryError::Invalid(e.body_text()))?;
    let (device, outcome) = app.registry.upsert_device(input).await?;

    let message = match outcome {
        UpsertOutcome::Created => format!("Device '{}' added", device.name),
        UpsertOutcome::Replaced => format!("Device '{}' updated", device.name),
        UpsertOutcome::Unchanged => format!("Device '{}' unchanged", device.name),
    };
    info!(device = %device.name, topic = %device.topic, ?outcome, "device upserted");
    Ok(Json(json!({ "success": true, "message": message })))
}

// DELETE /api/devices/{topic}
async fn remove_device(
    State(app): State<AppState>,
    Path(topic): Path<String>,
) -> Result<Json<Value>, RegistryError> {
    let removed = app.registry.remove_device(&topic).await?;
    info!(device = %removed.name, %topic, "device removed");
    Ok(Json(json!({
        "success": true,
        "message": format!("Device '{}' removed", removed.name),
    })))
}

// POST /api/devices/{name}/control
async fn update_control(
    State(app): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<ControlChange>, JsonRejection>,
) -> Result<Json<Device>, RegistryError> {
    let Json(change) = body.map_err(|e| RegistryError::Invalid(e.body_text()))?;
    let key: ControlKey = change.key.parse().map_err(RegistryError::Invalid)?;
    let device = app.registry.update_control_state(&name, key, change.value).await?;
    info!(device = %name, %key, value = change.value, "control state updated");
    Ok(Json(device))
}

// GET /ws
async fn viewer_socket(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, app.hub))
}

async fn serve_viewer(socket: WebSocket, hub: SharedHub) {
    let connection = hub.register_viewer();
    let viewer = connection.id();
    let (mut sender, mut receiver) = socket.split();

    // Dropping `connection` with this task unregisters the viewer.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = connection.recv().await {
            if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                debug!(viewer, "send failed, viewer gone");
                break;
            }
        }
    });

    // Viewers only listen; inbound traffic is drained until close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!(viewer, "viewer socket closed");
}

// GET /ws/ingest
async fn publisher_socket(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_publisher(socket, app.hub))
}

async fn serve_publisher(mut socket: WebSocket, hub: SharedHub) {
    info!("publisher connected");
    while let Some(msg) = socket.recv().await {
        // Malformed payloads are counted and logged by the hub; the socket stays open.
        match msg {
            Ok(Message::Text(text)) => {
                let _ = hub.accept(text.as_bytes());
            }
            Ok(Message::Binary(bytes)) => {
                let _ = hub.accept(&bytes);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "publisher socket error");
                break;
            }
        }
    }
    info!("publisher disconnected");
}
