//! Registry service: the only path from callers to the persisted device collection.
//!
//! Every operation runs a full load (→ modify → save) cycle on a blocking thread while
//! holding a single write lock. The lock is taken inside the blocking task, so a caller
//! that goes away (dropped HTTP request) cannot release it early and the cycle always
//! runs to completion.

use crate::error::{RegistryError, StoreError};
use crate::models::{ControlKey, Device, DeviceInput};
use crate::store::RegistryStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot published to subscribers after each successful write.
pub type RegistrySnapshot = Arc<Vec<Device>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Replaced,
    Unchanged,
}

#[derive(Clone)]
pub struct RegistryService {
    store: Arc<dyn RegistryStore>,
    write_lock: Arc<Mutex<()>>,
    changes: Arc<watch::Sender<RegistrySnapshot>>,
}

pub type SharedRegistry = Arc<RegistryService>;

impl RegistryService {
    /// Opens the service and seeds the change feed with the current snapshot.
    ///
    /// An unreadable registry file does not prevent startup: the feed starts empty and
    /// every operation reports the storage fault until the file is repaired.
    pub async fn open(store: Arc<dyn RegistryStore>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        let service = Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
            changes: Arc::new(tx),
        };
        match service.list_devices().await {
            Ok(devices) => {
                tracing::info!(devices = devices.len(), "registry loaded");
                service.changes.send_replace(Arc::new(devices));
            }
            Err(e) => tracing::error!(error = %e, "registry unreadable, starting with an empty snapshot"),
        }
        service
    }

    /// Receives the full collection after every committed change.
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.changes.subscribe()
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, RegistryError> {
        self.run(|devices| Ok((devices.clone(), false))).await
    }

    /// Inserts or replaces (by name, position preserved) a device record.
    pub async fn upsert_device(&self, input: DeviceInput) -> Result<(Device, UpsertOutcome), RegistryError> {
        let device = validate(input)?;

        self.run(move |devices| {
            if let Some(other) = devices
                .iter()
                .find(|d| d.topic == device.topic && d.name != device.name)
            {
                return Err(RegistryError::Invalid(format!(
                    "topic '{}' already used by device '{}'",
                    device.topic, other.name
                )));
            }

            match devices.iter().position(|d| d.name == device.name) {
                Some(i) if devices[i] == device => Ok(((device, UpsertOutcome::Unchanged), false)),
                Some(i) => {
                    devices[i] = device.clone();
                    Ok(((device, UpsertOutcome::Replaced), true))
                }
                None => {
                    devices.push(device.clone());
                    Ok(((device, UpsertOutcome::Created), true))
                }
            }
        })
        .await
    }

    /// Removes the first device whose topic matches. Keyed by topic, unlike the writes.
    pub async fn remove_device(&self, topic: &str) -> Result<Device, RegistryError> {
        let topic = topic.to_string();
        self.run(move |devices| {
            let i = devices
                .iter()
                .position(|d| d.topic == topic)
                .ok_or_else(|| RegistryError::NotFound(format!("no device with topic '{topic}'")))?;
            Ok((devices.remove(i), true))
        })
        .await
    }

    pub async fn update_control_state(
        &self,
        name: &str,
        key: ControlKey,
        value: bool,
    ) -> Result<Device, RegistryError> {
        let name = name.to_string();
        self.run(move |devices| {
            let device = devices
                .iter_mut()
                .find(|d| d.name == name)
                .ok_or_else(|| RegistryError::NotFound(format!("no device named '{name}'")))?;
            let dirty = device.control(key) != value;
            device.set_control(key, value);
            Ok((device.clone(), dirty))
        })
        .await
    }

    /// Runs `op` on the loaded collection under the write lock, saving when it reports a change.
    async fn run<T, F>(&self, op: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Vec<Device>) -> Result<(T, bool), RegistryError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let lock = self.write_lock.clone();
        let changes = self.changes.clone();

        let task = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let mut devices = store.load()?;
            let (out, dirty) = op(&mut devices)?;
            if dirty {
                store.save(&devices)?;
                changes.send_replace(Arc::new(devices));
            }
            Ok(out)
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "registry task aborted");
                Err(RegistryError::Storage(StoreError::Io(std::io::Error::other(e.to_string()))))
            }
        }
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, RegistryError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RegistryError::Invalid(format!("'{field}' must be a non-empty string")))
}

fn validate(input: DeviceInput) -> Result<Device, RegistryError> {
    Ok(Device {
        name: required("name", input.name)?,
        topic: required("topic", input.topic)?,
        location: input.location.unwrap_or_default(),
        image: input.image,
        fans_state: input.fans_state.unwrap_or(false),
        lights_state: input.lights_state.unwrap_or(false),
        hvac_state: input.hvac_state.unwrap_or(false),
    })
}
