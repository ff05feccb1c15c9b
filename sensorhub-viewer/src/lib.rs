//! SensorHub viewer - one live view of one device
//!
//! A [`ViewerSession`] is fed by a [`LiveFeed`] on the kernel's `/ws` endpoint and
//! with registry snapshots fetched from `/api/devices`. It keeps a bounded history per
//! metric for the device it observes and routes actuator toggles back to the registry,
//! rolling them back when the registry refuses them.

pub mod client;
pub mod feed;
pub mod history;
pub mod model;
pub mod session;

pub use client::{ClientError, HttpRegistryClient, RegistryApi};
pub use feed::{run, LiveFeed};
pub use history::{MetricHistory, RingBuffer, Sample, DEFAULT_CAPACITY};
pub use model::{ControlKey, DeviceSnapshot, TelemetryEvent};
pub use session::{SessionError, SessionState, ViewerSession};
