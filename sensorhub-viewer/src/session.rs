//! Viewer session: one observed device, its live history and its actuator toggles.

use crate::client::{ClientError, RegistryApi};
use crate::history::MetricHistory;
use crate::model::{ControlKey, DeviceSnapshot, TelemetryEvent};
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Live,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("session is closed")]
    Closed,
    #[error("control change rejected: {0}")]
    Control(#[from] ClientError),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("live feed transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug)]
pub struct ViewerSession {
    device: String,
    state: SessionState,
    facts: DeviceSnapshot,
    history: MetricHistory,
}

impl ViewerSession {
    pub fn new(device: impl Into<String>, capacity: usize) -> Self {
        let device = device.into();
        Self {
            facts: DeviceSnapshot::unknown(device.clone()),
            device,
            state: SessionState::Connecting,
            history: MetricHistory::new(capacity),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn facts(&self) -> &DeviceSnapshot {
        &self.facts
    }

    pub fn history(&self) -> &MetricHistory {
        &self.history
    }

    /// Transport handshake completed; see [`crate::feed::LiveFeed::connect`].
    pub fn on_connected(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connecting => {
                info!(device = %self.device, "viewer session live");
                self.state = SessionState::Live;
                Ok(())
            }
            from => Err(SessionError::InvalidTransition { from, to: SessionState::Live }),
        }
    }

    /// Navigation away or transport failure. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            info!(device = %self.device, from = ?self.state, "viewer session closed");
            self.state = SessionState::Closed;
        }
    }

    /// Appends the event's metrics when it belongs to the observed device.
    /// Returns whether the history changed.
    pub fn on_telemetry(&mut self, event: &TelemetryEvent) -> bool {
        if self.state != SessionState::Live || event.device != self.device {
            return false;
        }
        self.history.record(&event.metrics, &arrival_label());
        true
    }

    /// Parses one relayed frame and feeds it to [`Self::on_telemetry`].
    pub fn on_frame(&mut self, text: &str) -> Result<bool, SessionError> {
        let event = TelemetryEvent::parse(text).map_err(SessionError::Malformed)?;
        Ok(self.on_telemetry(&event))
    }

    /// Merges the observed device's static facts; history is left alone.
    /// Returns whether the device was present in `records`.
    pub fn on_registry_snapshot(&mut self, records: &[DeviceSnapshot]) -> bool {
        match records.iter().find(|d| d.name == self.device) {
            Some(record) => {
                self.facts = record.clone();
                true
            }
            None => {
                debug!(device = %self.device, "device absent from registry snapshot");
                false
            }
        }
    }

    pub async fn rehydrate<A: RegistryApi>(&mut self, api: &A) -> Result<bool, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let records = api.list_devices().await?;
        Ok(self.on_registry_snapshot(&records))
    }

    /// Flips `key` locally, then asks the registry to persist it. A refused change
    /// restores the previous value. Returns the value now shown.
    pub async fn request_control_change<A: RegistryApi>(
        &mut self,
        key: ControlKey,
        api: &A,
    ) -> Result<bool, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let previous = self.facts.control(key);
        self.facts.set_control(key, !previous);

        match api.update_control_state(&self.device, key, !previous).await {
            Ok(updated) => {
                if updated.name == self.device {
                    self.facts = updated;
                }
                Ok(self.facts.control(key))
            }
            Err(e) => {
                warn!(device = %self.device, %key, error = %e, "control change failed, rolling back");
                self.facts.set_control(key, previous);
                Err(e.into())
            }
        }
    }
}

fn arrival_label() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::DEFAULT_CAPACITY;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn event(device: &str, temperature: f64) -> TelemetryEvent {
        let mut metrics = BTreeMap::new();
        metrics.insert("temperature".to_string(), temperature);
        TelemetryEvent { device: device.to_string(), metrics }
    }

    fn room1() -> DeviceSnapshot {
        DeviceSnapshot {
            name: "Room1".into(),
            location: "Lab".into(),
            topic: "room1/sensors".into(),
            image: None,
            fans_state: false,
            lights_state: true,
            hvac_state: false,
        }
    }

    fn live(device: &str) -> ViewerSession {
        let mut session = ViewerSession::new(device, DEFAULT_CAPACITY);
        session.on_connected().unwrap();
        session
    }

    /// Registry double: answers from a fixed record or refuses every change.
    struct FakeRegistry {
        device: Mutex<DeviceSnapshot>,
        refuse: bool,
    }

    impl FakeRegistry {
        fn new(refuse: bool) -> Self {
            Self { device: Mutex::new(room1()), refuse }
        }
    }

    impl RegistryApi for FakeRegistry {
        async fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, ClientError> {
            Ok(vec![self.device.lock().unwrap().clone()])
        }

        async fn update_control_state(
            &self,
            name: &str,
            key: ControlKey,
            value: bool,
        ) -> Result<DeviceSnapshot, ClientError> {
            if self.refuse {
                return Err(ClientError::Api { status: 500, message: "disk full".into() });
            }
            let mut device = self.device.lock().unwrap();
            assert_eq!(device.name, name);
            device.set_control(key, value);
            Ok(device.clone())
        }
    }

    #[test]
    fn only_observed_device_is_recorded() {
        let mut session = live("Room1");
        assert!(session.on_telemetry(&event("Room1", 21.0)));
        assert!(!session.on_telemetry(&event("Room2", 99.0)));
        assert!(session.on_telemetry(&event("Room1", 22.0)));
        assert_eq!(session.history().values("temperature"), vec![21.0, 22.0]);
    }

    #[test]
    fn telemetry_before_handshake_or_after_close_is_ignored() {
        let mut session = ViewerSession::new("Room1", 5);
        assert!(!session.on_telemetry(&event("Room1", 20.0)));
        session.on_connected().unwrap();
        session.close();
        assert!(!session.on_telemetry(&event("Room1", 20.0)));
        assert!(session.history().values("temperature").is_empty());
    }

    #[test]
    fn state_machine_never_returns_to_connecting() {
        let mut session = ViewerSession::new("Room1", 5);
        assert_eq!(session.state(), SessionState::Connecting);
        session.on_connected().unwrap();
        assert!(matches!(
            session.on_connected(),
            Err(SessionError::InvalidTransition { from: SessionState::Live, to: SessionState::Live })
        ));
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.on_connected().is_err());

        let mut abandoned = ViewerSession::new("Room1", 5);
        abandoned.close();
        assert_eq!(abandoned.state(), SessionState::Closed);
    }

    #[test]
    fn late_viewer_sees_only_later_events() {
        let mut early = live("Room1");
        let mut late = ViewerSession::new("Room1", DEFAULT_CAPACITY);

        early.on_telemetry(&event("Room1", 1.0));
        early.on_telemetry(&event("Room1", 2.0));
        late.on_connected().unwrap();
        for s in [&mut early, &mut late] {
            s.on_telemetry(&event("Room1", 3.0));
        }

        assert_eq!(early.history().values("temperature"), vec![1.0, 2.0, 3.0]);
        assert_eq!(late.history().values("temperature"), vec![3.0]);
    }

    #[test]
    fn malformed_frames_are_reported() {
        let mut session = live("Room1");
        assert!(matches!(session.on_frame("{not json"), Err(SessionError::Malformed(_))));
        assert!(session.on_frame(r#"{"deviceIdentifier":"Room1","temperature":22.5}"#).unwrap());
        assert_eq!(session.history().latest("temperature"), Some(22.5));
    }

    #[test]
    fn registry_snapshot_merges_facts_but_keeps_history() {
        let mut session = live("Room1");
        session.on_telemetry(&event("Room1", 20.0));
        let mut other = room1();
        other.name = "Room2".into();

        assert!(session.on_registry_snapshot(&[other, room1()]));
        assert_eq!(session.facts().location, "Lab");
        assert!(session.facts().lights_state);
        assert_eq!(session.history().values("temperature"), vec![20.0]);
        assert!(!session.on_registry_snapshot(&[]));
        assert_eq!(session.facts().topic, "room1/sensors");
    }

    #[tokio::test]
    async fn control_change_is_confirmed_by_registry() {
        let registry = FakeRegistry::new(false);
        let mut session = live("Room1");
        assert!(session.rehydrate(&registry).await.unwrap());

        let shown = session.request_control_change(ControlKey::Fans, &registry).await.unwrap();
        assert!(shown);
        assert!(registry.device.lock().unwrap().fans_state);
    }

    #[tokio::test]
    async fn refused_control_change_rolls_back() {
        let registry = FakeRegistry::new(true);
        let mut session = live("Room1");
        session.rehydrate(&registry).await.unwrap();

        let err = session.request_control_change(ControlKey::Lights, &registry).await.unwrap_err();
        assert!(matches!(err, SessionError::Control(ClientError::Api { status: 500, .. })));
        assert!(session.facts().lights_state);
    }

    #[tokio::test]
    async fn closed_session_sends_nothing() {
        let registry = FakeRegistry::new(false);
        let mut session = live("Room1");
        session.close();
        assert!(matches!(
            session.request_control_change(ControlKey::Hvac, &registry).await,
            Err(SessionError::Closed)
        ));
        assert!(!registry.device.lock().unwrap().hvac_state);
    }
}
