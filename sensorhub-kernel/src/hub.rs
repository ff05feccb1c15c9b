//! Telemetry fan-out.
//!
//! ```text
//!   MQTT bridge ─┐                        ┌─► Outbox(viewer 1) ─► WebSocket
//!                ├─► FanoutHub::accept ───┼─► Outbox(viewer 2) ─► WebSocket
//!  /ws/ingest ───┘    (parse, relay)      └─► Outbox(viewer n) ─► WebSocket
//! ```
//!
//! Each viewer owns a bounded outbox. Relay pushes into every outbox while holding the
//! connection-set lock, so all viewers see frames in hub arrival order, and it never
//! awaits: a full outbox either drops its oldest frame or gets the viewer disconnected.

use crate::config::{FanoutConf, OverflowPolicy};
use crate::error::HubError;
use crate::models::TelemetryEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Payload text relayed verbatim to viewers; clones share one allocation.
pub type Frame = Arc<str>;

pub type ViewerId = u64;

enum Push {
    Queued,
    DroppedOldest,
    Overflow,
    Closed,
}

struct Outbox {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    fn push(&self, frame: Frame, policy: OverflowPolicy) -> Push {
        if self.closed.load(Ordering::Acquire) {
            return Push::Closed;
        }
        let outcome = {
            let mut queue = self.queue.lock();
            if queue.len() < self.capacity {
                queue.push_back(frame);
                Push::Queued
            } else {
                match policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(frame);
                        Push::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => return Push::Overflow,
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Receiving end of one viewer registration. Dropping it unregisters the viewer.
pub struct ViewerConnection {
    id: ViewerId,
    outbox: Arc<Outbox>,
    hub: Weak<FanoutHub>,
}

impl ViewerConnection {
    pub fn id(&self) -> ViewerId {
        self.id
    }

    /// Next frame in arrival order. Frames queued before a teardown are still handed
    /// out; `None` once the connection is torn down and its queue is empty.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            let notified = self.outbox.notify.notified();
            if let Some(frame) = self.try_recv() {
                return Some(frame);
            }
            if self.outbox.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<Frame> {
        self.outbox.queue.lock().pop_front()
    }
}

impl Drop for ViewerConnection {
    fn drop(&mut self) {
        self.outbox.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.unregister_viewer(self.id);
        }
    }
}

/// Per-relay delivery summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: usize,
}

#[derive(Default)]
struct HubCounters {
    accepted: AtomicU64,
    malformed: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    disconnected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub viewers: usize,
    pub events_accepted: u64,
    pub events_malformed: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub viewers_disconnected: u64,
}

pub struct FanoutHub {
    viewers: Mutex<HashMap<ViewerId, Arc<Outbox>>>,
    next_id: AtomicU64,
    config: FanoutConf,
    counters: HubCounters,
}

pub type SharedHub = Arc<FanoutHub>;

impl FanoutHub {
    pub fn new(config: FanoutConf) -> SharedHub {
        Arc::new(Self {
            viewers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            counters: HubCounters::default(),
        })
    }

    /// Adds a viewer; it receives every frame relayed from now on, and nothing earlier.
    pub fn register_viewer(self: &Arc<Self>) -> ViewerConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox::new(self.config.queue_capacity.max(1)));
        let count = {
            let mut viewers = self.viewers.lock();
            viewers.insert(id, outbox.clone());
            viewers.len()
        };
        tracing::info!(viewer = id, viewers = count, "viewer registered");
        ViewerConnection { id, outbox, hub: Arc::downgrade(self) }
    }

    /// Removes a viewer. Unknown ids are ignored.
    pub fn unregister_viewer(&self, id: ViewerId) -> bool {
        let removed = self.viewers.lock().remove(&id);
        match removed {
            Some(outbox) => {
                outbox.close();
                tracing::info!(viewer = id, "viewer unregistered");
                true
            }
            None => false,
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Validates one inbound payload and relays it to every registered viewer.
    pub fn accept(&self, raw: &[u8]) -> Result<RelayReport, HubError> {
        let parsed = TelemetryEvent::parse(raw)
            .and_then(|event| std::str::from_utf8(raw).map(|text| (event, text)).map_err(|e| e.to_string()));
        let (event, text) = match parsed {
            Ok(ok) => ok,
            Err(reason) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%reason, bytes = raw.len(), "dropping malformed telemetry");
                return Err(HubError::Malformed(reason));
            }
        };
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(device = %event.device, metrics = event.metrics.len(), "telemetry accepted");
        Ok(self.relay(Frame::from(text)))
    }

    /// Pushes `frame` to every viewer. A failing viewer is torn down; the others are unaffected.
    pub fn relay(&self, frame: Frame) -> RelayReport {
        let policy = self.config.overflow;
        let mut report = RelayReport::default();

        self.viewers.lock().retain(|id, outbox| match outbox.push(frame.clone(), policy) {
            Push::Queued => {
                report.delivered += 1;
                true
            }
            Push::DroppedOldest => {
                report.delivered += 1;
                report.dropped += 1;
                tracing::debug!(viewer = *id, "viewer queue full, dropped oldest frame");
                true
            }
            Push::Overflow => {
                outbox.close();
                report.disconnected += 1;
                tracing::warn!(viewer = *id, "viewer queue full, disconnecting");
                false
            }
            Push::Closed => {
                report.disconnected += 1;
                tracing::debug!(viewer = *id, "viewer already closed, removing");
                false
            }
        });

        self.counters.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.counters.disconnected.fetch_add(report.disconnected as u64, Ordering::Relaxed);
        report
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            viewers: self.viewer_count(),
            events_accepted: self.counters.accepted.load(Ordering::Relaxed),
            events_malformed: self.counters.malformed.load(Ordering::Relaxed),
            frames_delivered: self.counters.delivered.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            viewers_disconnected: self.counters.disconnected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn hub(capacity: usize, overflow: OverflowPolicy) -> SharedHub {
        FanoutHub::new(FanoutConf { queue_capacity: capacity, overflow })
    }

    fn event(device: &str, temperature: f64) -> Vec<u8> {
        format!(r#"{{"deviceIdentifier":"{device}","temperature":{temperature}}}"#).into_bytes()
    }

    fn drain(conn: &ViewerConnection) -> Vec<String> {
        std::iter::from_fn(|| conn.try_recv()).map(|f| f.to_string()).collect()
    }

    #[test]
    fn frames_arrive_in_order_and_verbatim() {
        let hub = hub(64, OverflowPolicy::DropOldest);
        let viewer = hub.register_viewer();
        let sent: Vec<Vec<u8>> = (0..10).map(|i| event("Room1", i as f64)).collect();
        for raw in &sent {
            hub.accept(raw).unwrap();
        }
        let got = drain(&viewer);
        let expected: Vec<String> = sent.iter().map(|r| String::from_utf8(r.clone()).unwrap()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn late_viewer_gets_no_backfill() {
        let hub = hub(64, OverflowPolicy::DropOldest);
        let a = hub.register_viewer();
        hub.accept(&event("Room1", 1.0)).unwrap();
        hub.accept(&event("Room1", 2.0)).unwrap();
        let b = hub.register_viewer();
        hub.accept(&event("Room1", 3.0)).unwrap();

        assert_eq!(drain(&a).len(), 3);
        let late = drain(&b);
        assert_eq!(late.len(), 1);
        assert!(late[0].contains("3"));
    }

    #[test]
    fn malformed_input_is_counted_and_not_relayed() {
        let hub = hub(64, OverflowPolicy::DropOldest);
        let viewer = hub.register_viewer();
        assert!(hub.accept(b"{broken").is_err());
        assert!(hub.accept(br#"{"temperature": 20}"#).is_err());
        hub.accept(&event("Room1", 1.0)).unwrap();

        assert_eq!(drain(&viewer).len(), 1);
        let stats = hub.stats();
        assert_eq!(stats.events_malformed, 2);
        assert_eq!(stats.events_accepted, 1);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let hub = hub(3, OverflowPolicy::DropOldest);
        let viewer = hub.register_viewer();
        for i in 0..5 {
            hub.accept(&event("Room1", i as f64)).unwrap();
        }
        let got = drain(&viewer);
        assert_eq!(got.len(), 3);
        assert!(got[0].contains(":2}") && got[2].contains(":4}"));
        assert_eq!(hub.stats().frames_dropped, 2);
    }

    #[test]
    fn full_queue_disconnects_slow_viewer_only() {
        let hub = hub(2, OverflowPolicy::Disconnect);
        let slow = hub.register_viewer();
        let fast = hub.register_viewer();

        for i in 0..3 {
            hub.accept(&event("Room1", i as f64)).unwrap();
            assert!(fast.try_recv().is_some());
        }
        assert_eq!(hub.viewer_count(), 1);
        // frames queued before the disconnect are still readable, nothing after it
        assert_eq!(drain(&slow).len(), 2);

        let report = hub.accept(&event("Room1", 9.0)).unwrap();
        assert_eq!(report.delivered, 1);
        assert!(fast.try_recv().is_some());
    }

    #[test]
    fn dropping_connection_unregisters_it() {
        let hub = hub(8, OverflowPolicy::DropOldest);
        let viewer = hub.register_viewer();
        let id = viewer.id();
        drop(viewer);

        assert_eq!(hub.viewer_count(), 0);
        assert!(!hub.unregister_viewer(id));
        assert_eq!(hub.accept(&event("Room1", 1.0)).unwrap().delivered, 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_relay_and_ends_on_unregister() {
        let hub = hub(8, OverflowPolicy::DropOldest);
        let viewer = hub.register_viewer();
        let id = viewer.id();

        let reader = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(f) = viewer.recv().await {
                frames.push(f.to_string());
            }
            frames
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.accept(&event("Room1", 1.0)).unwrap();
        hub.accept(&event("Room1", 2.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.unregister_viewer(id));

        let frames = tokio::time::timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn queued_frames_survive_unregister() {
        let hub = hub(8, OverflowPolicy::DropOldest);
        let viewer = hub.register_viewer();
        hub.accept(&event("Room1", 1.0)).unwrap();
        hub.accept(&event("Room1", 2.0)).unwrap();
        assert!(hub.unregister_viewer(viewer.id()));
        hub.accept(&event("Room1", 3.0)).unwrap();

        let first = viewer.recv().await.unwrap();
        let second = viewer.recv().await.unwrap();
        assert!(first.contains(":1}") && second.contains(":2}"));
        assert!(viewer.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unregister_during_relay_is_harmless() {
        let hub = hub(1024, OverflowPolicy::DropOldest);
        let keeper = hub.register_viewer();

        let churn = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let c = hub.register_viewer();
                    tokio::task::yield_now().await;
                    drop(c);
                }
            })
        };
        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    hub.accept(&event("Room1", i as f64)).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        churn.await.unwrap();
        publisher.await.unwrap();

        assert_eq!(hub.viewer_count(), 1);
        assert_eq!(drain(&keeper).len(), 500);
    }
}
