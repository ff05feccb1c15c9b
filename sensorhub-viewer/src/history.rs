//! Bounded per-metric history.

use std::collections::{BTreeMap, VecDeque};

/// Number of samples kept per metric unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 20;

/// Fixed-capacity FIFO: pushing into a full buffer evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    /// Appends `item`, returning the evicted entry if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity { self.items.pop_front() } else { None };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// One metric value with its arrival-order label.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub seq: u64,
    pub label: String,
    pub value: f64,
}

/// Ring buffer per metric name, all sharing the same capacity and sequence counter.
#[derive(Debug, Clone)]
pub struct MetricHistory {
    capacity: usize,
    next_seq: u64,
    series: BTreeMap<String, RingBuffer<Sample>>,
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), next_seq: 0, series: BTreeMap::new() }
    }

    /// Records every metric of one event under a single sequence number.
    pub fn record(&mut self, metrics: &BTreeMap<String, f64>, label: &str) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        for (name, value) in metrics {
            let capacity = self.capacity;
            self.series
                .entry(name.clone())
                .or_insert_with(|| RingBuffer::new(capacity))
                .push(Sample { seq, label: label.to_string(), value: *value });
        }
        seq
    }

    pub fn series(&self, metric: &str) -> Option<&RingBuffer<Sample>> {
        self.series.get(metric)
    }

    pub fn values(&self, metric: &str) -> Vec<f64> {
        self.series(metric).map(|s| s.iter().map(|x| x.value).collect()).unwrap_or_default()
    }

    pub fn labels(&self, metric: &str) -> Vec<&str> {
        self.series(metric).map(|s| s.iter().map(|x| x.label.as_str()).collect()).unwrap_or_default()
    }

    pub fn latest(&self, metric: &str) -> Option<f64> {
        self.series(metric).and_then(|s| s.last()).map(|x| x.value)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MetricHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
