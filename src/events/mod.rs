use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Topics published by the core. Payloads are flat maps of primitives.
pub mod topic {
    pub const VERIFY_START: &str = "verify:start";
    pub const VERIFY_PROGRESS: &str = "verify:progress";
    pub const VERIFY_NODE_PROMOTED: &str = "verify:node_promoted";
    pub const VERIFY_NODE_DEMOTED: &str = "verify:node_demoted";
    pub const VERIFY_NODE_ARCHIVED: &str = "verify:node_archived";
    pub const VERIFY_COMPLETE: &str = "verify:complete";
    pub const SUB_REFRESH_STARTED: &str = "sub:refresh_started";
    pub const SUB_REFRESH_COMPLETED: &str = "sub:refresh_completed";
    pub const CONFIG_APPLIED: &str = "config:applied";
    pub const PROBE_START: &str = "probe:start";
    pub const PROBE_STOP: &str = "probe:stop";

    pub const ALL: &[&str] = &[
        VERIFY_START,
        VERIFY_PROGRESS,
        VERIFY_NODE_PROMOTED,
        VERIFY_NODE_DEMOTED,
        VERIFY_NODE_ARCHIVED,
        VERIFY_COMPLETE,
        SUB_REFRESH_STARTED,
        SUB_REFRESH_COMPLETED,
        CONFIG_APPLIED,
        PROBE_START,
        PROBE_STOP,
    ];
}

/// One published event. `payload` is always a JSON object of primitive values.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: &'static str,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl Event {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            timestamp: crate::store::now_ms(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.payload {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Short human-readable line for the activity log.
    pub fn summary(&self) -> String {
        match &self.payload {
            serde_json::Value::Object(map) if !map.is_empty() => {
                let fields: Vec<String> = map
                    .iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => format!("{}={}", k, s),
                        other => format!("{}={}", k, other),
                    })
                    .collect();
                fields.join(", ")
            }
            _ => String::new(),
        }
    }
}

/// Per-subscriber queue depth. A subscriber that falls further behind loses
/// its oldest messages first.
const SUBSCRIBER_CAPACITY: usize = 256;

/// In-process topic broker.
///
/// `publish` never blocks: fan-out goes through a broadcast channel whose lag
/// semantics drop the oldest message for a slow subscriber. Ordering is
/// guaranteed per subscriber, not across subscribers.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    next_subscriber: AtomicU64,
    dropped: Arc<DashMap<u64, u64>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            tx,
            next_subscriber: AtomicU64::new(0),
            dropped: Arc::new(DashMap::new()),
        }
    }

    pub fn publish(&self, event: Event) {
        metrics::counter!("manager_events_published_total", "topic" => event.topic).increment(1);
        // No receivers is fine — the bus is fire-and-forget.
        let _ = self.tx.send(event);
    }

    /// Subscribe to a set of topics. Dropping the returned stream
    /// unsubscribes.
    pub fn subscribe(&self, topics: &[&'static str]) -> EventStream {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.dropped.insert(id, 0);
        EventStream {
            id,
            rx: self.tx.subscribe(),
            topics: topics.iter().copied().collect(),
            dropped: self.dropped.clone(),
        }
    }

    pub fn subscribe_all(&self) -> EventStream {
        self.subscribe(topic::ALL)
    }

    /// Total messages dropped across current subscribers.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.iter().map(|e| *e.value()).sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription. `recv` yields events matching the topic set in
/// publish order; returns `None` once the bus is gone.
pub struct EventStream {
    id: u64,
    rx: broadcast::Receiver<Event>,
    topics: HashSet<&'static str>,
    dropped: Arc<DashMap<u64, u64>>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.topics.contains(event.topic) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    if let Some(mut count) = self.dropped.get_mut(&self.id) {
                        *count += n;
                    }
                    metrics::counter!("manager_events_dropped_total").increment(n);
                    debug!("events: subscriber lagged, id={}, dropped={}", self.id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.topics.contains(event.topic) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    if let Some(mut count) = self.dropped.get_mut(&self.id) {
                        *count += n;
                    }
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.dropped.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe_in_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(&[topic::VERIFY_START, topic::VERIFY_COMPLETE]);

        bus.publish(Event::new(topic::VERIFY_START).with("cycle", 1));
        bus.publish(Event::new(topic::VERIFY_PROGRESS).with("current", 1));
        bus.publish(Event::new(topic::VERIFY_COMPLETE).with("cycle", 1));

        let first = stream.recv().await.unwrap();
        assert_eq!(first.topic, topic::VERIFY_START);
        // The progress event is filtered out by the topic set.
        let second = stream.recv().await.unwrap();
        assert_eq!(second.topic, topic::VERIFY_COMPLETE);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe_all();

        for i in 0..(SUBSCRIBER_CAPACITY + 50) {
            bus.publish(Event::new(topic::VERIFY_PROGRESS).with("i", i as i64));
        }

        // The first received event is no longer i=0: the oldest were dropped.
        let first = stream.recv().await.unwrap();
        let i = first.payload.get("i").and_then(|v| v.as_i64()).unwrap();
        assert!(i > 0, "expected oldest events dropped, got i={}", i);
        assert!(bus.dropped_total() >= 50);
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let bus = EventBus::new();
        let stream = bus.subscribe_all();
        assert_eq!(bus.dropped.len(), 1);
        drop(stream);
        assert_eq!(bus.dropped.len(), 0);
    }

    #[test]
    fn test_event_summary() {
        let ev = Event::new(topic::VERIFY_NODE_PROMOTED)
            .with("tag", "n1")
            .with("latency_ms", 120);
        let s = ev.summary();
        assert!(s.contains("tag=n1"));
        assert!(s.contains("latency_ms=120"));
    }
}
