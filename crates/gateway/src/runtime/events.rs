//! Per-room event fanout for SSE subscribers.
//!
//! Each subscriber owns a bounded channel; broadcasting never blocks
//! generation — a full queue just drops the event for that subscriber.
//! A `None` sentinel on the channel tells the SSE loop to close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

/// Default per-subscriber queue capacity.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Events delivered over a room's SSE stream.
///
/// `content_delta`/`thinking_delta` carry both the increment and the
/// full accumulated text, so a subscriber can reconstruct the final
/// message either way.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    Connected {
        room_id: i64,
    },
    CatchUp {
        agent_id: i64,
        agent_name: String,
        thinking_text: String,
        response_text: String,
    },
    StreamStart {
        task_id: String,
        agent_id: i64,
        agent_name: String,
        temp_id: String,
    },
    ContentDelta {
        task_id: String,
        agent_id: i64,
        delta: String,
        accumulated: String,
    },
    ThinkingDelta {
        task_id: String,
        agent_id: i64,
        delta: String,
        accumulated: String,
    },
    StreamEnd {
        task_id: String,
        agent_id: i64,
        skipped: bool,
        response_text: String,
        thinking_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    NewMessage {
        id: i64,
        room_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<i64>,
        content: String,
        role: String,
        timestamp: DateTime<Utc>,
    },
    Keepalive {},
}

impl RoomEvent {
    /// The SSE event name for this payload.
    pub fn event_name(&self) -> &'static str {
        match self {
            RoomEvent::Connected { .. } => "connected",
            RoomEvent::CatchUp { .. } => "catch_up",
            RoomEvent::StreamStart { .. } => "stream_start",
            RoomEvent::ContentDelta { .. } => "content_delta",
            RoomEvent::ThinkingDelta { .. } => "thinking_delta",
            RoomEvent::StreamEnd { .. } => "stream_end",
            RoomEvent::NewMessage { .. } => "new_message",
            RoomEvent::Keepalive {} => "keepalive",
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Option<String>>,
}

/// Per-room subscriber registry.
pub struct EventBroadcaster {
    subscribers: Mutex<HashMap<i64, Vec<Subscriber>>>,
    capacity: usize,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity,
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Register a subscriber queue for a room. Returns the subscriber id
    /// (for `unsubscribe`) and the receiving end; a `None` item means
    /// the server is shutting down.
    pub fn subscribe(&self, room_id: i64) -> (u64, mpsc::Receiver<Option<String>>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        let room_subs = subscribers.entry(room_id).or_default();
        room_subs.push(Subscriber { id, tx });
        tracing::debug!(room_id, total = room_subs.len(), "SSE subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, room_id: i64, subscriber_id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(room_subs) = subscribers.get_mut(&room_id) {
            room_subs.retain(|s| s.id != subscriber_id);
            if room_subs.is_empty() {
                subscribers.remove(&room_id);
            }
        }
        tracing::debug!(room_id, "SSE subscriber removed");
    }

    /// Deliver an event to every subscriber of a room. Non-blocking:
    /// full queues drop the event rather than stalling the generation
    /// pipeline.
    pub fn broadcast(&self, room_id: i64, event: &RoomEvent) {
        let subscribers = self.subscribers.lock();
        let Some(room_subs) = subscribers.get(&room_id) else {
            return;
        };
        let data = match serde_json::to_string(event) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize room event");
                return;
            }
        };
        for sub in room_subs {
            if sub.tx.try_send(Some(data.clone())).is_err() {
                tracing::warn!(
                    room_id,
                    event = event.event_name(),
                    "SSE queue full, dropping event"
                );
            }
        }
    }

    pub fn has_subscribers(&self, room_id: i64) -> bool {
        self.subscribers
            .lock()
            .get(&room_id)
            .is_some_and(|subs| !subs.is_empty())
    }

    pub fn subscriber_count(&self, room_id: i64) -> usize {
        self.subscribers
            .lock()
            .get(&room_id)
            .map_or(0, |subs| subs.len())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Signal every subscriber to terminate.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let subscribers = self.subscribers.lock();
        for room_subs in subscribers.values() {
            for sub in room_subs {
                let _ = sub.tx.try_send(None);
            }
        }
        tracing::info!("SSE broadcaster shutdown signalled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> RoomEvent {
        RoomEvent::ContentDelta {
            task_id: "room_1_agent_2".into(),
            agent_id: 2,
            delta: text.into(),
            accumulated: text.into(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let broadcaster = EventBroadcaster::default();
        let (_id, mut rx) = broadcaster.subscribe(1);

        broadcaster.broadcast(1, &delta("a"));
        broadcaster.broadcast(1, &delta("b"));

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert!(first.contains("\"a\""));
        assert!(second.contains("\"b\""));
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_room() {
        let broadcaster = EventBroadcaster::default();
        let (_a, mut rx1) = broadcaster.subscribe(1);
        let (_b, mut rx2) = broadcaster.subscribe(2);

        broadcaster.broadcast(1, &delta("only room 1"));

        assert!(rx1.recv().await.unwrap().is_some());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let broadcaster = EventBroadcaster::new(2);
        let (_id, mut rx) = broadcaster.subscribe(1);

        for i in 0..5 {
            broadcaster.broadcast(1, &delta(&format!("m{i}")));
        }

        // Only the first two made it; the rest were dropped silently.
        assert!(rx.recv().await.unwrap().unwrap().contains("m0"));
        assert!(rx.recv().await.unwrap().unwrap().contains("m1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_removes_queue() {
        let broadcaster = EventBroadcaster::default();
        let (id, _rx) = broadcaster.subscribe(1);
        assert!(broadcaster.has_subscribers(1));

        broadcaster.unsubscribe(1, id);
        assert!(!broadcaster.has_subscribers(1));
        assert_eq!(broadcaster.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn shutdown_sends_sentinel() {
        let broadcaster = EventBroadcaster::default();
        let (_id, mut rx) = broadcaster.subscribe(1);

        broadcaster.shutdown();
        assert!(broadcaster.is_shutting_down());
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[test]
    fn event_serialization_shape() {
        let event = RoomEvent::StreamEnd {
            task_id: "room_1_agent_2".into(),
            agent_id: 2,
            skipped: false,
            response_text: "hello".into(),
            thinking_text: String::new(),
            session_id: Some("sess_1".into()),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "stream_end");
        assert_eq!(json["skipped"], false);
        assert_eq!(json["session_id"], "sess_1");
    }

    #[test]
    fn keepalive_serializes_with_type_only() {
        let json = serde_json::to_string(&RoomEvent::Keepalive {}).unwrap();
        assert_eq!(json, r#"{"type":"keepalive"}"#);
    }
}
