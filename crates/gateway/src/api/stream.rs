//! SSE streaming endpoints.
//!
//! - `POST /rooms/:id/stream/ticket` — mint a single-use ticket
//! - `GET  /rooms/:id/stream?ticket=…` — the event stream
//!
//! On subscribe the client receives `connected`, then one `catch_up`
//! per agent already mid-generation, then live events. Fifteen quiet
//! seconds produce a `keepalive`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::stream::Stream;
use serde::Deserialize;

use super::auth::AuthContext;
use super::rooms::visible_room;
use super::{api_error, error_response};
use crate::runtime::events::{EventBroadcaster, RoomEvent};
use crate::state::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /rooms/:id/stream/ticket
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_ticket(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
) -> Response {
    if let Err(e) = visible_room(&state, &identity, room_id).await {
        return error_response(e);
    }
    let ticket = state
        .tickets
        .create_ticket(&identity.user_id, identity.role, room_id);
    Json(serde_json::json!({ "ticket": ticket })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /rooms/:id/stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub ticket: String,
}

pub async fn stream_events(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let Some(_ticket) = state.tickets.validate_ticket(&query.ticket, room_id) else {
        return api_error(StatusCode::UNAUTHORIZED, "invalid or expired ticket");
    };

    // Snapshot in-flight generations before subscribing so the client
    // can render partial text immediately.
    let catch_up = state.manager.streaming.snapshot_for_room(room_id);
    let (subscriber_id, rx) = state.broadcaster.subscribe(room_id);
    let guard = SubscriptionGuard {
        broadcaster: state.broadcaster.clone(),
        room_id,
        subscriber_id,
    };

    Sse::new(make_event_stream(room_id, catch_up, rx, guard)).into_response()
}

/// Unsubscribes when the SSE stream is dropped (client went away).
struct SubscriptionGuard {
    broadcaster: Arc<EventBroadcaster>,
    room_id: i64,
    subscriber_id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.room_id, self.subscriber_id);
    }
}

fn make_event_stream(
    room_id: i64,
    catch_up: std::collections::HashMap<i64, crate::runtime::streaming::StreamingSnapshot>,
    mut rx: tokio::sync::mpsc::Receiver<Option<String>>,
    guard: SubscriptionGuard,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let _guard = guard;

        let connected = RoomEvent::Connected { room_id };
        yield Ok(sse_frame(&connected));

        for (agent_id, snapshot) in catch_up {
            let event = RoomEvent::CatchUp {
                agent_id,
                agent_name: snapshot.agent_name,
                thinking_text: snapshot.thinking_text,
                response_text: snapshot.response_text,
            };
            yield Ok(sse_frame(&event));
        }

        loop {
            match tokio::time::timeout(KEEPALIVE_INTERVAL, rx.recv()).await {
                Ok(Some(Some(data))) => {
                    let name = serde_json::from_str::<serde_json::Value>(&data)
                        .ok()
                        .and_then(|v| v["type"].as_str().map(str::to_owned))
                        .unwrap_or_else(|| "message".into());
                    yield Ok(Event::default().event(name).data(data));
                }
                // Shutdown sentinel or closed channel: end the stream.
                Ok(Some(None)) | Ok(None) => break,
                Err(_) => {
                    yield Ok(sse_frame(&RoomEvent::Keepalive {}));
                }
            }
        }
    }
}

fn sse_frame(event: &RoomEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .data(serde_json::to_string(event).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::streaming::StreamingSnapshot;
    use futures_util::StreamExt;
    use std::collections::HashMap;

    fn frame_text(event: Event) -> String {
        format!("{event:?}")
    }

    #[tokio::test]
    async fn subscriber_gets_connected_then_catch_up_then_live_events() {
        let broadcaster = Arc::new(EventBroadcaster::default());
        let (subscriber_id, rx) = broadcaster.subscribe(7);
        let guard = SubscriptionGuard {
            broadcaster: broadcaster.clone(),
            room_id: 7,
            subscriber_id,
        };

        let mut catch_up = HashMap::new();
        catch_up.insert(
            3,
            StreamingSnapshot {
                agent_name: "Alice".into(),
                thinking_text: String::new(),
                response_text: "hel".into(),
                narration_text: String::new(),
            },
        );

        let mut stream = Box::pin(make_event_stream(7, catch_up, rx, guard));

        let first = frame_text(stream.next().await.unwrap().unwrap());
        assert!(first.contains("connected"));

        let second = frame_text(stream.next().await.unwrap().unwrap());
        assert!(second.contains("catch_up"));
        assert!(second.contains("hel"));

        // A live broadcast flows through with its event name.
        broadcaster.broadcast(
            7,
            &RoomEvent::ContentDelta {
                task_id: "room_7_agent_3".into(),
                agent_id: 3,
                delta: "lo".into(),
                accumulated: "hello".into(),
            },
        );
        let third = frame_text(stream.next().await.unwrap().unwrap());
        assert!(third.contains("content_delta"));

        // The shutdown sentinel closes the stream, which unsubscribes.
        broadcaster.shutdown();
        assert!(stream.next().await.is_none());
        drop(stream);
        assert!(!broadcaster.has_subscribers(7));
    }

    #[tokio::test]
    async fn quiet_stream_emits_keepalive() {
        tokio::time::pause();
        let broadcaster = Arc::new(EventBroadcaster::default());
        let (subscriber_id, rx) = broadcaster.subscribe(1);
        let guard = SubscriptionGuard {
            broadcaster: broadcaster.clone(),
            room_id: 1,
            subscriber_id,
        };
        let mut stream = Box::pin(make_event_stream(1, HashMap::new(), rx, guard));

        let first = frame_text(stream.next().await.unwrap().unwrap());
        assert!(first.contains("connected"));

        // Virtual time: the 15 s timeout elapses instantly under pause.
        let next = stream.next().await.unwrap().unwrap();
        assert!(frame_text(next).contains("keepalive"));
    }
}
