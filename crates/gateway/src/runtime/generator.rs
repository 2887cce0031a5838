//! One agent turn, end to end.
//!
//! Builds the conversation context, checks out the pooled runtime
//! client, folds the event stream into accumulated text while
//! broadcasting deltas, and persists the outcome through the write
//! queue. Skip, cancellation, and runtime failure are ordinary
//! [`TurnOutcome`] values — the tape executor branches on them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::Instrument;

use ag_domain::config::Config;
use ag_domain::types::{ImageAttachment, TurnOutcome, SKIP_MESSAGE};
use ag_domain::{Result, TaskIdentifier};
use ag_runtime::{parse_event, RuntimeClient};
use ag_store::cache::{room_agents_key, room_key, room_messages_key};
use ag_store::records::{AgentRecord, MessageRecord, NewMessage, RoomRecord};
use ag_store::{Cache, Store, WriteQueue};

use super::conversation::build_conversation_context;
use super::events::{EventBroadcaster, RoomEvent};
use super::manager::AgentManager;
use super::options::build_agent_options;

/// TTL for cached room and membership reads inside a turn.
const TURN_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct ResponseGenerator {
    store: Store,
    write_queue: Arc<WriteQueue>,
    cache: Arc<Cache>,
    broadcaster: Arc<EventBroadcaster>,
    manager: Arc<AgentManager>,
    config: Arc<Config>,
    /// Shared with the orchestrator: arrival instant of the latest user
    /// message per room. A turn that finishes after a newer arrival is
    /// discarded.
    last_user_message_time: Arc<Mutex<HashMap<i64, Instant>>>,
}

impl ResponseGenerator {
    pub fn new(
        store: Store,
        write_queue: Arc<WriteQueue>,
        cache: Arc<Cache>,
        broadcaster: Arc<EventBroadcaster>,
        manager: Arc<AgentManager>,
        config: Arc<Config>,
        last_user_message_time: Arc<Mutex<HashMap<i64, Instant>>>,
    ) -> Self {
        Self {
            store,
            write_queue,
            cache,
            broadcaster,
            manager,
            config,
            last_user_message_time,
        }
    }

    /// Run one turn for `agent` in `room_id`.
    ///
    /// `user_message` is `None` on follow-up rounds; the turn is
    /// skipped outright when nothing new has happened since the
    /// agent's last response. `hidden` keeps the response text out of
    /// streaming snapshots and delta broadcasts.
    pub async fn generate_response(
        &self,
        room_id: i64,
        agent: &AgentRecord,
        user_message: Option<&str>,
        hidden: bool,
    ) -> Result<TurnOutcome> {
        let span = tracing::info_span!("turn", room_id, agent_id = agent.id, agent = %agent.name);
        self.generate_response_inner(room_id, agent, user_message, hidden)
            .instrument(span)
            .await
    }

    async fn generate_response_inner(
        &self,
        room_id: i64,
        agent: &AgentRecord,
        user_message: Option<&str>,
        hidden: bool,
    ) -> Result<TurnOutcome> {
        let task = TaskIdentifier::new(room_id, agent.id);
        let started_at = Instant::now();

        // 1. Room (cached) + messages since this agent's last response.
        let Some(_room) = self.room_cached(room_id).await? else {
            return Err(ag_domain::Error::NotFound(format!("room {room_id}")));
        };
        let new_messages = self.store.messages_after_last_response(room_id, agent.id)?;
        if user_message.is_none() && new_messages.is_empty() {
            // Follow-up round with nothing new to react to.
            return Ok(TurnOutcome::Skipped);
        }

        // 2. Conversation context.
        let room_agents = self.room_agents_cached(room_id).await?;
        let history = self
            .store
            .recent_messages(room_id, self.config.orchestrator.context_message_limit)?;
        let context_text = build_conversation_context(
            &history,
            agent,
            &room_agents,
            self.config.orchestrator.context_message_limit,
            &self.config.orchestrator.user_name,
        );
        let images = latest_user_images(&new_messages);

        // 3-4. Cached session id + options; the pool invalidates on
        // config-hash or session change.
        let resume = self
            .store
            .get_room_agent_session(task)?
            .map(|s| s.session_id);
        let options = build_agent_options(agent, &self.config.runtime, resume.clone(), None);

        // 5. Checkout under the per-client usage lock for the whole turn.
        let (client, _is_new, usage_lock) = self.manager.pool.get_or_create(task, &options).await?;
        let _usage_guard = usage_lock.lock_owned().await;

        // 6-7. Streaming state + stream_start.
        self.manager.streaming.init(task, &agent.name, hidden);
        self.broadcaster.broadcast(
            room_id,
            &RoomEvent::StreamStart {
                task_id: task.to_string(),
                agent_id: agent.id,
                agent_name: agent.name.clone(),
                temp_id: uuid::Uuid::new_v4().to_string(),
            },
        );

        let outcome = self
            .drive_stream(
                task, agent, &client, &context_text, &images, resume, hidden, started_at,
            )
            .await;

        // 11. Always clear state and deregister, success or not.
        self.manager.streaming.clear(task);
        self.manager.deregister_active(task);
        outcome
    }

    /// Steps 8-10: issue the prompt, fold the stream, settle the turn.
    #[allow(clippy::too_many_arguments)]
    async fn drive_stream(
        &self,
        task: TaskIdentifier,
        agent: &AgentRecord,
        client: &Arc<dyn RuntimeClient>,
        context_text: &str,
        images: &[ImageAttachment],
        resume: Option<String>,
        hidden: bool,
        started_at: Instant,
    ) -> Result<TurnOutcome> {
        let room_id = task.room_id;

        if let Err(e) = client.query(context_text, images).await {
            let message = e.to_string();
            tracing::error!(task = %task, error = %message, "query failed");
            self.broadcast_stream_end(task, agent.id, false, &format!("[ERROR] {message}"), "", None);
            return Ok(TurnOutcome::Errored(message));
        }
        self.manager.register_active(task, client.clone());

        let mut response = String::new();
        let mut thinking = String::new();
        let mut session_id: Option<String> = None;
        let mut skip_used = false;
        let mut memory_entries: Vec<String> = Vec::new();
        let mut anthropic_calls: Vec<String> = Vec::new();
        let mut stream_error: Option<String> = None;

        let mut events = client.receive_events();
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    stream_error = Some(e.to_string());
                    break;
                }
            };
            let parsed = parse_event(&event, &response, &thinking);

            if parsed.response_text.len() > response.len() {
                let delta = parsed.response_text[response.len()..].to_owned();
                response = parsed.response_text;
                self.manager.streaming.update(task, &thinking, &response);
                if !hidden {
                    self.broadcaster.broadcast(
                        room_id,
                        &RoomEvent::ContentDelta {
                            task_id: task.to_string(),
                            agent_id: agent.id,
                            delta,
                            accumulated: response.clone(),
                        },
                    );
                }
            }
            if parsed.thinking_text.len() > thinking.len() {
                let delta = parsed.thinking_text[thinking.len()..].to_owned();
                thinking = parsed.thinking_text;
                self.manager.streaming.update(task, &thinking, &response);
                if !hidden {
                    self.broadcaster.broadcast(
                        room_id,
                        &RoomEvent::ThinkingDelta {
                            task_id: task.to_string(),
                            agent_id: agent.id,
                            delta,
                            accumulated: thinking.clone(),
                        },
                    );
                }
            }

            if let Some(sid) = parsed.session_id {
                session_id.get_or_insert(sid);
            }
            skip_used |= parsed.skip_used;
            memory_entries.extend(parsed.memory_entries);
            anthropic_calls.extend(parsed.anthropic_calls);
        }
        drop(events);

        if let Some(message) = stream_error {
            tracing::error!(task = %task, error = %message, "runtime stream error");
            self.broadcast_stream_end(
                task,
                agent.id,
                false,
                &format!("[ERROR] {message}"),
                &thinking,
                session_id,
            );
            return Ok(TurnOutcome::Errored(message));
        }

        // 10. Natural end: discard if a newer user message arrived or
        // the room was paused while we streamed.
        let interrupted = self
            .last_user_message_time
            .lock()
            .get(&room_id)
            .is_some_and(|t| *t > started_at);
        let paused = self
            .store
            .get_room(room_id)?
            .map_or(true, |room| room.is_paused);
        if interrupted || paused {
            tracing::info!(task = %task, interrupted, paused, "discarding finished turn");
            self.broadcast_stream_end(task, agent.id, true, "", &thinking, session_id);
            return Ok(TurnOutcome::Cancelled);
        }

        // Record the session id the runtime announced, once it differs.
        if let Some(sid) = &session_id {
            if resume.as_deref() != Some(sid.as_str()) {
                let sid = sid.clone();
                self.write_queue
                    .enqueue(move |store| store.upsert_room_agent_session(task, &sid))
                    .await?;
            }
        }

        if skip_used || response.trim().is_empty() {
            // The marker anchors "messages since my last response".
            let marker = NewMessage::assistant(room_id, agent.id, SKIP_MESSAGE);
            self.write_queue
                .enqueue(move |store| store.create_message(&marker))
                .await?;
            self.cache.invalidate(&room_key(room_id));
            self.broadcast_stream_end(task, agent.id, true, "", &thinking, session_id);
            return Ok(TurnOutcome::Skipped);
        }

        // Persist the message with its thinking trace and tool effects.
        let anthropic_json = if anthropic_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&anthropic_calls)?)
        };
        let mut record = NewMessage::assistant(room_id, agent.id, response.clone())
            .with_thinking((!thinking.is_empty()).then(|| thinking.clone()));
        record.anthropic_calls = anthropic_json;
        let saved: MessageRecord = self
            .write_queue
            .enqueue(move |store| store.create_message(&record))
            .await?;

        for entry in memory_entries {
            let agent_id = agent.id;
            if let Err(e) = self
                .write_queue
                .enqueue(move |store| store.append_recent_event(agent_id, &entry))
                .await
            {
                tracing::warn!(agent_id, error = %e, "failed to record memory entry");
            }
        }

        self.broadcast_stream_end(task, agent.id, false, &response, &thinking, session_id);
        self.broadcaster.broadcast(
            room_id,
            &RoomEvent::NewMessage {
                id: saved.id,
                room_id,
                agent_id: saved.agent_id,
                content: saved.content.clone(),
                role: saved.role.as_str().to_owned(),
                timestamp: saved.timestamp,
            },
        );
        self.cache.invalidate(&room_messages_key(room_id));
        self.cache.invalidate(&room_key(room_id));

        Ok(TurnOutcome::Responded)
    }

    fn broadcast_stream_end(
        &self,
        task: TaskIdentifier,
        agent_id: i64,
        skipped: bool,
        response_text: &str,
        thinking_text: &str,
        session_id: Option<String>,
    ) {
        self.broadcaster.broadcast(
            task.room_id,
            &RoomEvent::StreamEnd {
                task_id: task.to_string(),
                agent_id,
                skipped,
                response_text: response_text.to_owned(),
                thinking_text: thinking_text.to_owned(),
                session_id,
            },
        );
    }

    async fn room_cached(&self, room_id: i64) -> Result<Option<RoomRecord>> {
        let store = self.store.clone();
        self.cache
            .get_or_set_async(&room_key(room_id), TURN_CACHE_TTL, || async move {
                store.get_room(room_id)
            })
            .await
    }

    async fn room_agents_cached(&self, room_id: i64) -> Result<Vec<AgentRecord>> {
        let store = self.store.clone();
        self.cache
            .get_or_set_async(&room_agents_key(room_id), TURN_CACHE_TTL, || async move {
                store.get_room_agents(room_id)
            })
            .await
    }
}

/// Attachments from the most recent user message, if any.
fn latest_user_images(messages: &[MessageRecord]) -> Vec<ImageAttachment> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == ag_domain::types::MessageRole::User && m.images.is_some())
        .and_then(|m| serde_json::from_str(m.images.as_deref().unwrap_or("[]")).ok())
        .unwrap_or_default()
}
