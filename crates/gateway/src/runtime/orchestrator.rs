//! Conversation orchestrator.
//!
//! Owns the per-room tape tasks: a user message (or an autonomous
//! tick) interrupts whatever is running, then spawns one task that
//! executes tape rounds until every agent skips, a limit is reached,
//! or the room is interrupted again. Partial responses captured at
//! interrupt time are persisted so nothing the agents said is lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;

use ag_domain::config::Config;
use ag_domain::types::{ImageAttachment, MessageRole, ParticipantType};
use ag_domain::{Error, Result, TaskIdentifier};
use ag_store::cache::{room_agents_key, room_key, room_messages_key};
use ag_store::records::{AgentRecord, MessageRecord, NewMessage};
use ag_store::{Cache, Store, WriteQueue};

use super::events::{EventBroadcaster, RoomEvent};
use super::generator::ResponseGenerator;
use super::manager::AgentManager;
use super::tape::{TapeExecutor, TapeGenerator};

/// Entries in `last_user_message_time` older than this are purged by
/// the periodic cleanup.
const STALE_ENTRY_AGE: Duration = Duration::from_secs(3600);

const CACHE_TTL: Duration = Duration::from_secs(30);

/// A user message accepted on the HTTP write path.
#[derive(Debug, Clone)]
pub struct UserMessageInput {
    pub content: String,
    pub participant_type: ParticipantType,
    pub participant_name: Option<String>,
    pub images: Option<Vec<ImageAttachment>>,
}

pub struct Orchestrator {
    store: Store,
    write_queue: Arc<WriteQueue>,
    cache: Arc<Cache>,
    broadcaster: Arc<EventBroadcaster>,
    manager: Arc<AgentManager>,
    generator: ResponseGenerator,
    active_room_tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
    last_user_message_time: Arc<Mutex<HashMap<i64, Instant>>>,
    max_follow_up_rounds: u32,
    max_total_messages: u32,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        write_queue: Arc<WriteQueue>,
        cache: Arc<Cache>,
        broadcaster: Arc<EventBroadcaster>,
        manager: Arc<AgentManager>,
        config: Arc<Config>,
    ) -> Self {
        let last_user_message_time = Arc::new(Mutex::new(HashMap::new()));
        let generator = ResponseGenerator::new(
            store.clone(),
            write_queue.clone(),
            cache.clone(),
            broadcaster.clone(),
            manager.clone(),
            config.clone(),
            last_user_message_time.clone(),
        );
        Self {
            store,
            write_queue,
            cache,
            broadcaster,
            manager,
            generator,
            active_room_tasks: Mutex::new(HashMap::new()),
            last_user_message_time,
            max_follow_up_rounds: config.orchestrator.max_follow_up_rounds,
            max_total_messages: config.orchestrator.max_total_messages,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Entry points
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Accept a user message: persist it, interrupt any running tape
    /// (rescuing partial responses), and start a fresh tape.
    ///
    /// `saved_user_message_id` lets callers that already persisted the
    /// message skip the duplicate write.
    pub async fn handle_user_message(
        self: &Arc<Self>,
        room_id: i64,
        input: UserMessageInput,
        saved_user_message_id: Option<i64>,
    ) -> Result<MessageRecord> {
        let message = match saved_user_message_id {
            Some(id) => self.store.get_message(id)?,
            None => {
                let record = NewMessage {
                    room_id,
                    agent_id: None,
                    content: input.content,
                    role: MessageRole::User,
                    participant_type: Some(input.participant_type),
                    participant_name: input.participant_name,
                    thinking: None,
                    anthropic_calls: None,
                    images: match &input.images {
                        Some(images) if !images.is_empty() => {
                            Some(serde_json::to_string(images)?)
                        }
                        _ => None,
                    },
                    chat_session_id: None,
                    game_time_snapshot: None,
                };
                self.write_queue
                    .enqueue(move |store| store.create_message(&record))
                    .await?
            }
        };
        self.cache.invalidate(&room_messages_key(room_id));
        self.cache.invalidate(&room_key(room_id));

        // Cancel whatever the room was doing; keep what was said so far.
        self.interrupt_room_processing(room_id, true).await;
        self.last_user_message_time
            .lock()
            .insert(room_id, Instant::now());

        let agents = self.room_agents_cached(room_id).await?;
        if agents.is_empty() {
            return Ok(message);
        }
        let _ = self.spawn_tape(room_id, agents, Some(message.content.clone()));
        Ok(message)
    }

    /// Run one autonomous round for a room and wait for it to finish.
    /// No-op when a tape is already running there.
    pub async fn process_autonomous_round(self: &Arc<Self>, room_id: i64) -> Result<()> {
        {
            let tasks = self.active_room_tasks.lock();
            if tasks.get(&room_id).is_some_and(|h| !h.is_finished()) {
                return Ok(());
            }
        }
        let agents = self.room_agents_cached(room_id).await?;
        if agents.len() < 2 {
            return Ok(());
        }
        let done = self.spawn_tape(room_id, agents, None);
        // Completes on finish; a cancelled sender (interrupt) also
        // resolves the await.
        let _ = done.await;
        Ok(())
    }

    /// Cancel the room's running tape, signal its clients, and — when
    /// `save_partial` — persist every non-empty partial response as a
    /// normal assistant message.
    pub async fn interrupt_room_processing(&self, room_id: i64, save_partial: bool) {
        let handle = self.active_room_tasks.lock().remove(&room_id);
        if let Some(handle) = handle {
            if !handle.is_finished() {
                handle.abort();
            }
        }
        self.manager.interrupt_room(room_id).await;

        let drained = self.manager.streaming.drain_for_room(room_id);
        if drained.is_empty() {
            return;
        }
        for (agent_id, partial) in drained {
            let task = TaskIdentifier::new(room_id, agent_id);
            // The aborted tape cannot emit its own terminal event.
            self.broadcaster.broadcast(
                room_id,
                &RoomEvent::StreamEnd {
                    task_id: task.to_string(),
                    agent_id,
                    skipped: true,
                    response_text: partial.response_text.clone(),
                    thinking_text: partial.thinking_text.clone(),
                    session_id: None,
                },
            );
            if !save_partial || partial.response_text.trim().is_empty() {
                continue;
            }

            let record = NewMessage::assistant(room_id, agent_id, partial.response_text.clone())
                .with_thinking(
                    (!partial.thinking_text.is_empty()).then(|| partial.thinking_text.clone()),
                );
            match self
                .write_queue
                .enqueue(move |store| store.create_message(&record))
                .await
            {
                Ok(saved) => {
                    tracing::info!(room_id, agent_id, "saved partial response on interrupt");
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
                }
                Err(e) => {
                    tracing::error!(room_id, agent_id, error = %e, "failed to save partial response");
                }
            }
        }
    }

    /// Full teardown for a room (deletion, message clear): interrupt
    /// without saving, drop tracking state, evict pooled clients.
    pub async fn cleanup_room_state(&self, room_id: i64) {
        self.interrupt_room_processing(room_id, false).await;
        self.active_room_tasks.lock().remove(&room_id);
        self.last_user_message_time.lock().remove(&room_id);
        self.manager.pool.cleanup_room(room_id).await;
        self.cache.invalidate(&room_key(room_id));
        self.cache.invalidate(&room_agents_key(room_id));
        self.cache.invalidate(&room_messages_key(room_id));
    }

    /// Agent ids currently generating in a room.
    pub fn chatting_agents(&self, room_id: i64) -> Vec<i64> {
        self.manager.chatting_agents(room_id)
    }

    /// Drop finished task handles and stale user-message timestamps.
    /// Called from the periodic cleanup sweep.
    pub fn cleanup_stale_entries(&self) {
        let mut tasks = self.active_room_tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, handle| !handle.is_finished());
        let removed = before - tasks.len();
        if removed > 0 {
            tracing::debug!(removed, "cleaned up completed room tasks");
        }
        self.last_user_message_time
            .lock()
            .retain(|_, at| at.elapsed() < STALE_ENTRY_AGE);
    }

    /// True when a tape is currently running for the room.
    pub fn is_room_busy(&self, room_id: i64) -> bool {
        self.active_room_tasks
            .lock()
            .get(&room_id)
            .is_some_and(|h| !h.is_finished())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tape loop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn spawn_tape(
        self: &Arc<Self>,
        room_id: i64,
        agents: Vec<AgentRecord>,
        user_message: Option<String>,
    ) -> tokio::sync::oneshot::Receiver<()> {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let orchestrator = self.clone();
        let span = tracing::info_span!("tape", room_id);
        let handle = tokio::spawn(
            async move {
                if let Err(e) = orchestrator
                    .run_tape_loop(room_id, agents, user_message)
                    .await
                {
                    tracing::error!(room_id, error = %e, "tape loop failed");
                }
                let _ = done_tx.send(());
            }
            .instrument(span),
        );
        // The slot holds at most one live tape per room: displacing an
        // unfinished handle aborts it.
        if let Some(old) = self.active_room_tasks.lock().insert(room_id, handle) {
            if !old.is_finished() {
                old.abort();
            }
        }
        done_rx
    }

    async fn run_tape_loop(
        &self,
        room_id: i64,
        agents: Vec<AgentRecord>,
        user_message: Option<String>,
    ) -> Result<()> {
        let handling_started = Instant::now();
        let interrupt_agent_ids: Vec<i64> = agents
            .iter()
            .filter(|a| a.interrupt_every_turn)
            .map(|a| a.id)
            .collect();
        let tape_generator = TapeGenerator::new(agents.clone(), interrupt_agent_ids);
        let executor = TapeExecutor {
            generator: &self.generator,
            store: &self.store,
            room_id,
            handling_started,
            last_user_message_time: &*self.last_user_message_time,
        };

        let mut total_responses: u32 = 0;
        let mut round: u32 = 0;
        let mut tape = tape_generator.generate_initial_round();

        loop {
            tracing::debug!(room_id, round, turns = tape.turns.len(), "executing tape round");
            let result = executor
                .execute(&tape, &agents, user_message.as_deref())
                .await;
            total_responses += result.total_responses;

            if result.all_skipped {
                tracing::info!(room_id, "all agents skipped, conversation finished");
                self.mark_room_finished(room_id).await;
                break;
            }
            if result.was_paused || result.was_interrupted {
                break;
            }
            if agents.len() < 2 {
                break;
            }
            if total_responses >= self.max_total_messages {
                tracing::info!(room_id, total_responses, "message cap reached for this handling");
                break;
            }
            if self.room_interaction_cap_reached(room_id).await? {
                self.mark_room_finished(room_id).await;
                break;
            }
            if round >= self.max_follow_up_rounds {
                break;
            }

            round += 1;
            let mut eligible = Vec::new();
            for agent in &agents {
                if self.store.interlocutor_activity_since(room_id, agent.id)? {
                    eligible.push(agent.id);
                }
            }
            tape = tape_generator.generate_follow_up_round(round, &eligible);
            if tape.turns.is_empty() {
                break;
            }
        }
        Ok(())
    }

    async fn mark_room_finished(&self, room_id: i64) {
        let result = self
            .write_queue
            .enqueue(move |store| store.set_room_finished(room_id, true))
            .await;
        if let Err(e) = result {
            tracing::error!(room_id, error = %e, "failed to mark room finished");
        }
        self.cache.invalidate(&room_key(room_id));
    }

    async fn room_interaction_cap_reached(&self, room_id: i64) -> Result<bool> {
        let Some(room) = self.store.get_room(room_id)? else {
            return Ok(true);
        };
        let Some(cap) = room.max_interactions else {
            return Ok(false);
        };
        Ok(self.store.assistant_message_count(room_id)? >= cap)
    }

    async fn room_agents_cached(&self, room_id: i64) -> Result<Vec<AgentRecord>> {
        let store = self.store.clone();
        self.cache
            .get_or_set_async(&room_agents_key(room_id), CACHE_TTL, || async move {
                store.get_room_agents(room_id)
            })
            .await
    }

    /// Room lookup shared with the API layer (cached).
    pub async fn room_cached(&self, room_id: i64) -> Result<ag_store::records::RoomRecord> {
        let store = self.store.clone();
        self.cache
            .get_or_set_async(&room_key(room_id), CACHE_TTL, || async move {
                store.get_room(room_id)
            })
            .await?
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))
    }
}
