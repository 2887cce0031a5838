//! In-memory table of partial responses while agents are streaming.
//!
//! SSE catch-up reads a snapshot when a subscriber joins mid-stream;
//! the interruption path drains a room's entries so non-empty partials
//! can be persisted before the state is thrown away.

use std::collections::HashMap;

use parking_lot::Mutex;

use ag_domain::TaskIdentifier;

#[derive(Debug, Clone, Default)]
struct StreamingEntry {
    agent_name: String,
    thinking_text: String,
    response_text: String,
    narration_text: String,
    hidden: bool,
}

/// Snapshot view of one agent's in-flight generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingSnapshot {
    pub agent_name: String,
    pub thinking_text: String,
    pub response_text: String,
    pub narration_text: String,
}

/// Partial text captured when a generation is interrupted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainedPartial {
    pub thinking_text: String,
    pub response_text: String,
}

#[derive(Default)]
pub struct StreamingState {
    state: Mutex<HashMap<TaskIdentifier, StreamingEntry>>,
}

impl StreamingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a task. `hidden` suppresses response text
    /// (agents whose visible output travels another path).
    pub fn init(&self, task: TaskIdentifier, agent_name: &str, hidden: bool) {
        self.state.lock().insert(
            task,
            StreamingEntry {
                agent_name: agent_name.to_owned(),
                hidden,
                ..Default::default()
            },
        );
    }

    /// Update accumulated text if the entry still exists. Hidden
    /// entries never record response text.
    pub fn update(&self, task: TaskIdentifier, thinking_text: &str, response_text: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(&task) {
            entry.thinking_text = thinking_text.to_owned();
            if !entry.hidden {
                entry.response_text = response_text.to_owned();
            }
        }
    }

    pub fn update_narration(&self, task: TaskIdentifier, narration_text: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(&task) {
            entry.narration_text = narration_text.to_owned();
        }
    }

    pub fn clear(&self, task: TaskIdentifier) {
        self.state.lock().remove(&task);
    }

    /// Copy of all in-flight generations for a room, keyed by agent id.
    pub fn snapshot_for_room(&self, room_id: i64) -> HashMap<i64, StreamingSnapshot> {
        let state = self.state.lock();
        state
            .iter()
            .filter(|(task, _)| task.room_id == room_id)
            .map(|(task, entry)| {
                (
                    task.agent_id,
                    StreamingSnapshot {
                        agent_name: entry.agent_name.clone(),
                        thinking_text: entry.thinking_text.clone(),
                        response_text: entry.response_text.clone(),
                        narration_text: entry.narration_text.clone(),
                    },
                )
            })
            .collect()
    }

    /// Capture and clear a room's entries in one critical section.
    /// Used during interrupt so partial responses can be persisted.
    pub fn drain_for_room(&self, room_id: i64) -> HashMap<i64, DrainedPartial> {
        let mut state = self.state.lock();
        let tasks: Vec<TaskIdentifier> = state
            .keys()
            .filter(|task| task.room_id == room_id)
            .copied()
            .collect();
        let mut drained = HashMap::new();
        for task in tasks {
            if let Some(entry) = state.remove(&task) {
                drained.insert(
                    task.agent_id,
                    DrainedPartial {
                        thinking_text: entry.thinking_text,
                        response_text: entry.response_text,
                    },
                );
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }
}
