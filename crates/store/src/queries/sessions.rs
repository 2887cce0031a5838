use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use ag_domain::{Result, TaskIdentifier};

use crate::records::{ts_to_sql, RoomAgentSessionRecord};
use crate::store::{db_err, Store};

impl Store {
    /// Session id the runtime can resume for this (room, agent), if one
    /// was recorded by a previous turn.
    pub fn get_room_agent_session(
        &self,
        task: TaskIdentifier,
    ) -> Result<Option<RoomAgentSessionRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT room_id, agent_id, session_id, updated_at \
                 FROM room_agent_sessions WHERE room_id = ?1 AND agent_id = ?2",
                params![task.room_id, task.agent_id],
                RoomAgentSessionRecord::from_row,
            )
            .optional()
            .map_err(db_err)
        })
    }

    /// Record the session id the runtime announced for this pair.
    pub fn upsert_room_agent_session(&self, task: TaskIdentifier, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO room_agent_sessions (room_id, agent_id, session_id, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(room_id, agent_id) DO UPDATE SET \
                     session_id = ?3, updated_at = ?4",
                params![
                    task.room_id,
                    task.agent_id,
                    session_id,
                    ts_to_sql(Utc::now())
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}
