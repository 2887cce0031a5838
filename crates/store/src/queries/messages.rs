use chrono::Utc;
use rusqlite::params;

use ag_domain::types::SKIP_MESSAGE;
use ag_domain::{Error, Result};

use crate::records::{ts_to_sql, MessageRecord, NewMessage};
use crate::store::{db_err, Store};

const MESSAGE_COLUMNS: &str = "id, room_id, agent_id, content, role, participant_type, \
     participant_name, thinking, anthropic_calls, timestamp, images, chat_session_id, \
     game_time_snapshot";

impl Store {
    /// Insert a message and bump the room's last-activity timestamp in
    /// the same critical section.
    pub fn create_message(&self, message: &NewMessage) -> Result<MessageRecord> {
        self.with_conn(|conn| {
            let now = ts_to_sql(Utc::now());
            conn.execute(
                "INSERT INTO messages (room_id, agent_id, content, role, participant_type, \
                 participant_name, thinking, anthropic_calls, timestamp, images, \
                 chat_session_id, game_time_snapshot) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.room_id,
                    message.agent_id,
                    message.content,
                    message.role.as_str(),
                    message.participant_type.map(|p| p.as_str()),
                    message.participant_name,
                    message.thinking,
                    message.anthropic_calls,
                    now,
                    message.images,
                    message.chat_session_id,
                    message.game_time_snapshot,
                ],
            )
            .map_err(db_err)?;
            let id = conn.last_insert_rowid();
            conn.execute(
                "UPDATE rooms SET last_activity_at = ?2 WHERE id = ?1",
                params![message.room_id, now],
            )
            .map_err(db_err)?;

            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                MessageRecord::from_row,
            )
            .map_err(db_err)
        })
    }

    /// Full visible history of a room, oldest first. Skip markers are
    /// filtered out.
    pub fn get_messages(&self, room_id: i64) -> Result<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE room_id = ?1 AND content != ?2 ORDER BY id"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![room_id, SKIP_MESSAGE], MessageRecord::from_row)
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }

    /// Incremental poll: visible messages with id strictly greater than
    /// `since_id`, ascending.
    pub fn poll_messages(&self, room_id: i64, since_id: i64) -> Result<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE room_id = ?1 AND id > ?2 AND content != ?3 ORDER BY id"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![room_id, since_id, SKIP_MESSAGE],
                    MessageRecord::from_row,
                )
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }

    /// Most recent visible messages for context building, oldest first.
    pub fn recent_messages(&self, room_id: i64, limit: usize) -> Result<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT * FROM (SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE room_id = ?1 AND content != ?2 ORDER BY id DESC LIMIT ?3) \
                     ORDER BY id"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![room_id, SKIP_MESSAGE, limit as i64],
                    MessageRecord::from_row,
                )
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }

    /// Messages that arrived after the agent's latest assistant message
    /// in the room (skip markers included as anchors, excluded from the
    /// result). Drives follow-up-round discrimination.
    pub fn messages_after_last_response(
        &self,
        room_id: i64,
        agent_id: i64,
    ) -> Result<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE room_id = ?1 AND content != ?3 \
                       AND id > COALESCE((SELECT MAX(id) FROM messages \
                           WHERE room_id = ?1 AND agent_id = ?2 AND role = 'assistant'), 0) \
                     ORDER BY id"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![room_id, agent_id, SKIP_MESSAGE],
                    MessageRecord::from_row,
                )
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }

    /// True when another participant — the user, or a non-transparent
    /// peer agent — posted after this agent's latest assistant message.
    /// The agent's own messages and skip markers never qualify.
    pub fn interlocutor_activity_since(&self, room_id: i64, agent_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM messages m \
                 LEFT JOIN agents a ON a.id = m.agent_id \
                 WHERE m.room_id = ?1 AND m.content != ?3 \
                   AND m.id > COALESCE((SELECT MAX(id) FROM messages \
                       WHERE room_id = ?1 AND agent_id = ?2 AND role = 'assistant'), 0) \
                   AND (m.role = 'user' \
                        OR (m.role = 'assistant' AND m.agent_id != ?2 AND a.transparent = 0)))",
                params![room_id, agent_id, SKIP_MESSAGE],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n != 0)
            .map_err(db_err)
        })
    }

    /// Count of real assistant messages in a room (skip markers do not
    /// count toward the interaction cap).
    pub fn assistant_message_count(&self, room_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages \
                 WHERE room_id = ?1 AND role = 'assistant' AND content != ?2",
                params![room_id, SKIP_MESSAGE],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
    }

    pub fn delete_messages(&self, room_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE room_id = ?1", params![room_id])
                .map_err(db_err)
        })
    }

    pub fn get_message(&self, id: i64) -> Result<MessageRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                MessageRecord::from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("message {id}")),
                other => db_err(other),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::NewAgent;
    use ag_domain::types::MessageRole;

    struct Fixture {
        store: Store,
        room_id: i64,
        alice: i64,
        bob: i64,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let room = store.create_room(Some("admin"), "lounge", None, None).unwrap();
        let alice = store
            .create_agent(&NewAgent {
                name: "Alice".into(),
                system_prompt: "You are Alice".into(),
                ..Default::default()
            })
            .unwrap();
        let bob = store
            .create_agent(&NewAgent {
                name: "Bob".into(),
                system_prompt: "You are Bob".into(),
                ..Default::default()
            })
            .unwrap();
        store.add_agent_to_room(room.id, alice.id).unwrap();
        store.add_agent_to_room(room.id, bob.id).unwrap();
        Fixture {
            store,
            room_id: room.id,
            alice: alice.id,
            bob: bob.id,
        }
    }

    #[test]
    fn create_message_bumps_room_activity() {
        let f = fixture();
        let before = f.store.get_room(f.room_id).unwrap().unwrap().last_activity_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let message = f
            .store
            .create_message(&NewMessage::user(f.room_id, "hi"))
            .unwrap();
        let room = f.store.get_room(f.room_id).unwrap().unwrap();
        assert!(room.last_activity_at >= before);
        assert_eq!(room.last_activity_at, message.timestamp);
    }

    #[test]
    fn history_filters_skip_markers() {
        let f = fixture();
        f.store.create_message(&NewMessage::user(f.room_id, "hi")).unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.alice, SKIP_MESSAGE))
            .unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.alice, "hello"))
            .unwrap();

        let history = f.store.get_messages(f.room_id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.content != SKIP_MESSAGE));
    }

    #[test]
    fn poll_returns_strictly_increasing_ids_after_cursor() {
        let f = fixture();
        let first = f.store.create_message(&NewMessage::user(f.room_id, "one")).unwrap();
        f.store.create_message(&NewMessage::user(f.room_id, "two")).unwrap();
        f.store.create_message(&NewMessage::user(f.room_id, "three")).unwrap();

        let polled = f.store.poll_messages(f.room_id, first.id).unwrap();
        assert_eq!(polled.len(), 2);
        assert!(polled.windows(2).all(|w| w[0].id < w[1].id));
        assert!(polled.iter().all(|m| m.id > first.id));
    }

    #[test]
    fn messages_after_last_response_uses_latest_anchor() {
        let f = fixture();
        f.store.create_message(&NewMessage::user(f.room_id, "hi")).unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.alice, "hello"))
            .unwrap();
        f.store.create_message(&NewMessage::user(f.room_id, "again")).unwrap();

        let after = f
            .store
            .messages_after_last_response(f.room_id, f.alice)
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, "again");

        // An agent that never responded sees everything.
        let all = f.store.messages_after_last_response(f.room_id, f.bob).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn interlocutor_activity_ignores_own_messages() {
        let f = fixture();
        f.store.create_message(&NewMessage::user(f.room_id, "hi")).unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.alice, "hello"))
            .unwrap();

        // Nothing new since Alice's reply (her own message doesn't count).
        assert!(!f.store.interlocutor_activity_since(f.room_id, f.alice).unwrap());
        // Bob, however, has seen Alice's message since his (nonexistent) reply.
        assert!(f.store.interlocutor_activity_since(f.room_id, f.bob).unwrap());

        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.bob, "hey"))
            .unwrap();
        assert!(f.store.interlocutor_activity_since(f.room_id, f.alice).unwrap());
    }

    #[test]
    fn interlocutor_activity_ignores_transparent_peers() {
        let f = fixture();
        f.store
            .update_agent_config(f.bob, None, None, None, None, None, None, Some(true))
            .unwrap();

        f.store.create_message(&NewMessage::user(f.room_id, "hi")).unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.alice, "hello"))
            .unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.bob, "observing"))
            .unwrap();

        // Bob is transparent, so his message does not re-trigger Alice.
        assert!(!f.store.interlocutor_activity_since(f.room_id, f.alice).unwrap());
    }

    #[test]
    fn interlocutor_activity_ignores_skip_markers() {
        let f = fixture();
        f.store.create_message(&NewMessage::user(f.room_id, "hi")).unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.alice, "hello"))
            .unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.bob, SKIP_MESSAGE))
            .unwrap();

        assert!(!f.store.interlocutor_activity_since(f.room_id, f.alice).unwrap());
    }

    #[test]
    fn assistant_count_excludes_markers_and_users() {
        let f = fixture();
        f.store.create_message(&NewMessage::user(f.room_id, "hi")).unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.alice, "hello"))
            .unwrap();
        f.store
            .create_message(&NewMessage::assistant(f.room_id, f.bob, SKIP_MESSAGE))
            .unwrap();
        assert_eq!(f.store.assistant_message_count(f.room_id).unwrap(), 1);
    }

    #[test]
    fn recent_messages_returns_tail_in_order() {
        let f = fixture();
        for i in 0..10 {
            f.store
                .create_message(&NewMessage::user(f.room_id, format!("m{i}")))
                .unwrap();
        }
        let recent = f.store.recent_messages(f.room_id, 3).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m7", "m8", "m9"]);
    }

    #[test]
    fn delete_messages_clears_room() {
        let f = fixture();
        f.store.create_message(&NewMessage::user(f.room_id, "hi")).unwrap();
        assert_eq!(f.store.delete_messages(f.room_id).unwrap(), 1);
        assert!(f.store.get_messages(f.room_id).unwrap().is_empty());
    }

    #[test]
    fn assistant_messages_carry_agent_and_role() {
        let f = fixture();
        let message = f
            .store
            .create_message(
                &NewMessage::assistant(f.room_id, f.alice, "hello")
                    .with_thinking(Some("pondering".into())),
            )
            .unwrap();
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.agent_id, Some(f.alice));
        assert_eq!(message.thinking.as_deref(), Some("pondering"));
    }
}
