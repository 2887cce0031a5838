use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use ag_domain::{Error, Result};

use crate::records::{ts_to_sql, AgentRecord, NewAgent};
use crate::store::{db_err, Store};

const AGENT_COLUMNS: &str = "id, name, world_name, \"group\", config_file, profile_pic, \
     in_a_nutshell, characteristics, recent_events, system_prompt, priority, \
     interrupt_every_turn, transparent, created_at";

impl Store {
    /// Insert an agent record. Duplicate (name, world_name) surfaces as
    /// [`Error::Conflict`].
    pub fn create_agent(&self, agent: &NewAgent) -> Result<AgentRecord> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents (name, world_name, \"group\", config_file, profile_pic, \
                 in_a_nutshell, characteristics, recent_events, system_prompt, priority, \
                 interrupt_every_turn, transparent, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    agent.name,
                    agent.world_name,
                    agent.group,
                    agent.config_file,
                    agent.profile_pic,
                    agent.in_a_nutshell,
                    agent.characteristics,
                    agent.recent_events,
                    agent.system_prompt,
                    agent.priority,
                    agent.interrupt_every_turn as i64,
                    agent.transparent as i64,
                    ts_to_sql(Utc::now()),
                ],
            )
            .map_err(db_err)?;
            let id = conn.last_insert_rowid();
            self.agent_row(conn, id)?
                .ok_or_else(|| Error::Storage("agent vanished after insert".into()))
        })
    }

    pub fn get_agent(&self, id: i64) -> Result<Option<AgentRecord>> {
        self.with_conn(|conn| self.agent_row(conn, id))
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY id"))
                .map_err(db_err)?;
            let rows = stmt.query_map([], AgentRecord::from_row).map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }

    /// Patch the mutable config fields; `None` leaves a field untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn update_agent_config(
        &self,
        id: i64,
        in_a_nutshell: Option<&str>,
        characteristics: Option<&str>,
        recent_events: Option<&str>,
        system_prompt: Option<&str>,
        priority: Option<i64>,
        interrupt_every_turn: Option<bool>,
        transparent: Option<bool>,
    ) -> Result<AgentRecord> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE agents SET \
                     in_a_nutshell = COALESCE(?2, in_a_nutshell), \
                     characteristics = COALESCE(?3, characteristics), \
                     recent_events = COALESCE(?4, recent_events), \
                     system_prompt = COALESCE(?5, system_prompt), \
                     priority = COALESCE(?6, priority), \
                     interrupt_every_turn = COALESCE(?7, interrupt_every_turn), \
                     transparent = COALESCE(?8, transparent) \
                     WHERE id = ?1",
                    params![
                        id,
                        in_a_nutshell,
                        characteristics,
                        recent_events,
                        system_prompt,
                        priority,
                        interrupt_every_turn.map(|b| b as i64),
                        transparent.map(|b| b as i64),
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("agent {id}")));
            }
            self.agent_row(conn, id)?
                .ok_or_else(|| Error::NotFound(format!("agent {id}")))
        })
    }

    /// Append a memorized entry to the agent's recent-events text.
    pub fn append_recent_event(&self, id: i64, entry: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE agents SET recent_events = CASE \
                     WHEN recent_events IS NULL OR recent_events = '' THEN ?2 \
                     ELSE recent_events || char(10) || ?2 END \
                     WHERE id = ?1",
                    params![id, entry],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("agent {id}")));
            }
            Ok(())
        })
    }

    // ── Room membership ──────────────────────────────────────────────

    pub fn add_agent_to_room(&self, room_id: i64, agent_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO room_agents (room_id, agent_id, joined_at) \
                 VALUES (?1, ?2, ?3)",
                params![room_id, agent_id, ts_to_sql(Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn remove_agent_from_room(&self, room_id: i64, agent_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM room_agents WHERE room_id = ?1 AND agent_id = ?2",
                params![room_id, agent_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Agents of a room in join order (the tape's insertion order).
    pub fn get_room_agents(&self, room_id: i64) -> Result<Vec<AgentRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {cols} FROM agents a \
                     JOIN room_agents ra ON ra.agent_id = a.id \
                     WHERE ra.room_id = ?1 ORDER BY ra.rowid",
                    cols = qualified_agent_columns()
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![room_id], AgentRecord::from_row)
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }

    pub fn room_agent_count(&self, room_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM room_agents WHERE room_id = ?1",
                params![room_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(db_err)
        })
    }

    fn agent_row(&self, conn: &rusqlite::Connection, id: i64) -> Result<Option<AgentRecord>> {
        conn.query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
            params![id],
            AgentRecord::from_row,
        )
        .optional()
        .map_err(db_err)
    }
}

fn qualified_agent_columns() -> String {
    "a.id, a.name, a.world_name, a.\"group\", a.config_file, a.profile_pic, \
     a.in_a_nutshell, a.characteristics, a.recent_events, a.system_prompt, a.priority, \
     a.interrupt_every_turn, a.transparent, a.created_at"
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent(name: &str) -> NewAgent {
        NewAgent {
            name: name.into(),
            system_prompt: format!("You are {name}"),
            ..Default::default()
        }
    }

    #[test]
    fn create_and_list_agents() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&sample_agent("Alice")).unwrap();
        store.create_agent(&sample_agent("Bob")).unwrap();
        assert_eq!(store.list_agents().unwrap().len(), 2);
    }

    #[test]
    fn duplicate_name_same_world_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&sample_agent("Alice")).unwrap();
        assert!(matches!(
            store.create_agent(&sample_agent("Alice")).unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[test]
    fn same_name_different_world_is_allowed() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&sample_agent("Alice")).unwrap();
        let mut other = sample_agent("Alice");
        other.world_name = Some("midgard".into());
        store.create_agent(&other).unwrap();
    }

    #[test]
    fn update_patches_only_given_fields() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.create_agent(&sample_agent("Alice")).unwrap();

        let updated = store
            .update_agent_config(agent.id, Some("brief"), None, None, None, Some(3), None, None)
            .unwrap();
        assert_eq!(updated.in_a_nutshell.as_deref(), Some("brief"));
        assert_eq!(updated.priority, 3);
        assert_eq!(updated.system_prompt, "You are Alice");
    }

    #[test]
    fn append_recent_event_accumulates() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.create_agent(&sample_agent("Alice")).unwrap();

        store.append_recent_event(agent.id, "met the user").unwrap();
        store.append_recent_event(agent.id, "left the room").unwrap();
        let agent = store.get_agent(agent.id).unwrap().unwrap();
        assert_eq!(
            agent.recent_events.as_deref(),
            Some("met the user\nleft the room")
        );
    }

    #[test]
    fn room_membership_preserves_join_order() {
        let store = Store::open_in_memory().unwrap();
        let room = store.create_room(Some("admin"), "lounge", None, None).unwrap();
        let bob = store.create_agent(&sample_agent("Bob")).unwrap();
        let alice = store.create_agent(&sample_agent("Alice")).unwrap();

        store.add_agent_to_room(room.id, bob.id).unwrap();
        store.add_agent_to_room(room.id, alice.id).unwrap();

        let agents = store.get_room_agents(room.id).unwrap();
        let names: Vec<_> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Bob", "Alice"]);
        assert_eq!(store.room_agent_count(room.id).unwrap(), 2);

        store.remove_agent_from_room(room.id, bob.id).unwrap();
        assert_eq!(store.room_agent_count(room.id).unwrap(), 1);
    }
}
