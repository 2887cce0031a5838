use rusqlite::Connection;

use ag_domain::Result;

use crate::store::db_err;

/// Schema version (increment when changing table definitions).
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS rooms (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT,
            name TEXT NOT NULL,
            world_id INTEGER,
            is_paused INTEGER NOT NULL DEFAULT 0,
            is_finished INTEGER NOT NULL DEFAULT 0,
            max_interactions INTEGER,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL,
            last_read_at TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS ux_rooms_owner_name_world
            ON rooms(owner_id, name, world_id);
        CREATE INDEX IF NOT EXISTS idx_rooms_last_activity
            ON rooms(last_activity_at);

        CREATE TABLE IF NOT EXISTS agents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            world_name TEXT,
            "group" TEXT,
            config_file TEXT,
            profile_pic TEXT,
            in_a_nutshell TEXT,
            characteristics TEXT,
            recent_events TEXT,
            system_prompt TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            interrupt_every_turn INTEGER NOT NULL DEFAULT 0,
            transparent INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS ux_agents_name_world
            ON agents(name, world_name);

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id INTEGER NOT NULL
                REFERENCES rooms(id) ON DELETE CASCADE,
            agent_id INTEGER
                REFERENCES agents(id) ON DELETE SET NULL,
            content TEXT NOT NULL,
            role TEXT NOT NULL,
            participant_type TEXT,
            participant_name TEXT,
            thinking TEXT,
            anthropic_calls TEXT,
            timestamp TEXT NOT NULL,
            images TEXT,
            chat_session_id INTEGER,
            game_time_snapshot TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_messages_room_timestamp
            ON messages(room_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_room_session
            ON messages(room_id, chat_session_id);

        CREATE TABLE IF NOT EXISTS room_agents (
            room_id INTEGER NOT NULL
                REFERENCES rooms(id) ON DELETE CASCADE,
            agent_id INTEGER NOT NULL
                REFERENCES agents(id) ON DELETE CASCADE,
            joined_at TEXT,
            PRIMARY KEY (room_id, agent_id)
        );

        CREATE TABLE IF NOT EXISTS room_agent_sessions (
            room_id INTEGER NOT NULL
                REFERENCES rooms(id) ON DELETE CASCADE,
            agent_id INTEGER NOT NULL
                REFERENCES agents(id) ON DELETE CASCADE,
            session_id TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (room_id, agent_id)
        );
        "#,
    )
    .map_err(db_err)?;

    conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])
        .map_err(db_err)?;

    Ok(())
}
