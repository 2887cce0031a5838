use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::Serialize;

use ag_domain::types::{MessageRole, ParticipantType};
use ag_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timestamp helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Timestamps are stored as RFC 3339 TEXT; UTC values serialize with a
/// fixed `+00:00` suffix so lexicographic SQL comparison matches
/// chronological order.
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn opt_ts_from_sql(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| ts_from_sql(&s)).transpose()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Room
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct RoomRecord {
    pub id: i64,
    pub owner_id: Option<String>,
    pub name: String,
    pub world_id: Option<i64>,
    pub is_paused: bool,
    pub is_finished: bool,
    pub max_interactions: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl RoomRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            name: row.get("name")?,
            world_id: row.get("world_id")?,
            is_paused: row.get::<_, i64>("is_paused")? != 0,
            is_finished: row.get::<_, i64>("is_finished")? != 0,
            max_interactions: row.get("max_interactions")?,
            created_at: parse_row_ts(row, "created_at")?,
            last_activity_at: parse_row_ts(row, "last_activity_at")?,
            last_read_at: parse_row_opt_ts(row, "last_read_at")?,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    pub world_name: Option<String>,
    pub group: Option<String>,
    pub config_file: Option<String>,
    pub profile_pic: Option<String>,
    pub in_a_nutshell: Option<String>,
    pub characteristics: Option<String>,
    pub recent_events: Option<String>,
    pub system_prompt: String,
    pub priority: i64,
    pub interrupt_every_turn: bool,
    pub transparent: bool,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            world_name: row.get("world_name")?,
            group: row.get("group")?,
            config_file: row.get("config_file")?,
            profile_pic: row.get("profile_pic")?,
            in_a_nutshell: row.get("in_a_nutshell")?,
            characteristics: row.get("characteristics")?,
            recent_events: row.get("recent_events")?,
            system_prompt: row.get("system_prompt")?,
            priority: row.get("priority")?,
            interrupt_every_turn: row.get::<_, i64>("interrupt_every_turn")? != 0,
            transparent: row.get::<_, i64>("transparent")? != 0,
            created_at: parse_row_ts(row, "created_at")?,
        })
    }
}

/// Insert form for an agent record (parsed config arrives from the API).
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    pub name: String,
    pub world_name: Option<String>,
    pub group: Option<String>,
    pub config_file: Option<String>,
    pub profile_pic: Option<String>,
    pub in_a_nutshell: Option<String>,
    pub characteristics: Option<String>,
    pub recent_events: Option<String>,
    pub system_prompt: String,
    pub priority: i64,
    pub interrupt_every_turn: bool,
    pub transparent: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub room_id: i64,
    pub agent_id: Option<i64>,
    pub content: String,
    pub role: MessageRole,
    pub participant_type: Option<ParticipantType>,
    pub participant_name: Option<String>,
    pub thinking: Option<String>,
    /// JSON array of anthropic tool-call situations.
    pub anthropic_calls: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// JSON array of `{data, media_type}` attachments.
    pub images: Option<String>,
    pub chat_session_id: Option<i64>,
    pub game_time_snapshot: Option<String>,
}

impl MessageRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let role_raw: String = row.get("role")?;
        let role = MessageRole::parse(&role_raw).ok_or_else(|| bad_column("role", &role_raw))?;
        let participant_raw: Option<String> = row.get("participant_type")?;
        let participant_type = match participant_raw {
            Some(raw) => {
                Some(ParticipantType::parse(&raw).ok_or_else(|| bad_column("participant_type", &raw))?)
            }
            None => None,
        };
        Ok(Self {
            id: row.get("id")?,
            room_id: row.get("room_id")?,
            agent_id: row.get("agent_id")?,
            content: row.get("content")?,
            role,
            participant_type,
            participant_name: row.get("participant_name")?,
            thinking: row.get("thinking")?,
            anthropic_calls: row.get("anthropic_calls")?,
            timestamp: parse_row_ts(row, "timestamp")?,
            images: row.get("images")?,
            chat_session_id: row.get("chat_session_id")?,
            game_time_snapshot: row.get("game_time_snapshot")?,
        })
    }
}

/// Insert form for a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: i64,
    pub agent_id: Option<i64>,
    pub content: String,
    pub role: MessageRole,
    pub participant_type: Option<ParticipantType>,
    pub participant_name: Option<String>,
    pub thinking: Option<String>,
    pub anthropic_calls: Option<String>,
    pub images: Option<String>,
    pub chat_session_id: Option<i64>,
    pub game_time_snapshot: Option<String>,
}

impl NewMessage {
    /// A plain user message.
    pub fn user(room_id: i64, content: impl Into<String>) -> Self {
        Self {
            room_id,
            agent_id: None,
            content: content.into(),
            role: MessageRole::User,
            participant_type: Some(ParticipantType::User),
            participant_name: None,
            thinking: None,
            anthropic_calls: None,
            images: None,
            chat_session_id: None,
            game_time_snapshot: None,
        }
    }

    /// An assistant message from an agent.
    pub fn assistant(room_id: i64, agent_id: i64, content: impl Into<String>) -> Self {
        Self {
            room_id,
            agent_id: Some(agent_id),
            content: content.into(),
            role: MessageRole::Assistant,
            participant_type: None,
            participant_name: None,
            thinking: None,
            anthropic_calls: None,
            images: None,
            chat_session_id: None,
            game_time_snapshot: None,
        }
    }

    pub fn with_participant(mut self, kind: ParticipantType, name: Option<String>) -> Self {
        self.participant_type = Some(kind);
        self.participant_name = name;
        self
    }

    pub fn with_thinking(mut self, thinking: Option<String>) -> Self {
        self.thinking = thinking;
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Room-agent session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct RoomAgentSessionRecord {
    pub room_id: i64,
    pub agent_id: i64,
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
}

impl RoomAgentSessionRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            room_id: row.get("room_id")?,
            agent_id: row.get("agent_id")?,
            session_id: row.get("session_id")?,
            updated_at: parse_row_ts(row, "updated_at")?,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_row_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    ts_from_sql(&raw).map_err(|_| bad_column(column, &raw))
}

fn parse_row_opt_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    opt_ts_from_sql(raw).map_err(|_| bad_column(column, "<invalid>"))
}

fn bad_column(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("column {column}: unexpected value {value:?}").into(),
    )
}
