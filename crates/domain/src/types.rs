use serde::{Deserialize, Serialize};

/// Role of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// Who authored a user-side message.
///
/// `Character` messages carry a custom display name; `SituationBuilder`
/// messages describe scene framing and disable the 1-on-1 conversation
/// shape; `System` messages are stored for context but hidden from
/// polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    User,
    Character,
    SituationBuilder,
    System,
}

impl ParticipantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantType::User => "user",
            ParticipantType::Character => "character",
            ParticipantType::SituationBuilder => "situation_builder",
            ParticipantType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ParticipantType::User),
            "character" => Some(ParticipantType::Character),
            "situation_builder" => Some(ParticipantType::SituationBuilder),
            "system" => Some(ParticipantType::System),
            _ => None,
        }
    }
}

/// Authenticated caller role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Guest,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Guest => "guest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(UserRole::Admin),
            "guest" => Some(UserRole::Guest),
            _ => None,
        }
    }
}

/// Outcome of one agent turn.
///
/// Skip and cancellation are ordinary results, not errors: the tape
/// executor branches on them to decide termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent produced and persisted a message.
    Responded,
    /// The agent declined this turn (skip tool, or nothing new to say).
    Skipped,
    /// The turn was interrupted; nothing was persisted by the turn itself.
    Cancelled,
    /// The runtime failed; the tape moves on to the next agent.
    Errored(String),
}

impl TurnOutcome {
    pub fn responded(&self) -> bool {
        matches!(self, TurnOutcome::Responded)
    }
}

/// An inline image attachment on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// Base64-encoded payload.
    pub data: String,
    pub media_type: String,
}

/// Reserved content string persisted when an agent skips its turn.
///
/// The marker anchors "messages since my last response" for follow-up
/// scheduling and is filtered from every read surface.
pub const SKIP_MESSAGE: &str = "[SKIP]";
