//! Conversation context assembly.
//!
//! Builds the prompt text an agent sees for its turn: speaker-labeled
//! history with adjacent duplicates removed, truncated to the most
//! recent window, plus an instruction tail that differs between a
//! 1-on-1 chat and a group room.

use std::collections::HashMap;

use ag_domain::types::{MessageRole, ParticipantType};
use ag_store::records::{AgentRecord, MessageRecord};

/// Shape of the conversation derived from its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationShape {
    /// Single agent talking to a user/character, with no
    /// situation-builder framing.
    pub is_one_on_one: bool,
    /// Display name of the user-side participant, when present.
    pub user_name: Option<String>,
    pub has_situation_builder: bool,
}

/// Analyze messages to detect conversation type and participants.
pub fn detect_conversation_type(
    messages: &[MessageRecord],
    agent_count: usize,
    default_user_name: &str,
) -> ConversationShape {
    let mut user_name = None;
    let mut has_user_or_character = false;
    let mut has_situation_builder = false;

    for message in messages {
        if message.role != MessageRole::User {
            continue;
        }
        match message.participant_type {
            Some(ParticipantType::SituationBuilder) => has_situation_builder = true,
            Some(ParticipantType::Character) => {
                if let Some(name) = &message.participant_name {
                    has_user_or_character = true;
                    if user_name.is_none() {
                        user_name = Some(name.clone());
                    }
                }
            }
            Some(ParticipantType::User) => {
                has_user_or_character = true;
                if user_name.is_none() {
                    user_name = Some(default_user_name.to_owned());
                }
            }
            _ => {}
        }
    }

    ConversationShape {
        is_one_on_one: agent_count == 1 && has_user_or_character && !has_situation_builder,
        user_name,
        has_situation_builder,
    }
}

/// Build the full context string for one agent turn. Returns an empty
/// string when there is nothing to say anything about.
pub fn build_conversation_context(
    messages: &[MessageRecord],
    agent: &AgentRecord,
    room_agents: &[AgentRecord],
    message_limit: usize,
    default_user_name: &str,
) -> String {
    if messages.is_empty() {
        return String::new();
    }

    let names_by_id: HashMap<i64, &str> = room_agents
        .iter()
        .map(|a| (a.id, a.name.as_str()))
        .collect();

    let shape = detect_conversation_type(messages, room_agents.len(), default_user_name);
    let user_name = shape
        .user_name
        .clone()
        .unwrap_or_else(|| default_user_name.to_owned());

    let start = messages.len().saturating_sub(message_limit);
    let mut lines: Vec<String> = Vec::new();
    for message in &messages[start..] {
        let speaker = speaker_label(message, &names_by_id, &user_name);
        let line = format!("{speaker}: {}", message.content);
        // Retries and double-submits produce adjacent identical lines.
        if lines.last().map(String::as_str) == Some(line.as_str()) {
            continue;
        }
        lines.push(line);
    }

    let mut context = lines.join("\n");
    context.push_str("\n\n---\n");
    context.push_str(&instruction_tail(agent, room_agents, &shape, &user_name));
    context
}

fn speaker_label<'a>(
    message: &'a MessageRecord,
    names_by_id: &HashMap<i64, &'a str>,
    user_name: &'a str,
) -> &'a str {
    match message.role {
        MessageRole::Assistant => message
            .agent_id
            .and_then(|id| names_by_id.get(&id).copied())
            .unwrap_or("Agent"),
        MessageRole::User => match message.participant_type {
            Some(ParticipantType::Character) => {
                message.participant_name.as_deref().unwrap_or(user_name)
            }
            Some(ParticipantType::SituationBuilder) => "Situation",
            Some(ParticipantType::System) => "System",
            _ => user_name,
        },
    }
}

fn instruction_tail(
    agent: &AgentRecord,
    room_agents: &[AgentRecord],
    shape: &ConversationShape,
    user_name: &str,
) -> String {
    if shape.is_one_on_one {
        format!(
            "You are {name}, talking one-on-one with {user_name}. \
             Reply in character as {name}.",
            name = agent.name
        )
    } else {
        let peers: Vec<&str> = room_agents
            .iter()
            .filter(|a| a.id != agent.id)
            .map(|a| a.name.as_str())
            .collect();
        let peer_list = if peers.is_empty() {
            "the room".to_owned()
        } else {
            peers.join(", ")
        };
        format!(
            "You are {name} in a conversation with {peer_list}. \
             Reply in character as {name}. If you have nothing to add \
             right now, call your skip tool instead of replying.",
            name = agent.name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn agent(id: i64, name: &str) -> AgentRecord {
        AgentRecord {
            id,
            name: name.into(),
            world_name: None,
            group: None,
            config_file: None,
            profile_pic: None,
            in_a_nutshell: None,
            characteristics: None,
            recent_events: None,
            system_prompt: format!("You are {name}"),
            priority: 0,
            interrupt_every_turn: false,
            transparent: false,
            created_at: Utc::now(),
        }
    }

    fn user_msg(id: i64, content: &str) -> MessageRecord {
        MessageRecord {
            id,
            room_id: 1,
            agent_id: None,
            content: content.into(),
            role: MessageRole::User,
            participant_type: Some(ParticipantType::User),
            participant_name: None,
            thinking: None,
            anthropic_calls: None,
            timestamp: Utc::now(),
            images: None,
            chat_session_id: None,
            game_time_snapshot: None,
        }
    }

    fn agent_msg(id: i64, agent_id: i64, content: &str) -> MessageRecord {
        MessageRecord {
            agent_id: Some(agent_id),
            role: MessageRole::Assistant,
            participant_type: None,
            ..user_msg(id, content)
        }
    }

    fn character_msg(id: i64, name: &str, content: &str) -> MessageRecord {
        MessageRecord {
            participant_type: Some(ParticipantType::Character),
            participant_name: Some(name.into()),
            ..user_msg(id, content)
        }
    }

    #[test]
    fn one_on_one_requires_single_agent_and_user() {
        let messages = vec![user_msg(1, "hi")];
        let shape = detect_conversation_type(&messages, 1, "User");
        assert!(shape.is_one_on_one);
        assert_eq!(shape.user_name.as_deref(), Some("User"));

        let shape = detect_conversation_type(&messages, 2, "User");
        assert!(!shape.is_one_on_one);
    }

    #[test]
    fn situation_builder_defeats_one_on_one() {
        let mut framing = user_msg(1, "a dark alley");
        framing.participant_type = Some(ParticipantType::SituationBuilder);
        let messages = vec![framing, user_msg(2, "hi")];

        let shape = detect_conversation_type(&messages, 1, "User");
        assert!(shape.has_situation_builder);
        assert!(!shape.is_one_on_one);
    }

    #[test]
    fn character_name_wins_over_default() {
        let messages = vec![character_msg(1, "Kira", "hello there")];
        let shape = detect_conversation_type(&messages, 1, "User");
        assert_eq!(shape.user_name.as_deref(), Some("Kira"));
    }

    #[test]
    fn context_labels_speakers() {
        let alice = agent(10, "Alice");
        let agents = vec![alice.clone()];
        let messages = vec![user_msg(1, "hi"), agent_msg(2, 10, "hello")];

        let context = build_conversation_context(&messages, &alice, &agents, 50, "User");
        assert!(context.contains("User: hi"));
        assert!(context.contains("Alice: hello"));
        assert!(context.contains("one-on-one"));
    }

    #[test]
    fn adjacent_duplicates_are_collapsed() {
        let alice = agent(10, "Alice");
        let agents = vec![alice.clone()];
        let messages = vec![user_msg(1, "hi"), user_msg(2, "hi"), user_msg(3, "bye")];

        let context = build_conversation_context(&messages, &alice, &agents, 50, "User");
        assert_eq!(context.matches("User: hi").count(), 1);
        assert!(context.contains("User: bye"));
    }

    #[test]
    fn context_truncates_to_most_recent() {
        let alice = agent(10, "Alice");
        let agents = vec![alice.clone()];
        let messages: Vec<MessageRecord> =
            (0..10).map(|i| user_msg(i, &format!("m{i}"))).collect();

        let context = build_conversation_context(&messages, &alice, &agents, 3, "User");
        assert!(!context.contains("User: m6"));
        assert!(context.contains("User: m7"));
        assert!(context.contains("User: m9"));
    }

    #[test]
    fn group_tail_names_peers_and_skip_tool() {
        let alice = agent(10, "Alice");
        let agents = vec![alice.clone(), agent(11, "Bob"), agent(12, "Carol")];
        let messages = vec![user_msg(1, "hello everyone")];

        let context = build_conversation_context(&messages, &alice, &agents, 50, "User");
        assert!(context.contains("Bob, Carol"));
        assert!(context.contains("skip tool"));
    }

    #[test]
    fn empty_history_yields_empty_context() {
        let alice = agent(10, "Alice");
        let context = build_conversation_context(&[], &alice, &[alice.clone()], 50, "User");
        assert!(context.is_empty());
    }
}
