//! Agent option assembly.
//!
//! Produces the connection-time [`AgentOptions`] for one agent turn:
//! system prompt assembled from the agent's parsed config sections,
//! tool allow-list derived from the configured MCP servers, and the
//! resume session id when one is cached.

use ag_domain::config::RuntimeConfig;
use ag_runtime::AgentOptions;
use ag_store::records::AgentRecord;

/// Reserved tool suffixes every agent gets on each configured server.
const RESERVED_TOOLS: [&str; 3] = ["skip", "memorize", "anthropic"];

pub fn build_agent_options(
    agent: &AgentRecord,
    runtime: &RuntimeConfig,
    resume: Option<String>,
    output_format: Option<String>,
) -> AgentOptions {
    let mut allowed_tools = Vec::new();
    for server in &runtime.mcp_servers {
        for tool in RESERVED_TOOLS {
            allowed_tools.push(format!("mcp__{server}__{tool}"));
        }
    }

    AgentOptions {
        model: runtime.model.clone(),
        system_prompt: build_system_prompt(agent),
        allowed_tools,
        mcp_servers: runtime.mcp_servers.clone(),
        resume,
        output_format,
        max_thinking_tokens: runtime.max_thinking_tokens,
        include_partial_messages: true,
        subagents: Vec::new(),
    }
}

/// The agent's base prompt plus its markdown-derived config sections.
fn build_system_prompt(agent: &AgentRecord) -> String {
    let mut prompt = agent.system_prompt.clone();
    if let Some(nutshell) = non_empty(&agent.in_a_nutshell) {
        prompt.push_str("\n\n## In a nutshell\n");
        prompt.push_str(nutshell);
    }
    if let Some(characteristics) = non_empty(&agent.characteristics) {
        prompt.push_str("\n\n## Characteristics\n");
        prompt.push_str(characteristics);
    }
    if let Some(recent) = non_empty(&agent.recent_events) {
        prompt.push_str("\n\n## Recent events\n");
        prompt.push_str(recent);
    }
    prompt
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_agent() -> AgentRecord {
        AgentRecord {
            id: 1,
            name: "Alice".into(),
            world_name: None,
            group: None,
            config_file: None,
            profile_pic: None,
            in_a_nutshell: Some("a sharp-tongued alchemist".into()),
            characteristics: None,
            recent_events: Some("lost her notebook".into()),
            system_prompt: "You are Alice.".into(),
            priority: 0,
            interrupt_every_turn: false,
            transparent: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prompt_includes_config_sections() {
        let options = build_agent_options(
            &sample_agent(),
            &RuntimeConfig::default(),
            None,
            None,
        );
        assert!(options.system_prompt.starts_with("You are Alice."));
        assert!(options.system_prompt.contains("## In a nutshell"));
        assert!(options.system_prompt.contains("lost her notebook"));
        assert!(!options.system_prompt.contains("## Characteristics"));
    }

    #[test]
    fn reserved_tools_cover_every_server() {
        let mut runtime = RuntimeConfig::default();
        runtime.mcp_servers = vec!["room".into(), "world".into()];
        let options = build_agent_options(&sample_agent(), &runtime, None, None);

        assert!(options.allowed_tools.contains(&"mcp__room__skip".into()));
        assert!(options.allowed_tools.contains(&"mcp__world__memorize".into()));
        assert_eq!(options.allowed_tools.len(), 6);
    }

    #[test]
    fn resume_is_carried_but_not_hashed() {
        let without = build_agent_options(&sample_agent(), &RuntimeConfig::default(), None, None);
        let with = build_agent_options(
            &sample_agent(),
            &RuntimeConfig::default(),
            Some("sess_9".into()),
            None,
        );
        assert_eq!(with.resume.as_deref(), Some("sess_9"));
        assert_eq!(without.config_hash(), with.config_hash());
    }

    #[test]
    fn config_change_changes_hash() {
        let base = build_agent_options(&sample_agent(), &RuntimeConfig::default(), None, None);
        let mut updated = sample_agent();
        updated.recent_events = Some("found her notebook".into());
        let changed = build_agent_options(&updated, &RuntimeConfig::default(), None, None);
        assert_ne!(base.config_hash(), changed.config_hash());
    }
}
