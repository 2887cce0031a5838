use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A sub-agent definition inherited by the runtime (name + prompt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentDefinition {
    pub name: String,
    pub description: String,
    pub prompt: String,
}

/// Connection-time options for one pooled runtime client.
///
/// The client pool compares `config_hash()` (everything that shapes the
/// connection except `resume`) and `resume` separately: either changing
/// forces a replacement client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOptions {
    pub model: String,
    pub system_prompt: String,
    /// Tool names the agent may invoke (includes the reserved
    /// `*__skip` / `*__memorize` names).
    pub allowed_tools: Vec<String>,
    /// MCP server names to attach.
    pub mcp_servers: Vec<String>,
    /// Session id to resume; `None` starts a fresh context.
    pub resume: Option<String>,
    /// Output-format hint (e.g. a JSON schema name) for structured turns.
    pub output_format: Option<String>,
    pub max_thinking_tokens: u32,
    /// Always true: the gateway consumes partial-message stream events.
    pub include_partial_messages: bool,
    pub subagents: Vec<SubagentDefinition>,
}

impl AgentOptions {
    /// Stable digest over the connection-shaping fields.
    ///
    /// Tool and server lists are sorted before hashing so ordering
    /// differences do not force a reconnect. `resume` is deliberately
    /// excluded — the pool compares it on its own.
    pub fn config_hash(&self) -> String {
        let mut tools = self.allowed_tools.clone();
        tools.sort();
        let mut servers = self.mcp_servers.clone();
        servers.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update([0]);
        hasher.update(self.system_prompt.as_bytes());
        hasher.update([0]);
        for tool in &tools {
            hasher.update(tool.as_bytes());
            hasher.update([1]);
        }
        hasher.update([0]);
        for server in &servers {
            hasher.update(server.as_bytes());
            hasher.update([1]);
        }
        hasher.update([0]);
        hasher.update(self.output_format.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        for sub in &self.subagents {
            hasher.update(sub.name.as_bytes());
            hasher.update([1]);
            hasher.update(sub.prompt.as_bytes());
            hasher.update([1]);
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> AgentOptions {
        AgentOptions {
            model: "claude-sonnet-4-5".into(),
            system_prompt: "You are Alice".into(),
            allowed_tools: vec!["mcp__room__skip".into(), "mcp__room__memorize".into()],
            mcp_servers: vec!["room".into()],
            resume: None,
            output_format: None,
            max_thinking_tokens: 32_768,
            include_partial_messages: true,
            subagents: Vec::new(),
        }
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(base_options().config_hash(), base_options().config_hash());
    }

    #[test]
    fn hash_ignores_tool_ordering() {
        let a = base_options();
        let mut b = base_options();
        b.allowed_tools.reverse();
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn hash_ignores_resume() {
        let a = base_options();
        let mut b = base_options();
        b.resume = Some("sess_123".into());
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn hash_changes_with_model() {
        let a = base_options();
        let mut b = base_options();
        b.model = "claude-opus-4-5".into();
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn hash_changes_with_prompt() {
        let a = base_options();
        let mut b = base_options();
        b.system_prompt = "You are Bob".into();
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn hash_changes_with_tool_set() {
        let a = base_options();
        let mut b = base_options();
        b.allowed_tools.push("mcp__room__whiteboard".into());
        assert_ne!(a.config_hash(), b.config_hash());
    }
}
