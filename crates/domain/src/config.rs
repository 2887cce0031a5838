use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Allowed CORS origins. A single `"*"` allows all origins.
    #[serde(default = "d_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            allowed_origins: d_origins(),
            max_concurrent_requests: d_max_concurrent(),
        }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8787
}
fn d_origins() -> Vec<String> {
    vec!["http://localhost:5173".into()]
}
fn d_max_concurrent() -> usize {
    256
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// SHA-256 hex digest of the admin password. Overridden by the
    /// `AGORA_ADMIN_HASH` env var.
    #[serde(default)]
    pub admin_password_hash: String,
    /// SHA-256 hex digest of the guest password. Overridden by
    /// `AGORA_GUEST_HASH`.
    #[serde(default)]
    pub guest_password_hash: Option<String>,
    #[serde(default)]
    pub enable_guest_login: bool,
    /// Hex-encoded HMAC secret for access tokens. Overridden by
    /// `AGORA_TOKEN_SECRET`. When empty a random secret is generated at
    /// startup and tokens do not survive a restart.
    #[serde(default)]
    pub token_secret: String,
    #[serde(default = "d_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

fn d_token_ttl_hours() -> u64 {
    168
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "d_db_path")]
    pub path: PathBuf,
    /// Write-queue drain timeout on shutdown, seconds.
    #[serde(default = "d_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: d_db_path(),
            drain_timeout_secs: d_drain_timeout(),
        }
    }
}

fn d_db_path() -> PathBuf {
    PathBuf::from("agora.db")
}
fn d_drain_timeout() -> u64 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "d_follow_up_rounds")]
    pub max_follow_up_rounds: u32,
    #[serde(default = "d_total_messages")]
    pub max_total_messages: u32,
    /// Most-recent messages included when building conversation context.
    #[serde(default = "d_context_messages")]
    pub context_message_limit: usize,
    /// Display name for plain user-participant messages.
    #[serde(default = "d_user_name")]
    pub user_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_follow_up_rounds: d_follow_up_rounds(),
            max_total_messages: d_total_messages(),
            context_message_limit: d_context_messages(),
            user_name: d_user_name(),
        }
    }
}

fn d_follow_up_rounds() -> u32 {
    2
}
fn d_total_messages() -> u32 {
    10
}
fn d_context_messages() -> usize {
    50
}
fn d_user_name() -> String {
    "User".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "d_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "d_max_rooms")]
    pub max_concurrent_rooms: usize,
    /// Rooms inactive for longer than this are not ticked.
    #[serde(default = "d_active_window")]
    pub active_window_mins: i64,
    #[serde(default = "d_cleanup_mins")]
    pub cleanup_interval_mins: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: d_tick_secs(),
            max_concurrent_rooms: d_max_rooms(),
            active_window_mins: d_active_window(),
            cleanup_interval_mins: d_cleanup_mins(),
        }
    }
}

fn d_tick_secs() -> u64 {
    2
}
fn d_max_rooms() -> usize {
    5
}
fn d_active_window() -> i64 {
    5
}
fn d_cleanup_mins() -> u64 {
    5
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM runtime defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_thinking_tokens")]
    pub max_thinking_tokens: u32,
    /// MCP server names attached to every agent.
    #[serde(default = "d_servers")]
    pub mcp_servers: Vec<String>,
    /// Runtime CLI to spawn per pooled client (line-delimited JSON on
    /// stdio). Empty means no runtime is configured and turns fail.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: d_model(),
            max_thinking_tokens: d_thinking_tokens(),
            mcp_servers: d_servers(),
            command: String::new(),
            args: Vec::new(),
        }
    }
}

fn d_model() -> String {
    "claude-sonnet-4-5".into()
}
fn d_thinking_tokens() -> u32 {
    32_768
}
fn d_servers() -> Vec<String> {
    vec!["room".into()]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading & validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Load from a TOML file, falling back to defaults when the file
    /// does not exist, then overlay secrets from the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            Config::default()
        };

        if let Ok(hash) = std::env::var("AGORA_ADMIN_HASH") {
            if !hash.is_empty() {
                config.auth.admin_password_hash = hash;
            }
        }
        if let Ok(hash) = std::env::var("AGORA_GUEST_HASH") {
            if !hash.is_empty() {
                config.auth.guest_password_hash = Some(hash);
            }
        }
        if let Ok(secret) = std::env::var("AGORA_TOKEN_SECRET") {
            if !secret.is_empty() {
                config.auth.token_secret = secret;
            }
        }

        Ok(config)
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if self.auth.admin_password_hash.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "auth.admin_password_hash".into(),
                message: "no admin password configured (set AGORA_ADMIN_HASH)".into(),
            });
        } else if !is_hex_digest(&self.auth.admin_password_hash) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "auth.admin_password_hash".into(),
                message: "must be a 64-char SHA-256 hex digest".into(),
            });
        }
        if let Some(hash) = &self.auth.guest_password_hash {
            if !is_hex_digest(hash) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "auth.guest_password_hash".into(),
                    message: "must be a 64-char SHA-256 hex digest".into(),
                });
            }
        }
        if self.auth.enable_guest_login && self.auth.guest_password_hash.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "auth.enable_guest_login".into(),
                message: "guest login enabled but no guest password hash set".into(),
            });
        }
        if self.auth.token_secret.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "auth.token_secret".into(),
                message: "no token secret configured — tokens will not survive a restart".into(),
            });
        }

        if self.orchestrator.max_total_messages == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "orchestrator.max_total_messages".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.scheduler.tick_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.tick_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.scheduler.max_concurrent_rooms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.max_concurrent_rooms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.runtime.model.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "runtime.model".into(),
                message: "model must not be empty".into(),
            });
        }
        if self.runtime.command.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "runtime.command".into(),
                message: "no runtime command configured — agent turns will fail to connect".into(),
            });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, server) in self.runtime.mcp_servers.iter().enumerate() {
            if !seen.insert(server.as_str()) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    field: format!("runtime.mcp_servers[{i}]"),
                    message: format!("duplicate server \"{server}\""),
                });
            }
        }

        issues
    }
}

fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}
