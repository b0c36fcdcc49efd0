//! Shared types for ateam-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// One entry of a room transcript.
///
/// Messages are append-only: the history store assigns `id` on append and
/// nothing mutates a stored message afterwards. A message built locally has
/// `id == 0` until it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub is_summary: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            role,
            content: content.into(),
            agent_name: None,
            model_used: None,
            prompt_tokens: None,
            completion_tokens: None,
            is_summary: false,
            metadata: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn assistant(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content).with_agent(agent)
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_used = Some(model.into());
        self
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.prompt_tokens = Some(prompt_tokens);
        self.completion_tokens = Some(completion_tokens);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Name used when grouping or labelling this message: the agent, else the role
    pub fn author(&self) -> String {
        self.agent_name
            .clone()
            .unwrap_or_else(|| self.role.to_string())
    }
}

/// How a multi-agent turn is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Single,
    Sequential,
    Parallel,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Routing decision for one line of user input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseResult {
    pub target_agents: Vec<String>,
    pub clean_message: String,
    pub mode: ExecutionMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!(Role::System.to_string(), "system");
    }

    #[test]
    fn test_execution_mode_serde() {
        let json = serde_json::to_string(&ExecutionMode::Parallel).unwrap();
        assert_eq!(json, "\"parallel\"");
        let mode: ExecutionMode = serde_json::from_str("\"sequential\"").unwrap();
        assert_eq!(mode, ExecutionMode::Sequential);
    }

    #[test]
    fn test_message_builders() {
        let msg = Message::assistant("Coder", "done")
            .with_model("gpt-4o")
            .with_usage(12, 3)
            .with_metadata("kind", "reply");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.agent_name.as_deref(), Some("Coder"));
        assert_eq!(msg.model_used.as_deref(), Some("gpt-4o"));
        assert_eq!(msg.prompt_tokens, Some(12));
        assert_eq!(msg.completion_tokens, Some(3));
        assert_eq!(msg.metadata["kind"], "reply");
        assert!(!msg.is_summary);
        assert_eq!(msg.author(), "Coder");
        assert_eq!(Message::user("hi").author(), "user");
    }

    #[test]
    fn test_message_deserializes_with_defaults() {
        let msg: Message =
            serde_json::from_str(r#"{"role": "user", "content": "hello"}"#).unwrap();
        assert_eq!(msg.id, 0);
        assert_eq!(msg.content, "hello");
        assert!(msg.agent_name.is_none());
        assert!(msg.metadata.is_empty());
    }
}
