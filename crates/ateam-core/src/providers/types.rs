//! Provider-agnostic request and reply types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;
use crate::types::Message;

/// Tool advertised to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool invocation requested by a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// Token usage from a single call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// What an adapter returns for one `send`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: ProviderUsage,
}

impl ProviderReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Trait every wire-level provider adapter implements
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name, also the rate-limit key (e.g. "anthropic", "gemini")
    fn provider_name(&self) -> &str;

    /// Model identifier used for `model_used` on replies
    fn describe_model(&self) -> String;

    /// Whether tool results must be sent back for another completion
    fn requires_tool_followup(&self) -> bool {
        true
    }

    async fn send(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: &[ToolDefinition],
    ) -> Result<ProviderReply, ProviderError>;
}
