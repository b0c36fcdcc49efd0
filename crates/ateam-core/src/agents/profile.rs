//! Agent profile: identity, provider, model and trust level

use serde::{Deserialize, Serialize};

use crate::permissions::PermissionMode;
use crate::tokens::max_context_for_model;

/// A configured participant of a room. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Per-agent ceiling on the room's permission mode
    #[serde(default)]
    pub trust_level: Option<PermissionMode>,
    #[serde(default)]
    pub context_window: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl AgentProfile {
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            model: model.into(),
            system_prompt: String::new(),
            trust_level: None,
            context_window: None,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_trust_level(mut self, mode: PermissionMode) -> Self {
        self.trust_level = Some(mode);
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = Some(tokens);
        self
    }

    /// Token budget for this agent: explicit setting, else the model table
    pub fn max_tokens(&self) -> usize {
        self.context_window
            .unwrap_or_else(|| max_context_for_model(&self.model))
    }

    /// Agent names are what follows `@` in a tag
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}
