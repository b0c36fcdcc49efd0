//! Context window pruning and system prompt building

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agents::AgentProfile;
use crate::error::ContextOverflowError;
use crate::providers::ToolDefinition;
use crate::tokens::{EstimatingCounter, TokenCounter};
use crate::types::{Message, Role};

/// Messages at the tail that are never elided
const KEEP_LAST: usize = 5;
/// Topic fragments per participant in a summary
const MAX_TOPICS: usize = 3;
/// Fragment length cap, in characters
const TOPIC_CHARS: usize = 50;
/// `should_warn` threshold, in percent of `max_tokens`
const WARN_PERCENT: usize = 85;

/// Token budget for one model call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub max_tokens: usize,
    pub reserve_tokens: usize,
}

impl ContextBudget {
    pub fn new(max_tokens: usize, reserve_tokens: usize) -> Self {
        Self {
            max_tokens,
            reserve_tokens,
        }
    }

    /// Tokens available for system prompt plus transcript
    pub fn available(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserve_tokens)
    }
}

/// Configured context limits. `max_tokens` overrides each agent's own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_tokens: Option<usize>,
    pub reserve_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            reserve_tokens: 1_000,
        }
    }
}

impl ContextConfig {
    pub fn budget_for(&self, agent: &AgentProfile) -> ContextBudget {
        ContextBudget::new(
            self.max_tokens.unwrap_or_else(|| agent.max_tokens()),
            self.reserve_tokens,
        )
    }
}

/// Output of `prune`
#[derive(Debug, Clone, PartialEq)]
pub struct PruneResult {
    pub messages: Vec<Message>,
    pub tokens_removed: usize,
}

impl PruneResult {
    pub fn was_pruned(&self) -> bool {
        self.tokens_removed > 0
    }
}

/// Token usage snapshot for status display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub total: usize,
    pub max_tokens: usize,
    pub percent: usize,
}

/// Bounds the token cost of a transcript sent to a model
#[derive(Clone)]
pub struct ContextWindowManager {
    counter: Arc<dyn TokenCounter>,
}

impl Default for ContextWindowManager {
    fn default() -> Self {
        Self::new(Arc::new(EstimatingCounter))
    }
}

impl ContextWindowManager {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn count(&self, text: &str) -> usize {
        self.counter.count_tokens(text)
    }

    fn count_all(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count(&m.content)).sum()
    }

    /// Fit `messages` plus a system prompt of `system_tokens` into `budget`.
    ///
    /// The first message and the last five always survive. The middle is
    /// replaced by a summary when it fits, else dropped outright.
    pub fn prune(
        &self,
        messages: &[Message],
        system_tokens: usize,
        budget: ContextBudget,
    ) -> Result<PruneResult, ContextOverflowError> {
        let available = budget.available();
        let total = self.count_all(messages) + system_tokens;

        if total <= available {
            return Ok(PruneResult {
                messages: messages.to_vec(),
                tokens_removed: 0,
            });
        }

        if messages.len() <= KEEP_LAST + 1 {
            return Err(ContextOverflowError {
                total_tokens: total,
                kept_tokens: total,
                budget: available,
                message_count: messages.len(),
            });
        }

        let first = &messages[0];
        let tail = &messages[messages.len() - KEEP_LAST..];
        let middle = &messages[1..messages.len() - KEEP_LAST];

        let kept_tokens = self.count(&first.content) + self.count_all(tail) + system_tokens;
        if kept_tokens > available {
            return Err(ContextOverflowError {
                total_tokens: total,
                kept_tokens,
                budget: available,
                message_count: messages.len(),
            });
        }

        let summary = summarize(middle);
        let summary_tokens = self.count(&summary.content);

        let mut pruned = Vec::with_capacity(KEEP_LAST + 2);
        pruned.push(first.clone());
        let tokens_removed = if kept_tokens + summary_tokens <= available {
            pruned.push(summary);
            total - (kept_tokens + summary_tokens)
        } else {
            debug!(
                "Summary ({} tokens) does not fit, dropping {} messages outright",
                summary_tokens,
                middle.len()
            );
            total - kept_tokens
        };
        pruned.extend_from_slice(tail);

        info!(
            "Pruned context: {} -> {} messages, {} tokens removed (budget {})",
            messages.len(),
            pruned.len(),
            tokens_removed,
            available
        );

        Ok(PruneResult {
            messages: pruned,
            tokens_removed,
        })
    }

    pub fn token_usage(
        &self,
        messages: &[Message],
        system_tokens: usize,
        budget: ContextBudget,
    ) -> TokenUsage {
        let total = self.count_all(messages) + system_tokens;
        let percent = if budget.max_tokens > 0 {
            total * 100 / budget.max_tokens
        } else {
            0
        };
        TokenUsage {
            total,
            max_tokens: budget.max_tokens,
            percent,
        }
    }
}

/// Advisory: true at or above 85% of `max_tokens`
pub fn should_warn(current_tokens: usize, max_tokens: usize) -> bool {
    current_tokens.saturating_mul(100) >= max_tokens.saturating_mul(WARN_PERCENT)
}

/// Synthetic system message standing in for elided history.
/// Never persisted, so it keeps id 0.
pub fn summarize(middle: &[Message]) -> Message {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for msg in middle {
        // tool output says nothing about what an agent discussed
        if msg.metadata.contains_key("tool_call_id") {
            continue;
        }
        let author = msg.author();
        let idx = match groups.iter().position(|(name, _)| *name == author) {
            Some(idx) => idx,
            None => {
                groups.push((author, Vec::new()));
                groups.len() - 1
            }
        };
        let topics = &mut groups[idx].1;
        if topics.len() >= MAX_TOPICS {
            continue;
        }
        if let Some(topic) = topic_fragment(&msg.content) {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
    }

    let mut content = format!("[Summary of {} earlier messages]", middle.len());
    for (author, topics) in &groups {
        let topics = if topics.is_empty() {
            "general discussion".to_string()
        } else {
            topics.join(", ")
        };
        content.push_str(&format!("\n@{author} discussed: {topics}"));
    }

    let mut summary = Message::new(Role::System, content).with_metadata("elided", middle.len());
    summary.is_summary = true;
    summary
}

/// First clause of `text`, capped at 50 characters
fn topic_fragment(text: &str) -> Option<String> {
    let clause = text
        .split(['.', '!', '?', ';', '\n'])
        .map(str::trim)
        .find(|s| !s.is_empty())?;
    let fragment: String = clause.chars().take(TOPIC_CHARS).collect();
    Some(fragment.trim_end().to_string())
}

/// Assemble an agent's system prompt for a room turn
pub fn build_system_prompt(
    agent: &AgentProfile,
    room: &str,
    participants: &[&str],
    tools: &[ToolDefinition],
) -> String {
    let mut prompt = String::new();

    prompt.push_str("# IDENTITY\n\n");
    prompt.push_str(&format!("You are @{}.", agent.name));
    if !agent.system_prompt.is_empty() {
        prompt.push(' ');
        prompt.push_str(agent.system_prompt.trim());
    }
    prompt.push_str("\n\n");

    prompt.push_str("# ROOM\n\n");
    prompt.push_str(&format!("Room: {room}\n"));
    let others: Vec<String> = participants
        .iter()
        .filter(|name| **name != agent.name)
        .map(|name| format!("@{name}"))
        .collect();
    if !others.is_empty() {
        prompt.push_str(&format!("Other agents: {}\n", others.join(", ")));
    }
    prompt.push('\n');

    if !tools.is_empty() {
        prompt.push_str("# TOOLS\n\n");
        for tool in tools {
            prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
        prompt.push_str(
            "\nTo call a tool without native tool support, reply with \
             <tool_call name=\"TOOL\" path=\"PATH\">CONTENT</tool_call>.\n\n",
        );
    }

    prompt.push_str("# INSTRUCTIONS\n\n");
    prompt.push_str("Messages from other agents are prefixed with their @name. ");
    prompt.push_str("Build on their work instead of repeating it. ");
    prompt.push_str("Be concise.\n");

    debug!("Built system prompt for @{} ({} chars)", agent.name, prompt.len());
    prompt
}
