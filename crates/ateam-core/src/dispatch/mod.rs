//! Turn dispatcher
//!
//! Routes one line of user input to agents and runs them in single,
//! sequential or parallel mode. Every agent call goes through the rate
//! limiter, the context window manager and the provider registry; tool calls
//! in replies go through the permission engine before they reach the tool
//! executor.

pub mod parser;

pub use parser::{parse_directives, validate_message};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::AgentManager;
use crate::context::{
    ContextBudget, ContextConfig, ContextWindowManager, build_system_prompt, should_warn,
};
use crate::error::{DispatchError, PermissionDeniedError, ProviderError};
use crate::history::HistoryStore;
use crate::permissions::{AutoDeny, ConfirmationPort, PermissionEngine, PermissionOutcome};
use crate::providers::registry::send_with_retry;
use crate::providers::{ProviderAdapter, ProviderRegistry, ProviderReply, ToolCall, ToolDefinition};
use crate::rate_limit::{RateLimiter, RetryPolicy};
use crate::tokens::TokenCounter;
use crate::tools::calls::strip_inline_calls;
use crate::tools::{ToolExecutor, ToolRequest, parse_inline_calls};
use crate::types::{ExecutionMode, Message, ParseResult};

const MAX_TOOL_OUTPUT: usize = 100_000;

/// Dispatcher tuning from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub context: ContextConfig,
    pub retry: RetryPolicy,
    pub provider_timeout_secs: u64,
    /// Follow-up calls allowed after tool results, per agent per turn
    pub max_tool_rounds: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            retry: RetryPolicy::default(),
            provider_timeout_secs: 120,
            max_tool_rounds: 5,
        }
    }
}

/// What happened to one agent during a turn
#[derive(Debug)]
pub struct AgentOutcome {
    pub agent: String,
    /// Messages this agent appended, in order
    pub messages: Vec<Message>,
    pub error: Option<DispatchError>,
    pub warnings: Vec<String>,
    pub denials: Vec<PermissionDeniedError>,
    pub tool_calls: usize,
    pub queued: usize,
}

impl AgentOutcome {
    fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            messages: Vec::new(),
            error: None,
            warnings: Vec::new(),
            denials: Vec::new(),
            tool_calls: 0,
            queued: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The agent's final reply, if it produced one
    pub fn reply(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::Assistant)
    }
}

/// Result of one user turn
#[derive(Debug)]
pub struct TurnReport {
    pub mode: ExecutionMode,
    pub user_message: Message,
    pub outcomes: Vec<AgentOutcome>,
    /// Agents never invoked because the chain halted or was cancelled
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

impl TurnReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.skipped.is_empty() && self.outcomes.iter().all(AgentOutcome::is_success)
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &DispatchError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| (o.agent.as_str(), e)))
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .flat_map(|o| o.warnings.iter().map(String::as_str))
    }

    pub fn queued(&self) -> usize {
        self.outcomes.iter().map(|o| o.queued).sum()
    }
}

/// One bounded, rate-limited provider call with everything it needs owned,
/// so parallel mode can spawn it
struct CallPlan {
    agent: String,
    provider: String,
    adapter: Arc<dyn ProviderAdapter>,
    messages: Vec<Message>,
    system_prompt: String,
    tools: Vec<ToolDefinition>,
    context: ContextWindowManager,
    budget: ContextBudget,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
}

struct CallResult {
    reply: ProviderReply,
    model: String,
    followup: bool,
    tokens_removed: usize,
    warning: Option<String>,
}

impl CallPlan {
    async fn run(self) -> Result<CallResult, DispatchError> {
        let system_tokens = self.context.count(&self.system_prompt);
        let pruned = self.context.prune(&self.messages, system_tokens, self.budget)?;
        let usage = self
            .context
            .token_usage(&pruned.messages, system_tokens, self.budget);
        let warning = should_warn(usage.total, usage.max_tokens).then(|| {
            format!(
                "@{}: context at {}% of {} tokens",
                self.agent, usage.percent, usage.max_tokens
            )
        });

        let call = async {
            acquire_rate_slot(&self.limiter, &self.provider, &self.retry).await?;
            send_with_retry(
                self.adapter.as_ref(),
                &pruned.messages,
                &self.system_prompt,
                &self.tools,
                &self.retry,
                self.timeout,
            )
            .await
            .map_err(|source| DispatchError::Provider {
                agent: self.agent.clone(),
                source,
            })
        };

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled),
            reply = call => reply?,
        };

        Ok(CallResult {
            reply,
            model: self.adapter.describe_model(),
            followup: self.adapter.requires_tool_followup(),
            tokens_removed: pruned.tokens_removed,
            warning,
        })
    }
}

/// Take a rate-limit slot for `key`, backing off while the window is full
async fn acquire_rate_slot(
    limiter: &RateLimiter,
    key: &str,
    policy: &RetryPolicy,
) -> Result<(), DispatchError> {
    let mut attempt = 0;
    loop {
        match limiter.check_key(key) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, Some(e.retry_after));
                warn!("{}; retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn truncate_output(output: String) -> String {
    if output.chars().count() <= MAX_TOOL_OUTPUT {
        return output;
    }
    let mut cut: String = output.chars().take(MAX_TOOL_OUTPUT).collect();
    cut.push_str("\n[output truncated]");
    cut
}

/// Validate `text` and resolve its targets against `agents`. Checks, in
/// order: message validity, unknown tags, empty remainder. Untagged input
/// goes to `default_agent`, else the manager's default.
pub fn resolve_route(
    agents: &AgentManager,
    text: &str,
    default_agent: Option<&str>,
) -> Result<ParseResult, DispatchError> {
    validate_message(text)?;
    let mut parsed = parse_directives(text);

    for name in &parsed.target_agents {
        if !agents.contains(name) {
            return Err(DispatchError::UnknownAgent {
                name: name.clone(),
                suggestion: agents.suggest(name),
            });
        }
    }
    if parsed.clean_message.trim().is_empty() {
        return Err(DispatchError::EmptyMessage);
    }
    if parsed.target_agents.is_empty() {
        let default = default_agent.unwrap_or_else(|| agents.default_agent());
        if !agents.contains(default) {
            return Err(DispatchError::UnknownAgent {
                name: default.to_string(),
                suggestion: agents.suggest(default),
            });
        }
        parsed.target_agents.push(default.to_string());
    }
    Ok(parsed)
}

/// Routes user input and runs agent turns against a room's history
pub struct Dispatcher {
    agents: AgentManager,
    providers: ProviderRegistry,
    limiter: Arc<RateLimiter>,
    context: ContextWindowManager,
    history: Arc<dyn HistoryStore>,
    tools: Arc<dyn ToolExecutor>,
    confirm: Arc<dyn ConfirmationPort>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        agents: AgentManager,
        providers: ProviderRegistry,
        history: Arc<dyn HistoryStore>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            agents,
            providers,
            limiter: Arc::new(RateLimiter::default()),
            context: ContextWindowManager::default(),
            history,
            tools,
            confirm: Arc::new(AutoDeny),
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.context = ContextWindowManager::new(counter);
        self
    }

    pub fn with_confirmation(mut self, confirm: Arc<dyn ConfirmationPort>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn agents(&self) -> &AgentManager {
        &self.agents
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn tools(&self) -> &Arc<dyn ToolExecutor> {
        &self.tools
    }

    pub fn confirmation(&self) -> &Arc<dyn ConfirmationPort> {
        &self.confirm
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn unknown_agent(&self, name: &str) -> DispatchError {
        DispatchError::UnknownAgent {
            name: name.to_string(),
            suggestion: self.agents.suggest(name),
        }
    }

    fn check_targets(&self, targets: &[String]) -> Result<(), DispatchError> {
        for name in targets {
            if !self.agents.contains(name) {
                return Err(self.unknown_agent(name));
            }
        }
        for name in targets {
            if !self.providers.contains(name) {
                return Err(DispatchError::NoProvider(name.clone()));
            }
        }
        Ok(())
    }

    /// Parse and validate `text` without side effects. Untagged input goes to
    /// `default_agent`, or the configured default when `None`.
    pub fn route(
        &self,
        text: &str,
        default_agent: Option<&str>,
    ) -> Result<ParseResult, DispatchError> {
        let parsed = resolve_route(&self.agents, text, default_agent)?;
        self.check_targets(&parsed.target_agents)?;
        debug!("Routed to {:?} ({})", parsed.target_agents, parsed.mode);
        Ok(parsed)
    }

    /// Route and run in one step
    pub async fn dispatch(
        &self,
        room: &str,
        permissions: &mut PermissionEngine,
        text: &str,
        default_agent: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, DispatchError> {
        let parsed = self.route(text, default_agent)?;
        self.execute(room, permissions, &parsed, cancel).await
    }

    /// Run a routed turn. Only routing and history failures are returned as
    /// errors; per-agent failures are recorded in the report.
    pub async fn execute(
        &self,
        room: &str,
        permissions: &mut PermissionEngine,
        parsed: &ParseResult,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, DispatchError> {
        self.check_targets(&parsed.target_agents)?;
        if parsed.target_agents.is_empty() || parsed.clean_message.trim().is_empty() {
            return Err(DispatchError::EmptyMessage);
        }

        for name in &parsed.target_agents {
            let ceiling = self.agents.get(name).and_then(|p| p.trust_level);
            permissions.set_agent_ceiling(name, ceiling);
        }

        let user = Message::user(parsed.clean_message.clone())
            .with_metadata("targets", serde_json::json!(parsed.target_agents))
            .with_metadata("mode", parsed.mode.to_string());
        let user_message = self
            .history
            .append(room, user)
            .await
            .map_err(DispatchError::history)?;

        info!(
            "Turn in '{}': {} mode, agents {:?}",
            room, parsed.mode, parsed.target_agents
        );

        let mut report = TurnReport {
            mode: parsed.mode,
            user_message,
            outcomes: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
        };

        match parsed.mode {
            ExecutionMode::Parallel => {
                self.run_parallel(room, permissions, &parsed.target_agents, cancel, &mut report)
                    .await?
            }
            ExecutionMode::Single | ExecutionMode::Sequential => {
                self.run_sequential(room, permissions, &parsed.target_agents, cancel, &mut report)
                    .await
            }
        }

        info!(
            "Turn in '{}' finished: {} ok, {} failed, {} skipped{}",
            room,
            report.outcomes.iter().filter(|o| o.is_success()).count(),
            report.errors().count(),
            report.skipped.len(),
            if report.cancelled { ", cancelled" } else { "" }
        );
        Ok(report)
    }

    async fn run_sequential(
        &self,
        room: &str,
        permissions: &mut PermissionEngine,
        targets: &[String],
        cancel: &CancellationToken,
        report: &mut TurnReport,
    ) {
        for (idx, agent) in targets.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped.extend(targets[idx..].iter().cloned());
                break;
            }

            let mut outcome = AgentOutcome::new(agent);
            let first = match self.history.load(room).await {
                Ok(snapshot) => match self.plan(room, agent, snapshot, cancel) {
                    Ok(plan) => plan.run().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(DispatchError::history(e)),
            };
            self.finish_agent_turn(room, agent, first, permissions, cancel, &mut outcome)
                .await;

            let halt = match &outcome.error {
                None => false,
                Some(e) if e.is_timeout() => {
                    warn!("@{} timed out, continuing with the next agent", agent);
                    false
                }
                Some(DispatchError::Cancelled) => {
                    report.cancelled = true;
                    true
                }
                Some(e) => {
                    warn!("@{} failed, halting the chain: {}", agent, e);
                    true
                }
            };
            report.outcomes.push(outcome);
            if halt {
                report.skipped.extend(targets[idx + 1..].iter().cloned());
                break;
            }
        }
    }

    async fn run_parallel(
        &self,
        room: &str,
        permissions: &mut PermissionEngine,
        targets: &[String],
        cancel: &CancellationToken,
        report: &mut TurnReport,
    ) -> Result<(), DispatchError> {
        let snapshot = self
            .history
            .load(room)
            .await
            .map_err(DispatchError::history)?;

        let mut handles: Vec<(String, Result<JoinHandle<Result<CallResult, DispatchError>>, DispatchError>)> =
            Vec::with_capacity(targets.len());
        for agent in targets {
            let handle = self
                .plan(room, agent, snapshot.clone(), cancel)
                .map(|plan| tokio::spawn(plan.run()));
            handles.push((agent.clone(), handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (agent, handle) in handles {
            let result = match handle {
                Ok(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(DispatchError::Provider {
                        agent: agent.clone(),
                        source: ProviderError::Other(format!("task panicked: {e}")),
                    }),
                },
                Err(e) => Err(e),
            };
            results.push((agent, result));
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
        }

        // replies land in agent order; tools run one agent at a time
        for (agent, result) in results {
            let mut outcome = AgentOutcome::new(&agent);
            self.finish_agent_turn(room, &agent, result, permissions, cancel, &mut outcome)
                .await;
            report.outcomes.push(outcome);
        }
        Ok(())
    }

    fn plan(
        &self,
        room: &str,
        agent: &str,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<CallPlan, DispatchError> {
        let profile = self
            .agents
            .get(agent)
            .ok_or_else(|| self.unknown_agent(agent))?;
        let adapter = self
            .providers
            .get(agent)
            .ok_or_else(|| DispatchError::NoProvider(agent.to_string()))?;
        let tools = self.tools.list_tools();
        let participants = self.agents.list_agents();
        let system_prompt = build_system_prompt(profile, room, &participants, &tools);

        Ok(CallPlan {
            agent: agent.to_string(),
            provider: profile.provider.clone(),
            adapter,
            messages,
            system_prompt,
            tools,
            context: self.context.clone(),
            budget: self.config.context.budget_for(profile),
            limiter: self.limiter.clone(),
            retry: self.config.retry,
            timeout: Duration::from_secs(self.config.provider_timeout_secs),
            cancel: cancel.clone(),
        })
    }

    /// Append a reply, run its tool calls and follow up until the agent
    /// stops calling tools or the round cap is reached
    async fn finish_agent_turn(
        &self,
        room: &str,
        agent: &str,
        first: Result<CallResult, DispatchError>,
        permissions: &mut PermissionEngine,
        cancel: &CancellationToken,
        outcome: &mut AgentOutcome,
    ) {
        let mut result = first;
        let mut rounds = 0;
        loop {
            let call = match result {
                Ok(call) => call,
                Err(e) => {
                    outcome.error = Some(e);
                    return;
                }
            };
            outcome.warnings.extend(call.warning);

            let reply = call.reply;
            let (content, calls) = if reply.tool_calls.is_empty() {
                let inline = parse_inline_calls(&reply.content);
                if inline.is_empty() {
                    (reply.content, inline)
                } else {
                    // the calls live on in the tool_calls metadata
                    let text = strip_inline_calls(&reply.content);
                    let text = if text.is_empty() {
                        let names: Vec<&str> = inline.iter().map(|c| c.name.as_str()).collect();
                        format!("(calling {})", names.join(", "))
                    } else {
                        text
                    };
                    (text, inline)
                }
            } else {
                (reply.content, reply.tool_calls)
            };

            let mut message = Message::assistant(agent, content)
                .with_model(call.model)
                .with_usage(reply.usage.prompt_tokens, reply.usage.completion_tokens);
            if call.tokens_removed > 0 {
                message = message.with_metadata("tokens_pruned", call.tokens_removed);
            }
            if !calls.is_empty() {
                if let Ok(value) = serde_json::to_value(&calls) {
                    message = message.with_metadata("tool_calls", value);
                }
            }
            match self.history.append(room, message).await {
                Ok(stored) => outcome.messages.push(stored),
                Err(e) => {
                    outcome.error = Some(DispatchError::history(e));
                    return;
                }
            }

            if calls.is_empty() {
                return;
            }
            if let Err(e) = self
                .run_tool_calls(room, agent, &calls, permissions, cancel, outcome)
                .await
            {
                outcome.error = Some(e);
                return;
            }
            if !call.followup {
                return;
            }
            if rounds == self.config.max_tool_rounds {
                warn!("@{} hit the tool round cap ({})", agent, rounds);
                outcome.warnings.push(format!(
                    "@{agent}: stopped after {rounds} tool rounds"
                ));
                return;
            }
            rounds += 1;

            result = match self.history.load(room).await {
                Ok(snapshot) => match self.plan(room, agent, snapshot, cancel) {
                    Ok(plan) => plan.run().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(DispatchError::history(e)),
            };
        }
    }

    async fn run_tool_calls(
        &self,
        room: &str,
        agent: &str,
        calls: &[ToolCall],
        permissions: &mut PermissionEngine,
        cancel: &CancellationToken,
        outcome: &mut AgentOutcome,
    ) -> Result<(), DispatchError> {
        for call in calls {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            outcome.tool_calls += 1;
            let request = ToolRequest::from_call(call);
            let decision = permissions.authorize(agent, &request);

            let (status, text) = match decision.outcome {
                PermissionOutcome::Allow => ("executed", self.run_tool(&request).await),
                PermissionOutcome::Deny => {
                    outcome
                        .denials
                        .push(denied(&request, decision.reason.clone()));
                    ("denied", format!("Permission denied: {}", decision.reason))
                }
                PermissionOutcome::NeedsConfirmation if permissions.batch_mode() => {
                    let position =
                        permissions.enqueue(agent, request.clone(), decision.reason.clone());
                    outcome.queued += 1;
                    (
                        "queued",
                        format!("Queued for batch approval (#{position}); the user will decide later."),
                    )
                }
                PermissionOutcome::NeedsConfirmation => {
                    if self.confirm.confirm(agent, &request, &decision.reason).await {
                        ("executed", self.run_tool(&request).await)
                    } else {
                        outcome
                            .denials
                            .push(denied(&request, "denied by user".to_string()));
                        ("denied", "Permission denied by user".to_string())
                    }
                }
            };

            let message = Message::system(format!("[{} result]\n{}", call.name, text))
                .with_agent(agent)
                .with_metadata("tool_call_id", call.id.clone())
                .with_metadata("tool", call.name.clone())
                .with_metadata("status", status);
            let stored = self
                .history
                .append(room, message)
                .await
                .map_err(DispatchError::history)?;
            outcome.messages.push(stored);
        }
        Ok(())
    }

    async fn run_tool(&self, request: &ToolRequest) -> String {
        match self.tools.execute(request).await {
            Ok(output) => truncate_output(output),
            Err(e) => {
                warn!("Tool {} failed: {:#}", request, e);
                format!("Error: {e:#}")
            }
        }
    }
}

fn denied(request: &ToolRequest, reason: String) -> PermissionDeniedError {
    PermissionDeniedError {
        operation: request.operation.to_string(),
        path: request.path.clone(),
        reason,
    }
}
