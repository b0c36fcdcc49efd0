//! Per-agent adapter registry with retry and timeout

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::types::{ProviderAdapter, ProviderReply, ToolDefinition};
use crate::error::ProviderError;
use crate::rate_limit::RetryPolicy;
use crate::types::Message;

/// Maps agent names to the adapter that serves them
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        let agent = agent.into();
        debug!(
            "Registering provider {} ({}) for agent '{}'",
            adapter.provider_name(),
            adapter.describe_model(),
            agent
        );
        self.adapters.insert(agent, adapter);
    }

    pub fn with_adapter(mut self, agent: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(agent, adapter);
        self
    }

    pub fn get(&self, agent: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(agent).cloned()
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.adapters.contains_key(agent)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Call `adapter.send`, bounding each attempt by `timeout` and retrying
/// retryable failures with the policy's backoff
pub async fn send_with_retry(
    adapter: &dyn ProviderAdapter,
    messages: &[Message],
    system_prompt: &str,
    tools: &[ToolDefinition],
    policy: &RetryPolicy,
    timeout: Duration,
) -> Result<ProviderReply, ProviderError> {
    let mut attempt = 0;
    loop {
        debug!(
            "Calling {} ({}) attempt {}/{}",
            adapter.provider_name(),
            adapter.describe_model(),
            attempt + 1,
            policy.max_retries + 1
        );

        let result = match tokio::time::timeout(timeout, adapter.send(messages, system_prompt, tools)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };

        match result {
            Ok(reply) => {
                if attempt > 0 {
                    info!(
                        "Provider {} succeeded after {} retries",
                        adapter.provider_name(),
                        attempt
                    );
                }
                return Ok(reply);
            }
            Err(e) => {
                let retryable = e.is_retryable();
                warn!(
                    "Provider {} ({}) failed (attempt {}, retryable={}): {}",
                    adapter.provider_name(),
                    adapter.describe_model(),
                    attempt + 1,
                    retryable,
                    e
                );
                if !retryable || attempt >= policy.max_retries {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt, None);
                debug!("Backing off for {:?} before retry", delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
