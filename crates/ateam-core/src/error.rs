//! Error taxonomy for routing, context, rate limiting, permissions and providers

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A sliding-window rejection. Carries how long the caller should wait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for '{key}', retry after {:.1}s", .retry_after.as_secs_f64())]
pub struct RateLimitError {
    pub key: String,
    pub retry_after: Duration,
}

impl RateLimitError {
    pub fn retry_after_seconds(&self) -> f64 {
        self.retry_after.as_secs_f64()
    }
}

/// The transcript cannot be brought under budget, even after dropping the summary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "context window overflow: {total_tokens} tokens against a budget of {budget} \
     ({message_count} messages, {kept_tokens} tokens in the mandatory keep-set)"
)]
pub struct ContextOverflowError {
    pub total_tokens: usize,
    pub kept_tokens: usize,
    pub budget: usize,
    pub message_count: usize,
}

/// A tool call was refused, either by the path whitelist or by the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("permission denied for {operation} on {}: {reason}", .path.display())]
pub struct PermissionDeniedError {
    pub operation: String,
    pub path: PathBuf,
    pub reason: String,
}

/// Failure reported by a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid model '{0}'")]
    InvalidModel(String),

    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Network trouble and timeouts may succeed on retry; auth and model errors never do
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

/// Everything that can go wrong while routing or running a turn
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown agent '@{name}'{hint}", hint = did_you_mean(.suggestion))]
    UnknownAgent {
        name: String,
        suggestion: Option<String>,
    },

    #[error("empty message")]
    EmptyMessage,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("no provider adapter registered for agent '@{0}'")]
    NoProvider(String),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error(transparent)]
    ContextOverflow(#[from] ContextOverflowError),

    #[error("@{agent}: {source}")]
    Provider {
        agent: String,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    PermissionDenied(#[from] PermissionDeniedError),

    #[error("cancelled")]
    Cancelled,

    #[error("history store error: {0}")]
    History(String),
}

impl DispatchError {
    /// Routing errors are detected before any side effect and are never retried
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownAgent { .. }
                | Self::EmptyMessage
                | Self::InvalidMessage(_)
                | Self::NoProvider(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                source: ProviderError::Timeout(_),
                ..
            }
        )
    }

    pub(crate) fn history(err: anyhow::Error) -> Self {
        Self::History(format!("{err:#}"))
    }
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(name) => format!(" (did you mean '@{name}'?)"),
        None => String::new(),
    }
}

/// Failures while opening or driving a room session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room '{room}' is already open in another session ({holder})")]
    RoomLocked { room: String, holder: String },

    #[error("invalid room name '{name}': {reason}")]
    InvalidRoomName { name: String, reason: String },

    #[error("room lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_agent_message_includes_suggestion() {
        let err = DispatchError::UnknownAgent {
            name: "Archtect".to_string(),
            suggestion: Some("Architect".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "unknown agent '@Archtect' (did you mean '@Architect'?)"
        );

        let err = DispatchError::UnknownAgent {
            name: "Nobody".to_string(),
            suggestion: None,
        };
        assert_eq!(err.to_string(), "unknown agent '@Nobody'");
    }

    #[test]
    fn test_rate_limit_error_display() {
        let err = RateLimitError {
            key: "anthropic".to_string(),
            retry_after: Duration::from_millis(2500),
        };
        assert_eq!(
            err.to_string(),
            "rate limit exceeded for 'anthropic', retry after 2.5s"
        );
        assert!((err.retry_after_seconds() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_routing_error_predicate() {
        assert!(DispatchError::EmptyMessage.is_routing_error());
        assert!(DispatchError::NoProvider("Coder".into()).is_routing_error());
        assert!(!DispatchError::Cancelled.is_routing_error());
        let timeout = DispatchError::Provider {
            agent: "Coder".into(),
            source: ProviderError::Timeout(Duration::from_secs(1)),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_routing_error());
    }
}
