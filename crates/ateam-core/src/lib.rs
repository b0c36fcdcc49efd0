//! ateam-core - the room core of the A-Team multi-agent chat
//!
//! This crate provides:
//! - Dispatcher that parses `@Agent` tags and runs single, sequential or parallel turns
//! - Context window pruning with first-message and recent-tail retention
//! - Permission engine with modes, trust grants and batch approval
//! - Sliding-window rate limiting with an injectable clock
//! - Room sessions with an exclusive lock and slash directives
//! - Per-room SQLite history and Markdown transcript export

pub mod agents;
pub mod clock;
pub mod commands;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod permissions;
pub mod providers;
pub mod rate_limit;
pub mod session;
pub mod tokens;
pub mod tools;
pub mod types;

// Re-export main types for convenience
pub use agents::{AgentManager, AgentProfile};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ContextBudget, ContextConfig, ContextWindowManager, PruneResult};
pub use dispatch::{AgentOutcome, Dispatcher, DispatcherConfig, TurnReport, resolve_route};
pub use error::{
    ContextOverflowError, DispatchError, PermissionDeniedError, ProviderError, RateLimitError,
    SessionError,
};
pub use history::{HistoryStore, InMemoryHistory, RoomSummary, SqliteHistory, export_room};
pub use permissions::{
    ConfirmationPort, PermissionConfig, PermissionDecision, PermissionEngine, PermissionMode,
    PermissionOutcome,
};
pub use providers::{ProviderAdapter, ProviderRegistry, ProviderReply};
pub use rate_limit::{RateLimit, RateLimiter, RetryPolicy};
pub use session::{RoomSession, SessionReply};
pub use tokens::{EstimatingCounter, TokenCounter};
pub use tools::{FileSystemExecutor, Operation, ToolExecutor, ToolRequest};
pub use types::{ExecutionMode, Message, ParseResult, Role};

/// Turn cancellation handle taken by `Dispatcher::dispatch`
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        // Just verify that all main types are exported
        let _ = std::mem::size_of::<Dispatcher>();
        let _ = std::mem::size_of::<PermissionEngine>();
        let _ = std::mem::size_of::<RateLimiter>();
        let _ = std::mem::size_of::<RoomSession>();
        let _ = std::mem::size_of::<Message>();
        let _ = std::mem::size_of::<SqliteHistory>();
    }

    #[test]
    fn test_core_types_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Dispatcher>();
        assert_send_sync::<PermissionEngine>();
        assert_send_sync::<RateLimiter>();
        assert_send_sync::<SqliteHistory>();
    }
}
