//! Provider port: the capability trait wire adapters implement, and the
//! per-agent registry with retry and timeout handling

pub mod registry;
pub mod types;

pub use registry::ProviderRegistry;
pub use types::{ProviderAdapter, ProviderReply, ProviderUsage, ToolCall, ToolDefinition};
