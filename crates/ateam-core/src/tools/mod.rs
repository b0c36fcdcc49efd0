//! Tool requests and the executor port

use std::convert::Infallible;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::{ToolCall, ToolDefinition};

pub mod calls;
pub mod filesystem;
pub mod search;
pub mod shell;

pub use calls::parse_inline_calls;
pub use filesystem::FileSystemExecutor;

/// Side effect a tool call would have
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Read,
    List,
    Search,
    Create,
    Write,
    Delete,
    Move,
    Chmod,
    Execute,
    Other(String),
}

impl Operation {
    /// Map a model-facing tool name to its operation
    pub fn from_tool_name(name: &str) -> Self {
        match name {
            "read_file" => Self::Read,
            "list_files" => Self::List,
            "search" => Self::Search,
            "create_file" => Self::Create,
            "write_file" => Self::Write,
            "delete_file" => Self::Delete,
            "move_file" => Self::Move,
            "chmod" => Self::Chmod,
            "shell" => Self::Execute,
            other => {
                let Ok(op) = other.parse::<Operation>();
                op
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Read => "read",
            Self::List => "list",
            Self::Search => "search",
            Self::Create => "create",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Chmod => "chmod",
            Self::Execute => "execute",
            Self::Other(name) => name,
        }
    }
}

impl FromStr for Operation {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "read" => Self::Read,
            "list" => Self::List,
            "search" => Self::Search,
            "create" => Self::Create,
            "write" => Self::Write,
            "delete" => Self::Delete,
            "move" => Self::Move,
            "chmod" => Self::Chmod,
            "execute" => Self::Execute,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        Self::from_tool_name(&s)
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side-effecting action, as seen by the permission engine and executor.
///
/// `content` is the file body for create/write, the destination for move,
/// the octal mode for chmod, the query for search and the command line for
/// execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub operation: Operation,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ToolRequest {
    pub fn new(operation: Operation, path: impl Into<PathBuf>) -> Self {
        Self {
            operation,
            path: path.into(),
            content: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Build a request from a model's tool call
    pub fn from_call(call: &ToolCall) -> Self {
        let operation = Operation::from_tool_name(&call.name);
        let field = |key: &str| call.input.get(key).and_then(Value::as_str).map(str::to_string);

        let path = match operation {
            Operation::Execute => field("working_dir").or_else(|| field("path")),
            _ => field("path").or_else(|| field("source")),
        }
        .unwrap_or_else(|| ".".to_string());

        let content = ["content", "destination", "mode", "query", "command"]
            .iter()
            .find_map(|key| field(key));

        Self {
            operation,
            path: PathBuf::from(path),
            content,
        }
    }
}

impl std::fmt::Display for ToolRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.operation, self.path.display())?;
        match (&self.operation, &self.content) {
            (Operation::Move, Some(dest)) => write!(f, " -> {dest}"),
            (Operation::Chmod, Some(mode)) => write!(f, " ({mode})"),
            (Operation::Search, Some(query)) => write!(f, " for '{query}'"),
            (Operation::Execute, Some(cmd)) => write!(f, ": {cmd}"),
            _ => Ok(()),
        }
    }
}

/// Executes an authorized tool request
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, request: &ToolRequest) -> Result<String>;
    fn list_tools(&self) -> Vec<ToolDefinition>;
}

/// Helper function to create a JSON schema for tool input
pub fn json_schema(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_name_mapping() {
        assert_eq!(Operation::from_tool_name("read_file"), Operation::Read);
        assert_eq!(Operation::from_tool_name("list_files"), Operation::List);
        assert_eq!(Operation::from_tool_name("search"), Operation::Search);
        assert_eq!(Operation::from_tool_name("create_file"), Operation::Create);
        assert_eq!(Operation::from_tool_name("write_file"), Operation::Write);
        assert_eq!(Operation::from_tool_name("delete_file"), Operation::Delete);
        assert_eq!(Operation::from_tool_name("move_file"), Operation::Move);
        assert_eq!(Operation::from_tool_name("chmod"), Operation::Chmod);
        assert_eq!(Operation::from_tool_name("shell"), Operation::Execute);
        assert_eq!(Operation::from_tool_name("delete"), Operation::Delete);
        assert_eq!(
            Operation::from_tool_name("web_search"),
            Operation::Other("web_search".to_string())
        );
    }

    #[test]
    fn test_operation_serde_as_string() {
        let json = serde_json::to_string(&Operation::Chmod).unwrap();
        assert_eq!(json, "\"chmod\"");
        let op: Operation = serde_json::from_str("\"move\"").unwrap();
        assert_eq!(op, Operation::Move);
        let op: Operation = serde_json::from_str("\"fetch\"").unwrap();
        assert_eq!(op.to_string(), "fetch");
    }

    #[test]
    fn test_request_from_call() {
        let call = ToolCall {
            id: "1".into(),
            name: "write_file".into(),
            input: serde_json::json!({"path": "src/lib.rs", "content": "pub fn x() {}"}),
        };
        let req = ToolRequest::from_call(&call);
        assert_eq!(req.operation, Operation::Write);
        assert_eq!(req.path, PathBuf::from("src/lib.rs"));
        assert_eq!(req.content.as_deref(), Some("pub fn x() {}"));

        let call = ToolCall {
            id: "2".into(),
            name: "move_file".into(),
            input: serde_json::json!({"source": "a.txt", "destination": "b.txt"}),
        };
        let req = ToolRequest::from_call(&call);
        assert_eq!(req.path, PathBuf::from("a.txt"));
        assert_eq!(req.content.as_deref(), Some("b.txt"));

        let call = ToolCall {
            id: "3".into(),
            name: "shell".into(),
            input: serde_json::json!({"command": "ls -la"}),
        };
        let req = ToolRequest::from_call(&call);
        assert_eq!(req.operation, Operation::Execute);
        assert_eq!(req.path, PathBuf::from("."));
        assert_eq!(req.to_string(), "execute .: ls -la");

        let call = ToolCall {
            id: "4".into(),
            name: "search".into(),
            input: serde_json::json!({"path": "src", "query": "fn main"}),
        };
        let req = ToolRequest::from_call(&call);
        assert_eq!(req.operation, Operation::Search);
        assert_eq!(req.content.as_deref(), Some("fn main"));
        assert_eq!(req.to_string(), "search src for 'fn main'");
    }

    #[test]
    fn test_json_schema() {
        let schema = json_schema(serde_json::json!({"path": {"type": "string"}}), vec!["path"]);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"][0], "path");
    }
}
