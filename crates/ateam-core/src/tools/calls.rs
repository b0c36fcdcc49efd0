//! Inline `<tool_call name="...">...</tool_call>` markup for models without
//! native tool calling

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::providers::ToolCall;

static TOOL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<tool_call\s+name="([^"]+)"(?:\s+path="([^"]*)")?\s*>(.*?)</tool_call>"#)
        .expect("tool call pattern is a valid regex")
});

/// Extract inline tool calls from a reply, in order of appearance.
///
/// The body is the primary argument: the command for `shell`, the path for
/// path-only tools without a `path` attribute, else the file content.
pub fn parse_inline_calls(text: &str) -> Vec<ToolCall> {
    TOOL_CALL_RE
        .captures_iter(text)
        .enumerate()
        .map(|(i, caps)| {
            let name = caps[1].to_string();
            let path = caps.get(2).map(|m| m.as_str().to_string());
            let body = caps[3].trim().to_string();

            let mut input = Map::new();
            if let Some(path) = &path {
                input.insert("path".into(), Value::String(path.clone()));
            }
            let body_key = match name.as_str() {
                "shell" => "command",
                "move_file" => "destination",
                "chmod" => "mode",
                "search" => "query",
                "read_file" | "list_files" | "delete_file" if path.is_none() => "path",
                _ => "content",
            };
            if !(body.is_empty() && body_key == "path") {
                input.insert(body_key.into(), Value::String(body));
            }

            ToolCall {
                id: format!("inline-{}", i + 1),
                name,
                input: Value::Object(input),
            }
        })
        .collect()
}

/// Reply text with inline tool call markup removed
pub fn strip_inline_calls(text: &str) -> String {
    TOOL_CALL_RE.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shell_call() {
        let calls = parse_inline_calls(r#"Let me check. <tool_call name="shell">ls -la</tool_call>"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "inline-1");
        assert_eq!(calls[0].name, "shell");
        assert_eq!(calls[0].input["command"], "ls -la");
    }

    #[test]
    fn test_parse_path_attribute_and_multiline_body() {
        let text = "<tool_call name=\"write_file\" path=\"src/main.rs\">\nfn main() {}\n</tool_call>\n\
                    <tool_call name=\"read_file\">Cargo.toml</tool_call>";
        let calls = parse_inline_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].input["path"], "src/main.rs");
        assert_eq!(calls[0].input["content"], "fn main() {}");
        assert_eq!(calls[1].id, "inline-2");
        assert_eq!(calls[1].input["path"], "Cargo.toml");
    }

    #[test]
    fn test_parse_move_and_chmod() {
        let text = r#"<tool_call name="move_file" path="a.txt">b.txt</tool_call><tool_call name="chmod" path="run.sh">755</tool_call>"#;
        let calls = parse_inline_calls(text);
        assert_eq!(calls[0].input["destination"], "b.txt");
        assert_eq!(calls[1].input["mode"], "755");
    }

    #[test]
    fn test_list_files_without_body() {
        let calls = parse_inline_calls(r#"<tool_call name="list_files"></tool_call>"#);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].input.get("path").is_none());
    }

    #[test]
    fn test_no_calls() {
        assert!(parse_inline_calls("plain reply").is_empty());
        assert!(parse_inline_calls("<tool_call>broken</tool_call>").is_empty());
    }

    #[test]
    fn test_search_body_is_query() {
        let calls = parse_inline_calls(r#"<tool_call name="search" path="src">fn main</tool_call>"#);
        assert_eq!(calls[0].input["query"], "fn main");
        assert_eq!(calls[0].input["path"], "src");
    }

    #[test]
    fn test_strip_inline_calls() {
        let text = r#"Running it. <tool_call name="shell">ls</tool_call>"#;
        assert_eq!(strip_inline_calls(text), "Running it.");
    }
}
