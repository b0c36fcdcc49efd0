//! `@Agent` tag and `--parallel` flag parsing

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::DispatchError;
use crate::types::{ExecutionMode, ParseResult};

const MAX_MESSAGE_CHARS: usize = 50_000;
const MAX_MESSAGE_LINES: usize = 1_000;
const PARALLEL_FLAG: &str = "--parallel";

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_-]+)").expect("tag pattern is a valid regex"));

/// Split user text into tags, mode and the message left after removing them.
///
/// Pure: tags are not checked against configured agents and an untagged
/// message yields no targets.
pub fn parse_directives(text: &str) -> ParseResult {
    let mut targets: Vec<String> = Vec::new();
    let mut removals: Vec<Range<usize>> = Vec::new();

    for caps in TAG_RE.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let preceded_by_word = text[..whole.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric());
        if preceded_by_word {
            continue;
        }
        let name = name.as_str().to_string();
        if !targets.contains(&name) {
            targets.push(name);
        }
        let mut end = whole.end();
        if text[end..].starts_with([',', ':']) {
            end += 1;
        }
        removals.push(whole.start()..end);
    }

    if targets.is_empty() {
        return ParseResult {
            target_agents: targets,
            clean_message: text.to_string(),
            mode: ExecutionMode::Single,
        };
    }

    let mut parallel = false;
    let mut offset = 0;
    for token in text.split_inclusive(char::is_whitespace) {
        if token.trim_end() == PARALLEL_FLAG {
            parallel = true;
            removals.push(offset..offset + PARALLEL_FLAG.len());
        }
        offset += token.len();
    }

    let mode = match targets.len() {
        1 => ExecutionMode::Single,
        _ if parallel => ExecutionMode::Parallel,
        _ => ExecutionMode::Sequential,
    };

    ParseResult {
        target_agents: targets,
        clean_message: remove_spans(text, removals),
        mode,
    }
}

/// Drop each span plus the blanks directly after it, then trim
fn remove_spans(text: &str, mut spans: Vec<Range<usize>>) -> String {
    spans.sort_by_key(|r| r.start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        if span.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..span.start]);
        let rest = &text[span.end..];
        let blanks = rest.len() - rest.trim_start_matches([' ', '\t']).len();
        cursor = span.end + blanks;
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}

/// Reject input the dispatcher should never route
pub fn validate_message(text: &str) -> Result<(), DispatchError> {
    if text.contains('\0') {
        return Err(DispatchError::InvalidMessage(
            "message contains NUL bytes".to_string(),
        ));
    }
    let chars = text.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(DispatchError::InvalidMessage(format!(
            "message is {chars} characters long (max {MAX_MESSAGE_CHARS})"
        )));
    }
    let lines = text.lines().count();
    if lines > MAX_MESSAGE_LINES {
        return Err(DispatchError::InvalidMessage(format!(
            "message has {lines} lines (max {MAX_MESSAGE_LINES})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(targets: &[&str], clean: &str, mode: ExecutionMode) -> ParseResult {
        ParseResult {
            target_agents: targets.iter().map(|s| s.to_string()).collect(),
            clean_message: clean.to_string(),
            mode,
        }
    }

    #[test]
    fn test_single_tag_with_comma() {
        assert_eq!(
            parse_directives("@Architect, help"),
            parsed(&["Architect"], "help", ExecutionMode::Single)
        );
    }

    #[test]
    fn test_two_tags_sequential() {
        assert_eq!(
            parse_directives("@A @B go"),
            parsed(&["A", "B"], "go", ExecutionMode::Sequential)
        );
    }

    #[test]
    fn test_parallel_flag() {
        assert_eq!(
            parse_directives("@A @B --parallel go"),
            parsed(&["A", "B"], "go", ExecutionMode::Parallel)
        );
        assert_eq!(
            parse_directives("@A go @B --parallel"),
            parsed(&["A", "B"], "go", ExecutionMode::Parallel)
        );
    }

    #[test]
    fn test_no_tags_unmodified() {
        assert_eq!(
            parse_directives("no tags here"),
            parsed(&[], "no tags here", ExecutionMode::Single)
        );
        assert_eq!(
            parse_directives("  spaced --parallel  "),
            parsed(&[], "  spaced --parallel  ", ExecutionMode::Single)
        );
    }

    #[test]
    fn test_duplicates_collapsed_in_order() {
        let result = parse_directives("@B: check, then @A and @B again");
        assert_eq!(result.target_agents, vec!["B", "A"]);
        assert_eq!(result.mode, ExecutionMode::Sequential);
        assert_eq!(result.clean_message, "check, then and again");
    }

    #[test]
    fn test_email_is_not_a_tag() {
        let result = parse_directives("mail bob@example.com about it");
        assert!(result.target_agents.is_empty());

        let result = parse_directives("@Coder mail bob@example.com");
        assert_eq!(result.target_agents, vec!["Coder"]);
        assert_eq!(result.clean_message, "mail bob@example.com");
    }

    #[test]
    fn test_tags_without_spaces_between() {
        let result = parse_directives("@A,@B: review");
        assert_eq!(result.target_agents, vec!["A", "B"]);
        assert_eq!(result.clean_message, "review");
    }

    #[test]
    fn test_multiline_body_preserved() {
        let result = parse_directives("@Coder fix this:\n    let x = 1;\n    let y = 2;");
        assert_eq!(result.clean_message, "fix this:\n    let x = 1;\n    let y = 2;");
    }

    #[test]
    fn test_tag_only_leaves_empty_message() {
        let result = parse_directives("@Coder   ");
        assert_eq!(result.target_agents, vec!["Coder"]);
        assert!(result.clean_message.is_empty());
    }

    #[test]
    fn test_validate_message() {
        assert!(validate_message("hello").is_ok());
        assert!(matches!(
            validate_message("a\0b"),
            Err(DispatchError::InvalidMessage(_))
        ));
        assert!(validate_message(&"x".repeat(50_001)).is_err());
        assert!(validate_message(&"x".repeat(50_000)).is_ok());
        assert!(validate_message(&"line\n".repeat(1_001)).is_err());
        assert!(validate_message(&"line\n".repeat(1_000)).is_ok());
    }
}
