//! Token counting port and the default character-based estimate

/// Counts tokens for a piece of text. Exact tokenizers live outside the core.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count_tokens(&self, text: &str) -> usize {
        self(text)
    }
}

/// Average characters per token for common English text
const CHARS_PER_TOKEN: usize = 4;

/// Rough estimate: one token per four characters, at least one for non-empty text
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatingCounter;

impl TokenCounter for EstimatingCounter {
    fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() / CHARS_PER_TOKEN).max(1)
    }
}

/// Context window size for a model, matched by name substring.
/// Unknown models get a conservative 4096.
pub fn max_context_for_model(model: &str) -> usize {
    let model = model.to_lowercase();
    let table: [(&str, usize); 9] = [
        ("gemini-1.5-pro", 2_000_000),
        ("gemini-1.5-flash", 1_000_000),
        ("gemini-1.0-pro", 32_768),
        ("claude-3", 200_000),
        ("claude-2", 100_000),
        ("gpt-4o", 128_000),
        ("gpt-4-turbo", 128_000),
        ("gpt-4", 8_192),
        ("gpt-3.5-turbo", 16_385),
    ];
    table
        .iter()
        .find(|(needle, _)| model.contains(needle))
        .map(|(_, size)| *size)
        .unwrap_or(4_096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimating_counter() {
        let counter = EstimatingCounter;
        assert_eq!(counter.count_tokens(""), 0);
        assert_eq!(counter.count_tokens("hi"), 1);
        assert_eq!(counter.count_tokens("abcdefgh"), 2);
        assert_eq!(counter.count_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_closure_counter() {
        let chars = |text: &str| text.len();
        assert_eq!(chars.count_tokens("hello"), 5);
    }

    #[test]
    fn test_max_context_for_model() {
        assert_eq!(max_context_for_model("gemini-1.5-pro-latest"), 2_000_000);
        assert_eq!(max_context_for_model("claude-3-5-sonnet"), 200_000);
        assert_eq!(max_context_for_model("gpt-4o-mini"), 128_000);
        assert_eq!(max_context_for_model("gpt-4"), 8_192);
        assert_eq!(max_context_for_model("GPT-3.5-Turbo"), 16_385);
        assert_eq!(max_context_for_model("mistral"), 4_096);
    }
}
