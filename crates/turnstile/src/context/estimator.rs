//! Approximate token counting.
//!
//! Every middleware that needs a size uses the same rule: one token per four
//! characters, rounded up. Characters are Unicode scalar values, so the
//! estimate does not depend on how text is encoded.

use crate::{Message, MessageRole};

/// Characters per token for the approximate counter.
pub const CHARS_PER_TOKEN: usize = 4;

/// Counts tokens for a message sequence. Implementations must be pure and
/// must never decrease when messages are appended.
pub trait TokenCounter: Send + Sync {
    fn count(&self, messages: &[Message]) -> usize;
}

/// The default `ceil(chars / 4)` counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, messages: &[Message]) -> usize {
        estimate_tokens(messages)
    }
}

/// Characters a single message contributes to the estimate: its text, plus
/// the JSON of its tool calls (AI messages) or its `tool_call_id` (tool
/// messages).
pub fn message_chars(message: &Message) -> usize {
    let mut chars = message.content.char_count();
    match message.role {
        MessageRole::Ai if !message.tool_calls.is_empty() => {
            chars += serde_json::to_string(&message.tool_calls)
                .map(|json| json.chars().count())
                .unwrap_or(0);
        }
        MessageRole::Tool => {
            chars += message
                .tool_call_id
                .as_deref()
                .map_or(0, |id| id.chars().count());
        }
        _ => {}
    }
    chars
}

/// Approximate token count of `messages`: `ceil(total_chars / 4)`.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let total: usize = messages.iter().map(message_chars).sum();
    total.div_ceil(CHARS_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use serde_json::json;

    #[test]
    fn empty_is_zero() {
        assert_eq!(estimate_tokens(&[]), 0);
        assert_eq!(estimate_tokens(&[Message::human("")]), 0);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens(&[Message::human("abc")]), 1);
        assert_eq!(estimate_tokens(&[Message::human("abcd")]), 1);
        assert_eq!(estimate_tokens(&[Message::human("abcde")]), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // Four two-byte characters.
        assert_eq!(estimate_tokens(&[Message::human("éééé")]), 1);
    }

    #[test]
    fn tool_calls_and_ids_are_counted() {
        let calls = vec![ToolCall::new("c1", "search", json!({"q": "rust"}))];
        let json_len = serde_json::to_string(&calls).unwrap().chars().count();
        let ai = Message::ai_tool_calls("", calls);
        assert_eq!(message_chars(&ai), json_len);

        let tool = Message::tool_result("c1", "1234");
        assert_eq!(message_chars(&tool), 4 + 2);
    }

    #[test]
    fn tool_call_id_on_non_tool_message_is_ignored() {
        let mut msg = Message::human("abcd");
        msg.tool_call_id = Some("ignored".into());
        assert_eq!(message_chars(&msg), 4);
    }

    #[test]
    fn appending_never_decreases_the_estimate() {
        let mut messages = vec![Message::system("be brief")];
        let mut last = estimate_tokens(&messages);
        for text in ["", "a", "hello world", "", "ünïcödé"] {
            messages.push(Message::human(text));
            let now = estimate_tokens(&messages);
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn approx_counter_matches_free_function() {
        let messages = vec![Message::human("hello"), Message::ai_text("there")];
        assert_eq!(ApproxTokenCounter.count(&messages), estimate_tokens(&messages));
    }
}
