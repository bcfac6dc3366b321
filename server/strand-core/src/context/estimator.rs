use strand_types::{ContentPart, Message, MessageContent};

/// Fixed structural overhead per message (role framing and separators).
const ROLE_OVERHEAD_TOKENS: usize = 4;
/// Overhead of a serialized tool-call envelope beyond its arguments.
const TOOL_CALL_OVERHEAD_TOKENS: usize = 10;
/// Flat cost charged per image part.
const IMAGE_TOKENS: usize = 170;

/// Deterministic token estimation: the word-count and character-count
/// heuristics both approximate real tokenizers, and taking the larger keeps
/// the estimate conservative for mixed prose and code.
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate_text_tokens(text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        let char_count = text.len();
        let tokens_from_words = ((word_count as f64) / 0.75) as usize;
        let tokens_from_chars = ((char_count as f64) / 4.0) as usize;
        tokens_from_words.max(tokens_from_chars)
    }

    pub fn estimate_message_tokens(message: &Message) -> usize {
        let mut total = ROLE_OVERHEAD_TOKENS;
        match &message.content {
            MessageContent::Text(text) => {
                total += Self::estimate_text_tokens(text);
            }
            MessageContent::Parts(parts) => {
                for part in parts {
                    total += match part {
                        ContentPart::Text(text) => Self::estimate_text_tokens(text),
                        ContentPart::ImageUrl(_) => IMAGE_TOKENS,
                        ContentPart::ToolCall(call) => {
                            let serialized = format!(
                                "{}: {}",
                                call.name,
                                serde_json::to_string(&call.arguments).unwrap_or_default()
                            );
                            TOOL_CALL_OVERHEAD_TOKENS + Self::estimate_text_tokens(&serialized)
                        }
                        ContentPart::ToolResult(result) => {
                            let serialized =
                                serde_json::to_string(&result.output).unwrap_or_default();
                            TOOL_CALL_OVERHEAD_TOKENS + Self::estimate_text_tokens(&serialized)
                        }
                    };
                }
            }
        }
        total
    }

    pub fn estimate_thread_tokens(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message_tokens).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use strand_types::{MessageType, ToolCall};
    use uuid::Uuid;

    fn message(content: MessageContent) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            message_type: MessageType::User,
            content,
            is_llm_message: true,
            metadata: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn word_and_char_heuristics() {
        // 6 words -> 8 tokens by words; 26 chars -> 6 by chars; max wins.
        assert_eq!(
            TokenEstimator::estimate_text_tokens("Hello world this is a test"),
            8
        );
        assert_eq!(TokenEstimator::estimate_text_tokens(""), 0);
    }

    #[test]
    fn images_cost_a_flat_amount() {
        let msg = message(MessageContent::Parts(vec![
            ContentPart::ImageUrl("https://x/y.png".to_string()),
            ContentPart::ImageUrl("https://x/z.png".to_string()),
        ]));
        assert_eq!(
            TokenEstimator::estimate_message_tokens(&msg),
            4 + 170 + 170
        );
    }

    #[test]
    fn tool_calls_carry_structure_overhead() {
        let plain = message(MessageContent::Text("hi".to_string()));
        let with_call = message(MessageContent::Parts(vec![ContentPart::ToolCall(
            ToolCall::native("c1", "search", json!({"query": "hi"})),
        )]));
        assert!(
            TokenEstimator::estimate_message_tokens(&with_call)
                > TokenEstimator::estimate_message_tokens(&plain)
        );
    }

    #[test]
    fn thread_estimate_is_additive() {
        let a = message(MessageContent::Text("one two three".to_string()));
        let b = message(MessageContent::Text("four five six".to_string()));
        let both = [a.clone(), b.clone()];
        assert_eq!(
            TokenEstimator::estimate_thread_tokens(&both),
            TokenEstimator::estimate_message_tokens(&a)
                + TokenEstimator::estimate_message_tokens(&b)
        );
    }
}
