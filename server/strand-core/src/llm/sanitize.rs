use std::collections::HashSet;

use strand_types::{ContentPart, Message, MessageContent, MessageType};

/// Drops assistant tool calls that never received a result and tool results
/// that no surviving assistant message asked for. Providers reject
/// conversations with dangling halves of a tool exchange.
pub fn sanitize_messages(messages: &[Message]) -> Vec<Message> {
    let mut available_results = HashSet::new();
    for message in messages {
        for result in message.tool_results() {
            available_results.insert(result.tool_call_id.clone());
        }
    }

    let mut allowed_call_ids = HashSet::new();
    let mut sanitized = Vec::with_capacity(messages.len());

    for message in messages {
        match message.message_type {
            MessageType::Assistant => {
                let tool_calls = message.tool_calls();
                if tool_calls.is_empty() {
                    sanitized.push(message.clone());
                    continue;
                }
                let all_answered = tool_calls
                    .iter()
                    .all(|call| available_results.contains(&call.id));
                if all_answered {
                    for call in &tool_calls {
                        allowed_call_ids.insert(call.id.clone());
                    }
                    sanitized.push(message.clone());
                } else if let MessageContent::Parts(parts) = &message.content {
                    let stripped: Vec<ContentPart> = parts
                        .iter()
                        .filter(|p| !matches!(p, ContentPart::ToolCall(_)))
                        .cloned()
                        .collect();
                    if !stripped.is_empty() {
                        let mut kept = message.clone();
                        kept.content = MessageContent::Parts(stripped);
                        sanitized.push(kept);
                    }
                } else {
                    sanitized.push(message.clone());
                }
            }
            MessageType::Tool => {
                let results = message.tool_results();
                if results.is_empty() {
                    // XML-style tool output carried as plain text.
                    sanitized.push(message.clone());
                    continue;
                }
                let kept: Vec<ContentPart> = results
                    .into_iter()
                    .filter(|r| allowed_call_ids.contains(&r.tool_call_id))
                    .map(ContentPart::ToolResult)
                    .collect();
                if !kept.is_empty() {
                    let mut preserved = message.clone();
                    preserved.content = MessageContent::Parts(kept);
                    sanitized.push(preserved);
                }
            }
            _ => sanitized.push(message.clone()),
        }
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use strand_types::{ToolCall, ToolResult};
    use uuid::Uuid;

    fn message(message_type: MessageType, content: MessageContent) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            message_type,
            content,
            is_llm_message: true,
            metadata: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn strips_unanswered_tool_calls() {
        let messages = vec![message(
            MessageType::Assistant,
            MessageContent::Parts(vec![
                ContentPart::Text("let me check".to_string()),
                ContentPart::ToolCall(ToolCall::native("c1", "search", json!({}))),
            ]),
        )];
        let sanitized = sanitize_messages(&messages);
        assert_eq!(sanitized.len(), 1);
        assert!(sanitized[0].tool_calls().is_empty());
        assert_eq!(sanitized[0].as_text().unwrap(), "let me check");
    }

    #[test]
    fn keeps_complete_tool_exchanges() {
        let call = ToolCall::native("c1", "search", json!({}));
        let result = ToolResult {
            tool_call_id: "c1".to_string(),
            assistant_message_id: None,
            success: true,
            output: json!("found"),
        };
        let messages = vec![
            message(
                MessageType::Assistant,
                MessageContent::Parts(vec![ContentPart::ToolCall(call)]),
            ),
            message(
                MessageType::Tool,
                MessageContent::Parts(vec![ContentPart::ToolResult(result)]),
            ),
        ];
        let sanitized = sanitize_messages(&messages);
        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized[0].tool_calls().len(), 1);
        assert_eq!(sanitized[1].tool_results().len(), 1);
    }

    #[test]
    fn drops_orphaned_tool_results() {
        let result = ToolResult {
            tool_call_id: "ghost".to_string(),
            assistant_message_id: None,
            success: true,
            output: json!("?"),
        };
        let messages = vec![message(
            MessageType::Tool,
            MessageContent::Parts(vec![ContentPart::ToolResult(result)]),
        )];
        assert!(sanitize_messages(&messages).is_empty());
    }
}
