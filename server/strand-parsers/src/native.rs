use serde_json::Value;
use strand_types::ToolCall;

/// Builds a native `ToolCall` from the provider's wire shape. Providers send
/// arguments as a JSON string; anything that fails to parse is kept verbatim
/// so the tool still sees what the model produced.
pub fn from_provider(id: &str, name: &str, arguments: &str) -> ToolCall {
    let parsed = serde_json::from_str::<Value>(arguments)
        .unwrap_or_else(|_| Value::String(arguments.to_string()));
    ToolCall::native(id, name, parsed)
}

/// Backfills missing call ids. Some providers omit ids on reconstructed
/// streaming calls; downstream persistence requires one per call.
pub fn ensure_ids(tool_calls: &mut [ToolCall]) {
    for call in tool_calls.iter_mut() {
        if call.id.is_empty() {
            tracing::warn!(tool = %call.name, "tool call id empty; generating fallback uuid");
            call.id = uuid::Uuid::new_v4().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_types::ToolCallKind;

    #[test]
    fn parses_argument_objects() {
        let call = from_provider("c1", "search", r#"{"query":"AI news"}"#);
        assert_eq!(call.kind, ToolCallKind::Native);
        assert_eq!(call.arguments, json!({"query": "AI news"}));
    }

    #[test]
    fn keeps_malformed_arguments_as_string() {
        let call = from_provider("c1", "search", "{oops");
        assert_eq!(call.arguments, json!("{oops"));
    }

    #[test]
    fn backfills_empty_ids() {
        let mut calls = vec![
            from_provider("", "a", "{}"),
            from_provider("keep", "b", "{}"),
        ];
        ensure_ids(&mut calls);
        assert!(!calls[0].id.is_empty());
        assert_eq!(calls[1].id, "keep");
    }
}
