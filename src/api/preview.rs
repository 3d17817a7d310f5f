use serde_json::Value;

use crate::scheduler::ChatMessage;

const PREVIEW_CHARS: usize = 80;

/// First non-empty message content, flattened to one line.
pub fn preview_messages(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .find(|c| !c.is_empty())
        .map(snippet)
        .filter(|s| !s.is_empty())
}

/// `result.message.content`, falling back to `result.response`.
pub fn preview_result(result: Option<&Value>) -> Option<String> {
    let result = result?.as_object()?;
    if let Some(message) = result.get("message").and_then(Value::as_object) {
        if let Some(content) = message.get("content").and_then(Value::as_str) {
            return Some(snippet(content));
        }
    }
    result.get("response").and_then(Value::as_str).map(snippet)
}

fn snippet(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let trimmed = flat.trim();
    if trimmed.chars().count() > PREVIEW_CHARS {
        let head: String = trimmed.chars().take(PREVIEW_CHARS - 3).collect();
        format!("{}...", head)
    } else {
        trimmed.to_string()
    }
}
