//! Wire-level encoding and decoding for the OpenAI-compatible chat API.
//!
//! This is the single place that turns internal [`Message`] values into
//! [`OpenAIMessage`] wire values (and back), builds the outgoing
//! [`OpenAIRequest`], and repairs the occasional malformed JSON a local model
//! server emits. Every provider driver in [`crate::provider`] goes through
//! these functions rather than building requests by hand, so a wire-format
//! fix only has to happen once.

use crate::types::{
    ContentBlock, Message, MessageRole, OpenAIContent, OpenAIMessage, OpenAIRequest, OpenAIToolCall,
    TextBlock, ToolResultBlock, ToolUseBlock,
};
use crate::{Error, Result};

/// Response bodies larger than this are rejected rather than buffered whole.
pub const MAX_RESPONSE_BODY_BYTES: usize = 50 * 1024 * 1024;

/// A single SSE line longer than this indicates a runaway/unbounded chunk.
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Temperature forced onto requests that offer tools, regardless of the
/// caller's configured [`crate::types::Temperature`].
///
/// Local models are considerably more likely to emit well-formed tool calls
/// at low temperature; this is applied at the wire boundary so the caller's
/// `AgentOptions` is never mutated.
pub const TOOL_CALL_TEMPERATURE: f32 = 0.3;

/// Converts one internal [`Message`] into its wire representation.
///
/// Tool-use blocks become `tool_calls`; a lone tool-result block becomes a
/// `tool` message carrying `tool_call_id`. Mixed content (e.g. text alongside
/// a tool result) is not valid OpenAI wire format, so tool-result messages
/// are expected to carry exactly one block — callers that need parallel tool
/// replies should emit one [`Message`] per result, matching how
/// [`crate::session::Session`] appends them.
pub fn build_openai_message(message: &Message) -> OpenAIMessage {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
    .to_string();

    if message.role == MessageRole::Tool {
        if let Some(ContentBlock::ToolResult(result)) = message.content.first() {
            return OpenAIMessage {
                role,
                content: Some(OpenAIContent::Text(render_tool_result(result))),
                tool_calls: None,
                tool_call_id: Some(result.tool_use_id.clone()),
            };
        }
    }

    let tool_calls = collect_tool_calls(&message.content);
    let text = render_text_blocks(&message.content);

    OpenAIMessage {
        role,
        content: if text.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(OpenAIContent::Text(text))
        },
        tool_calls,
        tool_call_id: None,
    }
}

fn render_text_blocks(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(TextBlock { text, .. }) => Some(text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_tool_result(result: &ToolResultBlock) -> String {
    if let serde_json::Value::String(s) = &result.content {
        s.clone()
    } else {
        result.content.to_string()
    }
}

fn collect_tool_calls(blocks: &[ContentBlock]) -> Option<Vec<OpenAIToolCall>> {
    let calls: Vec<OpenAIToolCall> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse(ToolUseBlock { id, name, input, .. }) => Some(OpenAIToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: crate::types::OpenAIFunction {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            _ => None,
        })
        .collect();

    if calls.is_empty() { None } else { Some(calls) }
}

/// Builds the full request body for a chat completion call.
///
/// `system_prompt` is prepended as a system message when non-empty.
/// Temperature is forced to [`TOOL_CALL_TEMPERATURE`] whenever `tools` is
/// non-empty; otherwise the caller's configured temperature is used as-is.
#[allow(clippy::too_many_arguments)]
pub fn build_request(
    model: &str,
    system_prompt: &str,
    history: &[Message],
    tools: Option<Vec<serde_json::Value>>,
    max_tokens: Option<u32>,
    temperature: f32,
) -> OpenAIRequest {
    let mut messages = Vec::with_capacity(history.len() + 1);

    if !system_prompt.is_empty() {
        messages.push(OpenAIMessage {
            role: "system".to_string(),
            content: Some(OpenAIContent::Text(system_prompt.to_string())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    messages.extend(history.iter().map(build_openai_message));

    let effective_temperature = if tools.is_some() {
        TOOL_CALL_TEMPERATURE
    } else {
        temperature
    };

    OpenAIRequest {
        model: model.to_string(),
        messages,
        stream: true,
        max_tokens,
        temperature: Some(effective_temperature),
        tools,
    }
}

/// Reads an HTTP response body with a hard size ceiling, aborting the read
/// as soon as it is exceeded rather than buffering the whole thing first.
pub async fn read_bounded_body(response: reqwest::Response) -> Result<Vec<u8>> {
    use futures::StreamExt;

    let mut buf = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(Error::Http)?;
        if buf.len() + chunk.len() > MAX_RESPONSE_BODY_BYTES {
            return Err(Error::stream(format!(
                "response body exceeds {MAX_RESPONSE_BODY_BYTES} byte limit"
            )));
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf)
}

/// Attempts to parse `text` as JSON, falling back to a best-effort repair of
/// common truncation artifacts from local model servers: an unterminated
/// string, a trailing comma before a closing bracket, or missing closing
/// brackets at the end of the buffer.
///
/// Returns `None` if the salvage still does not produce valid JSON.
pub fn salvage_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }

    let mut repaired = strip_trailing_commas(text);
    repaired = close_unbalanced_brackets(&repaired);

    serde_json::from_str(&repaired).ok()
}

/// Removes commas that immediately precede a closing `}` or `]`, respecting
/// string literals and escape sequences so commas inside string content are
/// never touched.
fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }

        if c == ',' {
            // Look ahead past whitespace for a closing bracket.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Appends whatever closing brackets are needed to balance unterminated
/// objects/arrays, ignoring bracket characters inside string literals.
fn close_unbalanced_brackets(input: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = input.to_string();
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Unwraps up to three layers of JSON-string encoding on a tool-argument
/// value.
///
/// Some local models double- or triple-encode arguments, emitting
/// `"{\"x\":1}"` (a JSON string containing JSON) instead of `{"x":1}`. This
/// repeatedly re-parses a string value as JSON until it stops being a
/// string, a non-string value is produced, or the layer cap is reached —
/// whichever comes first. The cap exists so a string that legitimately looks
/// like JSON (e.g. `"null"` typed by a user) is not unwrapped forever.
pub fn normalize_arguments(value: serde_json::Value) -> serde_json::Value {
    const MAX_LAYERS: u8 = 3;

    let mut current = value;
    for _ in 0..MAX_LAYERS {
        let serde_json::Value::String(s) = &current else {
            break;
        };
        match serde_json::from_str::<serde_json::Value>(s) {
            Ok(inner) => current = inner,
            Err(_) => break,
        }
    }
    current
}

/// Parses a raw tool-call argument string (as received over the wire) into a
/// JSON value, applying [`salvage_json`] and [`normalize_arguments`] in
/// sequence. Falls back to an empty object for an empty string, matching
/// [`crate::utils::ToolCallAggregator`]'s existing convention.
pub fn parse_tool_arguments(raw: &str) -> Result<serde_json::Value> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }

    let value = salvage_json(raw)
        .ok_or_else(|| Error::stream(format!("failed to parse tool arguments: {raw}")))?;

    Ok(normalize_arguments(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolResultBlock;

    #[test]
    fn test_build_openai_message_text() {
        let msg = Message::user("hello there");
        let wire = build_openai_message(&msg);
        assert_eq!(wire.role, "user");
        assert!(matches!(wire.content, Some(OpenAIContent::Text(t)) if t == "hello there"));
        assert!(wire.tool_calls.is_none());
        assert!(wire.tool_call_id.is_none());
    }

    #[test]
    fn test_build_openai_message_tool_use() {
        let msg = Message::assistant(vec![ContentBlock::ToolUse(ToolUseBlock::new(
            "call_1",
            "search",
            serde_json::json!({"q": "rust"}),
        ))]);
        let wire = build_openai_message(&msg);
        let calls = wire.tool_calls.expect("tool_calls present");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(wire.content, None);
    }

    #[test]
    fn test_build_openai_message_tool_result() {
        let msg = Message::user_with_blocks(vec![ContentBlock::ToolResult(ToolResultBlock::new(
            "call_1",
            serde_json::json!({"result": "ok"}),
        ))]);
        let wire = build_openai_message(&msg);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_1"));
        assert!(wire.content.is_some());
    }

    #[test]
    fn test_build_request_forces_temperature_with_tools() {
        let req = build_request(
            "test-model",
            "",
            &[Message::user("hi")],
            Some(vec![serde_json::json!({"type": "function"})]),
            None,
            0.9,
        );
        assert_eq!(req.temperature, Some(TOOL_CALL_TEMPERATURE));
    }

    #[test]
    fn test_build_request_keeps_temperature_without_tools() {
        let req = build_request("test-model", "", &[Message::user("hi")], None, None, 0.9);
        assert_eq!(req.temperature, Some(0.9));
    }

    #[test]
    fn test_build_request_prepends_system_prompt() {
        let req = build_request(
            "test-model",
            "be concise",
            &[Message::user("hi")],
            None,
            None,
            0.5,
        );
        assert_eq!(req.messages[0].role, "system");
    }

    #[test]
    fn test_salvage_json_valid_passthrough() {
        let v = salvage_json(r#"{"a":1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_salvage_json_trailing_comma() {
        let v = salvage_json(r#"{"a":1,"b":2,}"#).unwrap();
        assert_eq!(v["b"], 2);
    }

    #[test]
    fn test_salvage_json_unbalanced_object() {
        let v = salvage_json(r#"{"a":1,"b":{"c":2"#).unwrap();
        assert_eq!(v["b"]["c"], 2);
    }

    #[test]
    fn test_salvage_json_ignores_commas_in_strings() {
        let v = salvage_json(r#"{"a":"x,y"}"#).unwrap();
        assert_eq!(v["a"], "x,y");
    }

    #[test]
    fn test_salvage_json_unsalvageable_returns_none() {
        assert!(salvage_json("not json at all {{{").is_none());
    }

    #[test]
    fn test_normalize_arguments_single_layer() {
        let v = normalize_arguments(serde_json::json!({"x": 1}));
        assert_eq!(v["x"], 1);
    }

    #[test]
    fn test_normalize_arguments_double_encoded() {
        let inner = serde_json::json!({"x": 1}).to_string();
        let once = serde_json::Value::String(inner);
        let twice = serde_json::Value::String(once.to_string());
        let v = normalize_arguments(twice);
        assert_eq!(v["x"], 1);
    }

    #[test]
    fn test_normalize_arguments_caps_at_three_layers() {
        // A plain string that happens to parse as a JSON string forever
        // ("\"a\"" -> "a" -> fails to parse further) terminates naturally;
        // this exercises the cap path for a value that would otherwise loop.
        let mut wrapped = serde_json::Value::String("5".to_string());
        for _ in 0..5 {
            wrapped = serde_json::Value::String(wrapped.to_string());
        }
        let v = normalize_arguments(wrapped);
        // After unwrapping MAX_LAYERS times it may still be a string; the
        // important property is it terminates and never panics/loops.
        assert!(v.is_string() || v.is_number());
    }

    #[test]
    fn test_parse_tool_arguments_empty_is_empty_object() {
        let v = parse_tool_arguments("").unwrap();
        assert_eq!(v, serde_json::json!({}));
    }

    #[test]
    fn test_parse_tool_arguments_salvages_truncated_json() {
        let v = parse_tool_arguments(r#"{"path":"/tmp/f"#).unwrap();
        assert_eq!(v["path"], "/tmp/f");
    }
}
